//! USB transport adapter: trait, shared types, Linux backend, and test mock.
//!
//! Everything above this module talks to hardware through [`UsbTransport`].
//! The trait is deliberately narrow: enumerate, open/close, configure, claim,
//! list endpoints, and move bytes over the default pipe (plus an optional
//! bulk read). Register-level framing lives in [`crate::register`].

use std::fmt;

use serde::Serialize;

use crate::protocol::{REQUEST_TYPE_VENDOR_IN, REQUEST_TYPE_VENDOR_OUT, VENDOR_REQUEST};

// ── Identity ──

/// Opaque, stable identifier for one attached USB device.
///
/// Stays the same for as long as the device stays plugged in, which makes it
/// usable as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RegistryId(String);

impl RegistryId {
    pub fn new(id: impl Into<String>) -> Self {
        RegistryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor-level identity captured at discovery time. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub registry_id: RegistryId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor_name: String,
    pub product_name: String,
    pub serial: String,
}

impl DeviceIdentity {
    /// `vvvv:pppp` in lowercase hex, the way `lsusb` prints it.
    pub fn usb_id(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

// ── Descriptors ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
}

/// One non-control pipe of a claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    /// Endpoint number without the direction bit.
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    /// `bEndpointAddress` (number plus direction bit).
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }
}

/// Setup stage of a vendor, device-recipient control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub direction: Direction,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn vendor_out(value: u16, index: u16) -> Self {
        ControlSetup {
            direction: Direction::Out,
            request: VENDOR_REQUEST,
            value,
            index,
        }
    }

    pub fn vendor_in(value: u16, index: u16) -> Self {
        ControlSetup {
            direction: Direction::In,
            request: VENDOR_REQUEST,
            value,
            index,
        }
    }

    /// `bmRequestType` for this setup.
    pub fn request_type(&self) -> u8 {
        match self.direction {
            Direction::In => REQUEST_TYPE_VENDOR_IN,
            Direction::Out => REQUEST_TYPE_VENDOR_OUT,
        }
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType=0x{:02X} wValue=0x{:04X} wIndex=0x{:04X}",
            self.request_type(),
            self.value,
            self.index
        )
    }
}

// ── Error types ──

/// A single failed transfer on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The control transfer itself failed (stall, timeout, disconnect).
    Control { setup: ControlSetup, reason: String },
    /// The device moved fewer bytes than the register access needs.
    Short {
        setup: ControlSetup,
        expected: usize,
        actual: usize,
    },
    /// Bulk read on the streaming endpoint failed.
    Bulk { endpoint: u8, reason: String },
}

impl TransferError {
    pub fn control(setup: ControlSetup, reason: impl Into<String>) -> Self {
        TransferError::Control {
            setup,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Control { setup, reason } => {
                write!(f, "Control transfer failed ({setup}): {reason}")
            }
            TransferError::Short {
                setup,
                expected,
                actual,
            } => write!(
                f,
                "Short control transfer ({setup}): expected {expected} bytes, got {actual}"
            ),
            TransferError::Bulk { endpoint, reason } => {
                write!(f, "Bulk transfer failed (endpoint 0x{endpoint:02X}): {reason}")
            }
        }
    }
}

impl std::error::Error for TransferError {}

/// Device lifecycle errors.
///
/// String payloads follow the convention **"context: details"**.
/// [`DeviceError::NotSupportedDevice`] is the one benign outcome: the device
/// exists but is not a dongle this crate drives.
#[derive(Debug)]
pub enum DeviceError {
    TransportUnavailable(String),
    DeviceNotFound,
    NotSupportedDevice { vendor_id: u16, product_id: u16 },
    OpenFailed(String),
    InterfaceClaimFailed(String),
    EndpointNotFound,
    Transfer(TransferError),
    CoefficientOutOfRange { index: usize, value: i32 },
    TunerNotFound,
    SessionClosed,
}

impl DeviceError {
    /// True when the device is simply not a supported dongle (not a fault).
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DeviceError::NotSupportedDevice { .. })
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::TransportUnavailable(e) => write!(f, "USB transport unavailable: {e}"),
            DeviceError::DeviceNotFound => write!(f, "USB device not found"),
            DeviceError::NotSupportedDevice {
                vendor_id,
                product_id,
            } => write!(
                f,
                "Not a supported RTL2832U device ({vendor_id:04x}:{product_id:04x})"
            ),
            DeviceError::OpenFailed(e) => write!(f, "Failed to open device: {e}"),
            DeviceError::InterfaceClaimFailed(e) => write!(f, "Failed to claim interface: {e}"),
            DeviceError::EndpointNotFound => write!(f, "No bulk-in endpoint 1 on any interface"),
            DeviceError::Transfer(e) => write!(f, "{e}"),
            DeviceError::CoefficientOutOfRange { index, value } => {
                write!(f, "FIR coefficient {index} out of range: {value}")
            }
            DeviceError::TunerNotFound => write!(f, "No supported tuner found"),
            DeviceError::SessionClosed => write!(f, "Device session is closed"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Transfer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransferError> for DeviceError {
    fn from(e: TransferError) -> Self {
        DeviceError::Transfer(e)
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

// ── Trait ──

/// Host USB stack as seen by the control plane.
///
/// Handles are plain values: whoever receives one from `open_*` owns it and
/// must hand it back to the matching `close_*`.
pub trait UsbTransport {
    type Device;
    type Interface;

    fn list_devices(&self) -> Result<Vec<RegistryId>>;

    /// Read descriptor identity without opening the device.
    fn identify(&self, id: &RegistryId) -> Result<DeviceIdentity>;

    fn open_device(&self, id: &RegistryId) -> Result<Self::Device>;
    fn close_device(&self, device: Self::Device);

    /// `bConfigurationValue` of the first (default) configuration.
    fn configuration_value(&self, device: &Self::Device) -> Result<u8>;
    fn set_configuration(&self, device: &Self::Device, value: u8) -> Result<()>;

    fn list_interfaces(&self, device: &Self::Device) -> Result<Vec<InterfaceInfo>>;
    fn open_interface(&self, device: &Self::Device, number: u8) -> Result<Self::Interface>;
    fn close_interface(&self, interface: Self::Interface);

    /// Non-control pipes of a claimed interface.
    fn list_endpoints(&self, interface: &Self::Interface) -> Result<Vec<EndpointInfo>>;

    /// Run one control transfer on the default pipe.
    ///
    /// OUT transfers send `data`; IN transfers fill it. Returns bytes moved.
    fn control_transfer(
        &self,
        device: &Self::Device,
        setup: ControlSetup,
        data: &mut [u8],
    ) -> std::result::Result<usize, TransferError>;

    /// Blocking bulk read. Default: not supported by this transport.
    fn bulk_in(
        &self,
        _interface: &Self::Interface,
        endpoint: u8,
        _buf: &mut [u8],
    ) -> std::result::Result<usize, TransferError> {
        Err(TransferError::Bulk {
            endpoint,
            reason: "bulk transfers not supported by this transport".into(),
        })
    }
}

// ── Linux backend ──

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::time::Duration;

    use nusb::transfer::{Control, ControlType, EndpointType, Recipient};

    use crate::protocol::CTRL_TIMEOUT_MS;

    /// `nusb`-backed transport. Control transfers go through the device
    /// handle, so no interface needs to be claimed for register access.
    pub struct NusbTransport {
        timeout: Duration,
    }

    /// Claimed interface plus the endpoint list captured when it was claimed.
    pub struct NusbInterface {
        #[allow(dead_code)]
        inner: nusb::Interface,
        number: u8,
        endpoints: Vec<EndpointInfo>,
    }

    impl NusbInterface {
        pub fn number(&self) -> u8 {
            self.number
        }
    }

    impl Default for NusbTransport {
        fn default() -> Self {
            Self::new(CTRL_TIMEOUT_MS)
        }
    }

    impl NusbTransport {
        pub fn new(timeout_ms: u64) -> Self {
            NusbTransport {
                timeout: Duration::from_millis(timeout_ms),
            }
        }

        fn registry_id(info: &nusb::DeviceInfo) -> RegistryId {
            RegistryId::new(format!(
                "usb:{:03}/{:03}",
                info.bus_number(),
                info.device_address()
            ))
        }

        fn find(&self, id: &RegistryId) -> Result<nusb::DeviceInfo> {
            nusb::list_devices()
                .map_err(|e| DeviceError::TransportUnavailable(format!("USB enumeration: {e}")))?
                .find(|dev| Self::registry_id(dev) == *id)
                .ok_or(DeviceError::DeviceNotFound)
        }

        fn control(setup: &ControlSetup) -> Control {
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: setup.request,
                value: setup.value,
                index: setup.index,
            }
        }
    }

    fn map_transfer_type(t: EndpointType) -> TransferType {
        match t {
            EndpointType::Control => TransferType::Control,
            EndpointType::Isochronous => TransferType::Isochronous,
            EndpointType::Bulk => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    impl UsbTransport for NusbTransport {
        type Device = nusb::Device;
        type Interface = NusbInterface;

        fn list_devices(&self) -> Result<Vec<RegistryId>> {
            let devices = nusb::list_devices()
                .map_err(|e| DeviceError::TransportUnavailable(format!("USB enumeration: {e}")))?;
            Ok(devices.map(|dev| Self::registry_id(&dev)).collect())
        }

        fn identify(&self, id: &RegistryId) -> Result<DeviceIdentity> {
            let info = self.find(id)?;
            Ok(DeviceIdentity {
                registry_id: id.clone(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                vendor_name: info.manufacturer_string().unwrap_or_default().to_string(),
                product_name: info.product_string().unwrap_or_default().to_string(),
                serial: info.serial_number().unwrap_or_default().to_string(),
            })
        }

        fn open_device(&self, id: &RegistryId) -> Result<nusb::Device> {
            self.find(id)?
                .open()
                .map_err(|e| DeviceError::OpenFailed(format!("USB open {id}: {e}")))
        }

        fn close_device(&self, device: nusb::Device) {
            drop(device);
        }

        fn configuration_value(&self, device: &nusb::Device) -> Result<u8> {
            device
                .configurations()
                .next()
                .map(|c| c.configuration_value())
                .ok_or_else(|| DeviceError::OpenFailed("configuration: no descriptors".into()))
        }

        fn set_configuration(&self, device: &nusb::Device, value: u8) -> Result<()> {
            // Re-selecting the active configuration resets every interface; skip it.
            if let Ok(active) = device.active_configuration()
                && active.configuration_value() == value
            {
                return Ok(());
            }
            device
                .set_configuration(value)
                .map_err(|e| DeviceError::OpenFailed(format!("set configuration {value}: {e}")))
        }

        fn list_interfaces(&self, device: &nusb::Device) -> Result<Vec<InterfaceInfo>> {
            let config = device
                .active_configuration()
                .map_err(|e| DeviceError::OpenFailed(format!("active configuration: {e}")))?;
            Ok(config
                .interface_alt_settings()
                .filter(|alt| alt.alternate_setting() == 0)
                .map(|alt| InterfaceInfo {
                    number: alt.interface_number(),
                    class: alt.class(),
                    subclass: alt.subclass(),
                })
                .collect())
        }

        fn open_interface(&self, device: &nusb::Device, number: u8) -> Result<NusbInterface> {
            let config = device
                .active_configuration()
                .map_err(|e| DeviceError::InterfaceClaimFailed(format!("interface {number}: {e}")))?;
            let endpoints = config
                .interface_alt_settings()
                .filter(|alt| alt.interface_number() == number && alt.alternate_setting() == 0)
                .flat_map(|alt| {
                    alt.endpoints()
                        .map(|ep| EndpointInfo {
                            number: ep.address() & 0x0F,
                            direction: match ep.direction() {
                                nusb::transfer::Direction::In => Direction::In,
                                nusb::transfer::Direction::Out => Direction::Out,
                            },
                            transfer_type: map_transfer_type(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size() as u16,
                        })
                        .collect::<Vec<_>>()
                })
                .collect();

            // The DVB kernel driver usually owns the dongle; detach it first.
            let inner = device
                .detach_and_claim_interface(number)
                .map_err(|e| DeviceError::InterfaceClaimFailed(format!("interface {number}: {e}")))?;
            Ok(NusbInterface {
                inner,
                number,
                endpoints,
            })
        }

        fn close_interface(&self, interface: NusbInterface) {
            drop(interface);
        }

        fn list_endpoints(&self, interface: &NusbInterface) -> Result<Vec<EndpointInfo>> {
            Ok(interface.endpoints.clone())
        }

        fn control_transfer(
            &self,
            device: &nusb::Device,
            setup: ControlSetup,
            data: &mut [u8],
        ) -> std::result::Result<usize, TransferError> {
            let control = Self::control(&setup);
            let result = match setup.direction {
                Direction::In => device.control_in_blocking(control, data, self.timeout),
                Direction::Out => device.control_out_blocking(control, data, self.timeout),
            };
            result.map_err(|e| TransferError::control(setup, e.to_string()))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{NusbInterface, NusbTransport};

// ── Stub (other platforms) ──

/// Transport for platforms without a USB backend; every call reports
/// [`DeviceError::TransportUnavailable`].
#[cfg(not(target_os = "linux"))]
#[derive(Default)]
pub struct StubTransport;

#[cfg(not(target_os = "linux"))]
impl StubTransport {
    pub fn new(_timeout_ms: u64) -> Self {
        StubTransport
    }

    fn unavailable<T>() -> Result<T> {
        Err(DeviceError::TransportUnavailable(
            "no USB backend on this platform".into(),
        ))
    }
}

#[cfg(not(target_os = "linux"))]
impl UsbTransport for StubTransport {
    type Device = ();
    type Interface = ();

    fn list_devices(&self) -> Result<Vec<RegistryId>> {
        Self::unavailable()
    }
    fn identify(&self, _id: &RegistryId) -> Result<DeviceIdentity> {
        Self::unavailable()
    }
    fn open_device(&self, _id: &RegistryId) -> Result<()> {
        Self::unavailable()
    }
    fn close_device(&self, _device: ()) {}
    fn configuration_value(&self, _device: &()) -> Result<u8> {
        Self::unavailable()
    }
    fn set_configuration(&self, _device: &(), _value: u8) -> Result<()> {
        Self::unavailable()
    }
    fn list_interfaces(&self, _device: &()) -> Result<Vec<InterfaceInfo>> {
        Self::unavailable()
    }
    fn open_interface(&self, _device: &(), _number: u8) -> Result<()> {
        Self::unavailable()
    }
    fn close_interface(&self, _interface: ()) {}
    fn list_endpoints(&self, _interface: &()) -> Result<Vec<EndpointInfo>> {
        Self::unavailable()
    }
    fn control_transfer(
        &self,
        _device: &(),
        setup: ControlSetup,
        _data: &mut [u8],
    ) -> std::result::Result<usize, TransferError> {
        Err(TransferError::control(setup, "no USB backend on this platform"))
    }
}

/// Concrete transport for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformTransport = NusbTransport;
#[cfg(not(target_os = "linux"))]
pub type PlatformTransport = StubTransport;

// ── Mock transport for testing ──

/// In-memory USB stack for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use crate::protocol::{RegisterBlock, WRITE_FLAG};

    const I2C_INDEX: u16 = RegisterBlock::I2c.base_offset() | WRITE_FLAG;

    /// One interface of a scripted device.
    #[derive(Debug, Clone)]
    pub struct MockInterface {
        pub info: InterfaceInfo,
        pub endpoints: Vec<EndpointInfo>,
        /// `open_interface` on this number fails.
        pub fail_claim: bool,
    }

    /// A scripted device on the mock bus.
    #[derive(Debug, Clone)]
    pub struct MockUsbDevice {
        pub identity: DeviceIdentity,
        pub configuration: u8,
        pub interfaces: Vec<MockInterface>,
        /// I2C chips behind the repeater: address → register file.
        pub i2c: HashMap<u8, HashMap<u8, u8>>,
        /// Bytes handed out by `bulk_in`, front first.
        pub bulk_data: Vec<u8>,
        pub fail_open: bool,
    }

    impl MockUsbDevice {
        /// A device with no interfaces and nothing on its I2C bus.
        pub fn new(id: &str, vendor_id: u16, product_id: u16) -> Self {
            MockUsbDevice {
                identity: DeviceIdentity {
                    registry_id: RegistryId::new(id),
                    vendor_id,
                    product_id,
                    vendor_name: "Mock".into(),
                    product_name: "Mock Device".into(),
                    serial: format!("MOCK-{id}"),
                },
                configuration: 1,
                interfaces: Vec::new(),
                i2c: HashMap::new(),
                bulk_data: Vec::new(),
                fail_open: false,
            }
        }

        /// A generic RTL2832U dongle with an R820T behind the repeater.
        pub fn rtl2832u(id: &str) -> Self {
            let mut dev = Self::new(id, 0x0BDA, 0x2838)
                .with_interface(
                    InterfaceInfo {
                        number: 0,
                        class: 0xFF,
                        subclass: 0xFF,
                    },
                    vec![bulk_in_endpoint(1)],
                )
                .with_i2c_register(0x34, 0x00, 0x69);
            dev.identity.vendor_name = "Realtek".into();
            dev.identity.product_name = "RTL2838UHIDIR".into();
            dev
        }

        pub fn with_interface(mut self, info: InterfaceInfo, endpoints: Vec<EndpointInfo>) -> Self {
            self.interfaces.push(MockInterface {
                info,
                endpoints,
                fail_claim: false,
            });
            self
        }

        pub fn with_i2c_register(mut self, addr: u8, reg: u8, value: u8) -> Self {
            self.i2c.entry(addr).or_default().insert(reg, value);
            self
        }

        /// Remove every chip from the I2C bus.
        pub fn without_i2c(mut self) -> Self {
            self.i2c.clear();
            self
        }

        pub fn with_bulk_data(mut self, data: Vec<u8>) -> Self {
            self.bulk_data = data;
            self
        }
    }

    pub fn bulk_in_endpoint(number: u8) -> EndpointInfo {
        EndpointInfo {
            number,
            direction: Direction::In,
            transfer_type: TransferType::Bulk,
            max_packet_size: 512,
        }
    }

    /// One successful control transfer as seen on the wire.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ControlRecord {
        pub device: RegistryId,
        pub setup: ControlSetup,
        /// Payload for OUT transfers, returned bytes for IN transfers.
        pub data: Vec<u8>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockDeviceHandle {
        pub id: RegistryId,
        /// Unique per successful open.
        pub token: u64,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockInterfaceHandle {
        pub id: RegistryId,
        pub number: u8,
        pub token: u64,
    }

    type FailPredicate = Box<dyn Fn(&ControlSetup, &[u8]) -> bool + Send>;

    #[derive(Default)]
    struct MockState {
        devices: Vec<MockUsbDevice>,
        log: Vec<ControlRecord>,
        transfer_count: usize,
        fail_at: Option<usize>,
        fail_when: Option<FailPredicate>,
        next_token: u64,
        live_devices: HashSet<u64>,
        live_interfaces: HashSet<u64>,
        device_opens: usize,
        device_releases: usize,
        interface_claims: usize,
        interface_releases: usize,
        configurations_set: Vec<(RegistryId, u8)>,
        i2c_pointer: HashMap<(RegistryId, u8), u8>,
    }

    impl MockState {
        fn device(&self, id: &RegistryId) -> Result<&MockUsbDevice> {
            self.devices
                .iter()
                .find(|d| d.identity.registry_id == *id)
                .ok_or(DeviceError::DeviceNotFound)
        }

        fn device_mut(&mut self, id: &RegistryId) -> Option<&mut MockUsbDevice> {
            self.devices.iter_mut().find(|d| d.identity.registry_id == *id)
        }

        fn issue_token(&mut self) -> u64 {
            self.next_token += 1;
            self.next_token
        }
    }

    /// Mock USB stack. Interior mutability so it can sit behind `Arc`.
    #[derive(Default)]
    pub struct MockTransport {
        state: Mutex<MockState>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_device(self, device: MockUsbDevice) -> Self {
            self.add_device(device);
            self
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn add_device(&self, device: MockUsbDevice) {
            self.state().devices.push(device);
        }

        /// Simulate unplugging: the device disappears from enumeration.
        pub fn remove_device(&self, id: &RegistryId) {
            self.state().devices.retain(|d| d.identity.registry_id != *id);
        }

        /// Fail the control transfer with this ordinal (0-based, counted
        /// from the first transfer this mock ever saw).
        pub fn fail_transfer_at(&self, ordinal: usize) {
            self.state().fail_at = Some(ordinal);
        }

        /// Fail every control transfer for which `pred` returns true.
        pub fn fail_when(&self, pred: impl Fn(&ControlSetup, &[u8]) -> bool + Send + 'static) {
            self.state().fail_when = Some(Box::new(pred));
        }

        pub fn clear_failures(&self) {
            let mut state = self.state();
            state.fail_at = None;
            state.fail_when = None;
        }

        pub fn set_fail_claim(&self, id: &RegistryId, number: u8) {
            if let Some(dev) = self.state().device_mut(id) {
                for iface in dev.interfaces.iter_mut().filter(|i| i.info.number == number) {
                    iface.fail_claim = true;
                }
            }
        }

        /// Successful control transfers, oldest first.
        pub fn transfers(&self) -> Vec<ControlRecord> {
            self.state().log.clone()
        }

        pub fn clear_transfers(&self) {
            self.state().log.clear();
        }

        pub fn transfer_count(&self) -> usize {
            self.state().transfer_count
        }

        pub fn open_device_count(&self) -> usize {
            self.state().live_devices.len()
        }

        pub fn open_interface_count(&self) -> usize {
            self.state().live_interfaces.len()
        }

        /// Total `open_device` calls that succeeded.
        pub fn device_opens(&self) -> usize {
            self.state().device_opens
        }

        /// Total `close_device` calls.
        pub fn device_releases(&self) -> usize {
            self.state().device_releases
        }

        /// Total `open_interface` calls that succeeded.
        pub fn interface_claims(&self) -> usize {
            self.state().interface_claims
        }

        /// Total `close_interface` calls.
        pub fn interface_releases(&self) -> usize {
            self.state().interface_releases
        }

        pub fn configurations_set(&self) -> Vec<(RegistryId, u8)> {
            self.state().configurations_set.clone()
        }

        fn i2c_transfer(
            state: &mut MockState,
            id: &RegistryId,
            setup: ControlSetup,
            data: &mut [u8],
        ) -> std::result::Result<(), TransferError> {
            let addr = setup.value as u8;
            let key = (id.clone(), addr);
            let pointer = state.i2c_pointer.get(&key).copied().unwrap_or(0);
            let dev = state
                .device_mut(id)
                .ok_or_else(|| TransferError::control(setup, "mock: device gone"))?;
            let Some(chip) = dev.i2c.get_mut(&addr) else {
                return Err(TransferError::control(
                    setup,
                    format!("mock: no I2C ack from 0x{addr:02X}"),
                ));
            };
            match setup.direction {
                Direction::Out => {
                    if let Some((&reg, values)) = data.split_first() {
                        for (i, v) in values.iter().enumerate() {
                            chip.insert(reg.wrapping_add(i as u8), *v);
                        }
                        state.i2c_pointer.insert(key, reg);
                    }
                }
                Direction::In => {
                    for (i, b) in data.iter_mut().enumerate() {
                        *b = chip.get(&pointer.wrapping_add(i as u8)).copied().unwrap_or(0);
                    }
                }
            }
            Ok(())
        }

        /// Current value of one register in a mock I2C chip.
        pub fn i2c_register(&self, id: &RegistryId, addr: u8, reg: u8) -> Option<u8> {
            let state = self.state();
            state
                .device(id)
                .ok()
                .and_then(|d| d.i2c.get(&addr))
                .and_then(|chip| chip.get(&reg).copied())
        }
    }

    impl UsbTransport for MockTransport {
        type Device = MockDeviceHandle;
        type Interface = MockInterfaceHandle;

        fn list_devices(&self) -> Result<Vec<RegistryId>> {
            Ok(self
                .state()
                .devices
                .iter()
                .map(|d| d.identity.registry_id.clone())
                .collect())
        }

        fn identify(&self, id: &RegistryId) -> Result<DeviceIdentity> {
            Ok(self.state().device(id)?.identity.clone())
        }

        fn open_device(&self, id: &RegistryId) -> Result<MockDeviceHandle> {
            let mut state = self.state();
            if state.device(id)?.fail_open {
                return Err(DeviceError::OpenFailed(format!("USB open {id}: mock failure")));
            }
            let token = state.issue_token();
            state.live_devices.insert(token);
            state.device_opens += 1;
            Ok(MockDeviceHandle {
                id: id.clone(),
                token,
            })
        }

        /// Panics when the handle was already released.
        fn close_device(&self, device: MockDeviceHandle) {
            let mut state = self.state();
            state.device_releases += 1;
            let live = state.live_devices.remove(&device.token);
            drop(state);
            assert!(live, "mock: device handle {} released twice", device.token);
        }

        fn configuration_value(&self, device: &MockDeviceHandle) -> Result<u8> {
            Ok(self.state().device(&device.id)?.configuration)
        }

        fn set_configuration(&self, device: &MockDeviceHandle, value: u8) -> Result<()> {
            let mut state = self.state();
            state.device(&device.id)?;
            state.configurations_set.push((device.id.clone(), value));
            Ok(())
        }

        fn list_interfaces(&self, device: &MockDeviceHandle) -> Result<Vec<InterfaceInfo>> {
            Ok(self
                .state()
                .device(&device.id)?
                .interfaces
                .iter()
                .map(|i| i.info)
                .collect())
        }

        fn open_interface(
            &self,
            device: &MockDeviceHandle,
            number: u8,
        ) -> Result<MockInterfaceHandle> {
            let mut state = self.state();
            let iface = state
                .device(&device.id)?
                .interfaces
                .iter()
                .find(|i| i.info.number == number)
                .ok_or_else(|| {
                    DeviceError::InterfaceClaimFailed(format!("interface {number}: not present"))
                })?;
            if iface.fail_claim {
                return Err(DeviceError::InterfaceClaimFailed(format!(
                    "interface {number}: mock failure"
                )));
            }
            let token = state.issue_token();
            state.live_interfaces.insert(token);
            state.interface_claims += 1;
            Ok(MockInterfaceHandle {
                id: device.id.clone(),
                number,
                token,
            })
        }

        /// Panics when the handle was already released.
        fn close_interface(&self, interface: MockInterfaceHandle) {
            let mut state = self.state();
            state.interface_releases += 1;
            let live = state.live_interfaces.remove(&interface.token);
            drop(state);
            assert!(live, "mock: interface handle {} released twice", interface.token);
        }

        fn list_endpoints(&self, interface: &MockInterfaceHandle) -> Result<Vec<EndpointInfo>> {
            Ok(self
                .state()
                .device(&interface.id)?
                .interfaces
                .iter()
                .find(|i| i.info.number == interface.number)
                .map(|i| i.endpoints.clone())
                .unwrap_or_default())
        }

        fn control_transfer(
            &self,
            device: &MockDeviceHandle,
            setup: ControlSetup,
            data: &mut [u8],
        ) -> std::result::Result<usize, TransferError> {
            let mut state = self.state();
            let ordinal = state.transfer_count;
            state.transfer_count += 1;

            let injected = state.fail_at == Some(ordinal)
                || state.fail_when.as_ref().is_some_and(|pred| pred(&setup, &*data));
            if injected {
                return Err(TransferError::control(setup, "mock: injected failure"));
            }
            if state.device(&device.id).is_err() {
                return Err(TransferError::control(setup, "mock: device disconnected"));
            }

            if setup.index == I2C_INDEX {
                Self::i2c_transfer(&mut state, &device.id, setup, data)?;
            } else if setup.direction == Direction::In {
                data.fill(0);
            }

            state.log.push(ControlRecord {
                device: device.id.clone(),
                setup,
                data: data.to_vec(),
            });
            Ok(data.len())
        }

        fn bulk_in(
            &self,
            interface: &MockInterfaceHandle,
            endpoint: u8,
            buf: &mut [u8],
        ) -> std::result::Result<usize, TransferError> {
            let mut state = self.state();
            let dev = state
                .device_mut(&interface.id)
                .ok_or_else(|| TransferError::Bulk {
                    endpoint,
                    reason: "mock: device disconnected".into(),
                })?;
            let n = buf.len().min(dev.bulk_data.len());
            buf[..n].copy_from_slice(&dev.bulk_data[..n]);
            dev.bulk_data = dev.bulk_data.split_off(n);
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn setup_request_type_follows_direction() {
        assert_eq!(ControlSetup::vendor_out(0, 0).request_type(), 0x40);
        assert_eq!(ControlSetup::vendor_in(0, 0).request_type(), 0xC0);
        assert_eq!(ControlSetup::vendor_in(0, 0).request, 0);
    }

    #[test]
    fn setup_display_is_hex() {
        let s = ControlSetup::vendor_out(0x0200, 0x0210).to_string();
        assert_eq!(s, "bmRequestType=0x40 wValue=0x0200 wIndex=0x0210");
    }

    #[test]
    fn endpoint_address_sets_direction_bit() {
        assert_eq!(bulk_in_endpoint(1).address(), 0x81);
        let out = EndpointInfo {
            direction: Direction::Out,
            ..bulk_in_endpoint(2)
        };
        assert_eq!(out.address(), 0x02);
    }

    #[test]
    fn identity_usb_id_format() {
        let dev = MockUsbDevice::rtl2832u("a");
        assert_eq!(dev.identity.usb_id(), "0bda:2838");
    }

    #[test]
    fn identity_serializes_registry_id_as_string() {
        let dev = MockUsbDevice::rtl2832u("usb:001/004");
        let json = serde_json::to_value(&dev.identity).unwrap();
        assert_eq!(json["registry_id"], "usb:001/004");
        assert_eq!(json["vendor_id"], 0x0BDA);
    }

    #[test]
    fn not_supported_is_benign() {
        let e = DeviceError::NotSupportedDevice {
            vendor_id: 0x1234,
            product_id: 0x5678,
        };
        assert!(e.is_not_supported());
        assert!(!DeviceError::TunerNotFound.is_not_supported());
        assert_eq!(
            e.to_string(),
            "Not a supported RTL2832U device (1234:5678)"
        );
    }

    #[test]
    fn transfer_error_display_includes_setup() {
        let e = TransferError::control(ControlSetup::vendor_out(0x0120, 0x0011), "timeout");
        let msg = DeviceError::from(e).to_string();
        assert!(msg.contains("wIndex=0x0011"), "{msg}");
        assert!(msg.ends_with(": timeout"), "{msg}");
    }

    #[test]
    fn device_error_source_chains_transfer() {
        let e = DeviceError::Transfer(TransferError::Bulk {
            endpoint: 0x81,
            reason: "stall".into(),
        });
        let source = std::error::Error::source(&e).unwrap();
        assert!(source.to_string().contains("stall"));
    }

    #[test]
    fn mock_counts_handles() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let id = RegistryId::new("a");
        let dev = t.open_device(&id).unwrap();
        let iface = t.open_interface(&dev, 0).unwrap();
        assert_eq!((t.open_device_count(), t.open_interface_count()), (1, 1));
        t.close_interface(iface);
        t.close_device(dev);
        assert_eq!((t.open_device_count(), t.open_interface_count()), (0, 0));
        assert_eq!(t.device_opens(), 1);
        assert_eq!((t.device_releases(), t.interface_releases()), (1, 1));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn mock_rejects_double_device_release() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        t.close_device(dev.clone());
        t.close_device(dev);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn mock_rejects_double_interface_release() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        let iface = t.open_interface(&dev, 0).unwrap();
        t.close_interface(iface.clone());
        t.close_interface(iface);
    }

    #[test]
    fn mock_handles_get_distinct_tokens() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let id = RegistryId::new("a");
        let a = t.open_device(&id).unwrap();
        let b = t.open_device(&id).unwrap();
        assert_ne!(a.token, b.token);
        t.close_device(a);
        assert_eq!(t.open_device_count(), 1);
        t.close_device(b);
    }

    #[test]
    fn mock_i2c_register_read() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        let mut reg = [0x00u8];
        t.control_transfer(&dev, ControlSetup::vendor_out(0x34, 0x0610), &mut reg)
            .unwrap();
        let mut out = [0u8; 1];
        t.control_transfer(&dev, ControlSetup::vendor_in(0x34, 0x0610), &mut out)
            .unwrap();
        assert_eq!(out[0], 0x69);
    }

    #[test]
    fn mock_i2c_absent_chip_fails() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        let mut out = [0u8; 1];
        let err = t
            .control_transfer(&dev, ControlSetup::vendor_in(0x74, 0x0610), &mut out)
            .unwrap_err();
        assert!(err.to_string().contains("no I2C ack"));
    }

    #[test]
    fn mock_injected_failure_by_ordinal() {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        t.fail_transfer_at(1);
        let mut b = [0u8; 1];
        assert!(t.control_transfer(&dev, ControlSetup::vendor_out(0, 0x10), &mut b).is_ok());
        assert!(t.control_transfer(&dev, ControlSetup::vendor_out(0, 0x10), &mut b).is_err());
        assert!(t.control_transfer(&dev, ControlSetup::vendor_out(0, 0x10), &mut b).is_ok());
        assert_eq!(t.transfers().len(), 2);
        assert_eq!(t.transfer_count(), 3);
    }

    #[test]
    fn mock_bulk_in_drains_data() {
        let t = MockTransport::new()
            .with_device(MockUsbDevice::rtl2832u("a").with_bulk_data(vec![1, 2, 3]));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        let iface = t.open_interface(&dev, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(t.bulk_in(&iface, 0x81, &mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(t.bulk_in(&iface, 0x81, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
    }
}
