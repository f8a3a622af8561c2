//! Device session: one dongle taken from "discovered" to "ready to stream".
//!
//! A session owns its USB handles. They are released exactly once, by
//! [`DeviceSession::close`] or on drop, which also covers every early return
//! during bring-up.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::baseband::{self, FirCoefficients};
use crate::error::{Result, RtlprobeError};
use crate::protocol::*;
use crate::register::{RegisterBus, Width};
use crate::tuner::{self, GainMode, Tuner, TunerDelegate, TunerKind};
use crate::usb::{
    self, DeviceError, DeviceIdentity, Direction, EndpointInfo, TransferType, UsbTransport,
};

/// Bring-up progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Discovered,
    ConfiguredUsb,
    BasebandInitialized,
    TunerResolved,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Discovered => "discovered",
            SessionState::ConfiguredUsb => "usb configured",
            SessionState::BasebandInitialized => "baseband initialized",
            SessionState::TunerResolved => "tuner resolved",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub rtl_xtal_hz: u32,
    pub fir: FirCoefficients,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            rtl_xtal_hz: DEFAULT_RTL_XTAL_HZ,
            fir: FirCoefficients::default(),
        }
    }
}

/// True for the IQ stream pipe: endpoint 1, bulk, device-to-host.
pub fn is_sample_endpoint(ep: &EndpointInfo) -> bool {
    ep.number == BULK_ENDPOINT_NUMBER
        && ep.direction == Direction::In
        && ep.transfer_type == TransferType::Bulk
}

pub struct DeviceSession<T: UsbTransport> {
    transport: Arc<T>,
    identity: DeviceIdentity,
    config: SessionConfig,
    device: Option<T::Device>,
    interface: Option<T::Interface>,
    interface_number: Option<u8>,
    endpoint: Option<EndpointInfo>,
    tuner: Option<Box<dyn Tuner>>,
    state: SessionState,
}

impl<T: UsbTransport> DeviceSession<T> {
    /// Open the device and run the full bring-up.
    ///
    /// On error every handle acquired so far has already been released.
    pub fn open(
        transport: Arc<T>,
        identity: DeviceIdentity,
        config: SessionConfig,
    ) -> usb::Result<Self> {
        let mut session = DeviceSession {
            transport,
            identity,
            config,
            device: None,
            interface: None,
            interface_number: None,
            endpoint: None,
            tuner: None,
            state: SessionState::Discovered,
        };
        if let Err(e) = session.bring_up() {
            warn!(
                "Bring-up of {} failed at '{}': {e}",
                session.identity.registry_id, session.state
            );
            return Err(e);
        }
        Ok(session)
    }

    fn bring_up(&mut self) -> usb::Result<()> {
        self.configure_usb()?;
        self.advance(SessionState::ConfiguredUsb);

        let fir = self.config.fir;
        baseband::init_baseband(&self.bus()?, &fir)?;
        self.advance(SessionState::BasebandInitialized);

        let found = tuner::discover_tuner(&self.bus()?)?;
        self.tuner = Some(found);
        self.advance(SessionState::TunerResolved);

        self.init_tuner()?;
        self.advance(SessionState::Ready);
        info!(
            "{} ({}) ready: interface {}, tuner {}",
            self.identity.registry_id,
            self.identity.usb_id(),
            self.interface_number.unwrap_or_default(),
            self.tuner_kind().map(|k| k.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    fn advance(&mut self, next: SessionState) {
        debug!("{}: {} -> {next}", self.identity.registry_id, self.state);
        self.state = next;
    }

    fn configure_usb(&mut self) -> usb::Result<()> {
        let device = self.transport.open_device(&self.identity.registry_id)?;
        let device = self.device.insert(device);
        let config = self.transport.configuration_value(device)?;
        self.transport.set_configuration(device, config)?;
        self.select_interface()
    }

    /// Claim the interface carrying the sample endpoint.
    ///
    /// Every interface is looked at; the first with a matching pipe stays
    /// claimed and the others are released straight away.
    fn select_interface(&mut self) -> usb::Result<()> {
        let device = self.device.as_ref().ok_or(DeviceError::SessionClosed)?;
        let interfaces = self.transport.list_interfaces(device)?;

        for info in interfaces {
            if self.interface.is_some() {
                debug!("Interface {} not needed, left unclaimed", info.number);
                continue;
            }
            let iface = self.transport.open_interface(device, info.number)?;
            let endpoints = match self.transport.list_endpoints(&iface) {
                Ok(eps) => eps,
                Err(e) => {
                    self.transport.close_interface(iface);
                    return Err(e);
                }
            };
            debug!(
                "Interface {} (class 0x{:02X}/0x{:02X}): {} endpoints",
                info.number,
                info.class,
                info.subclass,
                endpoints.len()
            );
            match endpoints.into_iter().find(is_sample_endpoint) {
                Some(ep) => {
                    self.interface = Some(iface);
                    self.interface_number = Some(info.number);
                    self.endpoint = Some(ep);
                }
                None => self.transport.close_interface(iface),
            }
        }

        if self.interface.is_none() {
            return Err(DeviceError::EndpointNotFound);
        }
        Ok(())
    }

    fn bus(&self) -> usb::Result<RegisterBus<'_, T>> {
        let device = self.device.as_ref().ok_or(DeviceError::SessionClosed)?;
        Ok(RegisterBus::new(&*self.transport, device, self.config.rtl_xtal_hz))
    }

    fn init_tuner(&mut self) -> usb::Result<()> {
        let (Some(device), Some(tuner)) = (self.device.as_ref(), self.tuner.as_mut()) else {
            return Err(DeviceError::SessionClosed);
        };
        let bus = RegisterBus::new(&*self.transport, device, self.config.rtl_xtal_hz);
        tuner::with_repeater(&bus, |bus| tuner.init(bus)).map_err(|e| match e {
            tuner::TunerError::I2c(t) => DeviceError::Transfer(t),
            _ => DeviceError::TunerNotFound,
        })
    }

    // ── Accessors ──

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn interface_number(&self) -> Option<u8> {
        self.interface_number
    }

    pub fn endpoint(&self) -> Option<EndpointInfo> {
        self.endpoint
    }

    pub fn tuner_kind(&self) -> Option<TunerKind> {
        self.tuner.as_ref().map(|t| t.kind())
    }

    pub fn rtl_xtal_hz(&self) -> u32 {
        self.config.rtl_xtal_hz
    }

    // ── Tuner operations ──

    /// Run a tuner call with the repeater open around it.
    fn with_tuner<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Tuner, &dyn TunerDelegate) -> tuner::Result<R>,
    ) -> Result<R> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::SessionClosed.into());
        }
        let (Some(device), Some(tuner)) = (self.device.as_ref(), self.tuner.as_mut()) else {
            return Err(DeviceError::SessionClosed.into());
        };
        let bus = RegisterBus::new(&*self.transport, device, self.config.rtl_xtal_hz);
        Ok(tuner::with_repeater(&bus, |bus| f(tuner.as_mut(), bus))?)
    }

    pub fn tuner_init(&mut self) -> Result<()> {
        self.with_tuner(|t, bus| t.init(bus))
    }

    pub fn tuner_exit(&mut self) -> Result<()> {
        self.with_tuner(|t, bus| t.exit(bus))
    }

    pub fn set_center_freq(&mut self, freq_hz: u32) -> Result<()> {
        self.with_tuner(|t, bus| t.set_frequency(bus, freq_hz))
    }

    /// Returns the IF frequency the demodulator now uses.
    pub fn set_tuner_bandwidth(&mut self, bandwidth_hz: u32) -> Result<u32> {
        self.with_tuner(|t, bus| t.set_bandwidth(bus, bandwidth_hz))
    }

    /// Gain in tenths of a dB.
    pub fn set_tuner_gain(&mut self, gain: i32) -> Result<()> {
        self.with_tuner(|t, bus| t.set_gain(bus, gain))
    }

    pub fn set_tuner_if_gain(&mut self, stage: i32, gain: i32) -> Result<()> {
        self.with_tuner(|t, bus| t.set_if_gain(bus, stage, gain))
    }

    pub fn set_tuner_gain_mode(&mut self, mode: GainMode) -> Result<()> {
        self.with_tuner(|t, bus| t.set_gain_mode(bus, mode))
    }

    // ── Streaming ──

    /// Flush the endpoint A FIFO before a read.
    pub fn reset_buffer(&self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::SessionClosed.into());
        }
        let bus = self.bus()?;
        bus.write_reg(RegisterBlock::Usb, USB_EPA_CTL, 0x1002, Width::Word)
            .map_err(DeviceError::from)?;
        bus.write_reg(RegisterBlock::Usb, USB_EPA_CTL, 0x0000, Width::Word)
            .map_err(DeviceError::from)?;
        Ok(())
    }

    /// Blocking read of raw IQ bytes from the sample endpoint.
    pub fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        let (Some(iface), Some(ep)) = (self.interface.as_ref(), self.endpoint) else {
            return Err(DeviceError::SessionClosed.into());
        };
        self.transport
            .bulk_in(iface, ep.address(), buf)
            .map_err(|e| RtlprobeError::Device(DeviceError::Transfer(e)))
    }

    // ── Teardown ──

    /// Put tuner and demodulator to sleep (if ready) and release USB handles.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state == SessionState::Ready {
            if let Err(e) = self.tuner_exit() {
                warn!("{}: tuner standby failed: {e}", self.identity.registry_id);
            }
            // power off demodulator and ADCs
            if let Err(e) = self
                .bus()
                .and_then(|bus| Ok(bus.write_reg(RegisterBlock::System, DEMOD_CTL, 0x20, Width::Byte)?))
            {
                warn!("{}: demod power-off failed: {e}", self.identity.registry_id);
            }
        }
        self.release();
        self.advance(SessionState::Closed);
    }

    /// Interface first, then the device.
    fn release(&mut self) {
        if let Some(iface) = self.interface.take() {
            self.transport.close_interface(iface);
        }
        if let Some(device) = self.device.take() {
            self.transport.close_device(device);
        }
        self.endpoint = None;
        self.tuner = None;
    }
}

impl<T: UsbTransport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: UsbTransport> fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("interface", &self.interface_number)
            .field("endpoint", &self.endpoint)
            .field("tuner", &self.tuner_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{MockTransport, MockUsbDevice, bulk_in_endpoint};
    use crate::usb::{InterfaceInfo, RegistryId};

    fn open(t: &Arc<MockTransport>, id: &str) -> usb::Result<DeviceSession<MockTransport>> {
        let identity = t.identify(&RegistryId::new(id)).unwrap();
        DeviceSession::open(Arc::clone(t), identity, SessionConfig::default())
    }

    #[test]
    fn sample_endpoint_match() {
        assert!(is_sample_endpoint(&bulk_in_endpoint(1)));
        assert!(!is_sample_endpoint(&bulk_in_endpoint(2)));
        let out = EndpointInfo {
            direction: Direction::Out,
            ..bulk_in_endpoint(1)
        };
        assert!(!is_sample_endpoint(&out));
        let intr = EndpointInfo {
            transfer_type: TransferType::Interrupt,
            ..bulk_in_endpoint(1)
        };
        assert!(!is_sample_endpoint(&intr));
    }

    #[test]
    fn open_reaches_ready() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let s = open(&t, "a").unwrap();
        assert!(s.is_ready());
        assert_eq!(s.tuner_kind(), Some(TunerKind::R820T));
        assert_eq!(s.interface_number(), Some(0));
        assert_eq!(s.endpoint().map(|e| e.address()), Some(0x81));
        assert_eq!(t.configurations_set(), vec![(RegistryId::new("a"), 1)]);
        assert_eq!((t.open_device_count(), t.open_interface_count()), (1, 1));
    }

    #[test]
    fn drop_releases_handles() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        drop(open(&t, "a").unwrap());
        assert_eq!((t.open_device_count(), t.open_interface_count()), (0, 0));
    }

    #[test]
    fn close_is_idempotent_and_blocks_operations() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let mut s = open(&t, "a").unwrap();
        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(
            s.set_tuner_gain_mode(GainMode::Manual),
            Err(RtlprobeError::Device(DeviceError::SessionClosed))
        ));
        assert!(s.reset_buffer().is_err());
        assert_eq!(t.open_device_count(), 0);
    }

    #[test]
    fn close_powers_down_demod() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let mut s = open(&t, "a").unwrap();
        t.clear_transfers();
        s.close();
        let last = t.transfers().pop().unwrap();
        assert_eq!((last.setup.index, last.setup.value), (0x0210, 0x0200));
        assert_eq!(last.data, vec![0x20]);
    }

    #[test]
    fn missing_endpoint_releases_everything() {
        let dev = MockUsbDevice::new("a", 0x0bda, 0x2838).with_interface(
            InterfaceInfo {
                number: 0,
                class: 0xFF,
                subclass: 0xFF,
            },
            vec![bulk_in_endpoint(2)],
        );
        let t = Arc::new(MockTransport::new().with_device(dev));
        assert!(matches!(open(&t, "a"), Err(DeviceError::EndpointNotFound)));
        assert_eq!((t.open_device_count(), t.open_interface_count()), (0, 0));
        assert_eq!(t.transfer_count(), 0);
    }

    #[test]
    fn claim_failure_is_reported() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        t.set_fail_claim(&RegistryId::new("a"), 0);
        assert!(matches!(
            open(&t, "a"),
            Err(DeviceError::InterfaceClaimFailed(_))
        ));
        assert_eq!(t.open_device_count(), 0);
    }

    #[test]
    fn reset_buffer_strobes_epa_ctl() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let s = open(&t, "a").unwrap();
        t.clear_transfers();
        s.reset_buffer().unwrap();
        let log = t.transfers();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|r| r.setup.value == USB_EPA_CTL && r.setup.index == 0x0110));
        assert_eq!(log[0].data, vec![0x10, 0x02]);
        assert_eq!(log[1].data, vec![0x00, 0x00]);
    }

    #[test]
    fn read_sync_reads_bulk_endpoint() {
        let t = Arc::new(
            MockTransport::new()
                .with_device(MockUsbDevice::rtl2832u("a").with_bulk_data(vec![127, 128, 126, 129])),
        );
        let s = open(&t, "a").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(s.read_sync(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[127, 128, 126, 129]);
    }

    #[test]
    fn tuner_ops_toggle_repeater() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let mut s = open(&t, "a").unwrap();
        t.clear_transfers();
        let if_hz = s.set_tuner_bandwidth(1_000_000).unwrap();
        assert_eq!(if_hz, 1_700_000);
        let demod_ctrl: Vec<u8> = t
            .transfers()
            .into_iter()
            .filter(|r| r.setup.index == 0x11 && r.setup.value == 0x0120)
            .map(|r| r.data[0])
            .collect();
        assert_eq!(demod_ctrl, vec![0x18, 0x10]);
    }

    #[test]
    fn tuner_errors_keep_their_code() {
        let t = Arc::new(MockTransport::new().with_device(MockUsbDevice::rtl2832u("a")));
        let mut s = open(&t, "a").unwrap();
        match s.set_center_freq(100_000_000) {
            Err(RtlprobeError::Tuner(e)) => assert_eq!(e.code(), -95),
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.set_tuner_if_gain(0, 0).is_ok());
    }
}
