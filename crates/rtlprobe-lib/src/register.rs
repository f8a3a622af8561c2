//! Register access over vendor control transfers.
//!
//! [`RegisterBus`] borrows a transport and an open device handle and turns
//! block/page/address triples into control transfers. It is also the
//! [`TunerDelegate`] handed to tuner drivers.

use log::trace;

use crate::protocol::*;
use crate::tuner::TunerDelegate;
use crate::usb::{ControlSetup, TransferError, UsbTransport};

pub type Result<T> = std::result::Result<T, TransferError>;

/// Register payload width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub const fn len(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }

    /// Big-endian payload for writes; a byte register takes only the low byte.
    fn encode(self, value: u16) -> ([u8; 2], usize) {
        match self {
            Width::Byte => ([value as u8, 0], 1),
            Width::Word => (value.to_be_bytes(), 2),
        }
    }
}

/// `wValue` for a paged demodulator access.
pub const fn demod_value(addr: u16) -> u16 {
    (addr << 8) | DEMOD_VALUE_FLAG
}

/// Signed IF register value for `if_hz` with crystal `rtl_xtal_hz`.
///
/// `-(if * 2^22 / xtal)`, truncated toward zero.
pub fn if_freq_word(if_hz: u32, rtl_xtal_hz: u32) -> i32 {
    let scaled = (f64::from(if_hz) * f64::from(1u32 << 22)) / f64::from(rtl_xtal_hz);
    -(scaled as i32)
}

pub struct RegisterBus<'a, T: UsbTransport> {
    transport: &'a T,
    device: &'a T::Device,
    rtl_xtal_hz: u32,
}

impl<'a, T: UsbTransport> RegisterBus<'a, T> {
    pub fn new(transport: &'a T, device: &'a T::Device, rtl_xtal_hz: u32) -> Self {
        RegisterBus {
            transport,
            device,
            rtl_xtal_hz,
        }
    }

    fn transfer(&self, setup: ControlSetup, data: &mut [u8]) -> Result<()> {
        let n = self.transport.control_transfer(self.device, setup, data)?;
        trace!("{setup} len={} -> {:02X?}", data.len(), &data[..n.min(data.len())]);
        if n < data.len() {
            return Err(TransferError::Short {
                setup,
                expected: data.len(),
                actual: n,
            });
        }
        Ok(())
    }

    fn write_array(&self, block: RegisterBlock, addr: u16, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        let setup = ControlSetup::vendor_out(addr, block.base_offset() | WRITE_FLAG);
        self.transfer(setup, &mut buf)
    }

    // Block reads carry the flag too; only demodulator page reads drop it.
    fn read_array(&self, block: RegisterBlock, addr: u16, data: &mut [u8]) -> Result<()> {
        let setup = ControlSetup::vendor_in(addr, block.base_offset() | WRITE_FLAG);
        self.transfer(setup, data)
    }

    // ── Block registers ──

    pub fn write_reg(&self, block: RegisterBlock, addr: u16, value: u16, width: Width) -> Result<()> {
        let (buf, len) = width.encode(value);
        self.write_array(block, addr, &buf[..len])
    }

    /// Read a block register. Replies arrive LSB first.
    pub fn read_reg(&self, block: RegisterBlock, addr: u16, width: Width) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_array(block, addr, &mut buf[..width.len()])?;
        Ok(u16::from_le_bytes(buf))
    }

    // ── Demodulator pages ──

    /// Paged demodulator write, followed by the status read-back the chip needs.
    pub fn demod_write_reg(&self, page: u8, addr: u16, value: u16, width: Width) -> Result<()> {
        let (mut buf, len) = width.encode(value);
        let setup = ControlSetup::vendor_out(demod_value(addr), u16::from(page) | WRITE_FLAG);
        self.transfer(setup, &mut buf[..len])?;
        self.demod_read_reg(DEMOD_STATUS_PAGE, DEMOD_STATUS_ADDR, Width::Byte)?;
        Ok(())
    }

    pub fn demod_read_reg(&self, page: u8, addr: u16, width: Width) -> Result<u16> {
        let mut buf = [0u8; 2];
        let setup = ControlSetup::vendor_in(demod_value(addr), u16::from(page));
        self.transfer(setup, &mut buf[..width.len()])?;
        Ok(u16::from_le_bytes(buf))
    }

    // ── I2C through the demodulator ──

    pub fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<()> {
        self.write_array(RegisterBlock::I2c, u16::from(i2c_addr), data)
    }

    /// Set the chip's register pointer, then read one byte back.
    pub fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8> {
        self.i2c_write(i2c_addr, &[reg])?;
        let mut buf = [0u8; 1];
        self.read_array(RegisterBlock::I2c, u16::from(i2c_addr), &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_i2c_repeater(&self, enabled: bool) -> Result<()> {
        let value = if enabled {
            I2C_REPEATER_ON
        } else {
            I2C_REPEATER_OFF
        };
        self.demod_write_reg(1, DEMOD_CTRL_ADDR, value, Width::Byte)
    }

    pub fn set_if_freq(&self, if_hz: u32) -> Result<()> {
        let word = if_freq_word(if_hz, self.rtl_xtal_hz);
        self.demod_write_reg(1, DEMOD_IF_FREQ_ADDR, ((word >> 16) & 0x3F) as u16, Width::Byte)?;
        self.demod_write_reg(1, DEMOD_IF_FREQ_ADDR + 1, ((word >> 8) & 0xFF) as u16, Width::Byte)?;
        self.demod_write_reg(1, DEMOD_IF_FREQ_ADDR + 2, (word & 0xFF) as u16, Width::Byte)
    }
}

impl<T: UsbTransport> TunerDelegate for RegisterBus<'_, T> {
    fn set_i2c_repeater(&self, enabled: bool) -> Result<()> {
        RegisterBus::set_i2c_repeater(self, enabled)
    }

    fn i2c_write(&self, i2c_addr: u8, data: &[u8]) -> Result<()> {
        RegisterBus::i2c_write(self, i2c_addr, data)
    }

    fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8> {
        RegisterBus::i2c_read_reg(self, i2c_addr, reg)
    }

    fn disable_zero_if(&self) -> Result<()> {
        self.demod_write_reg(1, DEMOD_ZERO_IF_ADDR, ZERO_IF_DISABLED, Width::Byte)
    }

    fn enable_in_phase_adc_only(&self) -> Result<()> {
        self.demod_write_reg(0, DEMOD_ADC_INPUT_ADDR, ADC_IN_PHASE_ONLY, Width::Byte)
    }

    fn set_if_frequency(&self, if_hz: u32) -> Result<()> {
        self.set_if_freq(if_hz)
    }

    fn enable_spectrum_inversion(&self) -> Result<()> {
        self.demod_write_reg(1, DEMOD_SPEC_INV_ADDR, 0x01, Width::Byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::{MockTransport, MockUsbDevice};
    use crate::usb::{Direction, RegistryId};

    fn setup() -> (MockTransport, crate::usb::mock::MockDeviceHandle) {
        let t = MockTransport::new().with_device(MockUsbDevice::rtl2832u("a"));
        let dev = t.open_device(&RegistryId::new("a")).unwrap();
        (t, dev)
    }

    #[test]
    fn write_reg_word_is_big_endian() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.write_reg(RegisterBlock::Usb, USB_EPA_CTL, 0x1002, Width::Word)
            .unwrap();
        let log = t.transfers();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].setup.index, 0x0110);
        assert_eq!(log[0].setup.value, USB_EPA_CTL);
        assert_eq!(log[0].data, vec![0x10, 0x02]);
    }

    #[test]
    fn write_reg_byte_keeps_low_byte() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.write_reg(RegisterBlock::System, DEMOD_CTL, 0x01E8, Width::Byte)
            .unwrap();
        assert_eq!(t.transfers()[0].data, vec![0xE8]);
    }

    #[test]
    fn read_reg_sets_flag_on_block_index() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        assert_eq!(bus.read_reg(RegisterBlock::Usb, USB_SYSCTL, Width::Byte).unwrap(), 0);
        let rec = &t.transfers()[0];
        assert_eq!(rec.setup.direction, Direction::In);
        assert_eq!(rec.setup.index, 0x0110);
        assert_eq!(rec.data.len(), 1);
    }

    #[test]
    fn system_read_uses_same_index_as_write() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.write_reg(RegisterBlock::System, DEMOD_CTL, 0xE8, Width::Byte)
            .unwrap();
        bus.read_reg(RegisterBlock::System, DEMOD_CTL, Width::Byte)
            .unwrap();
        let log = t.transfers();
        assert_eq!((log[0].setup.index, log[0].setup.value), (0x0210, 0x0200));
        assert_eq!((log[1].setup.index, log[1].setup.value), (0x0210, 0x0200));
        assert_eq!(log[1].setup.direction, Direction::In);
    }

    #[test]
    fn demod_read_uses_bare_page_index() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.demod_read_reg(1, 0x01, Width::Byte).unwrap();
        let rec = &t.transfers()[0];
        assert_eq!(rec.setup.index, 0x01);
        assert_eq!(rec.setup.value, 0x0120);
    }

    #[test]
    fn i2c_read_sets_pointer_then_reads() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        assert_eq!(bus.i2c_read_reg(0x34, 0x00).unwrap(), 0x69);
        let log = t.transfers();
        assert_eq!(log.len(), 2);
        assert_eq!((log[0].setup.index, log[0].setup.value), (0x0610, 0x34));
        assert_eq!(log[0].data, vec![0x00]);
        assert_eq!((log[1].setup.index, log[1].setup.value), (0x0610, 0x34));
        assert_eq!(log[1].setup.direction, Direction::In);
    }

    #[test]
    fn repeater_writes_page1_reg1() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.set_i2c_repeater(true).unwrap();
        bus.set_i2c_repeater(false).unwrap();
        let writes: Vec<_> = t
            .transfers()
            .into_iter()
            .filter(|r| r.setup.direction == Direction::Out)
            .collect();
        assert_eq!(writes[0].data, vec![0x18]);
        assert_eq!(writes[1].data, vec![0x10]);
        assert!(writes.iter().all(|w| w.setup.value == 0x0120 && w.setup.index == 0x11));
    }

    #[test]
    fn if_word_for_r82xx_default() {
        // 3.57 MHz at 28.8 MHz xtal
        assert_eq!(if_freq_word(3_570_000, 28_800_000), -519_918);
    }

    #[test]
    fn set_if_freq_writes_three_registers() {
        let (t, dev) = setup();
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        bus.set_if_freq(3_570_000).unwrap();
        let word = if_freq_word(3_570_000, DEFAULT_RTL_XTAL_HZ);
        let writes: Vec<_> = t
            .transfers()
            .into_iter()
            .filter(|r| r.setup.direction == Direction::Out)
            .map(|r| (r.setup.value >> 8, r.data[0]))
            .collect();
        assert_eq!(
            writes,
            vec![
                (0x19, ((word >> 16) & 0x3F) as u8),
                (0x1A, ((word >> 8) & 0xFF) as u8),
                (0x1B, (word & 0xFF) as u8),
            ]
        );
    }

    #[test]
    fn failure_surfaces_transfer_error() {
        let (t, dev) = setup();
        t.fail_transfer_at(0);
        let bus = RegisterBus::new(&t, &dev, DEFAULT_RTL_XTAL_HZ);
        let err = bus
            .write_reg(RegisterBlock::Usb, USB_SYSCTL, 0x09, Width::Byte)
            .unwrap_err();
        assert!(matches!(err, TransferError::Control { .. }));
    }
}
