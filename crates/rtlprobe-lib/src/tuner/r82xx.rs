//! Rafael Micro R820T / R828D driver.
//!
//! Only register sequencing is implemented here. PLL synthesis and the LNA/
//! mixer gain tables are not, so `set_frequency` and `set_gain` validate their
//! input and then report [`TunerError::Unsupported`].

use log::debug;

use super::{GainMode, Result, Tuner, TunerDelegate, TunerError, TunerKind, with_repeater};

pub const R820T_I2C_ADDR: u8 = 0x34;
pub const R828D_I2C_ADDR: u8 = 0x74;
pub const CHECK_REG: u8 = 0x00;
pub const CHECK_VALUE: u8 = 0x69;

/// IF used for the DVB-T 6 MHz mode, and the power-on default.
pub const IF_FREQ_HZ: u32 = 3_570_000;
const IF_FREQ_WIDE_HZ: u32 = 4_570_000;
const IF_FREQ_NARROW_HZ: u32 = 2_300_000;

/// First register held in the shadow file.
const REG_SHADOW_START: u8 = 0x05;

/// Largest I2C message, register byte included.
const MAX_I2C_MSG_LEN: usize = 8;

/// Power-on values for registers 0x05..=0x1F.
const INIT_REGS: [u8; 27] = [
    0x83, 0x32, 0x75, // 05 to 07
    0xc0, 0x40, 0xd6, 0x6c, // 08 to 0b
    0xf5, 0x63, 0x75, 0x68, // 0c to 0f
    0x6c, 0x83, 0x80, 0x00, // 10 to 13
    0x0f, 0x00, 0xc0, 0x30, // 14 to 17
    0x48, 0xcc, 0x60, 0x00, // 18 to 1b
    0x54, 0xae, 0x4a, 0xc0, // 1c to 1f
];

/// Register writes that put the chip in standby.
const STANDBY: [(u8, u8); 11] = [
    (0x06, 0xb1),
    (0x05, 0x03),
    (0x07, 0x3a),
    (0x08, 0x40),
    (0x09, 0xc0),
    (0x0a, 0x36),
    (0x0c, 0x35),
    (0x0f, 0x68),
    (0x11, 0x03),
    (0x17, 0xf4),
    (0x19, 0x0c),
];

// ── IF filter ──

const FILT_HP_BW1: u32 = 350_000;
const FILT_HP_BW2: u32 = 380_000;
const IF_LOW_PASS_BW: [u32; 10] = [
    1_700_000, 1_600_000, 1_550_000, 1_450_000, 1_200_000, 900_000, 700_000, 550_000, 450_000,
    350_000,
];

/// Register 0x0A/0x0B values and resulting IF for a requested bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSetting {
    pub reg_0a: u8,
    pub reg_0b: u8,
    pub if_hz: u32,
}

/// Pick the IF filter for `bandwidth_hz`.
///
/// Above 6 MHz the fixed DVB-T filters are used. Below that the high-pass
/// corners are enabled stage by stage and the narrowest low-pass that still
/// covers the remainder is chosen; the IF is then centred in the passband.
pub fn filter_for_bandwidth(bandwidth_hz: u32) -> FilterSetting {
    if bandwidth_hz > 7_000_000 {
        return FilterSetting {
            reg_0a: 0x10,
            reg_0b: 0x0b,
            if_hz: IF_FREQ_WIDE_HZ,
        };
    }
    if bandwidth_hz > 6_000_000 {
        return FilterSetting {
            reg_0a: 0x10,
            reg_0b: 0x2a,
            if_hz: IF_FREQ_WIDE_HZ,
        };
    }
    if bandwidth_hz > IF_LOW_PASS_BW[0] + FILT_HP_BW1 + FILT_HP_BW2 {
        return FilterSetting {
            reg_0a: 0x10,
            reg_0b: 0x6b,
            if_hz: IF_FREQ_HZ,
        };
    }

    let mut bw = bandwidth_hz;
    let mut reg_0b = 0x80u8;
    let mut if_hz = IF_FREQ_NARROW_HZ;
    let mut real_bw = 0u32;

    if bw > IF_LOW_PASS_BW[0] + FILT_HP_BW1 {
        bw -= FILT_HP_BW2;
        if_hz += FILT_HP_BW2;
        real_bw += FILT_HP_BW2;
    } else {
        reg_0b |= 0x20;
    }

    if bw > IF_LOW_PASS_BW[0] {
        bw -= FILT_HP_BW1;
        if_hz += FILT_HP_BW1;
        real_bw += FILT_HP_BW1;
    } else {
        reg_0b |= 0x40;
    }

    // narrowest filter still wider than what is left
    let wider = IF_LOW_PASS_BW
        .iter()
        .position(|&lp| bw > lp)
        .unwrap_or(IF_LOW_PASS_BW.len());
    let i = wider.saturating_sub(1);
    reg_0b |= 15 - i as u8;
    real_bw += IF_LOW_PASS_BW[i];

    FilterSetting {
        reg_0a: 0x00,
        reg_0b,
        if_hz: if_hz - real_bw / 2,
    }
}

// ── Driver ──

#[derive(Debug)]
pub struct R82xx {
    kind: TunerKind,
    i2c_addr: u8,
    regs: [u8; INIT_REGS.len()],
    initialized: bool,
    gain_mode: GainMode,
    if_hz: u32,
}

impl R82xx {
    pub fn new(kind: TunerKind, i2c_addr: u8) -> Self {
        R82xx {
            kind,
            i2c_addr,
            regs: INIT_REGS,
            initialized: false,
            gain_mode: GainMode::Auto,
            if_hz: IF_FREQ_HZ,
        }
    }

    /// Configure the demodulator for this tuner, then load the register file.
    pub fn boxed(kind: TunerKind, i2c_addr: u8, bus: &dyn TunerDelegate) -> Result<Box<dyn Tuner>> {
        bus.disable_zero_if()?;
        bus.enable_in_phase_adc_only()?;
        bus.set_if_frequency(IF_FREQ_HZ)?;
        bus.enable_spectrum_inversion()?;

        let mut tuner = R82xx::new(kind, i2c_addr);
        with_repeater(bus, |bus| tuner.write_regs(bus, REG_SHADOW_START, &INIT_REGS))?;
        Ok(Box::new(tuner))
    }

    pub fn if_hz(&self) -> u32 {
        self.if_hz
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Shadow copy of a register, if it is one we track.
    pub fn shadow(&self, reg: u8) -> Option<u8> {
        let idx = usize::from(reg.checked_sub(REG_SHADOW_START)?);
        self.regs.get(idx).copied()
    }

    fn shadow_index(reg: u8) -> Result<usize> {
        reg.checked_sub(REG_SHADOW_START)
            .map(usize::from)
            .filter(|&i| i < INIT_REGS.len())
            .ok_or_else(|| TunerError::InvalidParameter(format!("register 0x{reg:02X} not shadowed")))
    }

    /// Write consecutive registers starting at `reg`, split into bus-sized messages.
    ///
    /// The shadow file only takes a chunk once the chip acknowledged it.
    fn write_regs(&mut self, bus: &dyn TunerDelegate, reg: u8, values: &[u8]) -> Result<()> {
        let start = Self::shadow_index(reg)?;
        if start + values.len() > self.regs.len() {
            return Err(TunerError::InvalidParameter(format!(
                "{} bytes from register 0x{reg:02X} overflow the register file",
                values.len()
            )));
        }
        for (n, chunk) in values.chunks(MAX_I2C_MSG_LEN - 1).enumerate() {
            let offset = n * (MAX_I2C_MSG_LEN - 1);
            let mut msg = Vec::with_capacity(chunk.len() + 1);
            msg.push(reg + offset as u8);
            msg.extend_from_slice(chunk);
            bus.i2c_write(self.i2c_addr, &msg)?;
            self.regs[start + offset..start + offset + chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }

    fn write_reg(&mut self, bus: &dyn TunerDelegate, reg: u8, value: u8) -> Result<()> {
        self.write_regs(bus, reg, &[value])
    }

    /// Read-modify-write against the shadow file; only bits in `mask` change.
    fn write_reg_mask(&mut self, bus: &dyn TunerDelegate, reg: u8, value: u8, mask: u8) -> Result<()> {
        let old = self.regs[Self::shadow_index(reg)?];
        self.write_reg(bus, reg, (old & !mask) | (value & mask))
    }
}

impl Tuner for R82xx {
    fn kind(&self) -> TunerKind {
        self.kind
    }

    fn i2c_addr(&self) -> u8 {
        self.i2c_addr
    }

    fn init(&mut self, bus: &dyn TunerDelegate) -> Result<()> {
        self.write_regs(bus, REG_SHADOW_START, &INIT_REGS)?;
        self.initialized = true;
        debug!("{} initialized", self.kind);
        Ok(())
    }

    fn exit(&mut self, bus: &dyn TunerDelegate) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        for (reg, value) in STANDBY {
            self.write_reg(bus, reg, value)?;
        }
        self.initialized = false;
        debug!("{} in standby", self.kind);
        Ok(())
    }

    fn set_frequency(&mut self, _bus: &dyn TunerDelegate, freq_hz: u32) -> Result<()> {
        if !self.initialized {
            return Err(TunerError::NotInitialized);
        }
        if !(24_000_000..=1_766_000_000).contains(&freq_hz) {
            return Err(TunerError::InvalidParameter(format!(
                "frequency {freq_hz} Hz outside 24 MHz..1766 MHz"
            )));
        }
        Err(TunerError::Unsupported("PLL synthesis"))
    }

    fn set_bandwidth(&mut self, bus: &dyn TunerDelegate, bandwidth_hz: u32) -> Result<u32> {
        if bandwidth_hz == 0 {
            return Err(TunerError::InvalidParameter("bandwidth must be non-zero".into()));
        }
        let filter = filter_for_bandwidth(bandwidth_hz);
        self.write_reg_mask(bus, 0x0a, filter.reg_0a, 0x10)?;
        self.write_reg_mask(bus, 0x0b, filter.reg_0b, 0xef)?;
        bus.set_if_frequency(filter.if_hz)?;
        self.if_hz = filter.if_hz;
        debug!("{} bandwidth {bandwidth_hz} Hz, IF {} Hz", self.kind, filter.if_hz);
        Ok(filter.if_hz)
    }

    fn set_gain(&mut self, _bus: &dyn TunerDelegate, _gain: i32) -> Result<()> {
        if !self.initialized {
            return Err(TunerError::NotInitialized);
        }
        if self.gain_mode == GainMode::Auto {
            return Err(TunerError::InvalidParameter(
                "manual gain requires manual gain mode".into(),
            ));
        }
        Err(TunerError::Unsupported("gain table"))
    }

    fn set_if_gain(&mut self, _bus: &dyn TunerDelegate, _stage: i32, _gain: i32) -> Result<()> {
        // R82xx IF gain follows the mixer/VGA settings; nothing to program.
        Ok(())
    }

    fn set_gain_mode(&mut self, bus: &dyn TunerDelegate, mode: GainMode) -> Result<()> {
        match mode {
            GainMode::Manual => {
                // LNA and mixer AGC off, fixed VGA
                self.write_reg_mask(bus, 0x05, 0x10, 0x10)?;
                self.write_reg_mask(bus, 0x07, 0x00, 0x10)?;
                self.write_reg_mask(bus, 0x0c, 0x08, 0x9f)?;
                self.write_reg_mask(bus, 0x05, 0x00, 0x0f)?;
                self.write_reg_mask(bus, 0x07, 0x00, 0x0f)?;
            }
            GainMode::Auto => {
                self.write_reg_mask(bus, 0x05, 0x00, 0x10)?;
                self.write_reg_mask(bus, 0x07, 0x10, 0x10)?;
                self.write_reg_mask(bus, 0x0c, 0x0b, 0x9f)?;
            }
        }
        self.gain_mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::testing::{Call, RecordingDelegate};

    fn i2c_writes(bus: &RecordingDelegate) -> Vec<Vec<u8>> {
        bus.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::I2cWrite(_, data) => Some(data),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn construction_configures_demod_then_loads_registers() {
        let bus = RecordingDelegate::default();
        let tuner = R82xx::boxed(TunerKind::R820T, R820T_I2C_ADDR, &bus).unwrap();
        assert_eq!(tuner.kind(), TunerKind::R820T);
        let calls = bus.calls();
        assert_eq!(
            &calls[..5],
            &[
                Call::DisableZeroIf,
                Call::InPhaseAdcOnly,
                Call::IfFrequency(3_570_000),
                Call::SpectrumInversion,
                Call::Repeater(true),
            ]
        );
        assert_eq!(calls.last(), Some(&Call::Repeater(false)));
    }

    #[test]
    fn register_file_is_chunked() {
        let bus = RecordingDelegate::default();
        R82xx::boxed(TunerKind::R820T, R820T_I2C_ADDR, &bus).unwrap();
        let writes = i2c_writes(&bus);
        assert_eq!(writes.len(), 4);
        assert_eq!(
            writes.iter().map(|w| (w[0], w.len() - 1)).collect::<Vec<_>>(),
            vec![(0x05, 7), (0x0c, 7), (0x13, 7), (0x1a, 6)]
        );
        let payload: Vec<u8> = writes.iter().flat_map(|w| w[1..].to_vec()).collect();
        assert_eq!(payload, INIT_REGS.to_vec());
        assert!(writes.iter().all(|w| w.len() <= MAX_I2C_MSG_LEN));
    }

    #[test]
    fn construction_fails_on_i2c_error() {
        let bus = RecordingDelegate {
            fail_i2c: true,
            ..Default::default()
        };
        let err = R82xx::boxed(TunerKind::R828D, R828D_I2C_ADDR, &bus).unwrap_err();
        assert_eq!(err.code(), -5);
        assert_eq!(bus.calls().last(), Some(&Call::Repeater(false)));
    }

    #[test]
    fn masked_write_preserves_other_bits() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        t.write_reg_mask(&bus, 0x0a, 0x00, 0x10).unwrap();
        assert_eq!(t.shadow(0x0a), Some(0xc6));
        assert_eq!(i2c_writes(&bus), vec![vec![0x0a, 0xc6]]);
    }

    #[test]
    fn failed_write_leaves_shadow_untouched() {
        let mut bus = RecordingDelegate {
            fail_i2c: true,
            ..Default::default()
        };
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        let before = t.shadow(0x0a);
        assert!(t.write_reg_mask(&bus, 0x0a, 0x00, 0x10).is_err());
        assert_eq!(t.shadow(0x0a), before);

        bus.fail_i2c = false;
        t.write_reg_mask(&bus, 0x0a, 0x00, 0x10).unwrap();
        assert_eq!(t.shadow(0x0a), Some(0xc6));
        assert_eq!(i2c_writes(&bus).last(), Some(&vec![0x0a, 0xc6]));
    }

    #[test]
    fn failed_register_file_load_keeps_old_values() {
        let bus = RecordingDelegate {
            fail_i2c: true,
            ..Default::default()
        };
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        let before: Vec<_> = (0x05..0x20).map(|r| t.shadow(r)).collect();
        assert!(t.write_regs(&bus, 0x05, &[0u8; 27]).is_err());
        let after: Vec<_> = (0x05..0x20).map(|r| t.shadow(r)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn unshadowed_register_rejected() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        let err = t.write_reg(&bus, 0x04, 0).unwrap_err();
        assert_eq!(err.code(), -22);
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn exit_before_init_is_noop() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        t.exit(&bus).unwrap();
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn exit_writes_standby_sequence() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        t.init(&bus).unwrap();
        bus.calls.borrow_mut().clear();
        t.exit(&bus).unwrap();
        let writes = i2c_writes(&bus);
        assert_eq!(writes.len(), STANDBY.len());
        assert_eq!(writes[0], vec![0x06, 0xb1]);
        assert_eq!(writes[10], vec![0x19, 0x0c]);
        assert!(!t.is_initialized());
    }

    #[test]
    fn frequency_and_gain_need_init() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        assert_eq!(t.set_frequency(&bus, 100_000_000), Err(TunerError::NotInitialized));
        assert_eq!(t.set_gain(&bus, 100), Err(TunerError::NotInitialized));
        t.init(&bus).unwrap();
        assert_eq!(t.set_frequency(&bus, 100_000_000).unwrap_err().code(), -95);
        assert_eq!(t.set_frequency(&bus, 1_000).unwrap_err().code(), -22);
    }

    #[test]
    fn manual_gain_mode_writes() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        t.set_gain_mode(&bus, GainMode::Manual).unwrap();
        // 0x05: 0x83 -> set bit 4 -> 0x93 -> clear low nibble -> 0x90
        assert_eq!(t.shadow(0x05), Some(0x90));
        // 0x0c: 0xf5 & !0x9f | 0x08 -> 0x68
        assert_eq!(t.shadow(0x0c), Some(0x68));
        assert_eq!(i2c_writes(&bus).len(), 5);
        t.init(&bus).unwrap();
        assert_eq!(t.set_gain(&bus, 100).unwrap_err().code(), -95);
    }

    #[test]
    fn auto_gain_mode_writes() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        t.set_gain_mode(&bus, GainMode::Auto).unwrap();
        assert_eq!(
            i2c_writes(&bus),
            vec![vec![0x05, 0x83], vec![0x07, 0x75], vec![0x0c, 0x6b]]
        );
    }

    #[test]
    fn if_gain_is_accepted() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        assert!(t.set_if_gain(&bus, 1, 30).is_ok());
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn wide_bandwidths_use_fixed_filters() {
        assert_eq!(filter_for_bandwidth(8_000_000).if_hz, 4_570_000);
        assert_eq!(filter_for_bandwidth(8_000_000).reg_0b, 0x0b);
        assert_eq!(filter_for_bandwidth(6_500_000).reg_0b, 0x2a);
        let six = filter_for_bandwidth(6_000_000);
        assert_eq!((six.reg_0a, six.reg_0b, six.if_hz), (0x10, 0x6b, 3_570_000));
    }

    #[test]
    fn narrow_bandwidth_selects_low_pass() {
        let f = filter_for_bandwidth(1_000_000);
        assert_eq!(f, FilterSetting { reg_0a: 0x00, reg_0b: 0xeb, if_hz: 1_700_000 });
        let f = filter_for_bandwidth(2_000_000);
        assert_eq!(f, FilterSetting { reg_0a: 0x00, reg_0b: 0xaf, if_hz: 1_625_000 });
    }

    #[test]
    fn set_bandwidth_programs_if() {
        let bus = RecordingDelegate::default();
        let mut t = R82xx::new(TunerKind::R820T, R820T_I2C_ADDR);
        assert_eq!(t.set_bandwidth(&bus, 1_000_000).unwrap(), 1_700_000);
        assert_eq!(
            bus.calls(),
            vec![
                Call::I2cWrite(0x34, vec![0x0a, 0xc6]),
                Call::I2cWrite(0x34, vec![0x0b, 0xeb]),
                Call::IfFrequency(1_700_000),
            ]
        );
        assert_eq!(t.if_hz(), 1_700_000);
        assert_eq!(t.set_bandwidth(&bus, 0).unwrap_err().code(), -22);
    }
}
