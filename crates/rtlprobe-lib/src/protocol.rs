//! Register map and control-transfer constants for RTL2832U dongles.
//!
//! The RTL2832U exposes its internal registers through vendor control
//! transfers on the default pipe:
//!
//! - `wIndex` selects the register block (high byte) and the `0x10` flag.
//!   Block accesses always carry the flag. Demodulator pages carry it on
//!   writes only.
//! - `wValue` carries the register address (or, for the demodulator, the
//!   paged address `(addr << 8) | 0x20`).
//! - The data stage carries 1 or 2 bytes of register payload.
//!
//! Note the byte order mixing: multi-byte writes go out MSB first, while reads
//! come back LSB first.

// ── Register blocks ──

/// Address-space selector placed in the high byte of `wIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBlock {
    Demod,
    Usb,
    System,
    Tuner,
    Rom,
    Ir,
    I2c,
}

impl RegisterBlock {
    /// Every block, in block-number order.
    pub const ALL: [RegisterBlock; 7] = [
        RegisterBlock::Demod,
        RegisterBlock::Usb,
        RegisterBlock::System,
        RegisterBlock::Tuner,
        RegisterBlock::Rom,
        RegisterBlock::Ir,
        RegisterBlock::I2c,
    ];

    /// Fixed `wIndex` base for this block (`block_number << 8`).
    pub const fn base_offset(self) -> u16 {
        match self {
            RegisterBlock::Demod => 0x0000,
            RegisterBlock::Usb => 0x0100,
            RegisterBlock::System => 0x0200,
            RegisterBlock::Tuner => 0x0300,
            RegisterBlock::Rom => 0x0400,
            RegisterBlock::Ir => 0x0500,
            RegisterBlock::I2c => 0x0600,
        }
    }
}

// ── USB block registers ──

pub const USB_SYSCTL: u16 = 0x2000;
/// Endpoint A pipe control. `0x1002` stalls and resets the FIFO, `0x0000` runs it.
pub const USB_EPA_CTL: u16 = 0x2148;
/// Endpoint A max packet size (in 512-byte units, written MSB first).
pub const USB_EPA_MAXPKT: u16 = 0x2158;

// ── System block registers ──

/// Demodulator power and reset control. Sent as `wValue` alongside the
/// system block's `wIndex`.
pub const DEMOD_CTL: u16 = 0x0200;
pub const DEMOD_CTL_1: u16 = 0x300B;

// ── Control transfer parameters ──

/// `bmRequestType` for vendor requests to the device, host-to-device.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// `bmRequestType` for vendor requests to the device, device-to-host.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;

/// `bRequest` used by every register access.
pub const VENDOR_REQUEST: u8 = 0;

/// OR-ed into `wIndex` on block accesses and demodulator writes.
pub const WRITE_FLAG: u16 = 0x10;

/// OR-ed into the demodulator paged `wValue`.
pub const DEMOD_VALUE_FLAG: u16 = 0x20;

/// Default per-transfer timeout in milliseconds.
pub const CTRL_TIMEOUT_MS: u64 = 300;

// ── Demodulator status read-back ──

/// Page read back after every demodulator write.
pub const DEMOD_STATUS_PAGE: u8 = 0x0A;

/// Address read back after every demodulator write.
pub const DEMOD_STATUS_ADDR: u16 = 0x01;

// ── I2C repeater ──

/// Page 1 register controlling soft reset and the I2C repeater.
pub const DEMOD_CTRL_ADDR: u16 = 0x01;

/// Register value that opens the I2C repeater towards the tuner.
pub const I2C_REPEATER_ON: u16 = 0x18;

/// Register value that closes the I2C repeater (also the soft-reset release value).
pub const I2C_REPEATER_OFF: u16 = 0x10;

// ── Demodulator configuration registers used by tuner drivers ──

/// Page 1: zero-IF / DC / IQ compensation control (`en_bbin`, `en_dc_est`, ...).
pub const DEMOD_ZERO_IF_ADDR: u16 = 0xB1;

/// Zero-IF enabled with DC cancellation and IQ estimation/compensation.
pub const ZERO_IF_ENABLED: u16 = 0x1B;

/// Zero-IF disabled, compensation kept (tuners with a real IF).
pub const ZERO_IF_DISABLED: u16 = 0x1A;

/// Page 0: ADC input selection.
pub const DEMOD_ADC_INPUT_ADDR: u16 = 0x08;

/// Only the in-phase ADC input enabled.
pub const ADC_IN_PHASE_ONLY: u16 = 0x4D;

/// Page 1: spectrum inversion control.
pub const DEMOD_SPEC_INV_ADDR: u16 = 0x15;

/// Page 1: first IF-frequency register (6 bits), followed by 0x1A and 0x1B.
pub const DEMOD_IF_FREQ_ADDR: u16 = 0x19;

/// Page 1: first FIR coefficient register.
pub const DEMOD_FIR_ADDR: u16 = 0x1C;

// ── Clocks and streaming ──

/// Nominal RTL2832U crystal frequency in Hz.
pub const DEFAULT_RTL_XTAL_HZ: u32 = 28_800_000;

/// Endpoint number carrying the IQ sample stream.
pub const BULK_ENDPOINT_NUMBER: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_offsets_are_block_number_shifted() {
        for (n, block) in RegisterBlock::ALL.iter().enumerate() {
            assert_eq!(block.base_offset(), (n as u16) << 8, "{block:?}");
        }
    }

    #[test]
    fn block_offsets_leave_write_flag_clear() {
        for block in RegisterBlock::ALL {
            assert_eq!(block.base_offset() & WRITE_FLAG, 0, "{block:?}");
        }
    }

    #[test]
    fn usb_registers_distinct() {
        let regs = [USB_SYSCTL, USB_EPA_CTL, USB_EPA_MAXPKT];
        for i in 0..regs.len() {
            for j in (i + 1)..regs.len() {
                assert_ne!(regs[i], regs[j], "USB registers at {i} and {j} collide");
            }
        }
    }

    #[test]
    fn demod_ctl_matches_system_block_base() {
        assert_eq!(DEMOD_CTL, 0x0200);
        assert_eq!(DEMOD_CTL, RegisterBlock::System.base_offset());
        assert_ne!(DEMOD_CTL, DEMOD_CTL_1);
    }

    #[test]
    fn request_types_encode_direction() {
        // bit 7 = direction, bits 5..6 = vendor type, recipient = device
        assert_eq!(REQUEST_TYPE_VENDOR_OUT & 0x80, 0);
        assert_eq!(REQUEST_TYPE_VENDOR_IN & 0x80, 0x80);
        assert_eq!(REQUEST_TYPE_VENDOR_OUT & 0x60, 0x40);
        assert_eq!(REQUEST_TYPE_VENDOR_IN & 0x60, 0x40);
        assert_eq!(REQUEST_TYPE_VENDOR_OUT & 0x1F, 0);
    }

    #[test]
    fn repeater_values_differ_only_in_bit_3() {
        assert_eq!(I2C_REPEATER_ON ^ I2C_REPEATER_OFF, 0x08);
    }

    #[test]
    fn zero_if_values_differ_only_in_bbin_bit() {
        assert_eq!(ZERO_IF_ENABLED ^ ZERO_IF_DISABLED, 0x01);
    }
}
