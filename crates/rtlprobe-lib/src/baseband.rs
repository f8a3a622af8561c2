//! Demodulator bring-up: the fixed register sequence and FIR packing.
//!
//! [`INIT_SEQUENCE`] is data, not code, so the order can be inspected and
//! tested without a device. [`init_baseband`] walks it and stops at the first
//! failed transfer.

use log::debug;

use crate::protocol::*;
use crate::register::{RegisterBus, Width};
use crate::usb::{DeviceError, TransferError, UsbTransport};

// ── FIR coefficients ──

pub const FIR_LEN: usize = 16;

/// Packed length: 8 single bytes plus 4 × 3-byte pairs.
pub const FIR_PACKED_LEN: usize = 20;

/// Reference low-pass used by every RTL2832U driver.
pub const DEFAULT_FIR: [i32; FIR_LEN] = [
    -54, -36, -41, -40, -32, -14, 14, 53, // i8
    101, 156, 215, 273, 327, 372, 404, 421, // i12
];

const I8_RANGE: std::ops::RangeInclusive<i32> = -128..=127;
const I12_RANGE: std::ops::RangeInclusive<i32> = -2048..=2047;

/// Sixteen validated FIR coefficients: the first eight fit i8, the rest i12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirCoefficients([i32; FIR_LEN]);

impl FirCoefficients {
    pub fn new(coefficients: [i32; FIR_LEN]) -> Result<Self, DeviceError> {
        for (index, &value) in coefficients.iter().enumerate() {
            let range = if index < 8 { &I8_RANGE } else { &I12_RANGE };
            if !range.contains(&value) {
                return Err(DeviceError::CoefficientOutOfRange { index, value });
            }
        }
        Ok(FirCoefficients(coefficients))
    }

    /// Build from a slice (e.g. config), rejecting anything but 16 values.
    pub fn from_slice(values: &[i32]) -> Result<Self, DeviceError> {
        let arr: [i32; FIR_LEN] = values.try_into().map_err(|_| {
            DeviceError::CoefficientOutOfRange {
                index: values.len().min(FIR_LEN),
                value: values.len() as i32,
            }
        })?;
        Self::new(arr)
    }

    pub fn values(&self) -> &[i32; FIR_LEN] {
        &self.0
    }

    /// Register image for 0x1C onward.
    ///
    /// Pairs of 12-bit values pack big-endian into three bytes:
    /// `[c1 >> 4, (c1 << 4) | ((c2 >> 8) & 0x0F), c2]`.
    pub fn encode(&self) -> [u8; FIR_PACKED_LEN] {
        let mut out = [0u8; FIR_PACKED_LEN];
        for (dst, &c) in out.iter_mut().zip(&self.0[..8]) {
            *dst = c as u8;
        }
        for (pair, dst) in self.0[8..].chunks_exact(2).zip(out[8..].chunks_exact_mut(3)) {
            let (c1, c2) = (pair[0], pair[1]);
            dst[0] = (c1 >> 4) as u8;
            dst[1] = ((c1 << 4) | ((c2 >> 8) & 0x0F)) as u8;
            dst[2] = c2 as u8;
        }
        out
    }
}

impl Default for FirCoefficients {
    fn default() -> Self {
        FirCoefficients(DEFAULT_FIR)
    }
}

/// Validate and pack in one step.
pub fn encode_fir_coefficients(coefficients: &[i32; FIR_LEN]) -> Result<[u8; FIR_PACKED_LEN], DeviceError> {
    Ok(FirCoefficients::new(*coefficients)?.encode())
}

/// Recover the eight 12-bit coefficients from a packed image (sign-extended).
pub fn unpack_i12(packed: &[u8; FIR_PACKED_LEN]) -> [i32; 8] {
    let mut out = [0i32; 8];
    for (triple, dst) in packed[8..].chunks_exact(3).zip(out.chunks_exact_mut(2)) {
        let c1 = (u16::from(triple[0]) << 4) | (u16::from(triple[1]) >> 4);
        let c2 = (u16::from(triple[1] & 0x0F) << 8) | u16::from(triple[2]);
        dst[0] = sign_extend_12(c1);
        dst[1] = sign_extend_12(c2);
    }
    out
}

fn sign_extend_12(v: u16) -> i32 {
    (i32::from(v) << 20) >> 20
}

// ── Bring-up sequence ──

/// One step of the bring-up table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    Block {
        block: RegisterBlock,
        addr: u16,
        value: u16,
        width: Width,
    },
    Demod {
        page: u8,
        addr: u16,
        value: u16,
        width: Width,
    },
    /// The packed FIR image, one byte per register from 0x1C.
    Fir,
}

const fn block(block: RegisterBlock, addr: u16, value: u16, width: Width) -> InitStep {
    InitStep::Block {
        block,
        addr,
        value,
        width,
    }
}

const fn demod(page: u8, addr: u16, value: u16) -> InitStep {
    InitStep::Demod {
        page,
        addr,
        value,
        width: Width::Byte,
    }
}

/// Register writes that take a freshly opened RTL2832U into zero-IF SDR mode.
pub static INIT_SEQUENCE: &[InitStep] = &[
    // USB: enable, max packet, stall + reset endpoint A
    block(RegisterBlock::Usb, USB_SYSCTL, 0x09, Width::Byte),
    block(RegisterBlock::Usb, USB_EPA_MAXPKT, 0x0002, Width::Word),
    block(RegisterBlock::Usb, USB_EPA_CTL, 0x1002, Width::Word),
    // power on demod
    block(RegisterBlock::System, DEMOD_CTL_1, 0x22, Width::Byte),
    block(RegisterBlock::System, DEMOD_CTL, 0xe8, Width::Byte),
    // soft reset (bit 3)
    demod(1, 0x01, 0x14),
    demod(1, 0x01, 0x10),
    // no spectrum inversion, no adjacent channel rejection
    demod(1, 0x15, 0x00),
    InitStep::Demod {
        page: 1,
        addr: 0x16,
        value: 0x0000,
        width: Width::Word,
    },
    // DDC shift and IF frequency
    demod(1, 0x16, 0x00),
    demod(1, 0x17, 0x00),
    demod(1, 0x18, 0x00),
    demod(1, 0x19, 0x00),
    demod(1, 0x1a, 0x00),
    demod(1, 0x1b, 0x00),
    InitStep::Fir,
    // SDR mode, digital AGC off
    demod(0, 0x19, 0x05),
    // FSM state-holding
    demod(1, 0x93, 0xf0),
    demod(1, 0x94, 0x0f),
    // AGC, RF/IF AGC loop, PID filter off
    demod(1, 0x11, 0x00),
    demod(1, 0x04, 0x00),
    demod(0, 0x61, 0x60),
    // default ADC_I/ADC_Q datapath
    demod(0, 0x06, 0x80),
    // zero-IF with DC cancellation and IQ compensation
    demod(1, DEMOD_ZERO_IF_ADDR, ZERO_IF_ENABLED),
    // TP_CK0 clock output off
    demod(0, 0x0d, 0x83),
];

/// Ordinal of the soft-reset strobe within [`INIT_SEQUENCE`].
pub const SOFT_RESET_STEP: usize = 5;

fn run_step<T: UsbTransport>(
    bus: &RegisterBus<'_, T>,
    step: &InitStep,
    fir: &[u8; FIR_PACKED_LEN],
) -> Result<(), TransferError> {
    match *step {
        InitStep::Block {
            block,
            addr,
            value,
            width,
        } => bus.write_reg(block, addr, value, width),
        InitStep::Demod {
            page,
            addr,
            value,
            width,
        } => bus.demod_write_reg(page, addr, value, width),
        InitStep::Fir => {
            for (i, &b) in fir.iter().enumerate() {
                bus.demod_write_reg(1, DEMOD_FIR_ADDR + i as u16, u16::from(b), Width::Byte)?;
            }
            Ok(())
        }
    }
}

/// Run the bring-up sequence once. Aborts on the first failed write.
pub fn init_baseband<T: UsbTransport>(
    bus: &RegisterBus<'_, T>,
    fir: &FirCoefficients,
) -> Result<(), TransferError> {
    let packed = fir.encode();
    for (n, step) in INIT_SEQUENCE.iter().enumerate() {
        run_step(bus, step, &packed).inspect_err(|e| debug!("Baseband step {n} failed: {e}"))?;
    }
    debug!("Baseband initialized ({} steps)", INIT_SEQUENCE.len());
    Ok(())
}
