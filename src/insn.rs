//! Fixed 8-byte bytecode instruction model.
//!
//! A wide-immediate load (`LD | IMM | DW`) occupies two consecutive
//! instruction words; the second word carries the high 32 bits of the
//! immediate.

use crate::error::{Error, Result};

/// Encoded size of one instruction word.
pub const INSN_SIZE: usize = 8;

/// Kernel limit on instructions per program.
pub const MAX_INSNS: usize = 4096;

/// Wide-immediate load opcode (`LD | IMM | DW`).
pub const OP_LD_IMM_DW: u8 = 0x18;

/// Call opcode (`JMP | CALL`).
pub const OP_JMP_CALL: u8 = 0x85;

/// Source-register tag marking a wide load as a map-descriptor load.
pub const PSEUDO_MAP_FD: u8 = 1;

/// Source-register tag marking a call as an intra-object pseudo-call.
pub const PSEUDO_CALL: u8 = 1;

/// One decoded instruction word.
///
/// The `regs` byte packs the destination register in the low nibble and
/// the source register in the high nibble.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u8,
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub fn from_bytes(bytes: &[u8; INSN_SIZE]) -> Self {
        Self {
            code: bytes[0],
            regs: bytes[1],
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; INSN_SIZE] {
        let mut out = [0u8; INSN_SIZE];
        out[0] = self.code;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.off.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    pub fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub fn set_src_reg(&mut self, reg: u8) {
        self.regs = (self.regs & 0x0f) | (reg << 4);
    }
}

/// Decode a section's raw bytes into instruction words.
///
/// Fewer than [`INSN_SIZE`] bytes is rejected; a trailing partial word is
/// ignored, matching the original loader's truncating division.
pub fn decode(bytes: &[u8]) -> Result<Vec<Insn>> {
    if bytes.len() < INSN_SIZE {
        return Err(Error::InvalidInput);
    }
    Ok(bytes
        .chunks_exact(INSN_SIZE)
        .map(|c| Insn::from_bytes(c.try_into().expect("chunk is INSN_SIZE bytes")))
        .collect())
}

/// Encode instruction words back into their wire form.
pub fn encode(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * INSN_SIZE);
    for insn in insns {
        out.extend_from_slice(&insn.to_bytes());
    }
    out
}
