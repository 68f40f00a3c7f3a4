//! Minimal x64 instruction assembly for the two gadget shapes the hijack relies on.
//!
//! The whole scheme needs exactly three encodings: `jmp .` (the sleep loop the thread is
//! parked in), `ret`, and `push <r64>` (the first half of the pivot). Emitting them by
//! hand keeps the crate free of a full assembler dependency while still letting the
//! scanner derive its byte patterns from the same source of truth.

use crate::error::{NThreadError, Result};

/// The x64 general-purpose registers, in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// All sixteen general-purpose registers, in encoding order.
pub const ALL_REGISTERS: [Register; 16] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::Rbx,
    Register::Rsp,
    Register::Rbp,
    Register::Rsi,
    Register::Rdi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

impl Register {
    /// Hardware encoding index (0-15).
    pub fn encoding(self) -> u8 {
        match self {
            Self::Rax => 0,
            Self::Rcx => 1,
            Self::Rdx => 2,
            Self::Rbx => 3,
            Self::Rsp => 4,
            Self::Rbp => 5,
            Self::Rsi => 6,
            Self::Rdi => 7,
            Self::R8 => 8,
            Self::R9 => 9,
            Self::R10 => 10,
            Self::R11 => 11,
            Self::R12 => 12,
            Self::R13 => 13,
            Self::R14 => 14,
            Self::R15 => 15,
        }
    }

    /// Whether the register needs a REX.B prefix (`r8`-`r15`).
    pub fn is_extended(self) -> bool {
        self.encoding() >= 8
    }

    /// Lowercase mnemonic, e.g. `"rbx"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Rax => "rax",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rbx => "rbx",
            Self::Rsp => "rsp",
            Self::Rbp => "rbp",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::R13 => "r13",
            Self::R14 => "r14",
            Self::R15 => "r15",
        }
    }
}

/// `jmp .` - a two-byte relative jump onto itself (`EB FE`).
pub fn jmp_self() -> Vec<u8> {
    vec![0xEB, 0xFE]
}

/// `ret` (`C3`).
pub fn ret() -> Vec<u8> {
    vec![0xC3]
}

/// `push <r64>` - `50+r` for the low eight registers, `41 50+r` for `r8`-`r15`.
pub fn push(reg: Register) -> Vec<u8> {
    let enc = reg.encoding();
    if reg.is_extended() {
        vec![0x41, 0x50 + (enc - 8)]
    } else {
        vec![0x50 + enc]
    }
}

/// `push <r64>; ret` - the pivot gadget shape.
pub fn push_ret(reg: Register) -> Vec<u8> {
    let mut bytes = push(reg);
    bytes.extend_from_slice(&ret());
    bytes
}

/// Renders bytes as a space-separated hex pattern, e.g. `"EB FE"`.
pub fn to_pattern(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a space-separated hex pattern back into bytes.
///
/// # Errors
/// Returns [`NThreadError::GadgetScanFailed`] when the pattern is empty or contains a
/// token that is not a two-digit hex byte.
pub fn parse_pattern(pattern: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = pattern.split_whitespace().collect();
    if parts.is_empty() {
        return Err(NThreadError::GadgetScanFailed(pattern.to_string()));
    }

    let mut bytes = Vec::with_capacity(parts.len());
    for part in parts {
        let byte = u8::from_str_radix(part, 16)
            .map_err(|_| NThreadError::GadgetScanFailed(pattern.to_string()))?;
        bytes.push(byte);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_gadget_bytes() {
        assert_eq!(jmp_self(), [0xEB, 0xFE]);
    }

    #[test]
    fn push_encodings_cover_both_register_banks() {
        assert_eq!(push(Register::Rax), [0x50]);
        assert_eq!(push(Register::Rbx), [0x53]);
        assert_eq!(push(Register::Rdi), [0x57]);
        assert_eq!(push(Register::R8), [0x41, 0x50]);
        assert_eq!(push(Register::R15), [0x41, 0x57]);
    }

    #[test]
    fn pivot_gadget_ends_in_ret() {
        assert_eq!(push_ret(Register::Rbp), [0x55, 0xC3]);
        assert_eq!(push_ret(Register::R12), [0x41, 0x54, 0xC3]);
    }

    #[test]
    fn pattern_round_trip() {
        let bytes = push_ret(Register::Rsi);
        let pattern = to_pattern(&bytes);
        assert_eq!(pattern, "56 C3");
        assert_eq!(parse_pattern(&pattern).unwrap(), bytes);
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("EB FG").is_err());
        assert!(parse_pattern("XYZ").is_err());
    }
}
