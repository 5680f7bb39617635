//! x64 register definitions and calling conventions.
//!
//! The backend only needs the register *model* here: encodings for the
//! emitter, bitsets for callee-save bookkeeping and GC reference maps,
//! and the ABI split between volatile and callee-saved registers. The
//! machine encoder that consumes the encodings lives behind the
//! `InstructionEncoder` trait in `assembler`.
//!
//! Register reference maps are `u16` bitmaps indexed by hardware encoding
//! (bit 0 = RAX .. bit 15 = R15), so `GprSet::bits` doubles as the map
//! representation.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x64 general-purpose register with its hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All 16 general-purpose registers in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Convert from encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        if (enc as usize) < Self::ALL.len() {
            Some(Self::ALL[enc as usize])
        } else {
            None
        }
    }

    /// Get the 64-bit register name.
    pub const fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// A set of GPRs as a 16-bit bitfield for O(1) membership operations.
///
/// The raw bits are also the wire format of a register reference map.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// Empty register set.
    pub const EMPTY: GprSet = GprSet(0);

    /// All 16 registers.
    pub const ALL: GprSet = GprSet(0xFFFF);

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    /// Get the raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register from the set.
    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    /// Difference (self - other).
    #[inline(always)]
    pub const fn difference(self, other: GprSet) -> Self {
        GprSet(self.0 & !other.0)
    }

    /// Check if the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Count the number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over registers in the set (ascending encoding order).
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let enc = bits.trailing_zeros() as u8;
            bits &= bits - 1; // Clear lowest set bit
            Gpr::from_encoding(enc)
        })
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GprSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", reg)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Calling Conventions
// =============================================================================

/// Calling convention definitions for x64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Windows x64 ABI (Microsoft x64).
    WindowsX64,
    /// System V AMD64 ABI (Linux, macOS, BSD).
    SystemV,
}

impl CallingConvention {
    /// Detect the calling convention for the current platform.
    #[cfg(target_os = "windows")]
    pub const fn host() -> Self {
        CallingConvention::WindowsX64
    }

    #[cfg(not(target_os = "windows"))]
    pub const fn host() -> Self {
        CallingConvention::SystemV
    }

    /// Get integer argument registers in order.
    pub const fn int_arg_regs(self) -> &'static [Gpr] {
        match self {
            CallingConvention::WindowsX64 => &[Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9],
            CallingConvention::SystemV => {
                &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
            }
        }
    }

    /// Get the integer return register.
    pub const fn int_return_reg(self) -> Gpr {
        Gpr::Rax
    }

    /// Get volatile (caller-saved) GPRs.
    pub const fn volatile_gprs(self) -> GprSet {
        match self {
            CallingConvention::WindowsX64 => {
                // RAX, RCX, RDX, R8-R11
                GprSet::from_bits(0x0F07)
            }
            CallingConvention::SystemV => {
                // RAX, RCX, RDX, RSI, RDI, R8-R11
                GprSet::from_bits(0x0FC7)
            }
        }
    }

    /// Get non-volatile (callee-saved) GPRs.
    pub const fn callee_saved_gprs(self) -> GprSet {
        match self {
            CallingConvention::WindowsX64 => {
                // RBX, RBP, RDI, RSI, R12-R15
                GprSet::from_bits(0xF0F8)
            }
            CallingConvention::SystemV => {
                // RBX, RBP, R12-R15
                GprSet::from_bits(0xF028)
            }
        }
    }

    /// Get the stack alignment requirement in bytes.
    pub const fn stack_alignment(self) -> usize {
        16 // Both ABIs require 16-byte alignment before CALL
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::Rcx.encoding(), 1);
        assert_eq!(Gpr::R8.encoding(), 8);
        assert_eq!(Gpr::R15.encoding(), 15);
    }

    #[test]
    fn test_gpr_from_encoding_roundtrip() {
        for reg in Gpr::ALL {
            assert_eq!(Gpr::from_encoding(reg.encoding()), Some(reg));
        }
        assert_eq!(Gpr::from_encoding(16), None);
    }

    #[test]
    fn test_gpr_set_operations() {
        let set = GprSet::EMPTY
            .insert(Gpr::Rax)
            .insert(Gpr::Rcx)
            .insert(Gpr::R8);

        assert!(set.contains(Gpr::Rax));
        assert!(set.contains(Gpr::Rcx));
        assert!(set.contains(Gpr::R8));
        assert!(!set.contains(Gpr::Rdx));
        assert_eq!(set.count(), 3);

        let removed = set.remove(Gpr::Rcx);
        assert!(!removed.contains(Gpr::Rcx));
        assert_eq!(removed.count(), 2);
    }

    #[test]
    fn test_gpr_set_iter() {
        let set = GprSet::EMPTY
            .insert(Gpr::Rax)
            .insert(Gpr::Rdx)
            .insert(Gpr::R15);

        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![Gpr::Rax, Gpr::Rdx, Gpr::R15]);
    }

    #[test]
    fn test_gpr_set_bits_are_reference_map_encoding() {
        let set = GprSet::EMPTY.insert(Gpr::Rcx).insert(Gpr::Rbx);
        // Bit 1 = RCX, bit 3 = RBX
        assert_eq!(set.bits(), 0b1010);
    }

    #[test]
    fn test_callee_saved_disjoint_from_volatile() {
        for cc in [CallingConvention::WindowsX64, CallingConvention::SystemV] {
            let overlap = cc.callee_saved_gprs().bits() & cc.volatile_gprs().bits();
            assert_eq!(overlap, 0);
        }
    }

    #[test]
    fn test_sysv_calling_convention() {
        let cc = CallingConvention::SystemV;
        assert_eq!(
            cc.int_arg_regs(),
            &[Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9]
        );
        assert_eq!(cc.int_return_reg(), Gpr::Rax);
        assert!(cc.callee_saved_gprs().contains(Gpr::Rbx));
        assert!(!cc.callee_saved_gprs().contains(Gpr::Rdi));
    }
}
