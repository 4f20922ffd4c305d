//! # Privilege Levels
//!
//! i386 protection uses four rings; this kernel runs in ring 0 and user
//! programs in ring 3. The level shows up in three places:
//!
//! | Concept | Stored in                        | Meaning                         |
//! |---------|----------------------------------|---------------------------------|
//! | CPL     | low two bits of `CS`             | level of the running code       |
//! | [`Rpl`] | low two bits of any selector     | level the selector asks for     |
//! | [`Dpl`] | bits 45–46 of a descriptor/gate  | level needed to use the target  |
//!
//! An `int n` from user mode only succeeds for gates with `DPL = 3`, which
//! is how the system call gate is opened while exceptions stay closed.

/// Requested privilege level, the low two bits of a selector.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Rpl {
    Ring0 = 0,
    Ring3 = 3,
}

impl Rpl {
    /// Decodes two selector bits. Rings 1 and 2 are unused and read as 3.
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        if bits & 0b11 == 0 { Self::Ring0 } else { Self::Ring3 }
    }

    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Descriptor privilege level of a segment descriptor or gate.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Dpl {
    Ring0 = 0,
    Ring3 = 3,
}

impl Dpl {
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        if bits & 0b11 == 0 { Self::Ring0 } else { Self::Ring3 }
    }

    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Whether code running with `cpl` may invoke a gate of this level
    /// through a software interrupt.
    #[inline]
    #[must_use]
    pub const fn permits_int_from(self, cpl: Rpl) -> bool {
        cpl as u8 <= self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_may_only_use_user_gates() {
        assert!(Dpl::Ring3.permits_int_from(Rpl::Ring3));
        assert!(Dpl::Ring3.permits_int_from(Rpl::Ring0));
        assert!(!Dpl::Ring0.permits_int_from(Rpl::Ring3));
        assert_eq!(Rpl::from_bits(0x1B & 3), Rpl::Ring3);
        assert_eq!(Dpl::from_bits(0), Dpl::Ring0);
    }
}
