//! # 32-bit flat segment descriptors
//!
//! Every code and data segment spans the whole 4 GiB with base 0; paging
//! provides the protection. What differs between the four segments is
//! the **type** (code or data) and the **DPL**. All of them set:
//! - `s = 1` (code/data, not system),
//! - `p = 1` (present),
//! - `db = 1` (32-bit operand size / 32-bit stack),
//! - `g = 1` with `limit = 0xFFFFF` (4 KiB units, i.e. 4 GiB).

use crate::privilege::Dpl;
use bitfield_struct::bitfield;

#[bitfield(u64)]
pub struct SegmentDescBits {
    pub limit_lo: u16, // [15:0]
    pub base_lo: u16,  // [31:16]
    pub base_mid: u8,  // [39:32]
    #[bits(4)]
    pub typ: u8, // [43:40]
    pub s: bool,       // [44]
    #[bits(2)]
    pub dpl: u8, // [46:45]
    pub p: bool,       // [47]
    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,     // [52]
    pub l: bool,       // [53] 64-bit code; always 0 here
    pub db: bool,      // [54]
    pub g: bool,       // [55]
    pub base_hi: u8,   // [63:56]
}

/// Execute + read.
const TYPE_CODE: u8 = 0b1010;
/// Read + write.
const TYPE_DATA: u8 = 0b0010;

/// A single 8-byte code or data descriptor.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct Desc32(SegmentDescBits);

impl Desc32 {
    pub const NULL: Self = Self(SegmentDescBits::new());

    /// A flat 4 GiB code segment.
    pub const fn code(dpl: Dpl) -> Self {
        Self::flat(TYPE_CODE, dpl)
    }

    /// A flat 4 GiB data/stack segment.
    pub const fn data(dpl: Dpl) -> Self {
        Self::flat(TYPE_DATA, dpl)
    }

    const fn flat(typ: u8, dpl: Dpl) -> Self {
        Self(
            SegmentDescBits::new()
                .with_limit_lo(0xFFFF)
                .with_base_lo(0)
                .with_base_mid(0)
                .with_typ(typ)
                .with_s(true)
                .with_dpl(dpl.into_bits())
                .with_p(true)
                .with_limit_hi(0xF)
                .with_avl(false)
                .with_l(false)
                .with_db(true)
                .with_g(true)
                .with_base_hi(0),
        )
    }

    #[inline]
    pub const fn bits(self) -> SegmentDescBits {
        self.0
    }

    #[inline]
    pub const fn to_u64(self) -> u64 {
        self.0.into_bits()
    }
}

const _: () = {
    assert!(size_of::<SegmentDescBits>() == 8);
    assert!(size_of::<Desc32>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_segments_match_the_classic_encodings() {
        assert_eq!(Desc32::code(Dpl::Ring0).to_u64(), 0x00CF_9A00_0000_FFFF);
        assert_eq!(Desc32::data(Dpl::Ring0).to_u64(), 0x00CF_9200_0000_FFFF);
        assert_eq!(Desc32::code(Dpl::Ring3).to_u64(), 0x00CF_FA00_0000_FFFF);
        assert_eq!(Desc32::data(Dpl::Ring3).to_u64(), 0x00CF_F200_0000_FFFF);
        assert_eq!(Desc32::NULL.to_u64(), 0);
    }
}
