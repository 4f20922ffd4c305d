use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// A 32-bit *Available TSS* system descriptor (type 0x9, S=0).
#[bitfield(u64)]
pub struct TssDesc32 {
    pub limit_lo: u16, // [15:0]
    pub base_lo: u16,  // [31:16]
    pub base_mid: u8,  // [39:32]
    #[bits(4)]
    pub typ: u8, // [43:40] = 0x9, becomes 0xB (busy) after ltr
    pub s: bool,      // [44]    = 0 (system)
    #[bits(2)]
    pub dpl: u8, // [46:45]
    pub p: bool,      // [47]
    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,   // [52]
    #[bits(2)]
    __: u8, // [54:53] must be 0 for system types
    pub g: bool,     // [55] byte granularity
    pub base_hi: u8, // [63:56]
}

impl TssDesc32 {
    pub const AVAILABLE: u8 = 0x9;

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn available(base: VirtualAddress, limit: u32) -> Self {
        let base = base.as_u32();
        Self::new()
            .with_limit_lo((limit & 0xFFFF) as u16)
            .with_base_lo((base & 0xFFFF) as u16)
            .with_base_mid(((base >> 16) & 0xFF) as u8)
            .with_typ(Self::AVAILABLE)
            .with_s(false)
            .with_dpl(0)
            .with_p(true)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_avl(false)
            .with_g(false)
            .with_base_hi((base >> 24) as u8)
    }

    #[must_use]
    pub const fn base(self) -> u32 {
        (self.base_lo() as u32) | ((self.base_mid() as u32) << 16) | ((self.base_hi() as u32) << 24)
    }
}

const _: () = assert!(size_of::<TssDesc32>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_is_split_over_three_fields() {
        let d = TssDesc32::available(VirtualAddress::new(0x0012_3456), 103);
        assert_eq!(d.base(), 0x0012_3456);
        assert_eq!(d.limit_lo(), 103);
        assert_eq!(d.typ(), 0x9);
        assert!(d.p());
        assert!(!d.s());
        assert_eq!((d.into_bits() >> 40) & 0xFF, 0x89);
    }
}
