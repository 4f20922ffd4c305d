//! # Global Descriptor Table and TSS wiring
//!
//! Protected mode still routes every memory access through a segment, so the
//! kernel installs flat 4 GiB segments and lets paging do the protection.
//! The selectors matter for two things:
//!
//! - Their **DPL** separates ring 0 from ring 3. Returning to a user program
//!   with `iret` needs user code/data selectors with `RPL = 3`.
//! - The **TSS** descriptor lets the CPU find `esp0`, the kernel stack used
//!   when an interrupt arrives in ring 3.
//!
//! ## Layout
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code ([`KERNEL_CS`])
//! 2     | 0x10     | Kernel data ([`KERNEL_DS`])
//! 3     | 0x1b     | User code, RPL 3 ([`USER_CS`])
//! 4     | 0x23     | User data, RPL 3 ([`USER_DS`])
//! 5     | 0x28     | TSS ([`TSS_SEL`])
//!
//! These values are baked into the trap frames built for new processes, so
//! they are checked against that crate's constants at compile time.

pub mod descriptors;
pub mod selectors;
pub mod tss_desc;

use crate::gdt::descriptors::Desc32;
use crate::gdt::selectors::{CodeSel, DataSel, SegmentSelector, TssSel};
use crate::gdt::tss_desc::TssDesc32;
use crate::privilege::{Dpl, Rpl};
use crate::tss::{Tss32, tss_base};
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::context;

pub const KERNEL_CS_SEL: SegmentSelector<CodeSel> = SegmentSelector::<CodeSel>::new(1, Rpl::Ring0);
pub const KERNEL_DS_SEL: SegmentSelector<DataSel> = SegmentSelector::<DataSel>::new(2, Rpl::Ring0);
pub const USER_CS_SEL: SegmentSelector<CodeSel> = SegmentSelector::<CodeSel>::new(3, Rpl::Ring3);
pub const USER_DS_SEL: SegmentSelector<DataSel> = SegmentSelector::<DataSel>::new(4, Rpl::Ring3);
pub const TSS_SYS_SEL: SegmentSelector<TssSel> = SegmentSelector::<TssSel>::new(5);

pub const KERNEL_CS: u16 = KERNEL_CS_SEL.encode();
pub const KERNEL_DS: u16 = KERNEL_DS_SEL.encode();
pub const USER_CS: u16 = USER_CS_SEL.encode();
pub const USER_DS: u16 = USER_DS_SEL.encode();
pub const TSS_SEL: u16 = TSS_SYS_SEL.encode();

const _: () = {
    assert!(KERNEL_CS == 0x08);
    assert!(KERNEL_DS == 0x10);
    assert!(USER_CS == 0x1b);
    assert!(USER_DS == 0x23);
    assert!(TSS_SEL == 0x28);

    assert!(KERNEL_CS == context::KERNEL_CODE_SELECTOR);
    assert!(KERNEL_DS == context::KERNEL_DATA_SELECTOR);
    assert!(USER_CS == context::USER_CODE_SELECTOR);
    assert!(USER_DS == context::USER_DATA_SELECTOR);
    assert!(TSS_SEL == context::TSS_SELECTOR);
};

/// Pointer format required by `lgdt`.
#[repr(C, packed)]
struct DescTablePtr {
    /// Size of the table minus one.
    limit: u16,
    base: VirtualAddress,
}

#[repr(C, align(8))]
pub struct Gdt {
    null: Desc32,
    kcode: Desc32,
    kdata: Desc32,
    ucode: Desc32,
    udata: Desc32,
    tss: TssDesc32,
}

impl Gdt {
    pub const fn new_with_tss(tss: TssDesc32) -> Self {
        Self {
            null: Desc32::NULL,
            kcode: Desc32::code(Dpl::Ring0),
            kdata: Desc32::data(Dpl::Ring0),
            ucode: Desc32::code(Dpl::Ring3),
            udata: Desc32::data(Dpl::Ring3),
            tss,
        }
    }

    /// The raw entries, in selector order.
    pub const fn entries(&self) -> [u64; 6] {
        [
            self.null.to_u64(),
            self.kcode.to_u64(),
            self.kdata.to_u64(),
            self.ucode.to_u64(),
            self.udata.to_u64(),
            self.tss.into_bits(),
        ]
    }
}

const _: () = assert!(size_of::<Gdt>() == 6 * 8);

static mut GDT: Gdt = Gdt::new_with_tss(TssDesc32::new());

/// Build the GDT around the TSS, load it, reload every segment register and
/// load the task register.
///
/// `kernel_stack_top` becomes the initial `esp0`; the scheduler replaces it
/// on the first dispatch of a user process.
///
/// Run once, early, with interrupts disabled.
#[allow(clippy::cast_possible_truncation)]
pub fn init_gdt_and_tss(kernel_stack_top: usize) {
    crate::tss::set_kernel_stack(kernel_stack_top);
    let tss = TssDesc32::available(tss_base(), (size_of::<Tss32>() - 1) as u32);

    // SAFETY: boot is single threaded and nothing reads the GDT yet.
    let gdt = unsafe {
        let gdt = &mut *core::ptr::addr_of_mut!(GDT);
        *gdt = Gdt::new_with_tss(tss);
        &*gdt
    };
    log::debug!("GDT at {:p}, TSS at {}", gdt, tss_base());

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: the table is static, every selector below indexes it.
    unsafe {
        let ptr = DescTablePtr {
            limit: (size_of::<Gdt>() - 1) as u16,
            base: VirtualAddress::new(core::ptr::from_ref(gdt) as usize as u32),
        };
        core::arch::asm!(
            "lgdt [{}]",
            in(reg) &raw const ptr,
            options(readonly, nostack, preserves_flags)
        );

        core::arch::asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov fs, {0:x}",
            "mov gs, {0:x}",
            "mov ss, {0:x}",
            in(reg) KERNEL_DS,
            options(nostack, preserves_flags)
        );

        // Far return to reload CS.
        core::arch::asm!(
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            cs = in(reg) u32::from(KERNEL_CS),
            tmp = out(reg) _,
        );

        core::arch::asm!(
            "ltr {0:x}",
            in(reg) TSS_SYS_SEL.encode(),
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = DescTablePtr {
        limit: 0,
        base: VirtualAddress::zero(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_segments_sit_where_the_selectors_point() {
        let gdt = Gdt::new_with_tss(TssDesc32::available(VirtualAddress::new(0x1000), 103));
        let e = gdt.entries();
        assert_eq!(e[0], 0);
        assert_eq!((e[usize::from(USER_CS >> 3)] >> 45) & 3, 3);
        assert_eq!((e[usize::from(USER_DS >> 3)] >> 43) & 1, 0, "user data is not code");
        assert_eq!((e[usize::from(KERNEL_CS >> 3)] >> 45) & 3, 0);
        assert_eq!((e[usize::from(TSS_SEL >> 3)] >> 40) & 0xF, 0x9);
    }
}
