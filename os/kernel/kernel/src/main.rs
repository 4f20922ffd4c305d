//! # Kernel Entry Point
//!
//! Boot order:
//! 1. Check the loader magic, parse the command line, start logging.
//! 2. Descriptor tables: GDT with TSS, then the IDT; PIC and PIT.
//! 3. Kernel heap, frame allocator, kernel page directory, paging on.
//! 4. Boot modules become files; the scheduler installs the idle process
//!    and `init` is spawned from its image.
//! 5. The first dispatch leaves the boot stack for good.
//!
//! Only the pure parts build for the host, where `cargo test` runs them.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]
#![allow(unsafe_code)]

extern crate alloc;

#[cfg(target_os = "none")]
mod boot;
mod errno;
mod gdt;
#[cfg(target_os = "none")]
mod idt;
mod interrupts;
mod modules;
mod ports;
mod privilege;
#[cfg(target_os = "none")]
mod state;
#[cfg(target_os = "none")]
mod switch;
#[cfg(target_os = "none")]
mod syscall;
#[cfg(target_os = "none")]
mod tracing;
#[cfg(target_os = "none")]
mod traps;
mod tss;

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
pub use entry::kernel_main;

#[cfg(target_os = "none")]
mod entry {
    use crate::boot::{self, BootInfo};
    use crate::interrupts::stubs;
    use crate::interrupts::syscall::SyscallInterrupt;
    use crate::interrupts::timer::TimerInterrupt;
    use crate::interrupts::{ExceptionInterrupts, Idt, pic, pit};
    use crate::modules::BootModules;
    use crate::state::{self, Kernel, kernel};
    use crate::{gdt, idt, switch, tracing, traps};
    use arrayvec::ArrayVec;
    use kernel_alloc::frame_alloc::BitmapFrameAlloc;
    use kernel_alloc::heap::KernelHeap;
    use kernel_alloc::phys_mapper::IdentityPhysMapper;
    use kernel_alloc::vmm::Vmm;
    use kernel_info::boot::MULTIBOOT_BOOTLOADER_MAGIC;
    use kernel_info::config::{ConfigIssue, KernelConfig};
    use kernel_info::memory::KERNEL_HEAP_SIZE;
    use kernel_info::process::TIMER_HZ;
    use kernel_proc::Scheduler;
    use kernel_qemu::{QemuLogger, qemu_trace};
    use kernel_registers::cr0::Cr0;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
    use log::{info, warn};

    #[global_allocator]
    static ALLOCATOR: KernelHeap = KernelHeap::new();

    #[repr(align(4096))]
    struct Align4K<const N: usize>([u8; N]);

    static mut HEAP_SPACE: Align4K<KERNEL_HEAP_SIZE> = Align4K([0; KERNEL_HEAP_SIZE]);

    /// One bit per frame of the 4 GiB physical address space.
    const FRAME_WORDS: usize = BitmapFrameAlloc::storage_words(1 << 20);

    static mut FRAME_BITS: [u64; FRAME_WORDS] = [0; FRAME_WORDS];

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        kernel_sync::irq::cli_stop_interrupts();
        // Straight to the port: the logger may not be up yet.
        qemu_trace!("kernel panic: {info}\n");
        loop {
            traps::halt();
        }
    }

    /// Called from [`boot::_start`] on the boot stack.
    #[unsafe(no_mangle)]
    pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
        assert!(
            magic == MULTIBOOT_BOOTLOADER_MAGIC,
            "not started by a Multiboot loader (magic {magic:#x})"
        );
        // SAFETY: the magic says `ebx` held the loader's info block.
        let raw = unsafe { boot::multiboot_info(info_addr) };
        // SAFETY: nothing the loader passed has been overwritten yet.
        let boot_info = unsafe { BootInfo::from_multiboot(raw) };

        let mut issues = ArrayVec::<ConfigIssue<'static>, 8>::new();
        let config = KernelConfig::parse_with(boot_info.cmdline, |issue| {
            let _ = issues.try_push(issue);
        });
        if QemuLogger::new(config.log_level).init().is_err() {
            qemu_trace!("logger already installed\n");
        }
        for issue in &issues {
            warn!("ignoring kernel option: {issue:?}");
        }
        info!("kernel booting, {config:?}");
        tracing::trace_boot_info(raw, &boot_info);

        init_cpu_tables();
        let mut vmm = init_memory(&config, &boot_info);
        tracing::log_ctrl_bits();

        let mut files = BootModules::new();
        for module in boot_info.modules() {
            // SAFETY: entries of the loader's list, in reserved frames.
            let (cmdline, bytes) =
                unsafe { (boot::module_cmdline(&module), boot::module_bytes(&module)) };
            files.add(cmdline, bytes);
        }

        let mut sched = match Scheduler::new(
            &config,
            switch::trampolines(),
            vmm.kernel_root(),
            traps::idle_main as usize,
        ) {
            Ok(sched) => sched,
            Err(e) => panic!("cannot set up the process table: {e}"),
        };
        let init_argv: [&[u8]; 1] = [config.init_path.as_bytes()];
        match sched
            .processes_mut()
            .spawn(&mut vmm, &files, None, config.init_path, &init_argv)
        {
            Ok(pid) => info!("spawned {} as {pid}", config.init_path),
            Err(e) => panic!(
                "cannot start {} ({e}); boot modules: {:?}",
                config.init_path,
                files.paths().collect::<ArrayVec<_, 16>>()
            ),
        }

        state::install(Kernel { vmm, sched, files });
        let first = kernel().lock_irq().sched.start();
        switch::apply(first);
        panic!("the boot thread was dispatched again");
    }

    fn init_cpu_tables() {
        gdt::init_gdt_and_tss(boot::boot_stack_top());

        let mut table = Idt::new();
        table
            .init_exception_gates(stubs::exception_stub)
            .init_timer_gate(stubs::irq_stub(pic::IRQ_TIMER))
            .init_syscall_gate(stubs::syscall_stub());
        // Lines stay masked; spurious IRQ 7 and 15 still arrive.
        for irq in 1..16 {
            table[usize::from(pic::vector_of(irq))]
                .set_handler(stubs::irq_stub(irq))
                .kernel_only()
                .present(true);
        }
        // SAFETY: interrupts are off and the GDT is loaded.
        unsafe {
            idt::init_idt_once(table);
            pic::remap(&[pic::IRQ_TIMER]);
            pit::start_periodic(TIMER_HZ);
        }
        info!("interrupts routed, timer at {TIMER_HZ} Hz");
    }

    fn init_memory(
        config: &KernelConfig<'_>,
        boot_info: &BootInfo,
    ) -> Vmm<IdentityPhysMapper, BitmapFrameAlloc<'static>> {
        // SAFETY: the region is reserved for the heap and used nowhere else.
        unsafe {
            let start = core::ptr::addr_of_mut!(HEAP_SPACE) as usize;
            ALLOCATOR.init(start, KERNEL_HEAP_SIZE);
        }

        // SAFETY: boot is single threaded; the bitmap is handed over once.
        let bits: &'static mut [u64] = unsafe { &mut *core::ptr::addr_of_mut!(FRAME_BITS) };
        let reserved = boot_info.reserved_ranges();
        let frames = BitmapFrameAlloc::from_memory_map(
            bits,
            boot_info.regions.iter().copied(),
            config.identity_bytes,
            &reserved,
        );

        let mapper = IdentityPhysMapper::new(config.identity_bytes);
        let vmm = match Vmm::new(mapper, frames, config.identity_bytes) {
            Ok(vmm) => vmm,
            Err(e) => panic!("cannot build the kernel page directory: {e}"),
        };
        // SAFETY: the kernel directory identity maps the image, the heap and
        // the boot stack, so execution continues at the same addresses.
        unsafe {
            vmm.activate(vmm.kernel_root());
            let cr0 = Cr0::load_unsafe().with_pg_paging(true).with_wp_write_protect(true);
            cr0.store_unsafe();
        }
        info!(
            "paging enabled, {} MiB identity mapped",
            config.identity_bytes >> 20
        );
        vmm
    }
}
