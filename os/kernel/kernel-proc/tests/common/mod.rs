#![allow(dead_code)]

use kernel_alloc::vmm::Vmm;
use kernel_elf::FileSource;
use kernel_elf::image::ImageBuilder;
use kernel_info::config::KernelConfig;
use kernel_info::memory::IDENTITY_MAP_MIN;
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::context::{Trampolines, TrapFrame};
use kernel_proc::{Pid, Scheduler};
use kernel_vmem::sim::{ArenaFrames, FrameArena};

pub type TestVmm = Vmm<FrameArena, ArenaFrames>;

pub const TRAMPOLINES: Trampolines = Trampolines {
    kernel_thread: 0x0010_0000,
    trap_return: 0x0010_0100,
};
pub const IDLE_ENTRY: usize = 0x0010_0200;
pub const THREAD_ENTRY: usize = 0x0010_0300;

pub const CODE: u32 = 0x0804_8000;
pub const ENTRY: u32 = CODE + 0x10;
pub const DATA: u32 = 0x0804_A000;

pub fn vmm() -> TestVmm {
    Vmm::new(FrameArena::with_frames(512), ArenaFrames::new(1, 512), IDENTITY_MAP_MIN).unwrap()
}

pub fn scheduler(vmm: &TestVmm) -> Scheduler {
    scheduler_with(vmm, &KernelConfig::default())
}

pub fn scheduler_with(vmm: &TestVmm, config: &KernelConfig<'_>) -> Scheduler {
    Scheduler::new(config, TRAMPOLINES, vmm.kernel_root(), IDLE_ENTRY).unwrap()
}

/// Boot modules for tests.
pub struct Files(Vec<(&'static str, Vec<u8>)>);

impl Files {
    pub fn new() -> Self {
        Self(vec![
            ("/bin/init", program(ENTRY)),
            ("/bin/other", program(CODE + 0x20)),
            ("/bin/garbage", b"#!/bin/sh\n".to_vec()),
        ])
    }
}

impl FileSource for Files {
    fn read(&self, path: &str) -> Option<&[u8]> {
        self.0.iter().find(|(p, _)| *p == path).map(|(_, b)| b.as_slice())
    }
}

pub fn program(entry: u32) -> Vec<u8> {
    ImageBuilder::new(entry)
        .code(CODE, &[0x90; 0x40])
        .data(DATA, b"data", 0x2000)
        .build()
}

/// Spawn init from `/bin/init` and make it the running process.
pub fn boot_init(vmm: &mut TestVmm, sched: &mut Scheduler, files: &Files) -> Pid {
    let init = sched
        .processes_mut()
        .spawn(vmm, files, None, "/bin/init", &[&b"init"[..]])
        .unwrap();
    assert_eq!(init, Pid::INIT);
    let switch = sched.start();
    assert_eq!(switch.to, init);
    init
}

/// The frame a user process traps in with, as if it called a system call.
pub fn syscall_frame(sched: &Scheduler, pid: Pid) -> TrapFrame {
    let pcb = sched.processes().get(pid).unwrap();
    let layout = pcb.user.unwrap();
    let mut frame = TrapFrame::user(layout.entry, VirtualAddress::new(layout.stack_top.as_u32() - 64));
    frame.eax = 2;
    frame
}

pub fn used_slots(sched: &Scheduler) -> usize {
    sched.processes().table().used().count()
}
