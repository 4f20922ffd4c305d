mod common;

use common::*;
use kernel_elf::ElfError;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{PAGE_SIZE, USER_STACK_TOP};
use kernel_info::process::MIN_PROCESSES;
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::{BlockReason, Mode, Pid, ProcError, ProcessState, WaitOutcome};

#[test]
fn wait_without_children_fails_immediately() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);

    assert_eq!(
        sched.processes_mut().wait(&mut vmm, init, None),
        Err(ProcError::NoChildren)
    );
    assert_eq!(sched.processes().state(init), Some(ProcessState::Running));
}

#[test]
fn fork_child_sees_zero_and_parent_gets_its_id() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let before = used_slots(&sched);
    let frame = syscall_frame(&sched, init);

    let child = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();
    assert_eq!(used_slots(&sched), before + 1);

    let pcb = sched.processes().get(child).unwrap();
    assert_eq!(pcb.parent, init);
    assert_eq!(pcb.state, ProcessState::Ready);
    assert_eq!(pcb.mode, Mode::User);
    assert_eq!(pcb.name.as_str(), "init");

    // The child's first dispatch returns through a copy of the frame with eax = 0.
    let stack = pcb.kernel_stack.as_ref().unwrap();
    assert_eq!(stack.saved_context(pcb.context_sp).unwrap().eip, TRAMPOLINES.trap_return);
    let child_frame = stack.saved_trap_frame(pcb.context_sp).unwrap();
    assert_eq!(child_frame.eax, 0);
    assert_eq!(child_frame.eip, frame.eip);
    assert_eq!(child_frame.user_esp, frame.user_esp);

    // The parent's frame is untouched; the syscall layer stores the child id.
    assert_eq!(frame.eax, 2);
    assert_ne!(child, init);
}

#[test]
fn forked_memory_is_a_copy() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let frame = syscall_frame(&sched, init);
    let child = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();

    let parent_space = sched.processes().get(init).unwrap().space.unwrap();
    let child_space = sched.processes().get(child).unwrap().space.unwrap();
    assert_ne!(parent_space, child_space);

    let va = VirtualAddress::new(DATA);
    vmm.copy_to_user(child_space, va, b"CHILD").unwrap();
    let mut buf = [0u8; 5];
    vmm.copy_from_user(parent_space, va, &mut buf).unwrap();
    assert_eq!(&buf[..4], b"data");
}

#[test]
fn fork_of_a_kernel_thread_is_refused() {
    let mut vmm = vmm();
    let mut sched = scheduler(&vmm);
    let k = sched
        .processes_mut()
        .create_kernel(None, "k", THREAD_ENTRY, 0)
        .unwrap();
    let frame = kernel_proc::context::TrapFrame::default();
    assert_eq!(
        sched.processes_mut().fork(&mut vmm, k, &frame),
        Err(ProcError::NotUserProcess)
    );
}

#[test]
fn failed_fork_leaves_nothing_behind() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let frame = syscall_frame(&sched, init);

    let slots = used_slots(&sched);
    let live = vmm.frames().live();
    vmm.frames_mut().limit_to(3);
    assert_eq!(
        sched.processes_mut().fork(&mut vmm, init, &frame),
        Err(ProcError::OutOfMemory)
    );
    assert_eq!(used_slots(&sched), slots);
    assert_eq!(vmm.frames().live(), live);
    assert_eq!(sched.processes().table().ready_len(), 1);
}

#[test]
fn table_full_is_reported() {
    let vmm = vmm();
    let config = KernelConfig {
        max_processes: MIN_PROCESSES,
        ..KernelConfig::default()
    };
    let mut sched = scheduler_with(&vmm, &config);
    for _ in 1..MIN_PROCESSES {
        sched
            .processes_mut()
            .create_kernel(None, "k", THREAD_ENTRY, 0)
            .unwrap();
    }
    assert_eq!(
        sched.processes_mut().create_kernel(None, "k", THREAD_ENTRY, 0),
        Err(ProcError::TableFull)
    );
}

#[test]
fn exit_reparents_children_and_wakes_the_waiting_parent() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);

    let frame = syscall_frame(&sched, init);
    let p = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();
    let c1 = sched.processes_mut().fork(&mut vmm, p, &frame).unwrap();
    let c2 = sched.processes_mut().fork(&mut vmm, p, &frame).unwrap();

    assert_eq!(
        sched.processes_mut().wait(&mut vmm, init, None),
        Ok(WaitOutcome::Blocked)
    );
    assert_eq!(
        sched.processes().state(init),
        Some(ProcessState::Blocked(BlockReason::WaitChild(None)))
    );
    assert_eq!(sched.yield_now().unwrap().to, p);

    sched.processes_mut().exit(p, 7).unwrap();
    assert_eq!(sched.processes().state(p), Some(ProcessState::Zombie));
    assert_eq!(sched.processes().parent_of(c1), Some(Pid::INIT));
    assert_eq!(sched.processes().parent_of(c2), Some(Pid::INIT));
    assert_eq!(sched.processes().state(init), Some(ProcessState::Ready));

    // The zombie is not queued again; the next pick is the first child.
    assert_eq!(sched.reschedule().unwrap().to, c1);
    assert_eq!(
        sched.processes_mut().wait(&mut vmm, init, None),
        Ok(WaitOutcome::Reaped { pid: p, status: 7 })
    );
}

#[test]
fn init_is_woken_for_an_orphaned_zombie() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let frame = syscall_frame(&sched, init);
    let p = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();
    let c = sched.processes_mut().fork(&mut vmm, p, &frame).unwrap();

    sched.processes_mut().exit(c, 1).unwrap();
    // Only the reparenting can satisfy a wait for c.
    sched.processes_mut().block(init, BlockReason::WaitChild(Some(c))).unwrap();
    assert_eq!(sched.reschedule().unwrap().to, p);

    sched.processes_mut().exit(p, 0).unwrap();
    assert_eq!(sched.processes().parent_of(c), Some(Pid::INIT));
    assert_eq!(sched.processes().state(init), Some(ProcessState::Ready));
}

#[test]
fn reaping_frees_the_slot_and_every_frame() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let frame = syscall_frame(&sched, init);

    let slots = used_slots(&sched);
    let live = vmm.frames().live();
    let child = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();
    assert!(vmm.frames().live() > live);
    let idx = sched.processes().table().index_of(child).unwrap();

    sched.processes_mut().exit(child, 3).unwrap();
    assert_eq!(sched.processes().table().ready_len(), 1);
    assert_eq!(
        sched.processes_mut().wait(&mut vmm, init, Some(child)),
        Ok(WaitOutcome::Reaped { pid: child, status: 3 })
    );
    assert_eq!(used_slots(&sched), slots);
    assert_eq!(vmm.frames().live(), live);

    let slot = sched.processes().table().slot(idx);
    assert_eq!(slot.state, ProcessState::Unused);
    assert!(!slot.is_linked());
    assert!(slot.kernel_stack.is_none());
    assert_eq!(sched.processes().state(child), None);
}

#[test]
fn init_and_idle_cannot_exit() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    assert_eq!(sched.processes_mut().exit(init, 0), Err(ProcError::InitExited));
    assert_eq!(sched.processes_mut().exit(Pid::IDLE, 0), Err(ProcError::PermissionDenied));
    assert_eq!(sched.processes_mut().exit(Pid::new(42), 0), Err(ProcError::NoSuchProcess));
}

#[test]
fn exec_replaces_the_image_and_passes_arguments() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let mut frame = syscall_frame(&sched, init);
    let child = sched.processes_mut().fork(&mut vmm, init, &frame).unwrap();
    let old_space = sched.processes().get(child).unwrap().space.unwrap();
    let live = vmm.frames().live();

    sched
        .processes_mut()
        .exec(&mut vmm, &files, child, "/bin/other", &[&b"other"[..], &b"-v"[..]], &mut frame)
        .unwrap();

    let pcb = sched.processes().get(child).unwrap();
    let space = pcb.space.unwrap();
    assert_ne!(space, old_space);
    assert_eq!(pcb.name.as_str(), "other");
    assert_eq!(frame.eip, CODE + 0x20);
    assert!(frame.from_user_mode());
    assert_eq!(frame.eax, 0);
    // The old space went back; the new one is the same size.
    assert_eq!(vmm.frames().live(), live);

    let sp = VirtualAddress::new(frame.user_esp);
    assert!(sp < USER_STACK_TOP);
    let mut head = [0u8; 12];
    vmm.copy_from_user(space, sp, &mut head).unwrap();
    assert_eq!(u32::from_le_bytes(head[4..8].try_into().unwrap()), 2);
    let argv = u32::from_le_bytes(head[8..12].try_into().unwrap());
    let mut argv0 = [0u8; 4];
    vmm.copy_from_user(space, VirtualAddress::new(argv), &mut argv0).unwrap();
    let mut name = [0u8; 6];
    vmm.copy_from_user(space, VirtualAddress::new(u32::from_le_bytes(argv0)), &mut name)
        .unwrap();
    assert_eq!(&name, b"other\0");

    let layout = pcb.user.unwrap();
    assert_eq!(layout.brk, layout.brk_start);
    assert_eq!(layout.brk_start, VirtualAddress::new(DATA + 0x2000));
}

#[test]
fn failed_exec_changes_nothing() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let mut frame = syscall_frame(&sched, init);
    let original = frame;
    let space = sched.processes().get(init).unwrap().space;
    let live = vmm.frames().live();

    for (path, err) in [
        ("/bin/missing", ProcError::Exec(ElfError::NotFound)),
        ("/bin/garbage", ProcError::Exec(ElfError::TooShort)),
    ] {
        assert_eq!(
            sched.processes_mut().exec(&mut vmm, &files, init, path, &[], &mut frame),
            Err(err)
        );
    }
    assert_eq!(frame, original);
    assert_eq!(sched.processes().get(init).unwrap().space, space);
    assert_eq!(vmm.frames().live(), live);
}

#[test]
fn sbrk_maps_zeroed_heap_pages() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let start = sched.processes().get(init).unwrap().user.unwrap().brk_start;
    let space = sched.processes().get(init).unwrap().space.unwrap();

    let delta = i32::try_from(PAGE_SIZE + 16).unwrap();
    assert_eq!(sched.processes_mut().sbrk(&mut vmm, init, delta), Ok(start));
    let mut buf = [0xFFu8; 16];
    vmm.copy_from_user(space, start + PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(buf, [0; 16]);

    assert_eq!(
        sched.processes_mut().sbrk(&mut vmm, init, -delta),
        Ok(start + PAGE_SIZE + 16)
    );
    assert_eq!(
        sched.processes_mut().sbrk(&mut vmm, init, -1),
        Err(ProcError::InvalidArgument)
    );

    // Regrowing into pages a shrink left mapped takes no new frames.
    vmm.frames_mut().limit_to(0);
    assert_eq!(sched.processes_mut().sbrk(&mut vmm, init, delta), Ok(start));
    let grow = i32::try_from(2 * PAGE_SIZE).unwrap();
    assert_eq!(
        sched.processes_mut().sbrk(&mut vmm, init, grow),
        Err(ProcError::OutOfMemory)
    );
    assert_eq!(
        sched.processes_mut().sbrk(&mut vmm, init, 0),
        Ok(start + PAGE_SIZE + 16)
    );
}
