mod common;

use common::*;
use kernel_info::process::DEFAULT_TIME_SLICE;
use kernel_proc::{BlockReason, Pid, ProcessState, Scheduler, Switch};

fn thread(sched: &mut Scheduler, name: &str) -> Pid {
    sched
        .processes_mut()
        .create_kernel(None, name, THREAD_ENTRY, 0)
        .unwrap()
}

/// Tick until the scheduler switches; returns the switch and the ticks taken.
fn run_slice(sched: &mut Scheduler) -> (Switch, u32) {
    for n in 1..=100 {
        if let Some(s) = sched.tick() {
            return (s, n);
        }
    }
    panic!("no preemption within 100 ticks");
}

#[test]
fn round_robin_is_periodic_and_skips_idle() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    let c = thread(&mut sched, "c");

    let mut order = vec![sched.start().to];
    for _ in 0..8 {
        let (switch, ticks) = run_slice(&mut sched);
        assert_eq!(ticks, DEFAULT_TIME_SLICE);
        assert_eq!(switch.from, Some(*order.last().unwrap()));
        order.push(switch.to);
    }
    assert_eq!(order, [a, b, c, a, b, c, a, b, c]);
    assert_eq!(sched.stats().idle_ticks, 0);
    assert_eq!(sched.stats().switches, 9);
}

#[test]
fn running_process_is_never_queued() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    thread(&mut sched, "a");
    thread(&mut sched, "b");
    let first = sched.start().to;

    let table = sched.processes().table();
    let cur = table.current().unwrap();
    assert_eq!(table.slot(cur).pid, first);
    assert!(!table.ready().any(|i| i == cur));
    assert_eq!(table.slot(cur).state, ProcessState::Running);
    // b and idle
    assert_eq!(sched.stats().ready, 2);
}

#[test]
fn idle_runs_only_when_nothing_else_is_ready() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    assert_eq!(sched.start().to, Pid::IDLE);
    assert!(sched.tick().is_none());
    assert!(sched.tick().is_none());
    assert_eq!(sched.stats().idle_ticks, 2);

    let a = thread(&mut sched, "a");
    let switch = sched.tick().expect("idle gives way at the next tick");
    assert_eq!(switch.from, Some(Pid::IDLE));
    assert_eq!(switch.to, a);

    // Alone, `a` keeps running across slice ends.
    for _ in 0..3 * DEFAULT_TIME_SLICE {
        assert!(sched.tick().is_none());
    }
    assert_eq!(sched.current(), Some(a));
}

#[test]
fn yield_moves_to_the_tail() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    let c = thread(&mut sched, "c");
    sched.start();

    assert_eq!(sched.yield_now().unwrap().to, b);
    assert_eq!(sched.yield_now().unwrap().to, c);
    assert_eq!(sched.yield_now().unwrap().to, a);
}

#[test]
fn disabled_preemption_defers_the_switch() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    sched.start();

    sched.preempt_disable();
    sched.preempt_disable();
    for _ in 0..2 * DEFAULT_TIME_SLICE {
        assert!(sched.tick().is_none());
    }
    assert_eq!(sched.current(), Some(a));
    assert_eq!(sched.stats().ticks, u64::from(2 * DEFAULT_TIME_SLICE));
    assert_eq!(sched.processes().get(a).unwrap().ticks, u64::from(2 * DEFAULT_TIME_SLICE));

    assert!(sched.preempt_enable().is_none());
    assert_eq!(sched.preempt_enable().unwrap().to, b);
    assert!(sched.preemption_enabled());
}

#[test]
fn sleepers_wake_at_their_deadline() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    sched.start();

    let switch = sched.sleep_current(3).unwrap().unwrap();
    assert_eq!(switch.to, b);
    assert_eq!(
        sched.processes().state(a),
        Some(ProcessState::Blocked(BlockReason::Sleep { until: 3 }))
    );

    sched.tick();
    sched.tick();
    assert!(matches!(sched.processes().state(a), Some(ProcessState::Blocked(_))));
    sched.tick();
    assert_eq!(sched.processes().state(a), Some(ProcessState::Ready));
    assert!(!sched.processes_mut().take_interrupted(a));
}

#[test]
fn blocked_process_is_not_rescheduled_until_woken() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    sched.start();

    assert_eq!(sched.block_current(BlockReason::Explicit).unwrap().unwrap().to, b);
    for _ in 0..4 * DEFAULT_TIME_SLICE {
        assert!(sched.tick().is_none());
    }
    assert!(sched.processes_mut().wake(a));
    assert!(!sched.processes_mut().wake(a));
    let (switch, _) = run_slice(&mut sched);
    assert_eq!(switch.to, a);
}

#[test]
fn kernel_thread_takes_a_kill_at_its_next_switch() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    let a = thread(&mut sched, "a");
    let b = thread(&mut sched, "b");
    assert_eq!(sched.start().to, a);

    sched.processes_mut().kill(None, a, 9).unwrap();
    assert_eq!(sched.processes().state(a), Some(ProcessState::Running));

    let switch = sched.yield_now().unwrap();
    assert_eq!((switch.from, switch.to), (Some(a), b));
    assert_eq!(sched.processes().state(a), Some(ProcessState::Zombie));
    let table = sched.processes().table();
    assert!(!table.ready().any(|i| table.slot(i).pid == a));
}

#[test]
fn idle_cannot_block() {
    let vmm = vmm();
    let mut sched = scheduler(&vmm);
    sched.start();
    assert_eq!(
        sched.block_current(BlockReason::Explicit).unwrap_err(),
        kernel_proc::ProcError::PermissionDenied
    );
}

#[test]
fn switch_describes_the_incoming_process() {
    let mut vmm = vmm();
    let files = Files::new();
    let mut sched = scheduler(&vmm);
    let init = boot_init(&mut vmm, &mut sched, &files);
    let k = thread(&mut sched, "worker");

    let to_kernel = sched.yield_now().unwrap();
    assert_eq!(to_kernel.to, k);
    assert_eq!(to_kernel.space, vmm.kernel_root());
    assert_eq!(to_kernel.kernel_stack_top, None);
    let pcb = sched.processes().get(k).unwrap();
    assert_eq!(to_kernel.to_sp, pcb.context_sp);
    let ctx = pcb.kernel_stack.as_ref().unwrap().saved_context(pcb.context_sp).unwrap();
    assert_eq!(ctx.eip, TRAMPOLINES.kernel_thread);
    assert_eq!(ctx.ebx, THREAD_ENTRY);

    let to_user = sched.yield_now().unwrap();
    assert_eq!(to_user.to, init);
    let pcb = sched.processes().get(init).unwrap();
    assert_ne!(to_user.space, vmm.kernel_root());
    assert_eq!(Some(to_user.space), pcb.space);
    assert_eq!(to_user.kernel_stack_top, pcb.kernel_stack_top());
    assert_eq!(
        to_user.save_sp,
        std::ptr::from_ref(&sched.processes().get(k).unwrap().context_sp).cast_mut()
    );
}
