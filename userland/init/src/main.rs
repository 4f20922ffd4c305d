//! # init
//!
//! The first user process. Started without arguments it walks through the
//! process interface once and then reaps orphans forever. Started as
//! `init worker <status>` it naps briefly and exits with `status`, which is
//! how the first run tests `exec` on itself.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Init,
    Worker { status: i32 },
}

fn mode<'a>(mut args: impl Iterator<Item = &'a [u8]>) -> Mode {
    let _program = args.next();
    match args.next() {
        Some(b"worker") => Mode::Worker {
            status: args.next().and_then(parse_status).unwrap_or(0),
        },
        _ => Mode::Init,
    }
}

fn parse_status(arg: &[u8]) -> Option<i32> {
    core::str::from_utf8(arg).ok()?.parse().ok()
}

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod run {
    use super::{Mode, mode};
    use core::ffi::{CStr, c_char};
    use core::sync::atomic::{AtomicU32, Ordering};
    use stdlib::println;
    use stdlib::syscall::{self, Handler};
    use stdlib::syscall_abi::{Errno, signo};

    const SELF_PATH: &CStr = c"/bin/init";

    static CAUGHT: AtomicU32 = AtomicU32::new(0);

    extern "C" fn on_usr1(sig: u32) {
        CAUGHT.fetch_add(1, Ordering::Relaxed);
        println!("init: caught signal {sig}");
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn _start(argc: u32, argv: *const *const c_char) -> ! {
        let args = (0..argc as usize).map(|i| {
            // SAFETY: the kernel places `argc` C strings behind `argv`.
            unsafe { CStr::from_ptr(*argv.add(i)) }.to_bytes()
        });
        match mode(args) {
            Mode::Worker { status } => worker(status),
            Mode::Init => init(),
        }
    }

    fn worker(status: i32) -> ! {
        println!(
            "worker {} (parent {}) running",
            syscall::getpid(),
            syscall::getppid()
        );
        if let Err(e) = syscall::sleep(10) {
            println!("worker: sleep cut short: {e}");
        }
        syscall::exit(status)
    }

    fn init() -> ! {
        let me = syscall::getpid();
        println!("init {me} started");
        signals(me);
        grow_heap();
        run_worker();
        reap_forever()
    }

    fn signals(me: u32) {
        if let Err(e) = syscall::signal(signo::SIGUSR1, Handler::Catch(on_usr1)) {
            println!("init: cannot catch SIGUSR1: {e}");
            return;
        }
        let old = syscall::sigprocmask(signo::mask(signo::SIGUSR1)).unwrap_or(0);
        if let Err(e) = syscall::kill(me, signo::SIGUSR1) {
            println!("init: kill failed: {e}");
        }
        println!(
            "init: SIGUSR1 blocked, handler ran {} times",
            CAUGHT.load(Ordering::Relaxed)
        );
        // Delivered on the way back from this call.
        let _ = syscall::sigprocmask(old);
        println!(
            "init: SIGUSR1 unblocked, handler ran {} times",
            CAUGHT.load(Ordering::Relaxed)
        );
    }

    fn grow_heap() {
        match syscall::sbrk(4096) {
            Ok(p) => {
                // SAFETY: the kernel just mapped these bytes for us.
                unsafe { p.write_bytes(0xA5, 4096) };
                println!("init: heap page at {p:p}");
            }
            Err(e) => println!("init: sbrk failed: {e}"),
        }
    }

    fn run_worker() {
        match syscall::fork() {
            Ok(0) => {
                let argv = [
                    SELF_PATH.as_ptr().cast::<u8>(),
                    c"worker".as_ptr().cast(),
                    c"3".as_ptr().cast(),
                    core::ptr::null(),
                ];
                let e = syscall::exec(SELF_PATH, &argv);
                println!("init child: exec failed: {e}");
                syscall::exit(127)
            }
            Ok(child) => match syscall::wait(Some(child)) {
                Ok((pid, status)) => println!("init: worker {pid} exited with {status}"),
                Err(e) => println!("init: wait failed: {e}"),
            },
            Err(e) => println!("init: fork failed: {e}"),
        }
    }

    fn reap_forever() -> ! {
        loop {
            match syscall::wait(None) {
                Ok((pid, status)) => println!("init: reaped {pid} (status {status})"),
                Err(Errno::ECHILD) => {
                    let _ = syscall::sleep(100);
                }
                Err(_) => syscall::yield_now(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args<'a>(list: &'a [&'a str]) -> impl Iterator<Item = &'a [u8]> {
        list.iter().map(|s| s.as_bytes())
    }

    #[test]
    fn plain_start_is_init() {
        assert_eq!(mode(args(&["/bin/init"])), Mode::Init);
        assert_eq!(mode(args(&[])), Mode::Init);
    }

    #[test]
    fn worker_takes_its_exit_status() {
        assert_eq!(
            mode(args(&["/bin/init", "worker", "3"])),
            Mode::Worker { status: 3 }
        );
        assert_eq!(
            mode(args(&["/bin/init", "worker", "x"])),
            Mode::Worker { status: 0 }
        );
    }
}
