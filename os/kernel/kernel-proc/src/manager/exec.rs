//! `exec` and the initial user stack.
//!
//! The stack is laid out as if `main(argc, argv)` had just been called:
//!
//! ```text
//!  sp + 0   0             return address
//!  sp + 4   argc
//!  sp + 8   argv          -> sp + 12
//!  sp + 12  argv[0..argc], NULL
//!           strings, NUL terminated
//! ```
//!
//! `sp` is 16-byte aligned.

use super::ProcessManager;
use crate::ProcError;
use crate::context::TrapFrame;
use crate::pcb::{Mode, Pid, UserLayout};
use alloc::vec::Vec;
use kernel_alloc::vmm::Vmm;
use kernel_elf::{FileSource, LoadedImage};
use kernel_info::memory::{USER_STACK_SIZE, USER_STACK_TOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, PageFlags, PhysMapper, RootPage};
use log::info;

/// Upper bound for the argument block in bytes.
pub const ARG_MAX: usize = 4096;

const WORD: usize = 4;

/// The bytes to place at the returned stack pointer.
#[allow(clippy::cast_possible_truncation)]
fn argument_block(
    stack_top: VirtualAddress,
    argv: &[&[u8]],
) -> Result<(VirtualAddress, Vec<u8>), ProcError> {
    let strings: usize = argv.iter().map(|a| a.len() + 1).sum();
    let header = 3 * WORD + (argv.len() + 1) * WORD;
    let total = header + strings;
    if total > ARG_MAX {
        return Err(ProcError::ArgumentsTooLarge);
    }

    let sp = (stack_top.as_u32() - total as u32) & !0xF;
    let mut block = Vec::new();
    block
        .try_reserve_exact(total)
        .map_err(|_| ProcError::OutOfMemory)?;

    let word = |block: &mut Vec<u8>, w: u32| block.extend_from_slice(&w.to_le_bytes());
    word(&mut block, 0);
    word(&mut block, argv.len() as u32);
    word(&mut block, sp + 3 * WORD as u32);
    let mut at = sp + header as u32;
    for arg in argv {
        word(&mut block, at);
        at += arg.len() as u32 + 1;
    }
    word(&mut block, 0);
    for arg in argv {
        block.extend_from_slice(arg);
        block.push(0);
    }
    debug_assert_eq!(block.len(), total);
    Ok((VirtualAddress::new(sp), block))
}

/// Map the user stack of `space` and write the arguments onto it.
///
/// Returns the new layout and the initial user stack pointer.
pub(super) fn setup_user_stack<M: PhysMapper, A: FrameAlloc>(
    vmm: &mut Vmm<M, A>,
    space: RootPage,
    image: LoadedImage,
    argv: &[&[u8]],
) -> Result<(UserLayout, VirtualAddress), ProcError> {
    let (sp, block) = argument_block(USER_STACK_TOP, argv)?;
    let bottom = VirtualAddress::new(USER_STACK_TOP.as_u32() - USER_STACK_SIZE);
    vmm.map_user(space, bottom, USER_STACK_SIZE, PageFlags::USER_RW)?;
    vmm.copy_to_user(space, sp, &block)?;

    let layout = UserLayout {
        entry: image.entry,
        stack_top: USER_STACK_TOP,
        stack_bottom: bottom,
        brk_start: image.image_end,
        brk: image.image_end,
    };
    Ok((layout, sp))
}

/// Last path component, used as the process name.
pub(super) fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl ProcessManager {
    /// Replace the program of `pid` with the executable at `path`.
    ///
    /// On success the old address space is gone, `frame` enters the new
    /// program at its entry point with `argv` on a fresh stack, the heap
    /// break is reset and caught signals revert to their default. On failure
    /// nothing about `pid` has changed.
    ///
    /// # Errors
    /// [`ProcError::ArgumentsTooLarge`], [`ProcError::Exec`] for a missing or
    /// malformed image, [`ProcError::OutOfMemory`].
    pub fn exec<M: PhysMapper, A: FrameAlloc, F: FileSource + ?Sized>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        files: &F,
        pid: Pid,
        path: &str,
        argv: &[&[u8]],
        frame: &mut TrapFrame,
    ) -> Result<(), ProcError> {
        let idx = self.live_index(pid)?;
        // Reject oversized arguments before building anything.
        argument_block(USER_STACK_TOP, argv)?;

        let space = vmm.create_user_space()?;
        let built = kernel_elf::load_path(vmm, space, files, path)
            .map_err(ProcError::from)
            .and_then(|image| setup_user_stack(vmm, space, image, argv));
        let (layout, sp) = match built {
            Ok(v) => v,
            Err(e) => {
                vmm.destroy_space(space);
                return Err(e);
            }
        };

        let is_current = self.table.current() == Some(idx);
        let pcb = self.table.slot_mut(idx);
        let old = pcb.space.replace(space);
        if is_current {
            // SAFETY: the new directory carries the kernel identity map that
            // this code and its stack live in.
            unsafe { vmm.activate(space) };
        }
        if pcb.mode == Mode::User
            && let Some(old) = old
        {
            vmm.destroy_space(old);
        }

        pcb.mode = Mode::User;
        pcb.user = Some(layout);
        pcb.signals.reset_on_exec();
        pcb.set_name(file_name(path));
        *frame = TrapFrame::user(layout.entry, sp);
        info!("process {pid} exec {path}, entry {}", layout.entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(block: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(block[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn block_follows_cdecl_layout() {
        let top = VirtualAddress::new(0xBFFF_F000);
        let (sp, block) = argument_block(top, &[&b"/bin/sh"[..], &b"-c"[..]]).unwrap();
        assert_eq!(sp.as_u32() % 16, 0);
        assert!(sp.as_u32() + block.len() as u32 <= top.as_u32());

        assert_eq!(word(&block, 0), 0);
        assert_eq!(word(&block, 4), 2);
        assert_eq!(word(&block, 8), sp.as_u32() + 12);
        let argv0 = (word(&block, 12) - sp.as_u32()) as usize;
        let argv1 = (word(&block, 16) - sp.as_u32()) as usize;
        assert_eq!(word(&block, 20), 0);
        assert_eq!(&block[argv0..argv0 + 8], b"/bin/sh\0");
        assert_eq!(&block[argv1..argv1 + 3], b"-c\0");
    }

    #[test]
    fn empty_argv_still_has_terminator() {
        let (sp, block) = argument_block(VirtualAddress::new(0xBFFF_F000), &[]).unwrap();
        assert_eq!(block.len(), 16);
        assert_eq!(word(&block, 4), 0);
        assert_eq!(word(&block, 8), sp.as_u32() + 12);
        assert_eq!(word(&block, 12), 0);
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let big = [0x41u8; ARG_MAX];
        assert_eq!(
            argument_block(VirtualAddress::new(0xBFFF_F000), &[&big[..]]).unwrap_err(),
            ProcError::ArgumentsTooLarge
        );
    }

    #[test]
    fn names_come_from_the_last_component() {
        assert_eq!(file_name("/bin/init"), "init");
        assert_eq!(file_name("sh"), "sh");
    }
}
