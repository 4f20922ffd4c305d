//! The user heap break.

use super::ProcessManager;
use crate::ProcError;
use crate::pcb::Pid;
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, PageFlags, PhysMapper};

impl ProcessManager {
    /// Move the program break of `pid` by `delta` bytes and return the old
    /// break.
    ///
    /// Growing maps zeroed, writable pages up to the new break. Shrinking
    /// only moves the break; the pages stay mapped for the next growth.
    ///
    /// # Errors
    /// [`ProcError::NotUserProcess`], [`ProcError::InvalidArgument`] below
    /// the start of the heap, [`ProcError::OutOfMemory`] when the heap would
    /// reach the guard page under the stack or frames run out.
    pub fn sbrk<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        pid: Pid,
        delta: i32,
    ) -> Result<VirtualAddress, ProcError> {
        let idx = self.live_index(pid)?;
        let pcb = self.table.slot_mut(idx);
        let (Some(layout), Some(space)) = (pcb.user.as_mut(), pcb.space) else {
            return Err(ProcError::NotUserProcess);
        };

        let old = layout.brk;
        let new = old
            .as_u32()
            .checked_add_signed(delta)
            .map(VirtualAddress::new)
            .ok_or(ProcError::InvalidArgument)?;
        if new < layout.brk_start {
            return Err(ProcError::InvalidArgument);
        }
        let limit = layout.stack_bottom.as_u32() - PAGE_SIZE;
        if new.as_u32() > limit {
            return Err(ProcError::OutOfMemory);
        }

        if new > old {
            vmm.map_user(space, old, new.as_u32() - old.as_u32(), PageFlags::USER_RW)?;
        }
        layout.brk = new;
        Ok(old)
    }
}
