//! # Process Table
//!
//! A fixed number of [`Pcb`] slots allocated once, plus the ready queue
//! threaded through the slots by index. Slots never move, so a slot index
//! (and a pointer into a slot) stays valid for the life of the table.

use crate::ProcError;
use crate::pcb::{Pcb, Pid, ProcessState};
use alloc::boxed::Box;
use alloc::vec::Vec;

pub struct ProcessTable {
    slots: Box<[Pcb]>,
    head: Option<usize>,
    tail: Option<usize>,
    ready_len: usize,
    current: Option<usize>,
    next_pid: u32,
}

impl ProcessTable {
    /// # Errors
    /// [`ProcError::OutOfMemory`] if the slots cannot be allocated.
    pub fn new(capacity: usize) -> Result<Self, ProcError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| ProcError::OutOfMemory)?;
        slots.resize_with(capacity, Pcb::default);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: None,
            tail: None,
            ready_len: 0,
            current: None,
            next_pid: Pid::INIT.as_u32(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lowest unused slot.
    #[must_use]
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|p| p.state == ProcessState::Unused)
    }

    /// Next unused process id, counting up from 1 and skipping ids in use.
    pub fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = Pid::new(self.next_pid);
            self.next_pid = self.next_pid.checked_add(1).unwrap_or(Pid::INIT.as_u32() + 1);
            if self.index_of(pid).is_none() {
                return pid;
            }
        }
    }

    /// Slot of a live or zombie process.
    #[must_use]
    pub fn index_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.state != ProcessState::Unused && p.pid == pid)
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.index_of(pid).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.index_of(pid).map(|i| &mut self.slots[i])
    }

    #[must_use]
    pub fn slot(&self, idx: usize) -> &Pcb {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Pcb {
        &mut self.slots[idx]
    }

    #[must_use]
    pub const fn current(&self) -> Option<usize> {
        self.current
    }

    pub(crate) const fn set_current(&mut self, idx: Option<usize>) {
        self.current = idx;
    }

    #[must_use]
    pub fn current_pid(&self) -> Option<Pid> {
        self.current.map(|i| self.slots[i].pid)
    }

    /// Append `idx` to the ready queue and mark it ready.
    pub fn push_ready(&mut self, idx: usize) {
        debug_assert!(!self.slots[idx].queued, "{:?} queued twice", self.slots[idx].pid);
        debug_assert_ne!(self.current, Some(idx), "running process enqueued");

        let pcb = &mut self.slots[idx];
        pcb.state = ProcessState::Ready;
        pcb.queued = true;
        pcb.prev = self.tail;
        pcb.next = None;
        match self.tail {
            Some(t) => self.slots[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.ready_len += 1;
    }

    /// Unlink `idx` from the ready queue; `false` if it was not queued.
    pub fn remove_ready(&mut self, idx: usize) -> bool {
        if !self.slots[idx].queued {
            return false;
        }
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        let pcb = &mut self.slots[idx];
        pcb.prev = None;
        pcb.next = None;
        pcb.queued = false;
        self.ready_len -= 1;
        true
    }

    /// Ready queue from head to tail.
    pub fn ready(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.head, |&i| self.slots[i].next)
    }

    #[must_use]
    pub const fn ready_len(&self) -> usize {
        self.ready_len
    }

    /// Slots in use, zombies included.
    pub fn used(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(|&i| self.slots[i].state != ProcessState::Unused)
    }

    /// Live and zombie children of `parent`.
    pub fn children(&self, parent: Pid) -> impl Iterator<Item = usize> + '_ {
        self.used()
            .filter(move |&i| self.slots[i].parent == parent && self.slots[i].pid != parent)
    }

    /// Processes blocked for any reason.
    pub fn blocked(&self) -> impl Iterator<Item = usize> + '_ {
        self.used()
            .filter(|&i| matches!(self.slots[i].state, ProcessState::Blocked(_)))
    }

    /// Return a slot to unused, handing back what it held.
    pub fn release(&mut self, idx: usize) -> Pcb {
        self.remove_ready(idx);
        if self.current == Some(idx) {
            self.current = None;
        }
        core::mem::take(&mut self.slots[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy(t: &mut ProcessTable, parent: Pid) -> usize {
        let idx = t.find_free().unwrap();
        let pid = t.allocate_pid();
        let pcb = t.slot_mut(idx);
        pcb.pid = pid;
        pcb.parent = parent;
        pcb.state = ProcessState::Created;
        idx
    }

    #[test]
    fn queue_is_fifo_and_unlinks_from_the_middle() {
        let mut t = ProcessTable::new(8).unwrap();
        let a = occupy(&mut t, Pid::IDLE);
        let b = occupy(&mut t, Pid::IDLE);
        let c = occupy(&mut t, Pid::IDLE);
        t.push_ready(a);
        t.push_ready(b);
        t.push_ready(c);
        assert_eq!(t.ready().collect::<Vec<_>>(), [a, b, c]);

        assert!(t.remove_ready(b));
        assert!(!t.remove_ready(b));
        assert_eq!(t.ready().collect::<Vec<_>>(), [a, c]);
        assert_eq!(t.ready_len(), 2);
        assert!(!t.slot(b).is_linked());

        t.push_ready(b);
        assert_eq!(t.ready().collect::<Vec<_>>(), [a, c, b]);
    }

    #[test]
    fn released_slot_has_no_linkage() {
        let mut t = ProcessTable::new(4).unwrap();
        let a = occupy(&mut t, Pid::IDLE);
        let b = occupy(&mut t, Pid::IDLE);
        t.push_ready(a);
        t.push_ready(b);
        let old = t.release(a);
        assert_eq!(old.pid, Pid::new(1));
        assert_eq!(t.slot(a).state, ProcessState::Unused);
        assert!(!t.slot(a).is_linked());
        assert_eq!(t.ready().collect::<Vec<_>>(), [b]);
        assert_eq!(t.find_free(), Some(a));
    }

    #[test]
    fn pids_count_up_and_children_are_found() {
        let mut t = ProcessTable::new(4).unwrap();
        let init = occupy(&mut t, Pid::IDLE);
        assert_eq!(t.slot(init).pid, Pid::INIT);
        let c1 = occupy(&mut t, Pid::INIT);
        let c2 = occupy(&mut t, Pid::INIT);
        assert_eq!(t.slot(c2).pid, Pid::new(3));
        assert_eq!(t.children(Pid::INIT).collect::<Vec<_>>(), [c1, c2]);
        assert_eq!(t.index_of(Pid::new(3)), Some(c2));
        assert_eq!(t.index_of(Pid::new(9)), None);
    }
}
