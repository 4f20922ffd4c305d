//! # Saved Register Context
//!
//! A switched-out process is fully described by one stack pointer. At that
//! address its kernel stack holds a [`Context`] record: the callee-saved
//! registers and the address the switch routine returns to. The switch
//! routine pushes and pops exactly this record, so a new process is started
//! by placing a hand-made record on a fresh stack.
//!
//! ```text
//!  top of kernel stack
//!  +------------------+
//!  | TrapFrame        |  only for processes that start in user mode
//!  +------------------+
//!  | Context.eip      |  trap_return / kernel_thread trampoline
//!  | Context.ebp      |
//!  | Context.ebx      |
//!  | Context.esi      |
//!  | Context.edi      |  <- saved stack pointer
//!  +------------------+
//! ```

use alloc::vec::Vec;
use core::mem::size_of;
use kernel_memory_addresses::VirtualAddress;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// `IF` plus the always-one bit 1.
pub const USER_EFLAGS: u32 = 0x202;

/// Flags user code may change through `sigreturn`: CF PF AF ZF SF TF DF OF.
const USER_SETTABLE_EFLAGS: u32 = 0x0000_0DD5;

/// Callee-saved registers in the order the switch routine pops them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub edi: usize,
    pub esi: usize,
    pub ebx: usize,
    pub ebp: usize,
    /// Where the switch routine returns to.
    pub eip: usize,
}

impl Context {
    /// First dispatch runs `entry(arg)` through the kernel thread trampoline.
    #[must_use]
    pub const fn kernel_thread(t: &Trampolines, entry: usize, arg: usize) -> Self {
        Self {
            edi: 0,
            esi: arg,
            ebx: entry,
            ebp: 0,
            eip: t.kernel_thread,
        }
    }

    /// First dispatch pops the [`TrapFrame`] placed above this record.
    #[must_use]
    pub const fn trap_return(t: &Trampolines) -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: t.trap_return,
        }
    }
}

/// Addresses of the assembly entry routines new processes start in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampolines {
    /// Enables interrupts, calls `ebx(esi)` and exits with its result.
    pub kernel_thread: usize,
    /// Restores a [`TrapFrame`] and `iret`s.
    pub trap_return: usize,
}

/// Registers saved by the interrupt and system call entry stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // pushad order
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    // pushed by the CPU
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid when coming from user mode.
    pub user_esp: u32,
    pub user_ss: u32,
}

impl TrapFrame {
    pub const WORDS: usize = size_of::<Self>() / 4;
    pub const BYTES: usize = size_of::<Self>();

    /// A frame that enters user mode at `entry` with stack `sp`.
    #[must_use]
    pub fn user(entry: VirtualAddress, sp: VirtualAddress) -> Self {
        let ds = u32::from(USER_DATA_SELECTOR);
        Self {
            gs: ds,
            fs: ds,
            es: ds,
            ds,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: 0,
            error_code: 0,
            eip: entry.as_u32(),
            cs: u32::from(USER_CODE_SELECTOR),
            eflags: USER_EFLAGS,
            user_esp: sp.as_u32(),
            user_ss: ds,
        }
    }

    #[must_use]
    pub const fn from_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let words = [
            self.gs, self.fs, self.es, self.ds, self.edi, self.esi, self.ebp, self.esp_dummy,
            self.ebx, self.edx, self.ecx, self.eax, self.vector, self.error_code, self.eip,
            self.cs, self.eflags, self.user_esp, self.user_ss,
        ];
        let mut out = [0u8; Self::BYTES];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::BYTES]) -> Self {
        let mut w = [0u32; Self::WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            gs: w[0],
            fs: w[1],
            es: w[2],
            ds: w[3],
            edi: w[4],
            esi: w[5],
            ebp: w[6],
            esp_dummy: w[7],
            ebx: w[8],
            edx: w[9],
            ecx: w[10],
            eax: w[11],
            vector: w[12],
            error_code: w[13],
            eip: w[14],
            cs: w[15],
            eflags: w[16],
            user_esp: w[17],
            user_ss: w[18],
        }
    }

    /// Take the registers of `saved`, a frame that went through user memory.
    ///
    /// Selectors are forced to the user segments and only arithmetic flags
    /// are taken over, so user code cannot raise its privilege this way.
    pub fn restore_user(&mut self, saved: &Self) {
        let ds = u32::from(USER_DATA_SELECTOR);
        *self = Self {
            gs: ds,
            fs: ds,
            es: ds,
            ds,
            cs: u32::from(USER_CODE_SELECTOR),
            user_ss: ds,
            eflags: USER_EFLAGS | (saved.eflags & USER_SETTABLE_EFLAGS),
            vector: self.vector,
            error_code: self.error_code,
            ..*saved
        };
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Chunk([u8; 16]);

/// Heap allocated kernel stack of one process.
pub struct KernelStack {
    mem: Vec<Chunk>,
}

impl KernelStack {
    /// `None` if the heap cannot provide `bytes`.
    #[must_use]
    pub fn new(bytes: usize) -> Option<Self> {
        let chunks = bytes.div_ceil(size_of::<Chunk>());
        let mut mem = Vec::new();
        mem.try_reserve_exact(chunks).ok()?;
        mem.resize(chunks, Chunk([0; 16]));
        Some(Self { mem })
    }

    #[must_use]
    pub fn bottom(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    /// One past the highest byte; the initial stack pointer.
    #[must_use]
    pub fn top(&self) -> usize {
        self.bottom() + self.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mem.len() * size_of::<Chunk>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    #[must_use]
    pub fn contains(&self, sp: usize) -> bool {
        (self.bottom()..=self.top()).contains(&sp)
    }

    fn write<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(offset + size_of::<T>() <= self.len(), "kernel stack overflow");
        // SAFETY: in bounds, checked above; T is plain data.
        unsafe {
            self.mem
                .as_mut_ptr()
                .cast::<u8>()
                .add(offset)
                .cast::<T>()
                .write_unaligned(value);
        }
    }

    fn read<T: Copy>(&self, addr: usize) -> Option<T> {
        let offset = addr.checked_sub(self.bottom())?;
        if offset + size_of::<T>() > self.len() {
            return None;
        }
        // SAFETY: in bounds, checked above; T is plain data.
        Some(unsafe { self.mem.as_ptr().cast::<u8>().add(offset).cast::<T>().read_unaligned() })
    }

    /// The [`Context`] record at a saved stack pointer.
    #[must_use]
    pub fn saved_context(&self, sp: usize) -> Option<Context> {
        self.read(sp)
    }

    /// The [`TrapFrame`] directly above the [`Context`] record at `sp`.
    #[must_use]
    pub fn saved_trap_frame(&self, sp: usize) -> Option<TrapFrame> {
        self.read(sp + size_of::<Context>())
    }
}

/// Lays out the initial records on a fresh kernel stack, from the top down.
pub struct ContextBuilder<'s> {
    stack: &'s mut KernelStack,
    offset: usize,
}

impl<'s> ContextBuilder<'s> {
    #[must_use]
    pub fn new(stack: &'s mut KernelStack) -> Self {
        let offset = stack.len();
        Self { stack, offset }
    }

    /// The frame `trap_return` will restore.
    #[must_use]
    pub fn trap_frame(mut self, frame: &TrapFrame) -> Self {
        self.push(*frame);
        self
    }

    /// Place the switch record; returns the stack pointer to save.
    #[must_use]
    pub fn finish(mut self, ctx: Context) -> usize {
        self.push(ctx);
        self.stack.bottom() + self.offset
    }

    fn push<T: Copy>(&mut self, value: T) {
        self.offset -= size_of::<T>();
        self.stack.write(self.offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Trampolines = Trampolines {
        kernel_thread: 0x1000,
        trap_return: 0x2000,
    };

    #[test]
    fn kernel_thread_record_is_at_the_top() {
        let mut stack = KernelStack::new(4096).unwrap();
        let sp = ContextBuilder::new(&mut stack).finish(Context::kernel_thread(&T, 0x5000, 7));
        assert_eq!(sp, stack.top() - size_of::<Context>());
        let ctx = stack.saved_context(sp).unwrap();
        assert_eq!(ctx.eip, 0x1000);
        assert_eq!(ctx.ebx, 0x5000);
        assert_eq!(ctx.esi, 7);
        assert!(stack.contains(sp));
    }

    #[test]
    fn trap_frame_sits_above_the_record() {
        let mut stack = KernelStack::new(4096).unwrap();
        let frame = TrapFrame::user(VirtualAddress::new(0x0804_8000), VirtualAddress::new(0xBFFF_E000));
        let sp = ContextBuilder::new(&mut stack)
            .trap_frame(&frame)
            .finish(Context::trap_return(&T));
        assert_eq!(stack.saved_context(sp).unwrap().eip, 0x2000);
        let saved = stack.saved_trap_frame(sp).unwrap();
        assert_eq!(saved, frame);
        assert!(saved.from_user_mode());
        assert_eq!(sp + size_of::<Context>() + TrapFrame::BYTES, stack.top());
    }

    #[test]
    fn restore_cannot_raise_privilege() {
        let mut live = TrapFrame::user(VirtualAddress::new(0x0804_8000), VirtualAddress::new(0xBFFF_E000));
        let mut forged = live;
        forged.cs = u32::from(KERNEL_CODE_SELECTOR);
        forged.eflags = 0x3000 | 0x0001; // IOPL 3, CF
        forged.eax = 42;
        forged.eip = 0x0804_9000;

        live.restore_user(&forged);
        assert_eq!(live.cs, u32::from(USER_CODE_SELECTOR));
        assert_eq!(live.eflags, USER_EFLAGS | 1);
        assert_eq!(live.eax, 42);
        assert_eq!(live.eip, 0x0804_9000);
    }

    #[test]
    fn frame_bytes_keep_field_order() {
        let mut f = TrapFrame::default();
        f.gs = 1;
        f.user_ss = 0x23;
        let bytes = f.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[TrapFrame::BYTES - 4], 0x23);
        assert_eq!(TrapFrame::from_bytes(&bytes), f);
    }
}
