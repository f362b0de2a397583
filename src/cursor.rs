use crate::registers::Registers;
use crate::utils::Memory;

/// Why a cursor could not compute the caller's frame.
///
/// Each of these ends the unwind: the stack (or its metadata) can no longer
/// be trusted.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Corruption {
    #[error("no unwind info for pc {0:#x}")]
    NoUnwindInfo(u64),

    #[error("invalid unwind info for pc {0:#x}")]
    InvalidUnwindInfo(u64),

    #[error("unsupported unwind rule for pc {0:#x}")]
    UnsupportedRule(u64),

    #[error("read outside of the stack at {0:#x}")]
    OutOfBounds(u64),

    #[error("stack pointer did not advance: {callee:#x} -> {caller:#x}")]
    StackNotAdvancing { callee: u64, caller: u64 },
}

/// An unwind strategy: recovers a caller's registers from its callee's.
pub trait FrameUnwinder {
    /// Computes the register state of the caller of the frame described by
    /// `registers`.
    ///
    /// `lookup_pc` is the address to look unwind rules up with; it differs
    /// from `registers.pc()` when the pc is a return address. Returns
    /// `Ok(None)` when the metadata marks this frame as the outermost one.
    fn unwind_frame<M: Memory>(
        &mut self,
        registers: &Registers,
        lookup_pc: u64,
        memory: &M,
    ) -> Result<Option<Registers>, Corruption>;
}

impl<U: FrameUnwinder + ?Sized> FrameUnwinder for &mut U {
    #[inline]
    fn unwind_frame<M: Memory>(
        &mut self,
        registers: &Registers,
        lookup_pc: u64,
        memory: &M,
    ) -> Result<Option<Registers>, Corruption> {
        (**self).unwind_frame(registers, lookup_pc, memory)
    }
}

/// The outcome of a successful [UnwindCursor::step].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// The cursor moved to the caller's frame.
    Advanced,
    /// There is no caller; the cursor will not move again.
    Terminal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorState {
    Initialized,
    Stepping,
    Terminal,
    Errored(Corruption),
}

/// `UnwindCursor` is used to trace the stack with [Registers].
///
/// The cursor owns the current frame's registers and moves them one frame
/// outwards per [step](UnwindCursor::step). How the caller's registers are
/// recovered is left to a [FrameUnwinder]; on Linux the .eh_frame sections
/// (in DWARF format) are used, elsewhere the frame pointer chain.
///
/// ```
/// use unwind::{Registers, UnwindCursor, Step, LocalUnwinder, StackMemory};
///
/// let registers = Registers::capture();
/// let memory = StackMemory::from_sp(registers.sp()).unwrap();
/// let mut cursor = UnwindCursor::new(registers, LocalUnwinder::new(), memory);
/// let mut pcs = vec![cursor.pc()];
/// while let Ok(Step::Advanced) = cursor.step() {
///     pcs.push(cursor.pc());
/// }
/// assert!(pcs.len() > 1);
/// ```
///
/// [Registers]: crate::registers::Registers
pub struct UnwindCursor<U, M> {
    registers: Registers,
    unwinder: U,
    memory: M,
    state: CursorState,
    exact_pc: bool,
}

impl<U: FrameUnwinder, M: Memory> UnwindCursor<U, M> {
    /// Creates a new `UnwindCursor` from registers whose pc is a return
    /// address, such as the ones produced by [Registers::capture].
    #[inline]
    pub fn new(registers: Registers, unwinder: U, memory: M) -> Self {
        Self {
            registers,
            unwinder,
            memory,
            state: CursorState::Initialized,
            exact_pc: false,
        }
    }

    /// Creates a new `UnwindCursor` from registers of an interrupted frame
    /// (e.g. taken from a signal handler's `ucontext`), whose pc points at
    /// the interrupted instruction itself.
    #[inline]
    pub fn interrupted(registers: Registers, unwinder: U, memory: M) -> Self {
        Self {
            exact_pc: true,
            ..Self::new(registers, unwinder, memory)
        }
    }

    /// Attempts to restore the parent function's register state based on the
    /// current register state.
    ///
    /// Once the cursor reports [Step::Terminal] or an error it stays there:
    /// further calls return the same outcome without touching the stack.
    pub fn step(&mut self) -> Result<Step, Corruption> {
        match self.state {
            CursorState::Terminal => return Ok(Step::Terminal),
            CursorState::Errored(err) => return Err(err),
            CursorState::Initialized | CursorState::Stepping => {}
        }
        let pc = self.registers.pc();
        if pc == 0 {
            self.state = CursorState::Terminal;
            return Ok(Step::Terminal);
        }
        // Usually a pc is the return address, which points after the call
        // instruction and possibly into the next function. Subtract 1 to look
        // up the rules of the call site itself.
        let lookup_pc = if self.exact_pc && self.state == CursorState::Initialized {
            pc
        } else {
            pc - 1
        };
        self.state = CursorState::Stepping;

        let caller = match self.unwinder.unwind_frame(&self.registers, lookup_pc, &self.memory) {
            Ok(Some(caller)) => caller,
            Ok(None) => {
                log::trace!("outermost frame at pc {:#x}", pc);
                self.state = CursorState::Terminal;
                return Ok(Step::Terminal);
            }
            Err(err) => return Err(self.fail(err)),
        };
        if caller.pc() == 0 {
            log::trace!("null return address above pc {:#x}", pc);
            self.state = CursorState::Terminal;
            return Ok(Step::Terminal);
        }
        // Stacks grow downwards, so every caller must sit strictly above its
        // callee. This also stops loops in corrupted frame chains.
        if caller.sp() <= self.registers.sp() {
            return Err(self.fail(Corruption::StackNotAdvancing {
                callee: self.registers.sp(),
                caller: caller.sp(),
            }));
        }
        log::trace!("step {:#x} -> {:#x} (sp {:#x})", pc, caller.pc(), caller.sp());
        self.registers = caller;
        Ok(Step::Advanced)
    }

    /// The registers of the frame the cursor is currently on.
    #[inline]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// The pc of the frame the cursor is currently on.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.registers.pc()
    }

    #[inline]
    pub fn state(&self) -> CursorState {
        self.state
    }

    fn fail(&mut self, err: Corruption) -> Corruption {
        log::debug!("unwind stopped at pc {:#x}: {}", self.registers.pc(), err);
        self.state = CursorState::Errored(err);
        err
    }
}
