//! This crate walks the call stack of the current thread, frame by frame,
//! from the function that asks for it up to the outermost frame, and names
//! each frame through a symbol table.
//!
//! Simple usage:
//! ```
//! use unwind::{DynamicSymbols, Status};
//!
//! fn main() {
//!     let symbols = DynamicSymbols::new();
//!     let session = unwind::unwind(64).unwrap();
//!     let mut frames = session.symbolicate(&symbols);
//!     for frame in &mut frames {
//!         match frame.name {
//!             Some(name) => println!("{:#x}: ({}+{:#x})", frame.address, name, frame.offset),
//!             None => println!("{:#x}: -- no symbol", frame.address),
//!         }
//!     }
//!     assert_ne!(frames.status(), Status::InProgress);
//! }
//! ```
//!
//! Sample output on Linux+x86_64:
//! ```text
//! 0x55d0c2a1b3e2: -- no symbol
//! 0x55d0c2a1b8a3: -- no symbol
//! 0x7f3a1c829d90: (__libc_start_call_main+0x80)
//! 0x7f3a1c829e40: (__libc_start_main+0x80)
//! 0x55d0c2a1b215: (_start+0x25)
//! ```
//!
//! The pieces can also be used on their own: [Registers::capture] takes a
//! snapshot of the registers, an [UnwindCursor] steps it outwards with a
//! [FrameUnwinder], and a [Session] turns a cursor into an iterator of
//! [Frame]s. Unwinding is strictly local: only the calling thread's stack
//! is walked, and stack memory is only read within that thread's stack.
//!
//! For a runnable program, please refer to ../demos/.

mod cursor;
#[cfg(target_os = "linux")]
mod dwarf;
mod fp;
mod registers;
mod session;
mod symbols;
mod utils;

pub use cursor::{Corruption, CursorState, FrameUnwinder, Step, UnwindCursor};
#[cfg(target_os = "linux")]
pub use dwarf::CfiUnwinder;
pub use fp::FramePointerUnwinder;
pub use registers::{unwind_init_registers, Registers};
pub use session::{Frame, Session, Status, SymbolicFrame, Symbolicate};
#[cfg(unix)]
pub use symbols::DynamicSymbols;
pub use symbols::{Resolution, SymbolEntry, SymbolResolver, SymbolTable, DEFAULT_NAME_CAPACITY};
pub use utils::{AddressRange, Memory, StackMemory};

/// The unwinder used for the current thread: CFI on Linux, frame pointers
/// elsewhere.
#[cfg(target_os = "linux")]
pub type LocalUnwinder = CfiUnwinder;

/// The unwinder used for the current thread: CFI on Linux, frame pointers
/// elsewhere.
#[cfg(not(target_os = "linux"))]
pub type LocalUnwinder = FramePointerUnwinder;

/// A result type that wraps [Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Error definition.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    UnwindCorruption(#[from] Corruption),

    #[error("context capture is unsupported on this thread")]
    CaptureUnsupported,
}

/// Starts an unwind of the current thread's stack.
///
/// The returned [Session] yields at most `max_frames` frames (`usize::MAX`
/// for no limit), starting with the caller of `unwind`. It must be consumed
/// by that caller or by functions it calls, while the frames it describes
/// are still on the stack.
///
/// Fails with [Error::CaptureUnsupported] if the bounds of the current
/// thread's stack cannot be determined.
#[inline(never)]
pub fn unwind(max_frames: usize) -> Result<Session<LocalUnwinder, StackMemory>> {
    let registers = Registers::capture();
    let memory = StackMemory::from_sp(registers.sp()).ok_or(Error::CaptureUnsupported)?;
    let cursor = UnwindCursor::new(registers, LocalUnwinder::new(), memory);
    let mut session = Session::new(cursor, max_frames);
    // The captured frame is this function's own and is gone once we return,
    // so move onto the caller now.
    session.prime();
    Ok(session)
}

/// Inspects the current call-stack, passing all active frames into the closure
/// provided to calculate a stack trace.
///
/// The closure's return value is an indication of whether the backtrace should
/// continue. A return value of `false` will terminate the backtrace and return
/// [Status::LimitReached] immediately.
#[inline(never)]
pub fn trace<F>(mut f: F) -> Result<Status>
where
    F: FnMut(&Frame) -> bool,
{
    let registers = Registers::capture();
    let memory = StackMemory::from_sp(registers.sp()).ok_or(Error::CaptureUnsupported)?;
    let cursor = UnwindCursor::new(registers, LocalUnwinder::new(), memory);
    // Step directly, so that we can skip the current function (`unwind::trace`).
    Ok(drive(Session::new(cursor, usize::MAX), &mut f))
}

/// Inspects the call-stack from `ucontext`, passing all active frames into the closure
/// provided to calculate a stack trace.
///
/// The interrupted frame itself is reported first. The closure's return value
/// is an indication of whether the backtrace should continue.
#[cfg(target_os = "linux")]
pub fn trace_from_ucontext<F>(ucontext: *mut libc::c_void, mut f: F) -> Result<Status>
where
    F: FnMut(&Frame) -> bool,
{
    let registers = Registers::from_ucontext(ucontext).ok_or(Error::CaptureUnsupported)?;
    let memory = StackMemory::from_sp(registers.sp()).ok_or(Error::CaptureUnsupported)?;
    let cursor = UnwindCursor::interrupted(registers, LocalUnwinder::new(), memory);
    Ok(drive(Session::including_current(cursor, usize::MAX), &mut f))
}

fn drive<U, M, F>(mut session: Session<U, M>, f: &mut F) -> Status
where
    U: FrameUnwinder,
    M: Memory,
    F: FnMut(&Frame) -> bool,
{
    for frame in &mut session {
        if !f(&frame) {
            return Status::LimitReached;
        }
    }
    session.status()
}
