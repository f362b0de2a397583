use crate::cursor::{Corruption, FrameUnwinder, Step, UnwindCursor};
use crate::symbols::SymbolResolver;
use crate::utils::Memory;
use crate::Error;
use std::iter::FusedIterator;

/// One activation record, as produced by a [Session].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The program counter. For every frame but an interrupted one this is a
    /// return address.
    pub pc: u64,
    /// The stack pointer of the frame.
    pub sp: u64,
    /// Depth from the innermost frame, starting at 0.
    pub index: usize,
}

/// How an unwind session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The session has more frames to produce.
    InProgress,
    /// The frame limit was reached (or the consumer asked to stop) before
    /// the outermost frame.
    LimitReached,
    /// The outermost frame was reached.
    Terminal,
    /// The stack could not be unwound further.
    Errored(Error),
}

/// A lazy, finite sequence of the frames above the point an unwind was
/// requested from, innermost first.
///
/// Each call to `next` steps the cursor once. When the sequence ends,
/// [Session::status] tells whether it stopped at the frame limit, at the
/// outermost frame or because of a corrupted stack. A session cannot be
/// restarted; dropping it early is fine.
pub struct Session<U, M> {
    cursor: UnwindCursor<U, M>,
    max_frames: usize,
    produced: usize,
    pending: Option<Result<Step, Corruption>>,
    report_current: bool,
    status: Status,
}

impl<U: FrameUnwinder, M: Memory> Session<U, M> {
    /// Creates a session producing at most `max_frames` frames.
    ///
    /// The cursor's current frame is the one the unwind is requested from and
    /// is not reported; the first frame is its caller.
    pub fn new(cursor: UnwindCursor<U, M>, max_frames: usize) -> Self {
        Self {
            cursor,
            max_frames,
            produced: 0,
            pending: None,
            report_current: false,
            status: Status::InProgress,
        }
    }

    /// Creates a session whose first frame is the cursor's current frame,
    /// e.g. the interrupted frame of a signal handler.
    pub fn including_current(cursor: UnwindCursor<U, M>, max_frames: usize) -> Self {
        Self {
            report_current: true,
            ..Self::new(cursor, max_frames)
        }
    }

    /// Performs the next step ahead of time.
    ///
    /// Used when the current frame is about to disappear, such as the frame
    /// of [unwind](crate::unwind) itself once it has returned the session.
    pub(crate) fn prime(&mut self) {
        if !self.report_current && self.pending.is_none() {
            self.pending = Some(self.cursor.step());
        }
    }

    /// How the session ended, or [Status::InProgress] while it has not.
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Number of frames produced so far.
    #[inline]
    pub fn frames_produced(&self) -> usize {
        self.produced
    }

    /// Annotates each frame with the symbol `resolver` finds for its pc.
    pub fn symbolicate<S: SymbolResolver>(self, resolver: &S) -> Symbolicate<'_, U, M, S> {
        Symbolicate {
            session: self,
            resolver,
        }
    }

    fn advance(&mut self) -> Result<Step, Corruption> {
        match self.pending.take() {
            Some(step) => step,
            None => self.cursor.step(),
        }
    }

    fn finish(&mut self, status: Status) -> Option<Frame> {
        self.status = status;
        None
    }
}

impl<U: FrameUnwinder, M: Memory> Iterator for Session<U, M> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.status != Status::InProgress {
            return None;
        }
        if self.produced >= self.max_frames {
            // Peek once more, so a stack that ends exactly at the limit still
            // reports that it was complete.
            let status = match self.advance() {
                Ok(Step::Terminal) => Status::Terminal,
                Ok(Step::Advanced) | Err(_) => Status::LimitReached,
            };
            return self.finish(status);
        }
        if self.report_current {
            self.report_current = false;
            if self.cursor.pc() == 0 {
                return self.finish(Status::Terminal);
            }
        } else {
            match self.advance() {
                Ok(Step::Advanced) => {}
                Ok(Step::Terminal) => return self.finish(Status::Terminal),
                Err(err) => return self.finish(Status::Errored(err.into())),
            }
        }
        let registers = self.cursor.registers();
        let frame = Frame {
            pc: registers.pc(),
            sp: registers.sp(),
            index: self.produced,
        };
        self.produced += 1;
        Some(frame)
    }
}

impl<U: FrameUnwinder, M: Memory> FusedIterator for Session<U, M> {}

/// A frame together with the symbol its pc resolved to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SymbolicFrame<'a> {
    pub address: u64,
    pub index: usize,
    /// `None` if no symbol covers the address.
    pub name: Option<&'a str>,
    /// Distance of `address` from the start of the symbol, 0 without a symbol.
    pub offset: u64,
    /// Whether `name` was cut to the resolver's name capacity.
    pub truncated: bool,
}

/// Iterator returned by [Session::symbolicate].
pub struct Symbolicate<'a, U, M, S> {
    session: Session<U, M>,
    resolver: &'a S,
}

impl<'a, U: FrameUnwinder, M: Memory, S: SymbolResolver> Symbolicate<'a, U, M, S> {
    /// How the underlying session ended.
    #[inline]
    pub fn status(&self) -> Status {
        self.session.status()
    }
}

impl<'a, U: FrameUnwinder, M: Memory, S: SymbolResolver> Iterator for Symbolicate<'a, U, M, S> {
    type Item = SymbolicFrame<'a>;

    fn next(&mut self) -> Option<SymbolicFrame<'a>> {
        let frame = self.session.next()?;
        let resolver = self.resolver;
        let resolution = resolver.resolve(frame.pc);
        Some(SymbolicFrame {
            address: frame.pc,
            index: frame.index,
            name: resolution.name(),
            offset: resolution.offset().unwrap_or(0),
            truncated: resolution.is_truncated(),
        })
    }
}

impl<'a, U: FrameUnwinder, M: Memory, S: SymbolResolver> FusedIterator for Symbolicate<'a, U, M, S> {}
