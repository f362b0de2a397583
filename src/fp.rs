use crate::cursor::{Corruption, FrameUnwinder};
use crate::registers::Registers;
use crate::utils::Memory;

/// Unwinds by following the frame pointer chain.
///
/// Both x86_64 (`push rbp; mov rbp, rsp`) and aarch64 (`stp x29, x30, [sp, #-16]!;
/// mov x29, sp`) prologues leave a frame record at FP:
///
/// ```text
///     [fp + 8]  return address
///     [fp]      caller's frame pointer
/// ```
///
/// so the records form a linked list through the stack, and the caller's SP
/// is the address just above the record. A null frame pointer ends the list.
///
/// Only PC, SP and FP are restored. This is enough to trace the call stack,
/// but only for code built with frame pointers (always the case on macOS).
#[derive(Debug, Default, Copy, Clone)]
pub struct FramePointerUnwinder;

impl FramePointerUnwinder {
    /// Creates a new `FramePointerUnwinder`.
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl FrameUnwinder for FramePointerUnwinder {
    fn unwind_frame<M: Memory>(
        &mut self,
        registers: &Registers,
        _lookup_pc: u64,
        memory: &M,
    ) -> Result<Option<Registers>, Corruption> {
        let fp = registers.fp();
        if fp == 0 {
            return Ok(None);
        }
        let caller_sp = fp.checked_add(16).ok_or(Corruption::OutOfBounds(fp))?;
        let ra_loc = fp + 8;
        let caller_fp = memory.read_u64(fp).ok_or(Corruption::OutOfBounds(fp))?;
        let return_address = memory.read_u64(ra_loc).ok_or(Corruption::OutOfBounds(ra_loc))?;
        let mut caller = *registers;
        caller.set_fp(caller_fp);
        caller.set_pc(return_address);
        caller.set_sp(caller_sp);
        Ok(Some(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    impl Memory for HashMap<u64, u64> {
        fn read_u64(&self, address: u64) -> Option<u64> {
            self.get(&address).copied()
        }
    }

    #[test]
    fn test_frame_record() {
        let memory: HashMap<u64, u64> = [(0x7010, 0x7030), (0x7018, 0x2008)].into_iter().collect();
        let mut registers = Registers::default();
        registers.set_pc(0x1004);
        registers.set_sp(0x7000);
        registers.set_fp(0x7010);
        let caller = FramePointerUnwinder::new()
            .unwind_frame(&registers, 0x1003, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.pc(), 0x2008);
        assert_eq!(caller.fp(), 0x7030);
        assert_eq!(caller.sp(), 0x7020);
    }

    #[test]
    fn test_null_frame_pointer() {
        let memory = HashMap::new();
        let registers = Registers::default();
        let caller = FramePointerUnwinder::new().unwind_frame(&registers, 0, &memory);
        assert_eq!(caller.unwrap().map(|r| r.pc()), None);
    }

    #[test]
    fn test_unreadable_record() {
        let memory: HashMap<u64, u64> = [(0x7010, 0x7030)].into_iter().collect();
        let mut registers = Registers::default();
        registers.set_fp(0x7010);
        let res = FramePointerUnwinder::new().unwind_frame(&registers, 0, &memory);
        assert_eq!(res.map(|r| r.map(|r| r.pc())), Err(Corruption::OutOfBounds(0x7018)));
        registers.set_fp(u64::MAX);
        let res = FramePointerUnwinder::new().unwind_frame(&registers, 0, &memory);
        assert_eq!(res.map(|r| r.map(|r| r.pc())), Err(Corruption::OutOfBounds(u64::MAX)));
    }
}
