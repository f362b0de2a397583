use crate::cursor::{Corruption, FrameUnwinder};
use crate::registers::{Registers, RA};
use crate::utils::Memory;
use gimli::{CfaRule, Reader, Register, RegisterRule, UnwindContext, UnwindTableRow};
use sections::{sections, SectionInfo, SectionReader};

mod sections;

/// Unwinds with the call frame information in the .eh_frame sections of the
/// loaded modules.
///
/// The modules are discovered through `dl_iterate_phdr` once per process;
/// each unwinder only owns the scratch space gimli needs to evaluate CFI
/// programs.
pub struct CfiUnwinder {
    ctx: UnwindContext<SectionReader>,
    sections: &'static [SectionInfo<SectionReader>],
}

impl CfiUnwinder {
    /// Creates a new `CfiUnwinder`.
    #[inline]
    pub fn new() -> Self {
        Self {
            ctx: UnwindContext::new(),
            sections: sections(),
        }
    }
}

impl Default for CfiUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameUnwinder for CfiUnwinder {
    fn unwind_frame<M: Memory>(
        &mut self,
        registers: &Registers,
        lookup_pc: u64,
        memory: &M,
    ) -> Result<Option<Registers>, Corruption> {
        let section = self
            .sections
            .iter()
            .find(|s| s.contains(lookup_pc))
            .ok_or(Corruption::NoUnwindInfo(lookup_pc))?;
        let row = section.find_unwind_table_row(&mut self.ctx, lookup_pc)?;
        step(registers, &row, lookup_pc, memory)
    }
}

/// Applies one CFI row to `registers`, producing the caller's registers.
///
/// Returns `Ok(None)` when the row leaves the return address undefined, which
/// is how the outermost frames (`_start`, `clone`) mark the end of the stack.
/// gimli drops `Undefined` rules from a row, so a missing RA column and an
/// undefined one are the same thing here. Registers without a rule keep the
/// callee's value.
pub fn step<R: Reader, M: Memory>(
    registers: &Registers,
    row: &UnwindTableRow<R>,
    pc: u64,
    memory: &M,
) -> Result<Option<Registers>, Corruption> {
    let cfa = match *row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            check_register(register, pc)?;
            registers[register].wrapping_add(offset as u64)
        }
        CfaRule::Expression(_) => return Err(Corruption::UnsupportedRule(pc)),
    };
    let mut new_registers = *registers;
    for &(register, ref rule) in row.registers() {
        check_register(register, pc)?;
        new_registers[register] = recover(registers, register, rule, cfa, pc, memory)?;
    }
    let return_address = match row.register(RA) {
        RegisterRule::Undefined => match registers.link_register() {
            Some(lr) => lr,
            None => return Ok(None),
        },
        _ => new_registers[RA],
    };
    // Typically, the CFA is the stack pointer at the call site in the
    // previous frame.
    new_registers.set_sp(cfa);
    new_registers.set_pc(return_address);
    Ok(Some(new_registers))
}

/// Evaluates the rule restoring `register` in the caller.
fn recover<R: Reader, M: Memory>(
    registers: &Registers,
    register: Register,
    rule: &RegisterRule<R>,
    cfa: u64,
    pc: u64,
    memory: &M,
) -> Result<u64, Corruption> {
    match *rule {
        RegisterRule::Undefined => Ok(0),
        RegisterRule::SameValue => Ok(registers[register]),
        RegisterRule::Offset(n) => {
            let address = cfa.wrapping_add(n as u64);
            memory.read_u64(address).ok_or(Corruption::OutOfBounds(address))
        }
        RegisterRule::ValOffset(n) => Ok(cfa.wrapping_add(n as u64)),
        RegisterRule::Register(r) => {
            check_register(r, pc)?;
            Ok(registers[r])
        }
        RegisterRule::Expression(_) | RegisterRule::ValExpression(_) | RegisterRule::Architectural => {
            Err(Corruption::UnsupportedRule(pc))
        }
    }
}

#[inline]
fn check_register(register: Register, pc: u64) -> Result<(), Corruption> {
    if Registers::valid_register(register) {
        Ok(())
    } else {
        Err(Corruption::InvalidUnwindInfo(pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Step, UnwindCursor};
    use crate::utils::StackMemory;
    use gimli::write::{
        self, Address, CallFrameInstruction, CommonInformationEntry, EndianVec, Expression, FrameDescriptionEntry,
        FrameTable,
    };
    use gimli::{BaseAddresses, EhFrame, Encoding, Format, LittleEndian, UnwindSection, UnwindTable};
    use std::collections::HashMap;

    #[cfg(target_arch = "x86_64")]
    mod regs {
        use gimli::{Register, X86_64};
        pub const SP: Register = X86_64::RSP;
        pub const FP: Register = X86_64::RBP;
        pub const A: Register = X86_64::RBX;
        pub const B: Register = X86_64::R12;
        pub const C: Register = X86_64::R13;
    }

    #[cfg(target_arch = "aarch64")]
    mod regs {
        use gimli::{AArch64, Register};
        pub const SP: Register = AArch64::SP;
        pub const FP: Register = AArch64::X29;
        pub const A: Register = AArch64::X19;
        pub const B: Register = AArch64::X20;
        pub const C: Register = AArch64::X21;
    }

    use regs::*;

    const FUNCTION: u64 = 0x1000;
    const PC: u64 = 0x1010;

    /// Builds an .eh_frame with one CIE and one FDE covering `FUNCTION`, with
    /// every FDE instruction taking effect at the function's start.
    fn eh_frame(cie: Vec<CallFrameInstruction>, fde: Vec<CallFrameInstruction>) -> Vec<u8> {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 1,
            address_size: 8,
        };
        let mut common = CommonInformationEntry::new(encoding, 1, -8, RA);
        for instruction in cie {
            common.add_instruction(instruction);
        }
        let mut table = FrameTable::default();
        let cie_id = table.add_cie(common);
        let mut entry = FrameDescriptionEntry::new(Address::Constant(FUNCTION), 0x100);
        for instruction in fde {
            entry.add_instruction(0, instruction);
        }
        table.add_fde(cie_id, entry);
        let mut section = write::EhFrame(EndianVec::new(LittleEndian));
        table.write_eh_frame(&mut section).unwrap();
        section.0.into_vec()
    }

    /// The usual prologue: CFA = sp + 16, RA at CFA - 8, FP at CFA - 16.
    fn standard_cie() -> Vec<CallFrameInstruction> {
        vec![
            CallFrameInstruction::Cfa(SP, 16),
            CallFrameInstruction::Offset(RA, -8),
            CallFrameInstruction::Offset(FP, -16),
        ]
    }

    fn step_at(
        section: &[u8],
        registers: &Registers,
        memory: &HashMap<u64, u64>,
    ) -> Result<Option<Registers>, Corruption> {
        let eh_frame = EhFrame::new(section, LittleEndian);
        let bases = BaseAddresses::default();
        let fde = eh_frame
            .fde_for_address(&bases, PC, EhFrame::cie_from_offset)
            .unwrap();
        let mut ctx = UnwindContext::new();
        let mut table = UnwindTable::new(&eh_frame, &bases, &mut ctx, &fde).unwrap();
        while let Some(row) = table.next_row().unwrap() {
            if row.contains(PC) {
                return step(registers, row, PC, memory);
            }
        }
        panic!("no row for {:#x}", PC);
    }

    fn callee(fp: u64) -> Registers {
        let mut registers = Registers::default();
        registers.set_pc(PC + 1);
        registers.set_sp(0x7000);
        registers.set_fp(fp);
        registers
    }

    fn saved_frame() -> HashMap<u64, u64> {
        [(0x7000, 0x7200), (0x7008, 0x2222)].into_iter().collect()
    }

    #[test]
    fn test_offset_rules() {
        let section = eh_frame(standard_cie(), vec![]);
        let caller = step_at(&section, &callee(0x7100), &saved_frame()).unwrap().unwrap();
        assert_eq!(caller.sp(), 0x7010);
        assert_eq!(caller.pc(), 0x2222);
        assert_eq!(caller.fp(), 0x7200);
    }

    #[test]
    fn test_val_offset_and_register_rules() {
        let section = eh_frame(
            standard_cie(),
            vec![
                CallFrameInstruction::ValOffset(A, -16),
                CallFrameInstruction::Register(B, A),
            ],
        );
        let mut registers = callee(0x7100);
        registers[A] = 0xaaaa;
        registers[C] = 0xcccc;
        let caller = step_at(&section, &registers, &saved_frame()).unwrap().unwrap();
        assert_eq!(caller[A], 0x7000);
        assert_eq!(caller[B], 0xaaaa);
        // No rule: the callee's value is kept.
        assert_eq!(caller[C], 0xcccc);
    }

    #[test]
    fn test_undefined_return_address_is_outermost() {
        let section = eh_frame(standard_cie(), vec![CallFrameInstruction::Undefined(RA)]);
        let res = step_at(&section, &callee(0), &saved_frame());
        assert_eq!(res.map(|r| r.map(|r| r.pc())), Ok(None));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_missing_return_address_is_outermost() {
        let section = eh_frame(vec![CallFrameInstruction::Cfa(SP, 8)], vec![]);
        let res = step_at(&section, &callee(0x7100), &saved_frame());
        assert_eq!(res.map(|r| r.map(|r| r.pc())), Ok(None));
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn test_leaf_returns_through_link_register() {
        let section = eh_frame(vec![CallFrameInstruction::Cfa(SP, 0)], vec![]);
        let mut registers = callee(0x7100);
        registers[RA] = 0x3333;
        let caller = step_at(&section, &registers, &saved_frame()).unwrap().unwrap();
        assert_eq!(caller.pc(), 0x3333);
        assert_eq!(caller.sp(), 0x7000);
    }

    #[test]
    fn test_expressions_are_unsupported() {
        let cfa_expression = eh_frame(
            vec![CallFrameInstruction::CfaExpression(Expression::raw(vec![
                gimli::constants::DW_OP_lit0.0,
            ]))],
            vec![],
        );
        assert_eq!(
            step_at(&cfa_expression, &callee(0x7100), &saved_frame()).map(|r| r.map(|r| r.pc())),
            Err(Corruption::UnsupportedRule(PC))
        );

        let register_expression = eh_frame(
            standard_cie(),
            vec![CallFrameInstruction::Expression(
                A,
                Expression::raw(vec![gimli::constants::DW_OP_lit0.0]),
            )],
        );
        assert_eq!(
            step_at(&register_expression, &callee(0x7100), &saved_frame()).map(|r| r.map(|r| r.pc())),
            Err(Corruption::UnsupportedRule(PC))
        );
    }

    #[test]
    fn test_register_out_of_range() {
        let section = eh_frame(standard_cie(), vec![CallFrameInstruction::Offset(Register(200), -24)]);
        assert_eq!(
            step_at(&section, &callee(0x7100), &saved_frame()).map(|r| r.map(|r| r.pc())),
            Err(Corruption::InvalidUnwindInfo(PC))
        );

        let section = eh_frame(vec![CallFrameInstruction::Cfa(Register(300), 16)], vec![]);
        assert_eq!(
            step_at(&section, &callee(0x7100), &saved_frame()).map(|r| r.map(|r| r.pc())),
            Err(Corruption::InvalidUnwindInfo(PC))
        );
    }

    #[test]
    fn test_saved_register_off_stack() {
        let section = eh_frame(standard_cie(), vec![]);
        let res = step_at(&section, &callee(0x7100), &HashMap::new());
        assert!(matches!(res, Err(Corruption::OutOfBounds(0x7000 | 0x7008))));
    }

    #[test]
    #[inline(never)]
    fn test_cfi_step_to_caller() {
        let registers = Registers::capture();
        let memory = StackMemory::from_sp(registers.sp()).unwrap();
        let mut unwinder = CfiUnwinder::new();
        let caller = unwinder
            .unwind_frame(&registers, registers.pc() - 1, &memory)
            .unwrap()
            .unwrap();
        assert!(caller.sp() > registers.sp());
        assert_ne!(caller.pc(), 0);
    }

    #[test]
    fn test_cfi_cursor_walks_several_frames() {
        let registers = Registers::capture();
        let memory = StackMemory::from_sp(registers.sp()).unwrap();
        let mut cursor = UnwindCursor::new(registers, CfiUnwinder::new(), memory);
        let mut n = 0;
        while let Ok(Step::Advanced) = cursor.step() {
            n += 1;
        }
        assert!(n > 2);
    }

    #[test]
    fn test_unknown_pc() {
        let registers = Registers::default();
        let memory = StackMemory::from_sp(Registers::capture().sp()).unwrap();
        let res = CfiUnwinder::new().unwind_frame(&registers, 1, &memory);
        assert_eq!(res.map(|r| r.map(|r| r.pc())), Err(Corruption::NoUnwindInfo(1)));
    }
}
