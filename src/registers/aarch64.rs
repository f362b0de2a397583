use gimli::{AArch64, Register};
use std::ops::{Index, IndexMut};

// See: https://developer.arm.com/documentation/ihi0057/b/
const FP: Register = AArch64::X29;
const LR: Register = AArch64::X30;
const SP: Register = AArch64::SP;
// Column 32 is reserved by the DWARF ABI, the capture routine keeps the pc there.
const PC: Register = Register(32);

/// The DWARF column holding the return address.
pub const RA: Register = LR;

/// `Registers` holds the register context for a specific platform (OS+ISA).
///
/// It is an opaque snapshot: the cursor reads and writes it through DWARF
/// register numbers, callers only observe PC, SP and FP.
///
/// ```
/// let registers = unwind::Registers::capture();
/// assert_ne!(registers.pc(), 0);
/// ```
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Registers {
    x: [u64; 128], // x0 ~ x30, sp, pc, ...
}

impl Default for Registers {
    fn default() -> Self {
        Self { x: [0; 128] }
    }
}

impl Registers {
    /// Initialize `Registers` with value from `ucontext`.
    #[cfg(target_os = "linux")]
    pub fn from_ucontext(ucontext: *mut libc::c_void) -> Option<Self> {
        let ucontext = ucontext as *mut libc::ucontext_t;
        if ucontext.is_null() {
            return None;
        }
        let mcontext = unsafe { &(*ucontext).uc_mcontext };
        let mut registers = Self::default();
        registers.x[..31].copy_from_slice(&mcontext.regs);
        registers[SP] = mcontext.sp;
        registers[PC] = mcontext.pc;
        Some(registers)
    }

    /// Whether a DWARF register number fits into this register file.
    #[inline]
    pub fn valid_register(register: Register) -> bool {
        (register.0 as usize) < 128
    }

    /// Get the value of the PC (Program Counter) register.
    #[inline]
    pub fn pc(&self) -> u64 {
        self[PC]
    }

    /// Set the value of the PC (Program Counter) register.
    #[inline]
    pub fn set_pc(&mut self, v: u64) {
        self[PC] = v;
    }

    /// Get the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn sp(&self) -> u64 {
        self[SP]
    }

    /// Set the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn set_sp(&mut self, v: u64) {
        self[SP] = v;
    }

    /// Get the value of the FP (Frame Pointer) register.
    #[inline]
    pub fn fp(&self) -> u64 {
        self[FP]
    }

    /// Set the value of the FP (Frame Pointer) register.
    #[inline]
    pub fn set_fp(&mut self, v: u64) {
        self[FP] = v;
    }

    /// The return address to use when no CFI rule mentions the RA column.
    ///
    /// Leaf functions keep the return address in LR and emit no instruction
    /// describing how to restore it. The outermost frames (`_start`,
    /// `thread_start`) clear x29 and mark LR undefined, which looks the same
    /// to us once gimli drops the rule, so a null frame pointer means there
    /// is no caller.
    #[inline]
    pub fn link_register(&self) -> Option<u64> {
        if self[FP] == 0 {
            None
        } else {
            Some(self[LR])
        }
    }
}

impl Index<Register> for Registers {
    type Output = u64;

    fn index(&self, index: Register) -> &u64 {
        &self.x[index.0 as usize]
    }
}

impl IndexMut<Register> for Registers {
    fn index_mut(&mut self, index: Register) -> &mut u64 {
        &mut self.x[index.0 as usize]
    }
}
