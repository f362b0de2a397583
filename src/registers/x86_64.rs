use gimli::{Register, X86_64};
use std::ops::{Index, IndexMut};

/// The DWARF column holding the return address.
pub const RA: Register = X86_64::RA;

/// Where the kernel saves each register we track in `mcontext_t::gregs`.
#[cfg(target_os = "linux")]
const UCONTEXT_GREGS: [(Register, libc::c_int); 17] = [
    (X86_64::RAX, libc::REG_RAX),
    (X86_64::RDX, libc::REG_RDX),
    (X86_64::RCX, libc::REG_RCX),
    (X86_64::RBX, libc::REG_RBX),
    (X86_64::RSI, libc::REG_RSI),
    (X86_64::RDI, libc::REG_RDI),
    (X86_64::RBP, libc::REG_RBP),
    (X86_64::RSP, libc::REG_RSP),
    (X86_64::R8, libc::REG_R8),
    (X86_64::R9, libc::REG_R9),
    (X86_64::R10, libc::REG_R10),
    (X86_64::R11, libc::REG_R11),
    (X86_64::R12, libc::REG_R12),
    (X86_64::R13, libc::REG_R13),
    (X86_64::R14, libc::REG_R14),
    (X86_64::R15, libc::REG_R15),
    (RA, libc::REG_RIP),
];

/// `Registers` holds the register context for a specific platform (OS+ISA).
///
/// It is an opaque snapshot: the cursor reads and writes it through DWARF
/// register numbers, callers only observe PC, SP and FP.
///
/// We can use [Registers::capture] to initialize `Registers` based on
/// the current execution context:
/// ```
/// let registers = unwind::Registers::capture();
/// assert_ne!(registers.pc(), 0);
/// ```
///
/// Inside a signal handler the kernel provides an `ucontext` instead:
/// ```ignore
/// extern "C" fn signal_handler(_: libc::c_int, _: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
///     let registers = Registers::from_ucontext(ucontext).unwrap();
///     assert_ne!(registers.pc(), 0);
/// }
/// ```
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Registers {
    // 128 is enough for all general purpose registers on x86_64.
    //
    // Only rax ~ r15 and rip are ever filled, but CFI rules index registers
    // numerically, so reserve room for every column a rule may name.
    v: [u64; 128], // rax, rdx, rcx, rbx, rsi, rdi, rbp, rsp, r8~r15, rip, ...
}

impl Default for Registers {
    fn default() -> Self {
        Self { v: [0; 128] }
    }
}

impl Registers {
    /// Initialize `Registers` with value from `ucontext`.
    ///
    /// The pc is the interrupted instruction rather than a return address.
    #[cfg(target_os = "linux")]
    pub fn from_ucontext(ucontext: *mut libc::c_void) -> Option<Self> {
        let ucontext = ucontext as *const libc::ucontext_t;
        if ucontext.is_null() {
            return None;
        }
        let gregs = unsafe { &(*ucontext).uc_mcontext.gregs };
        let mut registers = Self::default();
        for &(register, greg) in UCONTEXT_GREGS.iter() {
            registers[register] = gregs[greg as usize] as u64;
        }
        Some(registers)
    }

    /// Whether a DWARF register number fits into this register file.
    #[inline]
    pub fn valid_register(register: Register) -> bool {
        (register.0 as usize) < 128
    }

    /// Get the value of the PC (Program Counter) register.
    /// This value is usually "Return Address" in implementation.
    #[inline]
    pub fn pc(&self) -> u64 {
        self[X86_64::RA]
    }

    /// Set the value of the PC (Program Counter) register.
    #[inline]
    pub fn set_pc(&mut self, v: u64) {
        self[X86_64::RA] = v;
    }

    /// Get the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn sp(&self) -> u64 {
        self[X86_64::RSP]
    }

    /// Set the value of the SP (Stack Pointer) register.
    #[inline]
    pub fn set_sp(&mut self, v: u64) {
        self[X86_64::RSP] = v;
    }

    /// Get the value of the FP (Frame Pointer) register.
    #[inline]
    pub fn fp(&self) -> u64 {
        self[X86_64::RBP]
    }

    /// Set the value of the FP (Frame Pointer) register.
    #[inline]
    pub fn set_fp(&mut self, v: u64) {
        self[X86_64::RBP] = v;
    }

    /// The return address to use when no CFI rule mentions the RA column.
    ///
    /// On x86_64 every CIE describes where the return address lives, so a row
    /// without an RA rule belongs to an outermost frame (`_start`, `clone`).
    #[inline]
    pub fn link_register(&self) -> Option<u64> {
        None
    }
}

impl Index<Register> for Registers {
    type Output = u64;

    fn index(&self, index: Register) -> &u64 {
        &self.v[index.0 as usize]
    }
}

impl IndexMut<Register> for Registers {
    fn index_mut(&mut self, index: Register) -> &mut u64 {
        &mut self.v[index.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let mut registers = Registers::default();
        registers.set_pc(0x1000);
        registers.set_sp(0x2000);
        registers.set_fp(0x3000);
        assert_eq!(registers[RA], 0x1000);
        assert_eq!(registers[X86_64::RSP], 0x2000);
        assert_eq!(registers[X86_64::RBP], 0x3000);
        assert!(registers.link_register().is_none());
        assert!(Registers::valid_register(X86_64::R15));
        assert!(!Registers::valid_register(Register(128)));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_from_ucontext() {
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        let gregs = &mut ucontext.uc_mcontext.gregs;
        gregs[libc::REG_RIP as usize] = 0x1000;
        gregs[libc::REG_RSP as usize] = 0x2000;
        gregs[libc::REG_RBP as usize] = 0x3000;
        gregs[libc::REG_R15 as usize] = 0x4000;
        let registers = Registers::from_ucontext(&mut ucontext as *mut _ as *mut libc::c_void).unwrap();
        assert_eq!(registers.pc(), 0x1000);
        assert_eq!(registers.sp(), 0x2000);
        assert_eq!(registers.fp(), 0x3000);
        assert_eq!(registers[X86_64::R15], 0x4000);
        assert!(Registers::from_ucontext(std::ptr::null_mut()).is_none());
    }
}
