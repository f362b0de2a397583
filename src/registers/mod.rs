#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::*;

extern "C" {
    /// Get the register context of the current thread stack and save it in `Registers`.
    ///
    /// The implementation of this function is linked to the assembly code of different
    /// platforms, such as: `src/registers/x86_64.S`, `src/registers/aarch64.S`.
    ///
    /// The saved PC is the return address of this call and the saved SP is the
    /// caller's stack pointer after the call returns, so the snapshot describes
    /// the call site.
    pub fn unwind_init_registers(registers: *mut Registers);
}

impl Registers {
    /// Captures the register state of the calling function at the call site.
    ///
    /// ```
    /// let registers = unwind::Registers::capture();
    /// assert_ne!(registers.pc(), 0);
    /// ```
    #[inline(always)]
    pub fn capture() -> Self {
        let mut registers = Self::default();
        unsafe { unwind_init_registers(&mut registers as _) };
        registers
    }
}
