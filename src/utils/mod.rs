use std::ptr;

thread_local! {
    static STACK: Option<AddressRange> = stack_bounds();
}

/// [start, end)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Determine whether the target address is in the current range.
    #[inline]
    pub fn contains(&self, target: u64) -> bool {
        self.start <= target && target < self.end
    }

    /// Determine whether `len` bytes starting at `target` are all in the range.
    #[inline]
    pub fn contains_span(&self, target: u64, len: u64) -> bool {
        match target.checked_add(len) {
            Some(end) => self.start <= target && end <= self.end,
            None => false,
        }
    }
}

/// Read access to the stack being unwound.
///
/// The cursor never dereferences addresses directly; every load of a saved
/// register or frame record goes through this trait, so an implementation can
/// refuse anything outside the memory it knows to be valid.
pub trait Memory {
    /// Load the 8-byte word at `address`, or `None` if it must not be read.
    fn read_u64(&self, address: u64) -> Option<u64>;
}

impl<M: Memory + ?Sized> Memory for &M {
    #[inline]
    fn read_u64(&self, address: u64) -> Option<u64> {
        (**self).read_u64(address)
    }
}

/// The live stack of the current thread, from a given stack pointer up to the
/// top of the stack.
///
/// Everything an unwind needs lives above the stack pointer it started from,
/// so the range also excludes the guard page and unmapped space below.
#[derive(Debug, Copy, Clone)]
pub struct StackMemory {
    range: AddressRange,
}

impl StackMemory {
    /// Creates a view of the current thread's stack above `sp`.
    ///
    /// Returns `None` if the stack bounds of the thread are unknown, or if
    /// `sp` is not on that stack (e.g. we are running on an alternate signal
    /// stack).
    pub fn from_sp(sp: u64) -> Option<Self> {
        let stack = STACK.with(|s| *s)?;
        if !stack.contains(sp) {
            return None;
        }
        Some(Self {
            range: AddressRange {
                start: sp,
                end: stack.end,
            },
        })
    }

    #[inline]
    pub fn range(&self) -> AddressRange {
        self.range
    }
}

impl Memory for StackMemory {
    #[inline]
    fn read_u64(&self, address: u64) -> Option<u64> {
        if !self.range.contains_span(address, 8) {
            return None;
        }
        Some(unsafe { load::<u64>(address) })
    }
}

/// Load the value at the `address`.
///
/// # Safety
///
/// `address` must point to `size_of::<T>()` readable bytes.
#[inline]
pub unsafe fn load<T: Copy>(address: u64) -> T {
    ptr::read_unaligned(address as *const T)
}

#[cfg(target_os = "linux")]
fn stack_bounds() -> Option<AddressRange> {
    use std::mem::MaybeUninit;

    unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let mut attr = attr.assume_init();
        let mut addr = ptr::null_mut();
        let mut size = 0;
        let res = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if res != 0 || addr.is_null() {
            return None;
        }
        let start = addr as u64;
        Some(AddressRange {
            start,
            end: start + size as u64,
        })
    }
}

#[cfg(target_os = "macos")]
fn stack_bounds() -> Option<AddressRange> {
    unsafe {
        let thread = libc::pthread_self();
        // On macOS the stack address is the top (highest address) of the stack.
        let end = libc::pthread_get_stackaddr_np(thread) as u64;
        let size = libc::pthread_get_stacksize_np(thread) as u64;
        if end == 0 || size == 0 || size > end {
            return None;
        }
        Some(AddressRange { start: end - size, end })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn stack_bounds() -> Option<AddressRange> {
    None
}
