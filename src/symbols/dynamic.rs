use super::{Resolution, SymbolResolver, DEFAULT_NAME_CAPACITY};
use std::ffi::CStr;
use std::mem::MaybeUninit;

/// Resolves addresses through `dladdr`, i.e. the dynamic symbol tables of the
/// loaded modules.
///
/// Only exported symbols are visible to the dynamic linker. An address in a
/// function missing from `.dynsym` resolves to the closest exported symbol
/// below it, or to nothing, so this is best suited to shared libraries and
/// executables linked with `-rdynamic`.
///
/// The returned names point into the modules' string tables and stay valid
/// as long as the module is not unloaded.
#[derive(Debug, Copy, Clone)]
pub struct DynamicSymbols {
    name_capacity: usize,
}

impl DynamicSymbols {
    /// Creates a resolver truncating names to [DEFAULT_NAME_CAPACITY].
    pub fn new() -> Self {
        Self::with_name_capacity(DEFAULT_NAME_CAPACITY)
    }

    /// Creates a resolver truncating names to `name_capacity` bytes.
    pub fn with_name_capacity(name_capacity: usize) -> Self {
        Self { name_capacity }
    }
}

impl Default for DynamicSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for DynamicSymbols {
    fn resolve(&self, address: u64) -> Resolution<'_> {
        if address == 0 {
            return Resolution::NotFound;
        }
        let info = unsafe {
            let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
            if libc::dladdr(address as *const libc::c_void, info.as_mut_ptr()) == 0 {
                return Resolution::NotFound;
            }
            info.assume_init()
        };
        if info.dli_sname.is_null() || info.dli_saddr.is_null() {
            return Resolution::NotFound;
        }
        let start = info.dli_saddr as u64;
        if start > address {
            return Resolution::NotFound;
        }
        let name = match unsafe { CStr::from_ptr(info.dli_sname) }.to_str() {
            Ok(name) => name,
            Err(_) => return Resolution::NotFound,
        };
        Resolution::with_capacity(name, address - start, self.name_capacity)
    }
}
