use crate::cursor::Corruption;
use crate::utils::AddressRange;
use gimli::{
    BaseAddresses, EhFrame, EhFrameHdr, EndianSlice, NativeEndian, ParsedEhFrameHdr, Pointer, Reader, UnwindContext,
    UnwindSection, UnwindTable, UnwindTableRow,
};
use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::ffi::CStr;
use std::slice;

pub type SectionReader = EndianSlice<'static, NativeEndian>;

const MAX_OBJECTS_LEN: usize = 128;
const PF_X: u32 = 1;

lazy_static! {
    static ref SECTIONS: SmallVec<[SectionInfo<SectionReader>; MAX_OBJECTS_LEN]> = find_sections();
}

/// Returns the unwind sections of all modules loaded by the current process.
///
/// The list is collected once, on first use.
#[inline]
pub fn sections() -> &'static [SectionInfo<SectionReader>] {
    &SECTIONS
}

/// The executable code of one loaded module and its parsed unwind sections.
pub struct SectionInfo<R: Reader> {
    text: AddressRange,
    eh_frame_hdr: ParsedEhFrameHdr<R>,
    eh_frame: EhFrame<R>,
    base_address: BaseAddresses,
}

impl<R: Reader> SectionInfo<R> {
    /// Determine whether the target address is in this module's code.
    #[inline]
    pub fn contains(&self, target: u64) -> bool {
        self.text.contains(target)
    }

    /// Finds the CFI row describing how to unwind from `target`.
    pub fn find_unwind_table_row(
        &self,
        ctx: &mut UnwindContext<R>,
        target: u64,
    ) -> Result<UnwindTableRow<R>, Corruption> {
        let Self {
            eh_frame,
            eh_frame_hdr,
            base_address,
            ..
        } = self;
        let tab = eh_frame_hdr.table().ok_or(Corruption::NoUnwindInfo(target))?;
        let fde = tab
            .fde_for_address(eh_frame, base_address, target, EhFrame::cie_from_offset)
            .map_err(|_| Corruption::NoUnwindInfo(target))?;
        let mut unwind_tab =
            UnwindTable::new(eh_frame, base_address, ctx, &fde).map_err(|_| Corruption::InvalidUnwindInfo(target))?;
        while let Some(row) = unwind_tab
            .next_row()
            .map_err(|_| Corruption::InvalidUnwindInfo(target))?
        {
            if row.contains(target) {
                return Ok(row.clone());
            }
        }
        Err(Corruption::NoUnwindInfo(target))
    }
}

fn find_sections() -> SmallVec<[SectionInfo<SectionReader>; MAX_OBJECTS_LEN]> {
    let mut data: SmallVec<[RawSectionInfo; MAX_OBJECTS_LEN]> = SmallVec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut data as *mut _ as *mut libc::c_void);
    }
    let mut sections = SmallVec::new();
    for s in &data {
        match unsafe { parse_section(s) } {
            Some(section) => sections.push(section),
            None => log::debug!("skipping module at {:#x}: unreadable .eh_frame_hdr", s.text),
        }
    }
    log::debug!("found unwind info for {} modules", sections.len());
    sections
}

unsafe fn parse_section(s: &RawSectionInfo) -> Option<SectionInfo<SectionReader>> {
    let section_data = slice::from_raw_parts(s.eh_frame_hdr as *const u8, s.eh_frame_hdr_len as _);
    let base_address = BaseAddresses::default()
        .set_eh_frame_hdr(s.eh_frame_hdr)
        .set_text(s.text);
    let eh_frame_hdr = EhFrameHdr::new(section_data, NativeEndian)
        .parse(&base_address, 8)
        .ok()?;
    let eh_frame_ptr = match eh_frame_hdr.eh_frame_ptr() {
        Pointer::Direct(v) => v,
        Pointer::Indirect(p) => *(p as *const u64),
    };
    if eh_frame_ptr >= s.max_addr {
        return None;
    }
    let base_address = base_address.set_eh_frame(eh_frame_ptr);
    // The exact size of .eh_frame is unknown, but it ends within the loaded image.
    let eh_frame_size = s.max_addr - eh_frame_ptr;
    let eh_frame_data = slice::from_raw_parts(eh_frame_ptr as *const u8, eh_frame_size as _);
    Some(SectionInfo {
        text: AddressRange {
            start: s.text,
            end: s.text + s.text_len,
        },
        eh_frame_hdr,
        eh_frame: EhFrame::new(eh_frame_data, NativeEndian),
        base_address,
    })
}

/// Where one module's code and unwind sections were loaded.
#[derive(Default, Debug)]
struct RawSectionInfo {
    text: u64,
    text_len: u64,
    eh_frame_hdr: u64,
    eh_frame_hdr_len: u64,
    max_addr: u64,
}

impl RawSectionInfo {
    /// Collects the executable segment, the `PT_GNU_EH_FRAME` segment and the
    /// end of the loaded image from a module's program headers.
    ///
    /// Returns `None` for modules without code or without unwind info.
    fn from_program_headers(bias: u64, headers: &[libc::Elf64_Phdr]) -> Option<Self> {
        let mut info = Self::default();
        let mut has_text = false;
        let mut has_unwind = false;
        for header in headers {
            let start = bias + header.p_vaddr;
            match header.p_type {
                libc::PT_LOAD => {
                    if header.p_flags & PF_X != 0 {
                        info.text = start;
                        info.text_len = header.p_memsz;
                        has_text = true;
                    }
                    info.max_addr = info.max_addr.max(start + header.p_filesz);
                }
                libc::PT_GNU_EH_FRAME => {
                    info.eh_frame_hdr = start;
                    info.eh_frame_hdr_len = header.p_memsz;
                    has_unwind = true;
                }
                _ => {}
            }
        }
        if has_text && has_unwind {
            Some(info)
        } else {
            None
        }
    }
}

/// Whether the module called `name` should be registered.
///
/// The main executable has an empty name. There is no usable .eh_frame data
/// for linux-vdso.so on some platforms.
fn wanted(name: &str) -> bool {
    if cfg!(not(feature = "trace-shared-libs")) && !name.is_empty() {
        return false;
    }
    !name.contains("linux-vdso.so")
}

extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
    let found = unsafe { &mut *(data as *mut SmallVec<[RawSectionInfo; MAX_OBJECTS_LEN]>) };
    let info = unsafe { &*info };
    if found.len() >= MAX_OBJECTS_LEN || info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
        return 0;
    }
    let name = if info.dlpi_name.is_null() {
        Ok("")
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }.to_str()
    };
    if !matches!(name, Ok(name) if wanted(name)) {
        return 0;
    }
    let headers = unsafe { slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
    if let Some(section) = RawSectionInfo::from_program_headers(info.dlpi_addr, headers) {
        found.push(section);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registers;

    #[test]
    fn test_sections() {
        assert!(!sections().is_empty());
        assert!(sections().len() <= MAX_OBJECTS_LEN);
    }

    #[test]
    fn test_find_unwind_table_row() {
        let registers = Registers::capture();
        let pc = registers.pc() - 1;
        let section = sections().iter().find(|s| s.contains(pc)).unwrap();
        let mut ctx = UnwindContext::new();
        let row = section.find_unwind_table_row(&mut ctx, pc).unwrap();
        assert!(row.contains(pc));
    }

    fn header(p_type: u32, p_flags: u32, p_vaddr: u64, p_filesz: u64, p_memsz: u64) -> libc::Elf64_Phdr {
        libc::Elf64_Phdr {
            p_type,
            p_flags,
            p_offset: 0,
            p_vaddr,
            p_paddr: p_vaddr,
            p_filesz,
            p_memsz,
            p_align: 0x1000,
        }
    }

    #[test]
    fn test_program_headers() {
        let headers = [
            header(libc::PT_LOAD, 4, 0, 0x800, 0x800),
            header(libc::PT_LOAD, 5, 0x1000, 0x2000, 0x2000),
            header(libc::PT_GNU_EH_FRAME, 4, 0x3100, 0x40, 0x40),
            header(libc::PT_LOAD, 6, 0x4000, 0x100, 0x300),
        ];
        let info = RawSectionInfo::from_program_headers(0x5500_0000, &headers).unwrap();
        assert_eq!(info.text, 0x5500_1000);
        assert_eq!(info.text_len, 0x2000);
        assert_eq!(info.eh_frame_hdr, 0x5500_3100);
        assert_eq!(info.eh_frame_hdr_len, 0x40);
        assert_eq!(info.max_addr, 0x5500_4100);

        // No unwind info, nothing to register.
        assert!(RawSectionInfo::from_program_headers(0, &headers[..2]).is_none());
        // No code either.
        assert!(RawSectionInfo::from_program_headers(0, &headers[2..3]).is_none());
    }

    #[test]
    fn test_wanted_modules() {
        assert!(wanted(""));
        assert!(!wanted("linux-vdso.so.1"));
        assert_eq!(wanted("/lib/x86_64-linux-gnu/libc.so.6"), cfg!(feature = "trace-shared-libs"));
    }

    #[test]
    fn test_no_row_outside_text() {
        let section = &sections()[0];
        let mut ctx = UnwindContext::new();
        let res = section.find_unwind_table_row(&mut ctx, 0);
        assert!(res.is_err());
    }
}
