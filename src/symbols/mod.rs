//! Mapping addresses to function names.
//!
//! A [SymbolTable] is built once from `(name, start, size)` entries by
//! whatever loader the caller has (debug info, a symbol file, a JIT's own
//! records) and is then only read, so it can be shared between threads and
//! sessions. [DynamicSymbols] asks the dynamic linker instead.

#[cfg(unix)]
mod dynamic;
#[cfg(unix)]
pub use dynamic::DynamicSymbols;

/// Default number of bytes a resolved name may occupy before it is truncated.
pub const DEFAULT_NAME_CAPACITY: usize = 100;

/// The outcome of resolving an address.
///
/// A missing symbol is a normal outcome (stripped code, generated code), and
/// so is a name longer than the resolver's capacity. Neither is an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// The address lies in a known symbol.
    Found { name: &'a str, offset: u64 },
    /// The address lies in a known symbol whose name did not fit into the
    /// name capacity; `name` holds its prefix.
    Truncated { name: &'a str, offset: u64 },
    /// No symbol covers the address.
    NotFound,
}

impl<'a> Resolution<'a> {
    /// Builds a resolution for `name`, truncating it to `capacity` bytes
    /// (on a UTF-8 character boundary) if needed.
    pub fn with_capacity(name: &'a str, offset: u64, capacity: usize) -> Self {
        if name.len() <= capacity {
            return Resolution::Found { name, offset };
        }
        let mut end = capacity;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Resolution::Truncated {
            name: &name[..end],
            offset,
        }
    }

    #[inline]
    pub fn name(&self) -> Option<&'a str> {
        match *self {
            Resolution::Found { name, .. } | Resolution::Truncated { name, .. } => Some(name),
            Resolution::NotFound => None,
        }
    }

    #[inline]
    pub fn offset(&self) -> Option<u64> {
        match *self {
            Resolution::Found { offset, .. } | Resolution::Truncated { offset, .. } => Some(offset),
            Resolution::NotFound => None,
        }
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        matches!(self, Resolution::Truncated { .. })
    }
}

/// Something that can name the function an address belongs to.
pub trait SymbolResolver {
    fn resolve(&self, address: u64) -> Resolution<'_>;
}

impl<S: SymbolResolver + ?Sized> SymbolResolver for &S {
    #[inline]
    fn resolve(&self, address: u64) -> Resolution<'_> {
        (**self).resolve(address)
    }
}

/// A function symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name: String,
    pub start: u64,
    /// Length in bytes, if known. A symbol without a size extends up to the
    /// next symbol.
    pub size: Option<u64>,
}

impl SymbolEntry {
    pub fn new(name: impl Into<String>, start: u64, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            start,
            size,
        }
    }

    #[inline]
    fn covers(&self, address: u64) -> bool {
        match self.size {
            Some(size) => address >= self.start && address - self.start < size,
            None => address >= self.start,
        }
    }
}

/// An immutable, address-ordered set of symbols.
///
/// Lookups pick the symbol with the greatest start address not above the
/// address. A sized symbol only covers `[start, start + size)`: an address in
/// a gap between symbols resolves to [Resolution::NotFound] rather than to the
/// preceding symbol.
///
/// ```
/// use unwind::{Resolution, SymbolEntry, SymbolResolver, SymbolTable};
///
/// let table = SymbolTable::new(vec![
///     SymbolEntry::new("main", 0x4000, Some(0x50)),
///     SymbolEntry::new("a", 0x3000, Some(0x30)),
/// ]);
/// assert_eq!(table.resolve(0x3004), Resolution::Found { name: "a", offset: 4 });
/// assert_eq!(table.resolve(0x3030), Resolution::NotFound);
/// ```
#[derive(Debug, Clone)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
    name_capacity: usize,
}

impl SymbolTable {
    /// Builds a table truncating names to [DEFAULT_NAME_CAPACITY].
    pub fn new(entries: Vec<SymbolEntry>) -> Self {
        Self::with_name_capacity(entries, DEFAULT_NAME_CAPACITY)
    }

    /// Builds a table truncating names to `name_capacity` bytes.
    ///
    /// When several entries share a start address, the first one is kept.
    pub fn with_name_capacity(mut entries: Vec<SymbolEntry>, name_capacity: usize) -> Self {
        // Stable, so the first of equal starts stays in front.
        entries.sort_by_key(|e| e.start);
        let before = entries.len();
        entries.dedup_by(|later, first| later.start == first.start);
        if entries.len() != before {
            log::debug!("dropped {} symbols with duplicate start addresses", before - entries.len());
        }
        Self { entries, name_capacity }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn name_capacity(&self) -> usize {
        self.name_capacity
    }

    /// Finds the entry covering `address`.
    pub fn lookup(&self, address: u64) -> Option<&SymbolEntry> {
        let index = match self.entries.binary_search_by(|e| e.start.cmp(&address)) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let entry = &self.entries[index];
        if entry.covers(address) {
            Some(entry)
        } else {
            None
        }
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, address: u64) -> Resolution<'_> {
        match self.lookup(address) {
            Some(entry) => Resolution::with_capacity(&entry.name, address - entry.start, self.name_capacity),
            None => Resolution::NotFound,
        }
    }
}

impl FromIterator<SymbolEntry> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = SymbolEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
