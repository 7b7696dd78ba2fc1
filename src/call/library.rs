//! Shared-library loading and symbol resolution.
//!
//! Libraries stay loaded for the lifetime of the process; a resolved symbol
//! address is therefore valid forever and cached on first lookup. A library
//! name may be a comma-separated list of candidates (soname variants across
//! distributions); the first that loads wins.
//!
//! An in-process symbol table lets embedders expose their own `extern "C"`
//! functions under a library name without a shared object on disk; it
//! shadows the dynamic loader for that name.

use dashmap::DashMap;
use libloading::Library;
use tracing::{debug, trace};

#[cfg(unix)]
fn open_one(name: &str) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    // RTLD_GLOBAL so dependent libraries resolve against each other.
    unsafe { UnixLibrary::open(Some(name), RTLD_NOW | RTLD_GLOBAL) }.map(Into::into)
}

#[cfg(not(unix))]
fn open_one(name: &str) -> Result<Library, libloading::Error> {
    unsafe { Library::new(name) }
}

pub struct LibraryMap {
    loaded: DashMap<String, Library>,
    /// (library, symbol) -> resolved address.
    resolved: DashMap<(String, String), usize>,
    /// In-process tables, keyed by library name.
    registered: DashMap<String, DashMap<String, usize>>,
}

impl LibraryMap {
    pub fn new() -> Self {
        Self {
            loaded: DashMap::new(),
            resolved: DashMap::new(),
            registered: DashMap::new(),
        }
    }

    /// Exposes in-process functions under a library name.
    pub fn register_symbols(&self, library: &str, symbols: &[(&str, *const ())]) {
        let table = self.registered.entry(library.to_owned()).or_default();
        for (name, ptr) in symbols {
            trace!(event = "symbol_register", library, symbol = *name);
            table.insert((*name).to_owned(), *ptr as usize);
        }
    }

    /// Resolves a symbol to its address, loading the library on first use.
    pub fn resolve(&self, library: &str, symbol: &str) -> Result<usize, LibraryError> {
        if let Some(table) = self.registered.get(library) {
            return table
                .get(symbol)
                .map(|addr| *addr)
                .ok_or_else(|| LibraryError::SymbolNotFound {
                    library: library.to_owned(),
                    symbol: symbol.to_owned(),
                });
        }

        let key = (library.to_owned(), symbol.to_owned());
        if let Some(addr) = self.resolved.get(&key) {
            return Ok(*addr);
        }

        self.ensure_loaded(library)?;
        let lib = self
            .loaded
            .get(library)
            .ok_or_else(|| LibraryError::LoadFailed {
                name: library.to_owned(),
                message: "library disappeared during resolution".to_owned(),
            })?;

        let name = format!("{}\0", symbol);
        let addr = unsafe {
            lib.get::<unsafe extern "C" fn()>(name.as_bytes())
                .map(|sym| *sym as usize)
                .map_err(|_| LibraryError::SymbolNotFound {
                    library: library.to_owned(),
                    symbol: symbol.to_owned(),
                })?
        };

        trace!(event = "symbol_resolve", library, symbol, addr);
        self.resolved.insert(key, addr);
        Ok(addr)
    }

    fn ensure_loaded(&self, library: &str) -> Result<(), LibraryError> {
        if self.loaded.contains_key(library) {
            return Ok(());
        }

        let candidates: Vec<&str> = library
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if candidates.is_empty() {
            return Err(LibraryError::InvalidName {
                name: library.to_owned(),
            });
        }

        let mut last_error = None;
        for candidate in &candidates {
            match open_one(candidate) {
                Ok(lib) => {
                    debug!(event = "library_load", name = library, resolved_as = *candidate);
                    self.loaded.entry(library.to_owned()).or_insert(lib);
                    return Ok(());
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(LibraryError::LoadFailed {
            name: library.to_owned(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidate names".to_owned()),
        })
    }
}

impl Default for LibraryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for LibraryMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LibraryMap")
            .field("loaded", &self.loaded.len())
            .field("resolved", &self.resolved.len())
            .field("registered", &self.registered.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    InvalidName { name: String },
    LoadFailed { name: String, message: String },
    /// Fatal: indicates a binding defect, never retried.
    SymbolNotFound { library: String, symbol: String },
}

impl core::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidName { name } => write!(f, "invalid library name {:?}", name),
            Self::LoadFailed { name, message } => {
                write!(f, "failed to load library {:?}: {}", name, message)
            }
            Self::SymbolNotFound { library, symbol } => {
                write!(f, "symbol {} not found in library {:?}", symbol, library)
            }
        }
    }
}

impl std::error::Error for LibraryError {}
