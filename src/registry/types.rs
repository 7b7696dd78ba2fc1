//! Runtime type metadata for native handles.
//!
//! Types are registered by name before any handle of that type is interned.
//! Each carries its parent in the native type hierarchy (for downcast-style
//! checks) and the release discipline its instances follow. An optional
//! runtime probe refines a declared static type to the most-derived type the
//! native side actually constructed.

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use std::os::raw::c_void;

/// Unary native function applied to a raw object pointer. Covers increfs,
/// decrefs and destructors alike; the C ABI signature is identical.
pub type RawDtor = unsafe extern "C" fn(*mut c_void);

/// Inspects a live native object and names its most-derived registered type,
/// or `None` when the object is not recognized.
pub type TypeProbe = dyn Fn(*mut c_void) -> Option<String> + Send + Sync;

/// How instances of a registered type are released.
#[derive(Clone, Copy)]
pub enum ReleaseOps {
    /// Shared objects with intrusive reference counts.
    RefCounted { incref: RawDtor, decref: RawDtor },
    /// Singly-owned objects freed by one destructor call, or leaked
    /// deliberately when the library provides no destructor.
    Boxed { destructor: Option<RawDtor> },
}

impl core::fmt::Debug for ReleaseOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RefCounted { .. } => f.write_str("RefCounted"),
            Self::Boxed { destructor } => f
                .debug_struct("Boxed")
                .field("has_destructor", &destructor.is_some())
                .finish(),
        }
    }
}

/// One registered native type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    /// Immediate supertype in the native hierarchy, if any.
    pub parent: Option<String>,
    pub release: ReleaseOps,
}

/// Registry of native type metadata, keyed by type name.
pub struct TypeRegistry {
    infos: DashMap<String, TypeInfo>,
    probe: RwLock<Option<Box<TypeProbe>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            infos: DashMap::new(),
            probe: RwLock::new(None),
        }
    }

    /// Registers a type, replacing any previous registration of the same name.
    pub fn register(&self, info: TypeInfo) {
        trace!(event = "type_register", name = %info.name, parent = ?info.parent);
        self.infos.insert(info.name.clone(), info);
    }

    pub fn lookup(&self, name: &str) -> Option<TypeInfo> {
        self.infos.get(name).map(|e| e.value().clone())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.infos.contains_key(name)
    }

    /// Walks the parent chain from `name` looking for `ancestor`.
    ///
    /// A type is its own subtype. Unregistered names have no ancestors.
    pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
        let mut current = name.to_owned();
        loop {
            if current == ancestor {
                return true;
            }
            match self.infos.get(&current).and_then(|e| e.parent.clone()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Installs the runtime type probe, replacing any previous one.
    pub fn set_probe(&self, probe: Box<TypeProbe>) {
        *self.probe.write() = Some(probe);
    }

    /// Most-derived registered type for a live object.
    ///
    /// The probe's answer wins over the statically declared type when it
    /// names a registered type; otherwise the declared name stands.
    pub fn resolve_runtime_type(&self, ptr: *mut c_void, declared: &str) -> String {
        let guard = self.probe.read();
        if let Some(probe) = guard.as_ref() {
            if let Some(found) = probe(ptr) {
                if self.infos.contains_key(&found) {
                    return found;
                }
            }
        }
        declared.to_owned()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("registered", &self.infos.len())
            .field("has_probe", &self.probe.read().is_some())
            .finish()
    }
}
