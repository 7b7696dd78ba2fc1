//! Handle identity and lifetime tracking for native objects.
//!
//! Every native pointer that crosses into managed code is interned into a
//! `Wrapper`. The registry guarantees one live wrapper per address: handing
//! the same pointer back while a wrapper is alive yields that wrapper, so
//! identity comparisons in managed code hold. Wrappers tie a release action
//! (decref or destructor call) to their drop, giving deterministic cleanup
//! without a collector pass.
//!
//! Design:
//! - Interning is lock-free on the hot path (`DashMap` of weak entries)
//! - Release runs at most once, enforced by an atomic flag
//! - Ownership transfer back to native code disarms the release

mod types;

pub use types::{RawDtor, ReleaseOps, TypeInfo, TypeProbe, TypeRegistry};

use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::descriptor::HandleKind;
use crate::memory::NativeBuffer;

/// What happens to the native object when its wrapper drops.
#[derive(Clone, Copy)]
enum ReleaseAction {
    /// Borrowed: the native side keeps ownership.
    None,
    /// Drop one reference from an intrusive count.
    Decref(RawDtor),
    /// Destroy a singly-owned object. `None` means the library provides no
    /// destructor and the object is deliberately leaked.
    Destroy(Option<RawDtor>),
}

type WeakMap = DashMap<usize, Weak<WrapperInner>>;

struct WrapperInner {
    ptr: usize,
    type_name: String,
    release: Mutex<ReleaseAction>,
    released: AtomicBool,
    /// Present only for engine-allocated struct buffers.
    buffer: Option<NativeBuffer>,
    map: Weak<WeakMap>,
    types: Arc<TypeRegistry>,
}

impl WrapperInner {
    fn run_release(&self) {
        let action = *self.release.lock();
        match action {
            ReleaseAction::None => {}
            ReleaseAction::Decref(decref) => {
                debug!(event = "handle_decref", ty = %self.type_name, ptr = self.ptr);
                unsafe { decref(self.ptr as *mut c_void) };
            }
            ReleaseAction::Destroy(Some(dtor)) => {
                debug!(event = "handle_destroy", ty = %self.type_name, ptr = self.ptr);
                unsafe { dtor(self.ptr as *mut c_void) };
            }
            ReleaseAction::Destroy(None) => {
                warn!(
                    event = "handle_leak",
                    ty = %self.type_name,
                    ptr = self.ptr,
                    "owned handle has no destructor; leaking"
                );
            }
        }
    }
}

impl Drop for WrapperInner {
    fn drop(&mut self) {
        if let Some(map) = self.map.upgrade() {
            // Only remove the entry if it still points at us (a new wrapper
            // may have been interned for a recycled address).
            map.remove_if(&self.ptr, |_, weak| weak.upgrade().is_none());
        }
        if !self.released.swap(true, Ordering::AcqRel) {
            self.run_release();
        }
    }
}

/// A managed handle to one native object.
///
/// Clones share identity; the release action runs when the last clone drops.
#[derive(Clone)]
pub struct Wrapper(Arc<WrapperInner>);

impl Wrapper {
    /// Raw pointer for passing back across the boundary.
    ///
    /// # Errors
    ///
    /// `UseAfterRelease` once ownership has been transferred or the release
    /// has run.
    pub fn ptr(&self) -> Result<*mut c_void, RegistryError> {
        if self.0.released.load(Ordering::Acquire) {
            return Err(RegistryError::UseAfterRelease {
                type_name: self.0.type_name.clone(),
            });
        }
        Ok(self.0.ptr as *mut c_void)
    }

    /// Most-derived type name resolved at interning time.
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Whether this handle is (a subtype of) the named registered type.
    pub fn is_instance_of(&self, ancestor: &str) -> bool {
        self.0.types.is_subtype(&self.0.type_name, ancestor)
    }

    /// True when both wrappers refer to the same interned object.
    pub fn same_identity(&self, other: &Wrapper) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Engine-allocated buffer backing this handle, if any.
    pub fn buffer(&self) -> Option<&NativeBuffer> {
        self.0.buffer.as_ref()
    }

    /// Takes one extra native reference on a ref-counted handle and returns
    /// the pointer, so an owned reference can be handed to native code while
    /// this wrapper stays live.
    ///
    /// # Errors
    ///
    /// `UseAfterRelease` on a released handle; `MissingRefOps` when the type
    /// is not registered as ref-counted.
    pub fn acquire_ref(&self) -> Result<*mut c_void, RegistryError> {
        let ptr = self.ptr()?;
        match self.0.types.lookup(&self.0.type_name).map(|i| i.release) {
            Some(ReleaseOps::RefCounted { incref, .. }) => {
                debug!(event = "handle_incref", ty = %self.0.type_name, ptr = self.0.ptr);
                unsafe { incref(ptr) };
                Ok(ptr)
            }
            _ => Err(RegistryError::MissingRefOps {
                type_name: self.0.type_name.clone(),
            }),
        }
    }

    /// Hands ownership back to native code: the pointer stays valid for the
    /// callee, and no release runs when the wrapper drops.
    ///
    /// # Errors
    ///
    /// `DoubleRelease` if ownership was already transferred or released.
    pub fn transfer(&self) -> Result<*mut c_void, RegistryError> {
        if self.0.released.swap(true, Ordering::AcqRel) {
            error!(event = "double_release", ty = %self.0.type_name, ptr = self.0.ptr);
            // Unrecoverable lifetime bug; fail loudly where it is cheap to.
            debug_assert!(false, "handle of type {} released twice", self.0.type_name);
            return Err(RegistryError::DoubleRelease {
                type_name: self.0.type_name.clone(),
            });
        }
        Ok(self.0.ptr as *mut c_void)
    }

    pub fn is_released(&self) -> bool {
        self.0.released.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Wrapper")
            .field("ptr", &(self.0.ptr as *const c_void))
            .field("type_name", &self.0.type_name)
            .field("released", &self.0.released.load(Ordering::Relaxed))
            .field("buffered", &self.0.buffer.is_some())
            .finish()
    }
}

/// Interning registry: one live wrapper per native address.
pub struct HandleRegistry {
    types: Arc<TypeRegistry>,
    map: Arc<WeakMap>,
}

impl HandleRegistry {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            map: Arc::new(DashMap::new()),
        }
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    fn live(&self, ptr: usize) -> Option<Wrapper> {
        self.map
            .get(&ptr)
            .and_then(|entry| entry.value().upgrade())
            .map(Wrapper)
    }

    fn intern_new(
        &self,
        ptr: usize,
        declared: &str,
        release: ReleaseAction,
        buffer: Option<NativeBuffer>,
    ) -> Wrapper {
        let type_name = self
            .types
            .resolve_runtime_type(ptr as *mut c_void, declared);
        let inner = Arc::new(WrapperInner {
            ptr,
            type_name,
            release: Mutex::new(release),
            released: AtomicBool::new(false),
            buffer,
            map: Arc::downgrade(&self.map),
            types: Arc::clone(&self.types),
        });
        self.map.insert(ptr, Arc::downgrade(&inner));
        Wrapper(inner)
    }

    /// Interns a pointer the native side still owns.
    ///
    /// Returns the existing wrapper when one is live for this address, so
    /// identity is stable. The reference count is never touched.
    pub fn intern_borrowed(&self, ptr: *mut c_void, declared: &str) -> Result<Wrapper, RegistryError> {
        if ptr.is_null() {
            return Err(RegistryError::NullPointer);
        }
        let addr = ptr as usize;
        if let Some(existing) = self.live(addr) {
            return Ok(existing);
        }
        Ok(self.intern_new(addr, declared, ReleaseAction::None, None))
    }

    /// Interns a pointer whose ownership (one reference, or the whole
    /// object) was transferred to us by the native side.
    ///
    /// For a ref-counted type the declared type must be registered with
    /// incref/decref ops. Interning an owned pointer whose address already
    /// has a live wrapper folds the incoming reference into it: a borrowed
    /// wrapper is upgraded to owning, a ref-counted owner drops the surplus
    /// reference immediately, and a boxed duplicate is flagged.
    pub fn intern_owned(
        &self,
        ptr: *mut c_void,
        kind: HandleKind,
        declared: &str,
        fallback_destructor: Option<RawDtor>,
    ) -> Result<Wrapper, RegistryError> {
        if ptr.is_null() {
            return Err(RegistryError::NullPointer);
        }
        let addr = ptr as usize;
        let release = self.owned_release(declared, kind, fallback_destructor)?;

        if let Some(existing) = self.live(addr) {
            let mut current = existing.0.release.lock();
            match (*current, release) {
                (ReleaseAction::None, incoming) => {
                    // Previously borrowed; it now owns the incoming reference.
                    *current = incoming;
                }
                (ReleaseAction::Decref(decref), ReleaseAction::Decref(_)) => {
                    // Already owns one reference; fold the surplus now.
                    drop(current);
                    debug!(event = "surplus_decref", ty = %existing.0.type_name, ptr = addr);
                    unsafe { decref(ptr) };
                    return Ok(existing);
                }
                _ => {
                    warn!(
                        event = "duplicate_ownership",
                        ty = %existing.0.type_name,
                        ptr = addr,
                        "owned pointer interned twice; keeping first owner"
                    );
                }
            }
            drop(current);
            return Ok(existing);
        }

        Ok(self.intern_new(addr, declared, release, None))
    }

    fn owned_release(
        &self,
        declared: &str,
        kind: HandleKind,
        fallback_destructor: Option<RawDtor>,
    ) -> Result<ReleaseAction, RegistryError> {
        match kind {
            HandleKind::RefCounted => match self.types.lookup(declared).map(|i| i.release) {
                Some(ReleaseOps::RefCounted { decref, .. }) => Ok(ReleaseAction::Decref(decref)),
                _ => Err(RegistryError::MissingRefOps {
                    type_name: declared.to_owned(),
                }),
            },
            HandleKind::Boxed => {
                let dtor = match self.types.lookup(declared).map(|i| i.release) {
                    Some(ReleaseOps::Boxed { destructor }) => destructor.or(fallback_destructor),
                    _ => fallback_destructor,
                };
                Ok(ReleaseAction::Destroy(dtor))
            }
        }
    }

    /// Wraps an engine-allocated buffer as a handle. The buffer is freed by
    /// the wrapper's drop; no native release is involved.
    pub fn register_buffer(&self, buffer: NativeBuffer) -> Wrapper {
        let addr = buffer.as_ptr() as usize;
        let declared = buffer.type_tag().to_owned();
        self.intern_new(addr, &declared, ReleaseAction::None, Some(buffer))
    }

    /// Number of addresses with a live wrapper.
    pub fn live_handles(&self) -> usize {
        self.map
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }
}

impl core::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("entries", &self.map.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NullPointer,
    /// Ref-counted interning requires registered incref/decref ops.
    MissingRefOps { type_name: String },
    UseAfterRelease { type_name: String },
    DoubleRelease { type_name: String },
}

impl core::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NullPointer => write!(f, "cannot intern a null pointer"),
            Self::MissingRefOps { type_name } => write!(
                f,
                "type {} has no registered reference-count operations",
                type_name
            ),
            Self::UseAfterRelease { type_name } => {
                write!(f, "handle of type {} used after release", type_name)
            }
            Self::DoubleRelease { type_name } => {
                write!(f, "handle of type {} released twice", type_name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
