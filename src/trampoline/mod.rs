//! Native-callable trampolines dispatching into managed code.
//!
//! A trampoline is a libffi closure: a freshly minted C function pointer
//! whose body decodes the native arguments, runs a registered managed
//! function, and encodes its result back. Each trampoline follows the
//! protocol of its kind:
//!
//! - `Closure`: void signal handler, fires any number of times; a handler
//!   failure is parked but leaves it connected
//! - `OneShotSource`: returns a continue flag; a `false` (or any failure)
//!   disarms it, and later native calls return `false` without dispatching
//! - `DestroyNotify`: fires the managed function at most once
//! - `Custom`: like `Closure` but with a declared scalar return
//!
//! Errors and panics never unwind into native frames: they are parked in a
//! thread-local slot and surfaced by the dispatcher after the native call
//! that triggered them returns.

use std::cell::RefCell;
use std::ffi::CStr;
use std::os::raw::c_void;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use libffi::low;
use libffi::middle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::call::LibraryMap;
use crate::descriptor::{FloatWidth, IntWidth, Ownership, TrampolineKind, TypeDesc};
use crate::registry::{HandleRegistry, RawDtor};
use crate::value::Value;

/// Stable identifier for a registered trampoline. Never reused within a
/// process, even after disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrampolineId(pub u64);

impl core::fmt::Display for TrampolineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "trampoline#{}", self.0)
    }
}

/// A managed-side function callable from a trampoline.
#[derive(Clone)]
pub struct ManagedFn(Arc<dyn Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync>);

impl ManagedFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallbackError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, CallbackError> {
        (self.0)(args)
    }
}

impl core::fmt::Debug for ManagedFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ManagedFn(..)")
    }
}

/// Failures raised by or around a managed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The managed function reported a failure.
    Failed(String),
    /// The managed function panicked; the payload message, when printable.
    Panicked(String),
    /// A native argument could not be decoded for the managed function.
    BadArgument { index: usize, message: String },
    /// Trampoline infrastructure failure (registration or closure setup).
    Trampoline(String),
}

impl core::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "callback failed: {}", msg),
            Self::Panicked(msg) => write!(f, "callback panicked: {}", msg),
            Self::BadArgument { index, message } => {
                write!(f, "callback argument {} invalid: {}", index, message)
            }
            Self::Trampoline(msg) => write!(f, "trampoline setup failed: {}", msg),
        }
    }
}

impl std::error::Error for CallbackError {}

thread_local! {
    /// First error raised by a trampoline on this thread since the last
    /// harvest. Trampolines cannot unwind into native frames, so the
    /// dispatcher drains this slot after every outbound call.
    static PENDING: RefCell<Option<CallbackError>> = const { RefCell::new(None) };
}

/// Drains the pending callback error parked on this thread, if any.
pub(crate) fn take_pending_error() -> Option<CallbackError> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

fn park_error(err: CallbackError) {
    error!(event = "callback_error", error = %err);
    PENDING.with(|slot| {
        let mut slot = slot.borrow_mut();
        // First error wins; later ones were likely knock-on effects.
        if slot.is_none() {
            *slot = Some(err);
        }
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// libffi type for one boundary slot.
pub(crate) fn ffi_type_of(desc: &TypeDesc) -> middle::Type {
    match desc {
        TypeDesc::Integer { width, signed } => match (width, signed) {
            (IntWidth::W8, true) => middle::Type::i8(),
            (IntWidth::W8, false) => middle::Type::u8(),
            (IntWidth::W16, true) => middle::Type::i16(),
            (IntWidth::W16, false) => middle::Type::u16(),
            (IntWidth::W32, true) => middle::Type::i32(),
            (IntWidth::W32, false) => middle::Type::u32(),
            (IntWidth::W64, true) => middle::Type::i64(),
            (IntWidth::W64, false) => middle::Type::u64(),
        },
        TypeDesc::Float { width } => match width {
            FloatWidth::W32 => middle::Type::f32(),
            FloatWidth::W64 => middle::Type::f64(),
        },
        TypeDesc::Boolean => middle::Type::u8(),
        TypeDesc::Void => middle::Type::void(),
        // Strings, handles, callbacks and nulls all travel as one pointer.
        _ => middle::Type::pointer(),
    }
}

/// Native return slot shape, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetClass {
    Void,
    /// Integers and booleans, widened into an `ffi_arg` word.
    Word,
    F32,
    F64,
}

impl RetClass {
    fn of(ret: Option<&TypeDesc>) -> Result<Self, CallbackError> {
        match ret {
            None | Some(TypeDesc::Void) => Ok(Self::Void),
            Some(TypeDesc::Integer { .. }) | Some(TypeDesc::Boolean) => Ok(Self::Word),
            Some(TypeDesc::Float { width: FloatWidth::W32 }) => Ok(Self::F32),
            Some(TypeDesc::Float { width: FloatWidth::W64 }) => Ok(Self::F64),
            Some(other) => Err(CallbackError::Trampoline(format!(
                "unsupported callback return kind: {}",
                other.kind_name()
            ))),
        }
    }
}

struct TrampolineState {
    id: TrampolineId,
    kind: TrampolineKind,
    arg_types: Vec<TypeDesc>,
    /// Destructors for owned handle arguments, resolved at registration.
    arg_dtors: Vec<Option<RawDtor>>,
    ret_class: RetClass,
    managed: Mutex<Option<ManagedFn>>,
    invocations: AtomicU64,
    handles: Arc<HandleRegistry>,
    /// Owns the ffi_cif the closure was prepped against; must stay at a
    /// stable address for the closure's whole lifetime.
    cif: middle::Cif,
}

impl TrampolineState {
    /// Runs one native invocation and returns the value to encode as the
    /// native result. Never unwinds.
    unsafe fn dispatch(&self, args: *const *const c_void) -> Value {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let managed = match self.kind {
            // Fires at most once; take the function out under the lock.
            TrampolineKind::DestroyNotify => self.managed.lock().take(),
            _ => self.managed.lock().clone(),
        };
        let Some(managed) = managed else {
            trace!(event = "trampoline_skip", id = self.id.0);
            return self.default_result();
        };

        let decoded = match self.decode_args(args) {
            Ok(values) => values,
            Err(err) => {
                self.disarm_failed_source();
                park_error(err);
                return self.default_result();
            }
        };

        debug!(event = "trampoline_fire", id = self.id.0, args = decoded.len());

        match panic::catch_unwind(panic::AssertUnwindSafe(|| managed.call(&decoded))) {
            Ok(Ok(value)) => self.encode_outcome(value),
            Ok(Err(err)) => {
                self.disarm_failed_source();
                park_error(err);
                self.default_result()
            }
            Err(payload) => {
                self.disarm_failed_source();
                park_error(CallbackError::Panicked(panic_message(payload)));
                self.default_result()
            }
        }
    }

    fn encode_outcome(&self, value: Value) -> Value {
        if self.kind == TrampolineKind::OneShotSource {
            let keep = match value {
                Value::Bool(b) => b,
                other => {
                    park_error(CallbackError::Failed(format!(
                        "one-shot source returned {}, expected bool",
                        other.type_name()
                    )));
                    false
                }
            };
            if !keep {
                self.disarm();
            }
            return Value::Bool(keep);
        }
        value
    }

    /// A failed one-shot source is spent like a `false` return; closures and
    /// custom callbacks stay connected until an explicit disconnect.
    fn disarm_failed_source(&self) {
        if self.kind == TrampolineKind::OneShotSource {
            self.disarm();
        }
    }

    /// Drops the managed function; later native entries get the default
    /// result without dispatching.
    fn disarm(&self) {
        if self.managed.lock().take().is_some() {
            debug!(event = "trampoline_disarm", id = self.id.0);
        }
    }

    fn default_result(&self) -> Value {
        match (self.kind, self.ret_class) {
            (TrampolineKind::OneShotSource, _) => Value::Bool(false),
            (_, RetClass::Void) => Value::Void,
            (_, RetClass::Word) => Value::Int(0),
            (_, RetClass::F32) | (_, RetClass::F64) => Value::Float(0.0),
        }
    }

    unsafe fn decode_args(&self, args: *const *const c_void) -> Result<Vec<Value>, CallbackError> {
        let mut decoded = Vec::with_capacity(self.arg_types.len());
        for (index, desc) in self.arg_types.iter().enumerate() {
            let slot = *args.add(index);
            decoded.push(self.decode_one(index, desc, slot)?);
        }
        Ok(decoded)
    }

    unsafe fn decode_one(
        &self,
        index: usize,
        desc: &TypeDesc,
        slot: *const c_void,
    ) -> Result<Value, CallbackError> {
        match desc {
            TypeDesc::Integer { width, signed } => {
                let raw = match (width, signed) {
                    (IntWidth::W8, true) => slot.cast::<i8>().read() as i64,
                    (IntWidth::W8, false) => slot.cast::<u8>().read() as i64,
                    (IntWidth::W16, true) => slot.cast::<i16>().read() as i64,
                    (IntWidth::W16, false) => slot.cast::<u16>().read() as i64,
                    (IntWidth::W32, true) => slot.cast::<i32>().read() as i64,
                    (IntWidth::W32, false) => slot.cast::<u32>().read() as i64,
                    (IntWidth::W64, true) => slot.cast::<i64>().read(),
                    (IntWidth::W64, false) => slot.cast::<u64>().read() as i64,
                };
                Ok(Value::Int(raw))
            }
            TypeDesc::Float { width } => {
                let raw = match width {
                    FloatWidth::W32 => slot.cast::<f32>().read() as f64,
                    FloatWidth::W64 => slot.cast::<f64>().read(),
                };
                Ok(Value::Float(raw))
            }
            TypeDesc::Boolean => Ok(Value::Bool(slot.cast::<u8>().read() != 0)),
            TypeDesc::String { ownership } => {
                let ptr = slot.cast::<*const libc::c_char>().read();
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                let text = CStr::from_ptr(ptr).to_string_lossy().into_owned();
                if *ownership == Ownership::Owned {
                    libc::free(ptr as *mut libc::c_void);
                }
                Ok(Value::Str(text))
            }
            TypeDesc::Handle {
                kind,
                ownership,
                type_name,
                ..
            } => {
                let ptr = slot.cast::<*mut c_void>().read();
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                let wrapper = match ownership {
                    Ownership::Borrowed => self.handles.intern_borrowed(ptr, type_name),
                    Ownership::Owned => {
                        let dtor = self.arg_dtors.get(index).copied().flatten();
                        self.handles.intern_owned(ptr, *kind, type_name, dtor)
                    }
                };
                wrapper
                    .map(Value::Handle)
                    .map_err(|err| CallbackError::BadArgument {
                        index,
                        message: err.to_string(),
                    })
            }
            other => Err(CallbackError::BadArgument {
                index,
                message: format!("{} arguments cannot cross into managed code", other.kind_name()),
            }),
        }
    }
}

// Raw libffi entry points, one per return slot shape. `userdata` is the
// boxed TrampolineState, stable for the closure's lifetime.

unsafe extern "C" fn trampoline_word(
    _cif: &low::ffi_cif,
    result: &mut low::ffi_arg,
    args: *const *const c_void,
    state: &TrampolineState,
) {
    let value = state.dispatch(args);
    *result = match value {
        Value::Int(v) => v as u64 as low::ffi_arg,
        Value::Bool(b) => low::ffi_arg::from(u8::from(b)),
        _ => 0,
    };
}

unsafe extern "C" fn trampoline_void(
    _cif: &low::ffi_cif,
    _result: &mut (),
    args: *const *const c_void,
    state: &TrampolineState,
) {
    state.dispatch(args);
}

unsafe extern "C" fn trampoline_f32(
    _cif: &low::ffi_cif,
    result: &mut f32,
    args: *const *const c_void,
    state: &TrampolineState,
) {
    *result = match state.dispatch(args) {
        Value::Float(v) => v as f32,
        _ => 0.0,
    };
}

unsafe extern "C" fn trampoline_f64(
    _cif: &low::ffi_cif,
    result: &mut f64,
    args: *const *const c_void,
    state: &TrampolineState,
) {
    *result = match state.dispatch(args) {
        Value::Float(v) => v,
        _ => 0.0,
    };
}

/// One live trampoline: its state, the libffi closure, and the minted code
/// pointer native code calls.
struct Registration {
    state: Box<TrampolineState>,
    closure: *mut low::ffi_closure,
    code: low::CodePtr,
}

// The registry hands the code pointer to native libraries and keeps the
// closure alive process-wide; state mutation goes through locks/atomics.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Drop for Registration {
    fn drop(&mut self) {
        // Free the closure before the state it points at.
        unsafe { low::closure_free(self.closure) };
    }
}

/// Registry of all live trampolines, keyed by id.
pub struct TrampolineRegistry {
    map: DashMap<u64, Registration>,
    next: AtomicU64,
    handles: Arc<HandleRegistry>,
    libraries: Arc<LibraryMap>,
}

impl TrampolineRegistry {
    pub fn new(handles: Arc<HandleRegistry>, libraries: Arc<LibraryMap>) -> Self {
        Self {
            map: DashMap::new(),
            next: AtomicU64::new(1),
            handles,
            libraries,
        }
    }

    /// Destructor address for an owned handle argument, looked up now so a
    /// bad declaration fails registration instead of a native invocation.
    fn resolve_arg_destructor(
        &self,
        index: usize,
        desc: &TypeDesc,
    ) -> Result<Option<RawDtor>, CallbackError> {
        let TypeDesc::Handle {
            ownership: Ownership::Owned,
            library,
            destructor: Some(symbol),
            ..
        } = desc
        else {
            return Ok(None);
        };
        let Some(library) = library else {
            return Err(CallbackError::BadArgument {
                index,
                message: format!("destructor {} names no library", symbol),
            });
        };
        let addr = self
            .libraries
            .resolve(library, symbol)
            .map_err(|err| CallbackError::BadArgument {
                index,
                message: err.to_string(),
            })?;
        // A destructor symbol is a unary void function.
        Ok(Some(unsafe { std::mem::transmute::<usize, RawDtor>(addr) }))
    }

    /// Mints a native function pointer dispatching to `managed`.
    ///
    /// `ret` must be `None` except for `Custom` trampolines; `OneShotSource`
    /// implicitly returns a continue flag. The caller validates descriptor
    /// well-formedness beforehand.
    pub fn register(
        &self,
        kind: TrampolineKind,
        arg_types: Vec<TypeDesc>,
        ret: Option<TypeDesc>,
        managed: ManagedFn,
    ) -> Result<TrampolineId, CallbackError> {
        let mut arg_dtors = Vec::with_capacity(arg_types.len());
        for (index, arg) in arg_types.iter().enumerate() {
            if matches!(arg, TypeDesc::Void) {
                return Err(CallbackError::BadArgument {
                    index,
                    message: "void is not a callback argument type".to_owned(),
                });
            }
            arg_dtors.push(self.resolve_arg_destructor(index, arg)?);
        }

        let ret_class = match kind {
            TrampolineKind::OneShotSource => RetClass::Word,
            TrampolineKind::Custom => RetClass::of(ret.as_ref())?,
            TrampolineKind::Closure | TrampolineKind::DestroyNotify => RetClass::Void,
        };

        let ret_type = match (kind, &ret) {
            (TrampolineKind::OneShotSource, _) => middle::Type::u8(),
            (TrampolineKind::Custom, Some(desc)) => ffi_type_of(desc),
            _ => middle::Type::void(),
        };
        let cif = middle::Builder::new()
            .args(arg_types.iter().map(ffi_type_of))
            .res(ret_type)
            .into_cif();

        let id = TrampolineId(self.next.fetch_add(1, Ordering::Relaxed));
        let state = Box::new(TrampolineState {
            id,
            kind,
            arg_types,
            arg_dtors,
            ret_class,
            managed: Mutex::new(Some(managed)),
            invocations: AtomicU64::new(0),
            handles: Arc::clone(&self.handles),
            cif,
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(CallbackError::Trampoline(
                "closure allocation failed".to_owned(),
            ));
        }

        // The cif and userdata live in the box; both addresses are stable
        // from here on.
        let prep = unsafe {
            let cif_ptr = state.cif.as_raw_ptr();
            let userdata = &*state as *const TrampolineState;
            match ret_class {
                RetClass::Void => {
                    low::prep_closure(closure, cif_ptr, trampoline_void, userdata, code)
                }
                RetClass::Word => {
                    low::prep_closure(closure, cif_ptr, trampoline_word, userdata, code)
                }
                RetClass::F32 => {
                    low::prep_closure(closure, cif_ptr, trampoline_f32, userdata, code)
                }
                RetClass::F64 => {
                    low::prep_closure(closure, cif_ptr, trampoline_f64, userdata, code)
                }
            }
        };
        if let Err(err) = prep {
            unsafe { low::closure_free(closure) };
            return Err(CallbackError::Trampoline(format!(
                "closure preparation failed: {:?}",
                err
            )));
        }

        debug!(event = "trampoline_register", id = id.0, kind = ?kind);
        self.map.insert(id.0, Registration { state, closure, code });
        Ok(id)
    }

    /// Native code pointer for a registered trampoline.
    pub fn code_ptr(&self, id: TrampolineId) -> Option<*const c_void> {
        self.map.get(&id.0).map(|reg| reg.code.0 as *const c_void)
    }

    /// Drops the managed function. The closure stays allocated so a native
    /// caller holding the pointer gets a harmless default instead of a jump
    /// into freed memory; it only reports that nothing is connected.
    pub fn disconnect(&self, id: TrampolineId) -> bool {
        match self.map.get(&id.0) {
            Some(reg) => {
                let was_armed = reg.state.managed.lock().take().is_some();
                if was_armed {
                    debug!(event = "trampoline_disconnect", id = id.0);
                } else {
                    warn!(event = "trampoline_disconnect", id = id.0, "already disconnected");
                }
                was_armed
            }
            None => false,
        }
    }

    /// Whether the trampoline still has a managed function attached.
    pub fn is_armed(&self, id: TrampolineId) -> bool {
        self.map
            .get(&id.0)
            .map(|reg| reg.state.managed.lock().is_some())
            .unwrap_or(false)
    }

    /// Times native code has entered this trampoline, armed or not.
    pub fn invocations(&self, id: TrampolineId) -> Option<u64> {
        self.map
            .get(&id.0)
            .map(|reg| reg.state.invocations.load(Ordering::Relaxed))
    }
}

impl core::fmt::Debug for TrampolineRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrampolineRegistry")
            .field("registered", &self.map.len())
            .finish()
    }
}
