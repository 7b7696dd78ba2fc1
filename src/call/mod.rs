//! Call dispatch: resolve, marshal, invoke, unmarshal.
//!
//! The engine is the single entry point for outbound native calls. A call
//! is fully synchronous: descriptors are validated, the symbol resolved
//! through the per-library cache, every argument marshalled, a CIF built
//! from the descriptors, the symbol invoked, and the return value decoded
//! back through the handle registry. Nothing is queued or retried; any
//! error before invocation means the native function never ran.
//!
//! Callbacks fired by native code during the call run nested inside it.
//! Their failures are parked thread-locally by the trampoline layer and
//! surfaced here as `CallbackPropagated` once the outer call returns.

mod library;
mod marshal;

pub use library::{LibraryError, LibraryMap};
pub use marshal::MarshalError;

use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use libffi::middle;
use tracing::{debug, trace, warn};

use crate::descriptor::{DescriptorError, FloatWidth, IntWidth, Ownership, TrampolineKind, TypeDesc};
use crate::logging;
use crate::memory::{MemoryError, NativeBuffer};
use crate::registry::{HandleRegistry, RawDtor, RegistryError, TypeRegistry, Wrapper};
use crate::trampoline::{
    self, ffi_type_of, CallbackError, ManagedFn, TrampolineId, TrampolineRegistry,
};
use crate::value::Value;

/// Declared shape of one native function.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub args: Vec<TypeDesc>,
    pub ret: TypeDesc,
}

impl Signature {
    pub fn new(args: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        Self { args, ret }
    }

    /// A function taking `args` and returning nothing.
    pub fn void(args: Vec<TypeDesc>) -> Self {
        Self {
            args,
            ret: TypeDesc::Void,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        for (index, arg) in self.args.iter().enumerate() {
            if matches!(arg, TypeDesc::Void) {
                return Err(DescriptorError::VoidArgument { index });
            }
            arg.validate()?;
        }
        if matches!(self.ret, TypeDesc::Callback { .. }) {
            return Err(DescriptorError::CallbackReturn);
        }
        self.ret.validate()
    }
}

/// One call in a batch.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub library: String,
    pub symbol: String,
    pub signature: Signature,
    pub args: Vec<Value>,
}

/// The dispatch engine. One per embedding; cheap accessors expose the
/// registries for type and callback registration.
pub struct Engine {
    libraries: Arc<LibraryMap>,
    types: Arc<TypeRegistry>,
    handles: Arc<HandleRegistry>,
    trampolines: TrampolineRegistry,
    /// Releases C string storage the engine no longer needs: returned owned
    /// strings after copying, and struct string fields displaced by a write.
    /// Foreign allocations must go back to the allocator that made them, so
    /// the default is the platform `free`, not Rust's.
    free_owned_string: unsafe extern "C" fn(*mut libc::c_void),
}

impl Engine {
    pub fn new() -> Self {
        let types = Arc::new(TypeRegistry::new());
        let handles = Arc::new(HandleRegistry::new(Arc::clone(&types)));
        let libraries = Arc::new(LibraryMap::new());
        Self {
            trampolines: TrampolineRegistry::new(Arc::clone(&handles), Arc::clone(&libraries)),
            libraries,
            types,
            handles,
            free_owned_string: libc::free,
        }
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    /// Exposes in-process `extern "C"` functions under a library name, so
    /// embedders (and tests) can bind without a shared object on disk.
    pub fn register_symbols(&self, library: &str, symbols: &[(&str, *const ())]) {
        self.libraries.register_symbols(library, symbols);
    }

    /// Replaces the deallocator used for returned owned strings.
    pub fn set_string_deallocator(&mut self, free: unsafe extern "C" fn(*mut libc::c_void)) {
        self.free_owned_string = free;
    }

    /// Invokes `symbol` in `library` with `args` checked and marshalled
    /// against `signature`.
    pub fn call(
        &self,
        library: &str,
        symbol: &str,
        signature: &Signature,
        args: &[Value],
    ) -> Result<Value, CallError> {
        // An event-loop-driven trampoline may have parked an error with no
        // call on the stack; it must not be blamed on this one.
        if let Some(stale) = trampoline::take_pending_error() {
            warn!(
                event = "stale_callback_error",
                error = %stale,
                "callback error raised outside any call"
            );
        }

        if signature.args.len() != args.len() {
            return Err(CallError::ArgumentCountMismatch {
                symbol: symbol.to_owned(),
                expected: signature.args.len(),
                got: args.len(),
            });
        }
        signature.validate()?;

        let addr = self.libraries.resolve(library, symbol)?;

        // All checks precede all side effects: a failing argument list must
        // not half-transfer ownership or invoke anything.
        marshal::check_args(&signature.args, args, &self.trampolines).map_err(|source| {
            CallError::Marshal {
                symbol: symbol.to_owned(),
                source,
            }
        })?;
        let slots = marshal::marshal_args(&signature.args, args, &self.trampolines)
            .map_err(|source| CallError::Marshal {
                symbol: symbol.to_owned(),
                source,
            })?;
        let ffi_args: Vec<middle::Arg> = slots.iter().map(marshal::Slot::as_arg).collect();

        let cif = middle::Builder::new()
            .args(signature.args.iter().map(ffi_type_of))
            .res(ffi_type_of(&signature.ret))
            .into_cif();

        logging::log_call(symbol, args.len());
        let code = middle::CodePtr(addr as *mut c_void);
        let result = unsafe { self.invoke(&cif, code, &ffi_args, &signature.ret, library) };

        // Slots carried the borrowed backing storage across the call.
        drop(slots);

        if let Some(source) = trampoline::take_pending_error() {
            logging::log_call_error(symbol, &source.to_string());
            return Err(CallError::CallbackPropagated {
                symbol: symbol.to_owned(),
                source,
            });
        }
        result
    }

    /// Runs a sequence of calls, stopping at the first error. Return values
    /// are dropped, so owned returns are released immediately.
    pub fn batch_call(&self, requests: &[CallRequest]) -> Result<(), CallError> {
        debug!(event = "batch_call", calls = requests.len());
        for request in requests {
            self.call(
                &request.library,
                &request.symbol,
                &request.signature,
                &request.args,
            )?;
        }
        Ok(())
    }

    unsafe fn invoke(
        &self,
        cif: &middle::Cif,
        code: middle::CodePtr,
        args: &[middle::Arg],
        ret: &TypeDesc,
        library: &str,
    ) -> Result<Value, CallError> {
        match ret {
            TypeDesc::Void => {
                cif.call::<()>(code, args);
                Ok(Value::Void)
            }
            TypeDesc::Integer { width, signed } => {
                let raw = match (width, signed) {
                    (IntWidth::W8, true) => cif.call::<i8>(code, args) as i64,
                    (IntWidth::W8, false) => cif.call::<u8>(code, args) as i64,
                    (IntWidth::W16, true) => cif.call::<i16>(code, args) as i64,
                    (IntWidth::W16, false) => cif.call::<u16>(code, args) as i64,
                    (IntWidth::W32, true) => cif.call::<i32>(code, args) as i64,
                    (IntWidth::W32, false) => cif.call::<u32>(code, args) as i64,
                    (IntWidth::W64, true) => cif.call::<i64>(code, args),
                    (IntWidth::W64, false) => cif.call::<u64>(code, args) as i64,
                };
                Ok(Value::Int(raw))
            }
            TypeDesc::Float { width } => {
                let raw = match width {
                    FloatWidth::W32 => cif.call::<f32>(code, args) as f64,
                    FloatWidth::W64 => cif.call::<f64>(code, args),
                };
                Ok(Value::Float(raw))
            }
            TypeDesc::Boolean => {
                let raw = cif.call::<u8>(code, args);
                Ok(Value::Bool(raw != 0))
            }
            TypeDesc::String { ownership } => {
                let ptr = cif.call::<*mut c_char>(code, args);
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                // Copy at the moment of the call; the native side may reuse
                // or mutate its storage afterwards.
                let text = std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned();
                if *ownership == Ownership::Owned {
                    (self.free_owned_string)(ptr as *mut libc::c_void);
                }
                Ok(Value::Str(text))
            }
            TypeDesc::Handle {
                kind,
                ownership,
                type_name,
                library: home,
                destructor,
            } => {
                let ptr = cif.call::<*mut c_void>(code, args);
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                let wrapper = match ownership {
                    Ownership::Borrowed => self.handles.intern_borrowed(ptr, type_name)?,
                    Ownership::Owned => {
                        let dtor =
                            self.resolve_destructor(home.as_deref().unwrap_or(library), destructor)?;
                        self.handles.intern_owned(ptr, *kind, type_name, dtor)?
                    }
                };
                Ok(Value::Handle(wrapper))
            }
            TypeDesc::Null => {
                cif.call::<*mut c_void>(code, args);
                Ok(Value::Null)
            }
            // Rejected by Signature::validate.
            TypeDesc::Callback { .. } => Err(CallError::Descriptor(
                DescriptorError::CallbackReturn,
            )),
        }
    }

    fn resolve_destructor(
        &self,
        library: &str,
        destructor: &Option<String>,
    ) -> Result<Option<RawDtor>, CallError> {
        match destructor {
            None => Ok(None),
            Some(symbol) => {
                let addr = self.libraries.resolve(library, symbol)?;
                trace!(event = "destructor_resolve", library, symbol = %symbol, addr);
                // A destructor symbol is a unary void function.
                Ok(Some(unsafe {
                    std::mem::transmute::<usize, RawDtor>(addr)
                }))
            }
        }
    }

    /// Mints a native function pointer dispatching into `managed` and
    /// registers it for use as a `Value::Callback` argument.
    pub fn register_callback(
        &self,
        kind: TrampolineKind,
        arg_types: Vec<TypeDesc>,
        return_type: Option<TypeDesc>,
        managed: ManagedFn,
    ) -> Result<TrampolineId, CallError> {
        // Validate as a callback descriptor first, so malformed shapes are
        // caught before any closure is allocated.
        let desc = TypeDesc::Callback {
            kind,
            arg_types: arg_types.clone(),
            return_type: return_type.clone().map(Box::new),
        };
        desc.validate()?;
        for (index, arg) in arg_types.iter().enumerate() {
            if matches!(arg, TypeDesc::Void) {
                return Err(CallError::Descriptor(DescriptorError::VoidArgument {
                    index,
                }));
            }
        }

        let id = self
            .trampolines
            .register(kind, arg_types, return_type, managed)?;
        Ok(id)
    }

    /// Drops a trampoline's managed function; the native-visible pointer
    /// stays callable and reports nothing connected.
    pub fn disconnect(&self, id: TrampolineId) -> bool {
        self.trampolines.disconnect(id)
    }

    /// Times native code has entered a trampoline.
    pub fn invocations(&self, id: TrampolineId) -> Option<u64> {
        self.trampolines.invocations(id)
    }

    /// Allocates a zero-initialized boxed struct buffer and interns it as a
    /// handle for by-reference passing.
    pub fn alloc(
        &self,
        size: usize,
        type_tag: &str,
        library: Option<String>,
    ) -> Result<Wrapper, CallError> {
        let buffer = NativeBuffer::alloc(size, type_tag, library)?;
        Ok(self.handles.register_buffer(buffer))
    }

    /// Reads a field from an engine-allocated struct buffer.
    ///
    /// Scalars decode in place; string fields copy out; handle fields are
    /// interned as borrowed.
    pub fn read(
        &self,
        handle: &Wrapper,
        desc: &TypeDesc,
        offset: usize,
    ) -> Result<Value, CallError> {
        let buffer = handle.buffer().ok_or(MemoryError::NotABuffer)?;
        match desc {
            TypeDesc::String { .. } => {
                let ptr = buffer.read_ptr(desc, offset)?;
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                let text = unsafe { std::ffi::CStr::from_ptr(ptr as *const c_char) }
                    .to_string_lossy()
                    .into_owned();
                Ok(Value::Str(text))
            }
            TypeDesc::Handle { type_name, .. } => {
                let ptr = buffer.read_ptr(desc, offset)?;
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Handle(self.handles.intern_borrowed(ptr, type_name)?))
            }
            _ => Ok(buffer.read(desc, offset)?),
        }
    }

    /// Writes a field into an engine-allocated struct buffer.
    ///
    /// String fields are copied with the platform allocator so the struct
    /// owns native-freeable storage; the displaced copy, if any, goes back
    /// through the string deallocator. Handle fields store the raw pointer
    /// without touching the wrapped object's lifetime.
    pub fn write(
        &self,
        handle: &Wrapper,
        desc: &TypeDesc,
        offset: usize,
        value: &Value,
    ) -> Result<(), CallError> {
        let buffer = handle.buffer().ok_or(MemoryError::NotABuffer)?;
        match (desc, value) {
            (TypeDesc::String { .. }, Value::Str(s)) => {
                let c = std::ffi::CString::new(s.as_str())
                    .map_err(|_| MemoryError::InteriorNul { offset })?;
                let prior = buffer.read_ptr(desc, offset)?;
                let dup = unsafe { libc::strdup(c.as_ptr()) };
                buffer.write_ptr(desc, offset, dup as *mut c_void)?;
                if !prior.is_null() {
                    unsafe { (self.free_owned_string)(prior as *mut libc::c_void) };
                }
                Ok(())
            }
            (TypeDesc::Handle { .. }, Value::Handle(wrapper)) => {
                let ptr = wrapper.ptr()?;
                buffer.write_ptr(desc, offset, ptr)?;
                Ok(())
            }
            (TypeDesc::String { .. }, Value::Null) => {
                let prior = buffer.read_ptr(desc, offset)?;
                buffer.write_ptr(desc, offset, std::ptr::null_mut())?;
                if !prior.is_null() {
                    unsafe { (self.free_owned_string)(prior as *mut libc::c_void) };
                }
                Ok(())
            }
            (TypeDesc::Handle { .. }, Value::Null) => {
                buffer.write_ptr(desc, offset, std::ptr::null_mut())?;
                Ok(())
            }
            _ => Ok(buffer.write(desc, offset, value)?),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("libraries", &self.libraries)
            .field("handles", &self.handles)
            .field("trampolines", &self.trampolines)
            .finish()
    }
}

/// Dispatch errors. Everything is synchronous; an error before invocation
/// means the native function never ran.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Descriptor(DescriptorError),
    /// An argument failed to marshal; names the symbol alongside the
    /// per-argument failure.
    Marshal {
        symbol: String,
        source: MarshalError,
    },
    Memory(MemoryError),
    Registry(RegistryError),
    Library(LibraryError),
    Callback(CallbackError),
    ArgumentCountMismatch {
        symbol: String,
        expected: usize,
        got: usize,
    },
    /// A callback raised during this call; wraps the original failure and
    /// names the native call frame it happened under.
    CallbackPropagated {
        symbol: String,
        source: CallbackError,
    },
}

impl core::fmt::Display for CallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Descriptor(e) => write!(f, "{}", e),
            Self::Marshal { symbol, source } => write!(f, "call to {}: {}", symbol, source),
            Self::Memory(e) => write!(f, "{}", e),
            Self::Registry(e) => write!(f, "{}", e),
            Self::Library(e) => write!(f, "{}", e),
            Self::Callback(e) => write!(f, "{}", e),
            Self::ArgumentCountMismatch {
                symbol,
                expected,
                got,
            } => write!(
                f,
                "{} expects {} arguments, got {}",
                symbol, expected, got
            ),
            Self::CallbackPropagated { symbol, source } => {
                write!(f, "callback raised during call to {}: {}", symbol, source)
            }
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Descriptor(e) => Some(e),
            Self::Marshal { source, .. } => Some(source),
            Self::Memory(e) => Some(e),
            Self::Registry(e) => Some(e),
            Self::Library(e) => Some(e),
            Self::Callback(e) => Some(e),
            Self::CallbackPropagated { source, .. } => Some(source),
            Self::ArgumentCountMismatch { .. } => None,
        }
    }
}

impl From<DescriptorError> for CallError {
    fn from(e: DescriptorError) -> Self {
        Self::Descriptor(e)
    }
}

impl From<MemoryError> for CallError {
    fn from(e: MemoryError) -> Self {
        Self::Memory(e)
    }
}

impl From<RegistryError> for CallError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<LibraryError> for CallError {
    fn from(e: LibraryError) -> Self {
        Self::Library(e)
    }
}

impl From<CallbackError> for CallError {
    fn from(e: CallbackError) -> Self {
        Self::Callback(e)
    }
}

#[cfg(test)]
mod tests;
