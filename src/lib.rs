//! Callbridge - dynamic native-call engine
//!
//! Lets a managed runtime invoke arbitrary C-ABI functions in shared
//! libraries, marshal values across the boundary in both directions, manage
//! the lifetime of reference-counted native objects, and expose managed
//! functions as native-callable function pointers.
//!
//! Architecture (leaves first):
//! - `descriptor` - tagged type descriptors for boundary slots
//! - `memory` - native buffers and C struct layout computation
//! - `registry` - handle identity, runtime types, reference-count discipline
//! - `trampoline` - native-callable closures dispatching into managed code
//! - `call` - the dispatcher: resolve, marshal, invoke, unmarshal

pub mod logging;

pub mod descriptor;
pub mod value;
pub mod memory;
pub mod registry;
pub mod trampoline;
pub mod call;

pub use call::{CallError, CallRequest, Engine, Signature};
pub use descriptor::{
    DescriptorError, FloatWidth, HandleKind, IntWidth, Ownership, TrampolineKind, TypeDesc,
};
pub use memory::{LayoutError, MemoryError, NativeBuffer, StructLayout};
pub use registry::{HandleRegistry, RegistryError, TypeInfo, TypeRegistry, Wrapper};
pub use trampoline::{CallbackError, ManagedFn, TrampolineId};
pub use value::Value;

/// Engine initialization: sets up structured logging from the environment.
///
/// Idempotent; safe to call from multiple embedding entry points.
pub fn init() {
    logging::init();
}
