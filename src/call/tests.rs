//! Dispatcher test suite.
//!
//! Native functions are simulated with in-process `extern "C"` stubs
//! registered under test library names, so no shared object is needed.

use super::*;
use crate::descriptor::HandleKind;

use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};

fn i32_desc() -> TypeDesc {
    TypeDesc::Integer {
        width: IntWidth::W32,
        signed: true,
    }
}

fn i64_desc() -> TypeDesc {
    TypeDesc::Integer {
        width: IntWidth::W64,
        signed: true,
    }
}

fn f64_desc() -> TypeDesc {
    TypeDesc::Float {
        width: FloatWidth::W64,
    }
}

#[test]
fn integer_call_round_trips() {
    extern "C" fn add(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("add", add as *const ())]);

    let sig = Signature::new(vec![i32_desc(), i32_desc()], i32_desc());
    let out = engine
        .call("testlib", "add", &sig, &[Value::Int(40), Value::Int(2)])
        .unwrap();
    assert_eq!(out, Value::Int(42));

    let out = engine
        .call("testlib", "add", &sig, &[Value::Int(-1), Value::Int(-41)])
        .unwrap();
    assert_eq!(out, Value::Int(-42));
}

#[test]
fn float_and_bool_returns_decode() {
    extern "C" fn half(v: f64) -> f64 {
        v / 2.0
    }
    extern "C" fn is_even(v: i64) -> u8 {
        u8::from(v % 2 == 0)
    }

    let engine = Engine::new();
    engine.register_symbols(
        "testlib",
        &[("half", half as *const ()), ("is_even", is_even as *const ())],
    );

    let sig = Signature::new(vec![f64_desc()], f64_desc());
    assert_eq!(
        engine.call("testlib", "half", &sig, &[Value::Float(5.0)]).unwrap(),
        Value::Float(2.5)
    );

    let sig = Signature::new(vec![i64_desc()], TypeDesc::Boolean);
    assert_eq!(
        engine.call("testlib", "is_even", &sig, &[Value::Int(4)]).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        engine.call("testlib", "is_even", &sig, &[Value::Int(3)]).unwrap(),
        Value::Bool(false)
    );
}

#[test]
fn argument_count_mismatch_never_invokes() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn observe(_: i32) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("observe", observe as *const ())]);

    let sig = Signature::void(vec![i32_desc()]);
    let err = engine
        .call("testlib", "observe", &sig, &[Value::Int(1), Value::Int(2)])
        .unwrap_err();
    assert_eq!(
        err,
        CallError::ArgumentCountMismatch {
            symbol: "observe".into(),
            expected: 1,
            got: 2,
        }
    );
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn type_mismatch_never_invokes() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn observe(_: i32) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("observe", observe as *const ())]);

    let sig = Signature::void(vec![i32_desc()]);
    let err = engine
        .call("testlib", "observe", &sig, &[Value::Float(1.0)])
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Marshal {
            symbol: "observe".into(),
            source: MarshalError::TypeMismatch {
                index: 0,
                expected: "integer",
                got: "float",
            },
        }
    );
    // The rendered error names both the symbol and the argument index.
    let message = err.to_string();
    assert!(message.contains("observe"), "{}", message);
    assert!(message.contains("argument 0"), "{}", message);
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_symbols_are_fatal() {
    let engine = Engine::new();
    engine.register_symbols("testlib", &[]);

    let sig = Signature::void(vec![]);
    let err = engine.call("testlib", "missing", &sig, &[]).unwrap_err();
    assert_eq!(
        err,
        CallError::Library(LibraryError::SymbolNotFound {
            library: "testlib".into(),
            symbol: "missing".into(),
        })
    );
}

#[test]
fn borrowed_string_arguments_pass_as_pointers() {
    extern "C" fn measure(s: *const c_char) -> i64 {
        if s.is_null() {
            return -1;
        }
        unsafe { CStr::from_ptr(s) }.to_bytes().len() as i64
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("measure", measure as *const ())]);

    let sig = Signature::new(
        vec![TypeDesc::String {
            ownership: Ownership::Borrowed,
        }],
        i64_desc(),
    );
    assert_eq!(
        engine
            .call("testlib", "measure", &sig, &[Value::Str("hello".into())])
            .unwrap(),
        Value::Int(5)
    );
    assert_eq!(
        engine.call("testlib", "measure", &sig, &[Value::Null]).unwrap(),
        Value::Int(-1)
    );
}

#[test]
fn borrowed_string_returns_are_copied() {
    extern "C" fn greet() -> *const c_char {
        b"hi there\0".as_ptr() as *const c_char
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("greet", greet as *const ())]);

    let sig = Signature::new(
        vec![],
        TypeDesc::String {
            ownership: Ownership::Borrowed,
        },
    );
    assert_eq!(
        engine.call("testlib", "greet", &sig, &[]).unwrap(),
        Value::Str("hi there".into())
    );
}

#[test]
fn owned_string_returns_are_freed_through_the_hook() {
    static FREED: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn make_name() -> *mut c_char {
        let text = std::ffi::CString::new("dynamic").unwrap();
        unsafe { libc::strdup(text.as_ptr()) }
    }
    unsafe extern "C" fn counting_free(p: *mut libc::c_void) {
        FREED.fetch_add(1, Ordering::SeqCst);
        libc::free(p);
    }

    let mut engine = Engine::new();
    engine.set_string_deallocator(counting_free);
    engine.register_symbols("testlib", &[("make_name", make_name as *const ())]);

    let sig = Signature::new(
        vec![],
        TypeDesc::String {
            ownership: Ownership::Owned,
        },
    );
    assert_eq!(
        engine.call("testlib", "make_name", &sig, &[]).unwrap(),
        Value::Str("dynamic".into())
    );
    assert_eq!(FREED.load(Ordering::SeqCst), 1);
}

#[test]
fn handle_returns_intern_with_identity() {
    extern "C" fn get_widget() -> *mut c_void {
        0x5000 as *mut c_void
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("get_widget", get_widget as *const ())]);

    let sig = Signature::new(
        vec![],
        TypeDesc::Handle {
            kind: HandleKind::Boxed,
            ownership: Ownership::Borrowed,
            type_name: "Widget".into(),
            library: None,
            destructor: None,
        },
    );
    let a = engine.call("testlib", "get_widget", &sig, &[]).unwrap();
    let b = engine.call("testlib", "get_widget", &sig, &[]).unwrap();

    // Same native pointer, same wrapper.
    assert_eq!(a, b);
    match a {
        Value::Handle(ref w) => assert_eq!(w.type_name(), "Widget"),
        ref other => panic!("expected handle, got {:?}", other),
    }
}

#[test]
fn owned_handle_returns_resolve_their_destructor() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn make_widget() -> *mut c_void {
        0x6000 as *mut c_void
    }
    extern "C" fn widget_free(_: *mut c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols(
        "testlib",
        &[
            ("make_widget", make_widget as *const ()),
            ("widget_free", widget_free as *const ()),
        ],
    );

    let sig = Signature::new(
        vec![],
        TypeDesc::Handle {
            kind: HandleKind::Boxed,
            ownership: Ownership::Owned,
            type_name: "Widget".into(),
            library: None,
            destructor: Some("widget_free".into()),
        },
    );
    let out = engine.call("testlib", "make_widget", &sig, &[]).unwrap();
    drop(out);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
fn handle_arguments_unwrap_to_their_pointer() {
    extern "C" fn addr_of(p: *mut c_void) -> i64 {
        p as i64
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("addr_of", addr_of as *const ())]);

    let handle = engine
        .handles()
        .intern_borrowed(0x7000 as *mut c_void, "Widget")
        .unwrap();
    let sig = Signature::new(
        vec![TypeDesc::Handle {
            kind: HandleKind::Boxed,
            ownership: Ownership::Borrowed,
            type_name: "Widget".into(),
            library: None,
            destructor: None,
        }],
        i64_desc(),
    );
    assert_eq!(
        engine
            .call("testlib", "addr_of", &sig, &[Value::Handle(handle)])
            .unwrap(),
        Value::Int(0x7000)
    );
}

#[test]
fn callback_arguments_dispatch_into_managed_code() {
    extern "C" fn trigger_twice(f: extern "C" fn()) {
        f();
        f();
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("trigger_twice", trigger_twice as *const ())]);

    let fired = std::sync::Arc::new(AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&fired);
    let id = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![],
            None,
            ManagedFn::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Void)
            }),
        )
        .unwrap();

    let sig = Signature::void(vec![TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![],
        return_type: None,
    }]);
    engine
        .call("testlib", "trigger_twice", &sig, &[Value::Callback(id)])
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(engine.invocations(id), Some(2));
}

#[test]
fn callback_failures_propagate_to_the_caller() {
    extern "C" fn trigger(f: extern "C" fn()) {
        f();
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("trigger", trigger as *const ())]);

    let id = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![],
            None,
            ManagedFn::new(|_| Err(CallbackError::Failed("handler rejected".into()))),
        )
        .unwrap();

    let sig = Signature::void(vec![TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![],
        return_type: None,
    }]);
    let err = engine
        .call("testlib", "trigger", &sig, &[Value::Callback(id)])
        .unwrap_err();
    assert_eq!(
        err,
        CallError::CallbackPropagated {
            symbol: "trigger".into(),
            source: CallbackError::Failed("handler rejected".into()),
        }
    );
}

#[test]
fn unregistered_trampolines_are_rejected_before_invocation() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn trigger(_: extern "C" fn()) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("trigger", trigger as *const ())]);

    let sig = Signature::void(vec![TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![],
        return_type: None,
    }]);
    let err = engine
        .call("testlib", "trigger", &sig, &[Value::Callback(TrampolineId(999))])
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Marshal {
            symbol: "trigger".into(),
            source: MarshalError::UnknownTrampoline { index: 0 },
        }
    );
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn stale_callback_errors_do_not_blame_the_next_call() {
    extern "C" fn noop() {}

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("noop", noop as *const ())]);

    let id = engine
        .register_callback(
            TrampolineKind::OneShotSource,
            vec![],
            None,
            ManagedFn::new(|_| Err(CallbackError::Failed("loop-driven failure".into()))),
        )
        .unwrap();

    // An event loop drives the source with no managed call on the stack.
    let f: extern "C" fn() -> u8 =
        unsafe { std::mem::transmute(engine.trampolines.code_ptr(id).unwrap()) };
    assert_eq!(f(), 0);

    // The parked error belongs to that invocation, not to this call.
    let sig = Signature::void(vec![]);
    assert_eq!(
        engine.call("testlib", "noop", &sig, &[]).unwrap(),
        Value::Void
    );
}

#[test]
fn owned_callback_handle_arguments_resolve_their_destructor() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn hand_over(f: extern "C" fn(*mut c_void)) {
        f(0x9000 as *mut c_void);
    }
    extern "C" fn blob_free(_: *mut c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols(
        "testlib",
        &[
            ("hand_over", hand_over as *const ()),
            ("blob_free", blob_free as *const ()),
        ],
    );

    let blob = TypeDesc::Handle {
        kind: HandleKind::Boxed,
        ownership: Ownership::Owned,
        type_name: "Blob".into(),
        library: Some("testlib".into()),
        destructor: Some("blob_free".into()),
    };
    let id = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![blob.clone()],
            None,
            // The handle drops as soon as the handler returns.
            ManagedFn::new(|_| Ok(Value::Void)),
        )
        .unwrap();

    let sig = Signature::void(vec![TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![blob],
        return_type: None,
    }]);
    engine
        .call("testlib", "hand_over", &sig, &[Value::Callback(id)])
        .unwrap();
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
}

#[test]
fn owned_callback_handle_destructors_require_a_library() {
    let engine = Engine::new();
    let err = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![TypeDesc::Handle {
                kind: HandleKind::Boxed,
                ownership: Ownership::Owned,
                type_name: "Blob".into(),
                library: None,
                destructor: Some("blob_free".into()),
            }],
            None,
            ManagedFn::new(|_| Ok(Value::Void)),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Callback(CallbackError::BadArgument { index: 0, .. })
    ));
}

#[test]
fn overwritten_string_fields_release_their_storage() {
    static FREED: AtomicUsize = AtomicUsize::new(0);
    unsafe extern "C" fn counting_free(p: *mut libc::c_void) {
        FREED.fetch_add(1, Ordering::SeqCst);
        libc::free(p);
    }

    let mut engine = Engine::new();
    engine.set_string_deallocator(counting_free);
    let row = engine.alloc(8, "Row", None).unwrap();

    let field = TypeDesc::String {
        ownership: Ownership::Borrowed,
    };
    engine.write(&row, &field, 0, &Value::Str("first".into())).unwrap();
    assert_eq!(FREED.load(Ordering::SeqCst), 0);

    engine.write(&row, &field, 0, &Value::Str("second".into())).unwrap();
    assert_eq!(engine.read(&row, &field, 0).unwrap(), Value::Str("second".into()));
    assert_eq!(FREED.load(Ordering::SeqCst), 1);

    engine.write(&row, &field, 0, &Value::Null).unwrap();
    assert_eq!(engine.read(&row, &field, 0).unwrap(), Value::Null);
    assert_eq!(FREED.load(Ordering::SeqCst), 2);
}

#[test]
fn buffer_fields_read_and_write_through_the_engine() {
    let engine = Engine::new();
    let buf = engine.alloc(16, "Color", None).unwrap();

    let f32_desc = TypeDesc::Float {
        width: FloatWidth::W32,
    };
    for (i, v) in [0.25, 0.5, 0.75, 1.0].into_iter().enumerate() {
        engine.write(&buf, &f32_desc, i * 4, &Value::Float(v)).unwrap();
    }
    assert_eq!(engine.read(&buf, &f32_desc, 8).unwrap(), Value::Float(0.75));
}

#[test]
fn field_access_requires_a_buffer_backed_handle() {
    let engine = Engine::new();
    let plain = engine
        .handles()
        .intern_borrowed(0x8000 as *mut c_void, "Widget")
        .unwrap();

    let err = engine.read(&plain, &i32_desc(), 0).unwrap_err();
    assert_eq!(err, CallError::Memory(MemoryError::NotABuffer));
}

#[test]
fn batch_calls_stop_at_the_first_error() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn observe(_: i32) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let engine = Engine::new();
    engine.register_symbols("testlib", &[("observe", observe as *const ())]);

    let ok = |v: i64| CallRequest {
        library: "testlib".into(),
        symbol: "observe".into(),
        signature: Signature::void(vec![i32_desc()]),
        args: vec![Value::Int(v)],
    };
    let bad = CallRequest {
        library: "testlib".into(),
        symbol: "observe".into(),
        signature: Signature::void(vec![i32_desc()]),
        args: vec![Value::Bool(true)],
    };

    let err = engine.batch_call(&[ok(1), bad, ok(2)]).unwrap_err();
    assert!(matches!(err, CallError::Marshal { .. }));
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn void_argument_signatures_are_rejected() {
    let engine = Engine::new();
    engine.register_symbols("testlib", &[]);

    let sig = Signature::void(vec![TypeDesc::Void]);
    let err = engine.call("testlib", "anything", &sig, &[Value::Void]).unwrap_err();
    assert_eq!(
        err,
        CallError::Descriptor(DescriptorError::VoidArgument { index: 0 })
    );
}
