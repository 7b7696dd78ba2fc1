//! End-to-end engine scenarios against in-process native stubs.

use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use callbridge::{
    CallError, Engine, FloatWidth, HandleKind, IntWidth, ManagedFn, Ownership, Signature,
    TrampolineKind, TypeDesc, Value,
};

fn f32_desc() -> TypeDesc {
    TypeDesc::Float {
        width: FloatWidth::W32,
    }
}

fn buffer_handle_desc(tag: &str) -> TypeDesc {
    TypeDesc::Handle {
        kind: HandleKind::Boxed,
        ownership: Ownership::Borrowed,
        type_name: tag.into(),
        library: None,
        destructor: None,
    }
}

fn closure_desc() -> TypeDesc {
    TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![],
        return_type: None,
    }
}

// Boxed struct of four f32 fields, compared by a native call.
#[test]
fn boxed_float_quads_compare_through_native_code() {
    extern "C" fn quads_equal(a: *const f32, b: *const f32) -> u8 {
        let (a, b) = unsafe {
            (
                std::slice::from_raw_parts(a, 4),
                std::slice::from_raw_parts(b, 4),
            )
        };
        u8::from(a == b)
    }

    let engine = Engine::new();
    engine.register_symbols("quadlib", &[("quads_equal", quads_equal as *const ())]);

    let left = engine.alloc(16, "Quad", None).unwrap();
    let right = engine.alloc(16, "Quad", None).unwrap();
    for (i, v) in [0.1, 0.2, 0.3, 0.4].into_iter().enumerate() {
        let v = v as f32 as f64;
        engine.write(&left, &f32_desc(), i * 4, &Value::Float(v)).unwrap();
        engine.write(&right, &f32_desc(), i * 4, &Value::Float(v)).unwrap();
    }

    let sig = Signature::new(
        vec![buffer_handle_desc("Quad"), buffer_handle_desc("Quad")],
        TypeDesc::Boolean,
    );
    let args = [
        Value::Handle(left.clone()),
        Value::Handle(right.clone()),
    ];
    assert_eq!(
        engine.call("quadlib", "quads_equal", &sig, &args).unwrap(),
        Value::Bool(true)
    );

    engine
        .write(&right, &f32_desc(), 8, &Value::Float(0.9f32 as f64))
        .unwrap();
    assert_eq!(
        engine.call("quadlib", "quads_equal", &sig, &args).unwrap(),
        Value::Bool(false)
    );
}

// Connect a closure to a native "signal", emit twice, disconnect, emit again.
#[test]
fn closure_connect_emit_disconnect_cycle() {
    static HANDLER: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn connect_handler(f: extern "C" fn(i32)) {
        HANDLER.store(f as usize, Ordering::SeqCst);
    }
    extern "C" fn emit_event(payload: i32) {
        let addr = HANDLER.load(Ordering::SeqCst);
        if addr != 0 {
            let f: extern "C" fn(i32) = unsafe { std::mem::transmute(addr) };
            f(payload);
        }
    }

    let engine = Engine::new();
    engine.register_symbols(
        "signallib",
        &[
            ("connect_handler", connect_handler as *const ()),
            ("emit_event", emit_event as *const ()),
        ],
    );

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![TypeDesc::Integer {
                width: IntWidth::W32,
                signed: true,
            }],
            None,
            ManagedFn::new(move |args| {
                sink.lock().unwrap().push(args[0].clone());
                Ok(Value::Void)
            }),
        )
        .unwrap();

    let connect_sig = Signature::void(vec![TypeDesc::Callback {
        kind: TrampolineKind::Closure,
        arg_types: vec![TypeDesc::Integer {
            width: IntWidth::W32,
            signed: true,
        }],
        return_type: None,
    }]);
    engine
        .call("signallib", "connect_handler", &connect_sig, &[Value::Callback(id)])
        .unwrap();

    let emit_sig = Signature::void(vec![TypeDesc::Integer {
        width: IntWidth::W32,
        signed: true,
    }]);
    engine.call("signallib", "emit_event", &emit_sig, &[Value::Int(7)]).unwrap();
    engine.call("signallib", "emit_event", &emit_sig, &[Value::Int(-3)]).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(7), Value::Int(-3)]);

    assert!(engine.disconnect(id));
    engine.call("signallib", "emit_event", &emit_sig, &[Value::Int(99)]).unwrap();

    // The native side still jumped through the trampoline, but the managed
    // callback saw nothing new.
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(engine.invocations(id), Some(3));
}

// A one-shot source pumped by native code until it asks to stop.
#[test]
fn one_shot_source_runs_exactly_n_times() {
    extern "C" fn pump(f: extern "C" fn() -> u8) -> i32 {
        let mut rounds = 0;
        // Native loop keeps driving the source while it returns true, with
        // a cap so a broken source cannot hang the test.
        while rounds < 100 {
            rounds += 1;
            if f() == 0 {
                break;
            }
        }
        rounds
    }

    let engine = Engine::new();
    engine.register_symbols("looplib", &[("pump", pump as *const ())]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let id = engine
        .register_callback(
            TrampolineKind::OneShotSource,
            vec![],
            None,
            ManagedFn::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Value::Bool(n < 5))
            }),
        )
        .unwrap();

    let sig = Signature::new(
        vec![TypeDesc::Callback {
            kind: TrampolineKind::OneShotSource,
            arg_types: vec![],
            return_type: None,
        }],
        TypeDesc::Integer {
            width: IntWidth::W32,
            signed: true,
        },
    );
    let rounds = engine.call("looplib", "pump", &sig, &[Value::Callback(id)]).unwrap();
    assert_eq!(rounds, Value::Int(5));
    assert_eq!(fired.load(Ordering::SeqCst), 5);
}

// A borrowed string return is copied at call time; later native mutation of
// the same storage does not reach the managed value.
#[test]
fn borrowed_string_returns_snapshot_native_storage() {
    static BUFFER: std::sync::Mutex<[u8; 8]> = std::sync::Mutex::new(*b"first\0\0\0");
    extern "C" fn current_text() -> *const c_char {
        BUFFER.lock().unwrap().as_ptr() as *const c_char
    }
    extern "C" fn overwrite_text() {
        *BUFFER.lock().unwrap() = *b"second\0\0";
    }

    let engine = Engine::new();
    engine.register_symbols(
        "textlib",
        &[
            ("current_text", current_text as *const ()),
            ("overwrite_text", overwrite_text as *const ()),
        ],
    );

    let get_sig = Signature::new(
        vec![],
        TypeDesc::String {
            ownership: Ownership::Borrowed,
        },
    );
    let before = engine.call("textlib", "current_text", &get_sig, &[]).unwrap();

    engine
        .call("textlib", "overwrite_text", &Signature::void(vec![]), &[])
        .unwrap();

    assert_eq!(before, Value::Str("first".into()));
    assert_eq!(
        engine.call("textlib", "current_text", &get_sig, &[]).unwrap(),
        Value::Str("second".into())
    );
}

// A callback failure inside a nested native frame surfaces on the outer call.
#[test]
fn nested_callback_errors_unwind_to_the_outer_call() {
    extern "C" fn run(f: extern "C" fn()) {
        f();
    }

    let engine = Engine::new();
    engine.register_symbols("faillib", &[("run", run as *const ())]);

    let id = engine
        .register_callback(
            TrampolineKind::Closure,
            vec![],
            None,
            ManagedFn::new(|_| panic!("handler exploded")),
        )
        .unwrap();

    let sig = Signature::void(vec![closure_desc()]);
    let err = engine
        .call("faillib", "run", &sig, &[Value::Callback(id)])
        .unwrap_err();
    match err {
        CallError::CallbackPropagated { symbol, .. } => assert_eq!(symbol, "run"),
        other => panic!("expected propagated callback error, got {}", other),
    }
}

// Handle identity and type queries across repeated returns of one pointer.
#[test]
fn returned_handles_answer_type_queries() {
    extern "C" fn get_button() -> *mut c_void {
        0x9000 as *mut c_void
    }

    let engine = Engine::new();
    engine.register_symbols("uilib", &[("get_button", get_button as *const ())]);

    use callbridge::registry::{ReleaseOps, TypeInfo};
    engine.types().register(TypeInfo {
        name: "Widget".into(),
        parent: None,
        release: ReleaseOps::Boxed { destructor: None },
    });
    engine.types().register(TypeInfo {
        name: "Button".into(),
        parent: Some("Widget".into()),
        release: ReleaseOps::Boxed { destructor: None },
    });

    let sig = Signature::new(
        vec![],
        TypeDesc::Handle {
            kind: HandleKind::Boxed,
            ownership: Ownership::Borrowed,
            type_name: "Button".into(),
            library: None,
            destructor: None,
        },
    );
    let a = engine.call("uilib", "get_button", &sig, &[]).unwrap();
    let b = engine.call("uilib", "get_button", &sig, &[]).unwrap();
    assert_eq!(a, b);

    match a {
        Value::Handle(w) => {
            assert!(w.is_instance_of("Button"));
            assert!(w.is_instance_of("Widget"));
            assert!(!w.is_instance_of("Window"));
        }
        other => panic!("expected handle, got {:?}", other),
    }
}
