//! End-to-end behaviour of breakpoints against an in-memory spy store.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tempo::store::{Binding, Engine, Store};
use tempo::{
    Breakpoint, DeliveryWorker, EdgeRecord, Error, InsertFailure, ObserverKind, Options, Payload,
    TestContext, enter, function_key,
};
use tempo::observer::Console;

/// Records every payload it is handed.
struct Spy {
    engine: Engine,
    fail: bool,
    payloads: Mutex<Vec<Payload>>,
}

impl Spy {
    fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine,
            fail: false,
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn failing(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine,
            fail: true,
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<Payload> {
        self.payloads.lock().unwrap().clone()
    }

    fn records(&self) -> Vec<EdgeRecord> {
        self.payloads()
            .iter()
            .flat_map(|p| p.rows().cloned().collect::<Vec<_>>())
            .collect()
    }
}

impl Store for Spy {
    fn resolve(&self, database_name: &str) -> Result<Binding, Error> {
        Ok(Binding {
            database_name: database_name.to_owned(),
            url: format!("spy://{database_name}"),
            engine: self.engine,
        })
    }

    fn insert(&self, payload: &Payload, binding: &Binding) -> Result<(), InsertFailure> {
        if self.fail {
            return Err(InsertFailure::new(&binding.database_name, "connection refused"));
        }
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

fn g() -> u32 {
    let _g = enter!("g");
    1
}

fn h() -> u32 {
    let _g = enter!("h");
    2
}

/// f calls g once and h twice.
fn f(base: u32) -> u32 {
    base + g() + h() + h()
}

#[test]
fn f_g_h_gives_three_records() {
    let spy = Spy::new(Engine::Server);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .test_id("T-1")
        .wrap(function_key!("f"), f)
        .unwrap();

    assert_eq!(bp.call(10).unwrap(), 15);

    let payloads = spy.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(matches!(payloads[0], Payload::Rows(_)));

    let records = spy.records();
    assert_eq!(records.len(), 3);

    let root = records.iter().find(|r| r.child_function_name == "f").unwrap();
    assert_eq!(root.parent_path, "~");
    assert_eq!(root.parent_line_number, 0);
    assert_eq!(root.parent_function_name, root.sample_id);
    assert_eq!(root.sample_id.len(), 8);

    let g = records.iter().find(|r| r.child_function_name == "g").unwrap();
    assert_eq!(g.parent_function_name, "f");
    assert_eq!(g.number_of_calls, 1);

    let h = records.iter().find(|r| r.child_function_name == "h").unwrap();
    assert_eq!(h.parent_function_name, "f");
    assert_eq!(h.number_of_calls, 2);

    for r in &records {
        assert_eq!(r.test_id, "T-1");
        assert_eq!(r.name_of_method_under_test, "f");
        assert_eq!(r.epoch_timestamp, root.epoch_timestamp);
        assert_eq!(r.total_response_time, root.total_response_time);
    }
}

#[test]
fn each_call_gets_a_fresh_sample_id() {
    let spy = Spy::new(Engine::Server);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("f"), f)
        .unwrap();
    bp.call(0).unwrap();
    bp.call(0).unwrap();

    let payloads = spy.payloads();
    let samples: Vec<&str> = payloads
        .iter()
        .map(|p| p.rows().next().unwrap().sample_id.as_str())
        .collect();
    assert_eq!(samples.len(), 2);
    assert_ne!(samples[0], samples[1]);
}

#[test]
fn disabled_or_unobserved_calls_touch_nothing() {
    let spy = Spy::new(Engine::Serverless);
    let calls = Arc::new(Mutex::new(0));

    let counted = {
        let calls = calls.clone();
        move |n: u32| {
            *calls.lock().unwrap() += 1;
            assert!(!tempo_runtime::is_capturing());
            n
        }
    };

    let disabled = Breakpoint::builder()
        .enabled(false)
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("counted"), counted.clone())
        .unwrap();
    assert_eq!(disabled.call(1).unwrap(), 1);

    let unobserved = Breakpoint::builder()
        .store(spy.clone())
        .wrap(function_key!("counted"), counted.clone())
        .unwrap();
    assert_eq!(unobserved.call(2).unwrap(), 2);

    let switched_off = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .options(Options {
            enable_intrusive_profiling: false,
            ..Options::default()
        })
        .wrap(function_key!("counted"), counted)
        .unwrap();
    assert_eq!(switched_off.call(3).unwrap(), 3);

    assert_eq!(*calls.lock().unwrap(), 3);
    assert!(spy.payloads().is_empty());
}

/// Root plus `fanout` distinct children, each reached once from the root.
fn wide(fanout: usize) -> usize {
    // Distinct keys need distinct `'static` names and lines; leak a fixed set.
    let keys: Vec<tempo::FunctionKey> = (0..fanout)
        .map(|i| {
            let name: &'static str = Box::leak(format!("leaf_{i}").into_boxed_str());
            tempo::FunctionKey::new("tests/breakpoint.rs", i as u32 + 1_000, name)
        })
        .collect();
    for key in keys {
        let _g = tempo::enter(key);
    }
    fanout
}

#[test]
fn serverless_delivery_chunks_at_999() {
    let spy = Spy::new(Engine::Serverless);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("wide"), wide)
        .unwrap();

    // 1999 children + 1 root = 2000 records.
    assert_eq!(bp.call(1_999).unwrap(), 1_999);

    let payloads = spy.payloads();
    let sizes: Vec<usize> = payloads.iter().map(Payload::len).collect();
    assert_eq!(sizes, vec![999, 999, 2]);
    for payload in &payloads {
        assert!(matches!(payload, Payload::Batched(outer) if outer.len() == 1));
    }
    assert_eq!(spy.records().iter().filter(|r| r.parent_path == "~").count(), 1);
}

#[test]
fn server_delivery_is_never_chunked() {
    let spy = Spy::new(Engine::Server);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("wide"), wide)
        .unwrap();
    bp.call(1_999).unwrap();
    let sizes: Vec<usize> = spy.payloads().iter().map(Payload::len).collect();
    assert_eq!(sizes, vec![2_000]);
}

#[test]
fn sync_insert_failure_keeps_the_output() {
    let spy = Spy::failing(Engine::Server);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy)
        .database_name("orders")
        .wrap(function_key!("f"), f)
        .unwrap();

    let failure = bp.call(10).unwrap_err();
    assert!(
        matches!(&failure.error, Error::Insert(insert) if insert.database == "orders"),
        "{failure:?}"
    );
    assert_eq!(failure.output, Some(15));
}

#[test]
fn async_insert_failure_does_not_reach_the_caller() {
    let spy = Spy::failing(Engine::Serverless);
    let worker = Arc::new(DeliveryWorker::spawn(8).unwrap());
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy)
        .delivery_worker(worker.clone())
        .options(Options {
            enable_asynchronous_payload_delivery: true,
            ..Options::default()
        })
        .wrap(function_key!("f"), f)
        .unwrap();

    assert_eq!(bp.call(10).unwrap(), 15);
    worker.flush();
    let stats = worker.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 0);
}

#[test]
fn async_delivery_arrives_after_flush() {
    let spy = Spy::new(Engine::Server);
    let worker = Arc::new(DeliveryWorker::spawn(8).unwrap());
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .delivery_worker(worker.clone())
        .options(Options {
            enable_asynchronous_payload_delivery: true,
            ..Options::default()
        })
        .wrap(function_key!("f"), f)
        .unwrap();

    for _ in 0..3 {
        bp.call(1).unwrap();
    }
    worker.flush();
    assert_eq!(spy.payloads().len(), 3);
    assert_eq!(worker.stats().rows, 9);
}

#[test]
fn missing_store_is_an_invalid_observer() {
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .options(Options {
            connection_url: Some("postgresql://db.internal:5432".into()),
            ..Options::default()
        })
        .wrap(function_key!("f"), f)
        .unwrap();

    let failure = bp.call(1).unwrap_err();
    assert!(
        matches!(failure.error, Error::InvalidObserver { kind: ObserverKind::Statistics, .. }),
        "{failure:?}"
    );
    assert_eq!(failure.output, Some(6));
}

#[test]
fn target_panics_propagate_unchanged() {
    let spy = Spy::new(Engine::Server);
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("explode"), |_: ()| -> u32 {
            g();
            panic!("boom");
        })
        .unwrap();

    let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| bp.call(())))
        .unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert!(spy.payloads().is_empty());
    assert!(!tempo_runtime::is_capturing());
}

#[test]
fn context_supplies_identity_between_tests() {
    let spy = Spy::new(Engine::Server);
    let ctx = TestContext::new();
    ctx.set_database_name("nightly");
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .context(ctx.clone())
        .wrap(function_key!("f"), f)
        .unwrap();

    let first = ctx.start("login");
    bp.call(0).unwrap();
    let second = ctx.start("logout");
    bp.call(0).unwrap();

    let payloads = spy.payloads();
    let firsts: Vec<&EdgeRecord> = payloads.iter().map(|p| p.rows().next().unwrap()).collect();
    assert_eq!(firsts[0].test_id, first);
    assert_eq!(firsts[0].test_case_name, "login");
    assert_eq!(firsts[1].test_id, second);
    assert_eq!(firsts[1].test_case_name, "logout");
}

struct Twice;

impl tempo::ExecutionWrapper for Twice {
    fn execute(&self, target: &mut dyn FnMut()) {
        target();
        target();
    }
}

#[test]
fn execution_wrapper_runs_the_target_once() {
    let spy = Spy::new(Engine::Server);
    let calls = Arc::new(Mutex::new(0));
    let counted = {
        let calls = calls.clone();
        move |n: u32| {
            *calls.lock().unwrap() += 1;
            f(n)
        }
    };
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .execution_wrapper(Twice)
        .wrap(function_key!("counted"), counted)
        .unwrap();

    assert_eq!(bp.call(0).unwrap(), 5);
    assert_eq!(*calls.lock().unwrap(), 1);
    // g and h hang off the root frame.
    let records = spy.records();
    let g = records.iter().find(|r| r.child_function_name == "g").unwrap();
    assert_eq!(g.parent_function_name, "counted");
}

#[test]
fn closure_wrappers_see_the_target() {
    let spy = Spy::new(Engine::Server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy)
        .execution_wrapper(move |target: &mut dyn FnMut()| {
            log.lock().unwrap().push("before");
            target();
            log.lock().unwrap().push("after");
        })
        .wrap(function_key!("f"), f)
        .unwrap();

    assert_eq!(bp.call(1).unwrap(), 6);
    assert_eq!(*seen.lock().unwrap(), vec!["before", "after"]);
}

#[test]
fn wrapper_that_skips_the_target_reports_it() {
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(Spy::new(Engine::Server))
        .execution_wrapper(|_: &mut dyn FnMut()| {})
        .wrap(function_key!("f"), f)
        .unwrap();

    let failure = bp.call(1).unwrap_err();
    assert!(matches!(failure.error, Error::TargetNotInvoked));
    assert!(failure.output.is_none());
}

#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn print_observer_writes_a_summary() {
    let buffer = Buffer::default();
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Print)
        .console(Console::new(buffer.clone()))
        .test_case_name("printing")
        .wrap(function_key!("f"), f)
        .unwrap();
    bp.call(0).unwrap();

    let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains("method_name=f"), "{text}");
    assert!(text.contains("test_case_name=printing"), "{text}");
}

#[test]
fn nested_breakpoints_capture_their_own_frames() {
    let spy = Spy::new(Engine::Server);
    let inner = Arc::new(
        Breakpoint::builder()
            .observer(ObserverKind::Statistics)
            .store(spy.clone())
            .wrap(function_key!("inner"), |_: ()| h())
            .unwrap(),
    );
    let outer = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("outer"), {
            let inner = inner.clone();
            move |_: ()| g() + inner.call(()).unwrap()
        })
        .unwrap();

    assert_eq!(outer.call(()).unwrap(), 3);

    let payloads = spy.payloads();
    assert_eq!(payloads.len(), 2);
    let names = |p: &Payload| -> Vec<String> {
        let mut names: Vec<String> = p.rows().map(|r| r.child_function_name.clone()).collect();
        names.sort();
        names
    };
    // Inner finishes first.
    assert_eq!(names(&payloads[0]), vec!["h", "inner"]);
    assert!(names(&payloads[1]).contains(&"g".to_owned()));
    assert!(!names(&payloads[1]).contains(&"h".to_owned()));
}
