//! Breakpoints built without explicit options follow the process
//! configuration. Kept in its own binary: it sets process environment before
//! the options are first loaded.

use std::sync::{Arc, Mutex};

use tempo::store::{Binding, Engine, Store};
use tempo::{Breakpoint, Error, InsertFailure, ObserverKind, Options, Payload, enter, function_key};

#[derive(Default)]
struct Spy {
    inserts: Mutex<usize>,
}

impl Store for Spy {
    fn resolve(&self, database_name: &str) -> Result<Binding, Error> {
        Ok(Binding {
            database_name: database_name.to_owned(),
            url: format!("spy://{database_name}"),
            engine: Engine::Server,
        })
    }

    fn insert(&self, _payload: &Payload, _binding: &Binding) -> Result<(), InsertFailure> {
        *self.inserts.lock().unwrap() += 1;
        Ok(())
    }
}

fn g() -> u32 {
    let _g = enter!("g");
    1
}

fn f(base: u32) -> u32 {
    base + g()
}

#[test]
fn kill_switch_in_config_reaches_default_breakpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("tempo.toml");
    std::fs::write(&config, "enable_intrusive_profiling = false\n").unwrap();
    // SAFETY: the only test in this binary, and it runs before anything reads
    // the environment.
    unsafe {
        std::env::set_var("TEMPO_CONFIG", &config);
        std::env::set_var("TEMPO_DATABASE_NAME", "from-env");
        std::env::remove_var("TEMPO_ENABLE_INTRUSIVE_PROFILING");
    }

    let spy = Arc::new(Spy::default());
    let bp = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .wrap(function_key!("f"), f)
        .unwrap();

    assert!(!Options::global().enable_intrusive_profiling);
    assert!(!bp.is_instrumenting());
    assert_eq!(bp.call(4).unwrap(), 5);
    assert_eq!(*spy.inserts.lock().unwrap(), 0);
    assert_eq!(bp.run_identity().database_name, "from-env");

    // Explicit options still override the process configuration.
    let forced = Breakpoint::builder()
        .observer(ObserverKind::Statistics)
        .store(spy.clone())
        .options(Options::default())
        .wrap(function_key!("f"), f)
        .unwrap();
    assert_eq!(forced.call(4).unwrap(), 5);
    assert_eq!(*spy.inserts.lock().unwrap(), 1);
}
