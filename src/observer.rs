//! Observers notified after each instrumented call, and the per-breakpoint
//! registry that owns them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tempo_runtime::{FunctionKey, Profile};

use crate::config::Options;
use crate::deliver::DeliveryWorker;
use crate::error::Error;
use crate::identity::RunIdentity;
use crate::sinks::{PrintSink, StatisticsSink};
use crate::store::Store;

/// The observers a breakpoint can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObserverKind {
    /// Prints a short summary of each call.
    Print,
    /// Flattens each call graph and delivers it to a store.
    Statistics,
}

impl fmt::Display for ObserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObserverKind::Print => "print",
            ObserverKind::Statistics => "statistics",
        })
    }
}

/// What an observer is told about one instrumented call.
///
/// This is the capture result minus the functional output. Observers are
/// stored type-erased and outlive any one call's return type, so the output
/// stays with the caller; only the identity, the breakpointed function and
/// the profile are shared.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub identity: &'a RunIdentity,
    /// The breakpointed function.
    pub function: FunctionKey,
    pub profile: &'a Profile,
}

impl Subject<'_> {
    pub fn method_name(&self) -> &'static str {
        self.function.function_name
    }
}

pub trait Observer: Send + Sync {
    fn kind(&self) -> ObserverKind;

    /// Handle one call. Errors are returned to the breakpoint's caller next
    /// to the functional output.
    fn update(&self, subject: &Subject<'_>) -> Result<(), Error>;
}

/// Shared, lockable output stream for printing observers.
#[derive(Clone)]
pub struct Console(Arc<Mutex<Box<dyn Write + Send>>>);

impl Console {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write `text` and flush, holding the lock for the whole write.
    pub fn write_str(&self, text: &str) -> io::Result<()> {
        let mut out = self.0.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Console")
    }
}

/// Collaborators handed to observers when they are constructed.
#[derive(Clone)]
pub struct Environment {
    pub options: Arc<Options>,
    pub store: Option<Arc<dyn Store>>,
    /// Shared async worker. Async statistics sinks without one spawn their own.
    pub worker: Option<Arc<DeliveryWorker>>,
    pub console: Console,
}

impl Environment {
    pub fn new(options: Arc<Options>) -> Self {
        Self {
            options,
            store: None,
            worker: None,
            console: Console::default(),
        }
    }

    fn build(&self, kind: ObserverKind) -> Box<dyn Observer> {
        match kind {
            ObserverKind::Print => Box::new(PrintSink::new(self.console.clone())),
            ObserverKind::Statistics => Box::new(StatisticsSink::new(
                self.store.clone(),
                &self.options,
                self.worker.clone(),
            )),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("options", &self.options)
            .field("store", &self.store.is_some())
            .field("worker", &self.worker)
            .finish()
    }
}

/// Observers attached to one breakpoint, at most one per kind.
pub struct Registry {
    environment: Environment,
    observers: BTreeMap<ObserverKind, Box<dyn Observer>>,
}

impl Registry {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            observers: BTreeMap::new(),
        }
    }

    /// Construct and attach an observer of `kind`. Returns `false` if one was
    /// already attached, in which case nothing changes.
    pub fn attach(&mut self, kind: ObserverKind) -> bool {
        if self.observers.contains_key(&kind) {
            return false;
        }
        let observer = self.environment.build(kind);
        self.observers.insert(kind, observer);
        true
    }

    pub fn detach(&mut self, kind: ObserverKind) -> Result<Box<dyn Observer>, Error> {
        self.observers
            .remove(&kind)
            .ok_or(Error::ObserverNotAttached(kind))
    }

    pub fn contains(&self, kind: ObserverKind) -> bool {
        self.observers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ObserverKind> + '_ {
        self.observers.keys().copied()
    }

    /// Update every observer. The first failure stops the round; observers
    /// already updated keep what they did.
    pub fn notify(&self, subject: &Subject<'_>) -> Result<(), Error> {
        for (kind, observer) in &self.observers {
            tracing::debug!(
                observer = %kind,
                function = %subject.function,
                sample_id = %subject.identity.sample_id,
                "notifying observer"
            );
            observer.update(subject)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("observers", &self.observers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
