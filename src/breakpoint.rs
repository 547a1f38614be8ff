//! The instrumentation boundary around a function under test.

use std::fmt;
use std::sync::Arc;

use tempo_runtime::{Capture, CaptureError, FunctionKey, Profile};

use crate::config::Options;
use crate::context::TestContext;
use crate::deliver::DeliveryWorker;
use crate::error::Error;
use crate::identity::{DEFAULT_TEST_ID, RunIdentity};
use crate::observer::{Console, Environment, Observer, ObserverKind, Registry, Subject};
use crate::store::{self, Store};

/// Runs the bound target in a caller-chosen way, such as inside a retry or a
/// transaction. The target may be invoked at most once; later calls do
/// nothing.
pub trait ExecutionWrapper: Send + Sync {
    fn execute(&self, target: &mut dyn FnMut());
}

impl<W> ExecutionWrapper for W
where
    W: Fn(&mut dyn FnMut()) + Send + Sync,
{
    fn execute(&self, target: &mut dyn FnMut()) {
        self(target)
    }
}

/// The target ran (or was never invoked), but profiling it failed.
///
/// `output` holds the target's result whenever it produced one. Profiling
/// never suppresses it.
pub struct ProfilingFailure<R> {
    pub output: Option<R>,
    pub error: Error,
}

impl<R> ProfilingFailure<R> {
    pub fn into_output(self) -> Option<R> {
        self.output
    }
}

impl<R> fmt::Debug for ProfilingFailure<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingFailure")
            .field("has_output", &self.output.is_some())
            .field("error", &self.error)
            .finish()
    }
}

impl<R> fmt::Display for ProfilingFailure<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profiling failed: {}", self.error)
    }
}

impl<R> std::error::Error for ProfilingFailure<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Configures a [`Breakpoint`].
///
/// ```no_run
/// use tempo::{Breakpoint, ObserverKind, function_key};
///
/// fn checkout(items: u32) -> u32 {
///     let _g = tempo::enter!("checkout_inner");
///     items * 2
/// }
///
/// let bp = Breakpoint::builder()
///     .observer(ObserverKind::Statistics)
///     .test_case_name("checkout")
///     .wrap(function_key!("checkout"), checkout)
///     .unwrap();
/// let total = bp.call(3).unwrap();
/// assert_eq!(total, 6);
/// ```
#[must_use]
pub struct BreakpointBuilder {
    enabled: bool,
    observers: Vec<ObserverKind>,
    database_name: Option<String>,
    test_case_name: Option<String>,
    test_id: Option<String>,
    context: Option<TestContext>,
    execution_wrapper: Option<Box<dyn ExecutionWrapper>>,
    options: Option<Arc<Options>>,
    store: Option<Arc<dyn Store>>,
    worker: Option<Arc<DeliveryWorker>>,
    console: Option<Console>,
}

impl Default for BreakpointBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            observers: Vec::new(),
            database_name: None,
            test_case_name: None,
            test_id: None,
            context: None,
            execution_wrapper: None,
            options: None,
            store: None,
            worker: None,
            console: None,
        }
    }
}

impl BreakpointBuilder {
    /// When `false`, every call goes straight to the target.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn observer(mut self, kind: ObserverKind) -> Self {
        self.observers.push(kind);
        self
    }

    pub fn observers(mut self, kinds: impl IntoIterator<Item = ObserverKind>) -> Self {
        self.observers.extend(kinds);
        self
    }

    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    pub fn test_case_name(mut self, name: impl Into<String>) -> Self {
        self.test_case_name = Some(name.into());
        self
    }

    pub fn test_id(mut self, id: impl Into<String>) -> Self {
        self.test_id = Some(id.into());
        self
    }

    /// Ambient identity consulted for fields not set on the builder.
    pub fn context(mut self, context: TestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn execution_wrapper(mut self, wrapper: impl ExecutionWrapper + 'static) -> Self {
        self.execution_wrapper = Some(Box::new(wrapper));
        self
    }

    /// Options in effect. Defaults to the process-wide [`Options::global`].
    pub fn options(mut self, options: impl Into<Arc<Options>>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Store for statistics. Defaults to the bundled store for the options'
    /// connection URL, when there is one.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Worker shared by asynchronous statistics sinks.
    pub fn delivery_worker(mut self, worker: Arc<DeliveryWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Where print sinks write. Defaults to stdout.
    pub fn console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    /// Wrap `function`, identified by `key`.
    ///
    /// Fails with [`Error::InstrumentationTarget`] when `key` cannot name a
    /// frame: empty function name or source path, or control characters in
    /// the name. Names like `<impl Display for Cart>::fmt` are accepted.
    pub fn wrap<F>(self, key: FunctionKey, function: F) -> Result<Breakpoint<F>, Error> {
        validate_target(&key)?;

        let options = self.options.unwrap_or_else(Options::global);
        let store = match self.store {
            Some(store) => Some(store),
            None => match store::open_store(&options) {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::debug!(function = %key, error = %e, "no bundled store for breakpoint");
                    None
                }
            },
        };
        let environment = Environment {
            options: Arc::clone(&options),
            store,
            worker: self.worker,
            console: self.console.unwrap_or_default(),
        };
        let mut registry = Registry::new(environment);
        for kind in self.observers {
            registry.attach(kind);
        }

        Ok(Breakpoint {
            function,
            key,
            enabled: self.enabled,
            database_name: self.database_name,
            test_case_name: self.test_case_name,
            test_id: self.test_id,
            context: self.context,
            execution_wrapper: self.execution_wrapper,
            options,
            registry,
        })
    }
}

fn validate_target(key: &FunctionKey) -> Result<(), Error> {
    let reason = if key.function_name.is_empty() {
        "function name is empty".to_owned()
    } else if key.function_name.chars().any(char::is_control) {
        format!("function name {:?} contains control characters", key.function_name)
    } else if key.source_path.is_empty() {
        format!("source path of `{}` is empty", key.function_name)
    } else {
        return Ok(());
    };
    Err(Error::InstrumentationTarget { reason })
}

/// A function wrapped for intrusive profiling.
///
/// Each [`call`](Breakpoint::call) either goes straight to the function or,
/// when enabled and observed, runs it once inside a [`Capture`] and notifies
/// the attached observers.
pub struct Breakpoint<F> {
    function: F,
    key: FunctionKey,
    enabled: bool,
    database_name: Option<String>,
    test_case_name: Option<String>,
    test_id: Option<String>,
    context: Option<TestContext>,
    execution_wrapper: Option<Box<dyn ExecutionWrapper>>,
    options: Arc<Options>,
    registry: Registry,
}

impl Breakpoint<()> {
    pub fn builder() -> BreakpointBuilder {
        BreakpointBuilder::default()
    }
}

impl<F> Breakpoint<F> {
    pub fn key(&self) -> FunctionKey {
        self.key
    }

    /// Attach an observer of `kind`; a second attach of the same kind is a no-op.
    pub fn attach(&mut self, kind: ObserverKind) -> bool {
        self.registry.attach(kind)
    }

    pub fn detach(&mut self, kind: ObserverKind) -> Result<Box<dyn Observer>, Error> {
        self.registry.detach(kind)
    }

    pub fn observers(&self) -> Vec<ObserverKind> {
        self.registry.kinds().collect()
    }

    /// Whether the next call will be captured.
    pub fn is_instrumenting(&self) -> bool {
        self.enabled && self.options.enable_intrusive_profiling && !self.registry.is_empty()
    }

    /// Identity for one call: builder value, else test context, else default.
    /// Draws a fresh sample id.
    pub fn run_identity(&self) -> RunIdentity {
        let ambient = self
            .context
            .as_ref()
            .map(TestContext::current)
            .unwrap_or_default();
        RunIdentity::new(
            self.test_id
                .clone()
                .or(ambient.test_id)
                .unwrap_or_else(|| DEFAULT_TEST_ID.to_owned()),
            self.test_case_name
                .clone()
                .or(ambient.test_case_name)
                .unwrap_or_else(|| self.options.test_case_name.clone()),
            self.database_name
                .clone()
                .or(ambient.database_name)
                .unwrap_or_else(|| self.options.database_name.clone()),
        )
    }

    /// Call the function with `args`.
    ///
    /// Uninstrumented calls always return `Ok`. An instrumented call returns
    /// `Err` when capture or an observer failed; the error still carries the
    /// function's output. Panics in the function propagate unchanged.
    pub fn call<A, R>(&self, args: A) -> Result<R, ProfilingFailure<R>>
    where
        F: Fn(A) -> R,
    {
        if !self.is_instrumenting() {
            return Ok((self.function)(args));
        }

        let identity = self.run_identity();
        let (output, profile) = self.capture(args);
        self.settle(&identity, output, profile)
    }

    /// Turn a capture outcome into the caller's result, notifying observers
    /// only when a profile exists.
    fn settle<R>(
        &self,
        identity: &RunIdentity,
        output: Option<R>,
        profile: Result<Profile, CaptureError>,
    ) -> Result<R, ProfilingFailure<R>> {
        let Some(output) = output else {
            return Err(ProfilingFailure {
                output: None,
                error: Error::TargetNotInvoked,
            });
        };
        let profile = match profile {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(function = %self.key, error = %e, "capture failed, nothing delivered");
                return Err(ProfilingFailure {
                    output: Some(output),
                    error: e.into(),
                });
            }
        };

        let subject = Subject {
            identity,
            function: self.key,
            profile: &profile,
        };
        match self.registry.notify(&subject) {
            Ok(()) => Ok(output),
            Err(error) => Err(ProfilingFailure {
                output: Some(output),
                error,
            }),
        }
    }

    fn capture<A, R>(&self, args: A) -> (Option<R>, Result<Profile, CaptureError>)
    where
        F: Fn(A) -> R,
    {
        let capture = Capture::new(self.key);
        let Some(wrapper) = &self.execution_wrapper else {
            return match capture.run(|| (self.function)(args)) {
                Ok(result) => (Some(result.functional_output), Ok(result.profile)),
                Err(failure) => (Some(failure.output), Err(failure.error)),
            };
        };

        let mut args = Some(args);
        let mut output = None;
        let outcome = capture.run(|| {
            let mut bound = || {
                if let Some(args) = args.take() {
                    output = Some((self.function)(args));
                }
            };
            wrapper.execute(&mut bound);
        });
        let profile = match outcome {
            Ok(result) => Ok(result.profile),
            Err(failure) => Err(failure.error),
        };
        (output, profile)
    }
}

impl<F> fmt::Debug for Breakpoint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("key", &self.key)
            .field("enabled", &self.enabled)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
