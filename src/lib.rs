//! Intrusive call profiling.
//!
//! A [`Breakpoint`] wraps a function. Each call it instruments runs inside a
//! [`tempo_runtime::Capture`]; the resulting call graph is handed to the
//! attached observers, which print it or flatten it into [`EdgeRecord`]s and
//! deliver them to a [`Store`].

pub mod breakpoint;
pub mod config;
pub mod context;
pub mod deliver;
pub mod error;
pub mod flatten;
pub mod identity;
pub mod logging;
pub mod observer;
pub mod sinks;
pub mod store;

pub use breakpoint::{Breakpoint, BreakpointBuilder, ExecutionWrapper, ProfilingFailure};
pub use config::Options;
pub use context::{TestContext, TestIdentity};
pub use deliver::{DeliveryJob, DeliveryStats, DeliveryWorker, Payload, SERVERLESS_PARAMETER_CEILING};
pub use error::{Error, InsertFailure};
pub use flatten::{EdgeRecord, Flattener};
pub use identity::RunIdentity;
pub use observer::{Console, Environment, Observer, ObserverKind, Registry, Subject};
pub use store::{Binding, Engine, Store};

pub use tempo_runtime::{FunctionKey, enter, function_key};
