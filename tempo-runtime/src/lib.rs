//! Call-graph capture runtime.
//!
//! Instrumented functions open a frame with [`enter!`] (or [`enter`] with an
//! explicit [`FunctionKey`]); [`Capture::run`] executes a target once and
//! returns the call graph of every frame entered while it ran.

mod capture;
mod collector;
mod graph;

pub use capture::{Capture, CaptureError, CaptureFailure, CaptureResult, Profile};
pub use collector::{Guard, enter, is_capturing};
pub use graph::{CallGraph, CallStats, CallerStats, FunctionKey};

/// Build a [`FunctionKey`] for `name` at the current source location.
#[macro_export]
macro_rules! function_key {
    ($name:expr) => {
        $crate::FunctionKey::new(file!(), line!(), $name)
    };
}

/// Open a frame named `name` at the current source location.
///
/// Bind the result: `let _guard = tempo_runtime::enter!("parse");`
#[macro_export]
macro_rules! enter {
    ($name:expr) => {
        $crate::enter($crate::function_key!($name))
    };
}
