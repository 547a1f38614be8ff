//! One timed, call-graph-recording execution of a target.

use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use crate::collector::{self, enter};
use crate::graph::{CallGraph, FunctionKey};

/// Why a capture could not produce a call graph.
///
/// The target has already run when any of these is reported; its output is
/// returned alongside in [`CaptureFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Guards were still alive when the capture closed (moved out of the target).
    OpenFrames(usize),
    /// The root frame never completed inside the capture.
    MissingRootFrame(FunctionKey),
    /// The session was closed or replaced by someone else.
    SessionLost,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::OpenFrames(n) => {
                write!(f, "{n} frame(s) still open when the capture closed")
            }
            CaptureError::MissingRootFrame(key) => {
                write!(f, "root frame {key} was not recorded")
            }
            CaptureError::SessionLost => write!(f, "capture session was lost"),
        }
    }
}

impl Error for CaptureError {}

/// Timing and call graph of one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Wall-clock time at which the target started.
    pub started_at: SystemTime,
    pub total_response_time: Duration,
    pub call_graph: CallGraph,
}

/// Output of a successful capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult<R> {
    pub functional_output: R,
    pub profile: Profile,
}

impl<R> CaptureResult<R> {
    /// Replace the functional output, keeping the profile.
    pub fn map<U>(self, f: impl FnOnce(R) -> U) -> CaptureResult<U> {
        CaptureResult {
            functional_output: f(self.functional_output),
            profile: self.profile,
        }
    }
}

/// A capture that ran its target but could not produce a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFailure<R> {
    pub output: R,
    pub error: CaptureError,
}

/// Closes (or discards, on unwind) the session it opened.
struct SessionGuard {
    id: u64,
    closed: bool,
}

impl SessionGuard {
    fn open() -> Self {
        Self {
            id: collector::open_session(),
            closed: false,
        }
    }

    fn close(mut self) -> Result<CallGraph, CaptureError> {
        self.closed = true;
        collector::close_session(self.id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.closed {
            collector::discard_session(self.id);
        }
    }
}

/// A single-shot capture rooted at `root`.
///
/// ```
/// use tempo_runtime::{Capture, function_key};
///
/// fn parse(input: &str) -> usize {
///     let _g = tempo_runtime::enter!("parse");
///     input.len()
/// }
///
/// let result = Capture::new(function_key!("main")).run(|| parse("abc")).unwrap();
/// assert_eq!(result.functional_output, 3);
/// assert_eq!(result.profile.call_graph.len(), 2);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    root: FunctionKey,
}

impl Capture {
    pub fn new(root: FunctionKey) -> Self {
        Self { root }
    }

    pub fn root(&self) -> FunctionKey {
        self.root
    }

    /// Run `target` exactly once inside a fresh session.
    ///
    /// A panic in `target` discards the session and resumes unwinding
    /// unchanged. A capture fault never re-runs the target.
    ///
    /// Guards that leak or migrate are drained when their enclosing frame
    /// exits, so through [`enter`] alone a fault only arises when the
    /// session bookkeeping itself is broken. Callers must still handle it.
    pub fn run<R>(self, target: impl FnOnce() -> R) -> Result<CaptureResult<R>, CaptureFailure<R>> {
        let session = SessionGuard::open();
        let started_at = SystemTime::now();
        let clock = Instant::now();
        let output = {
            let _root = enter(self.root);
            target()
        };
        let total_response_time = clock.elapsed();

        let call_graph = match session.close() {
            Ok(graph) => graph,
            Err(error) => return Err(CaptureFailure { output, error }),
        };
        if call_graph.get(&self.root).is_none() {
            return Err(CaptureFailure {
                output,
                error: CaptureError::MissingRootFrame(self.root),
            });
        }

        Ok(CaptureResult {
            functional_output: output,
            profile: Profile {
                started_at,
                total_response_time,
                call_graph,
            },
        })
    }
}
