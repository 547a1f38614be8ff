//! Thread-local call-graph collector with RAII guards.
//!
//! Each instrumented function calls `enter(key)`. When a capture session is
//! open on the current thread, this pushes a `StackEntry` onto the session's
//! call stack and returns an active `Guard`. When the guard drops (on any exit
//! path, including unwinding), it pops the entry, computes elapsed and
//! exclusive time, propagates elapsed time to the parent's children total, and
//! folds the frame into the session's `CallGraph` under its caller.
//!
//! Without an open session `enter()` returns an inert guard: no stack push,
//! no allocation, nothing recorded on drop.
//!
//! Sessions nest. `Capture::run` opens one per capture; a capture started
//! while another is open on the same thread owns every frame entered until it
//! closes. Guards remember the session they entered, so a frame that outlives
//! an inner session still lands in the right graph (or nowhere).
//!
//! Thread-locality: sessions are thread-local. A guard dropped on a different
//! thread than it entered on (futures migrated between runtime workers)
//! records nothing; its stack entry is drained as an orphan when the next
//! enclosing frame exits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::capture::CaptureError;
use crate::graph::{CallGraph, FunctionKey};

/// Session ids are process-unique so a guard can never write into a session
/// that replaced the one it entered.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Entry on a session's call stack.
struct StackEntry {
    key: FunctionKey,
    /// Unique within the session; ties a guard to exactly one entry.
    serial: u64,
    start: Instant,
    children: Duration,
    /// The same key was already on the stack when this frame entered.
    recursive: bool,
    depth: usize,
}

/// Recording state for one open capture.
pub(crate) struct Session {
    id: u64,
    next_serial: u64,
    stack: Vec<StackEntry>,
    /// Frames per key currently on `stack`.
    active: HashMap<FunctionKey, usize>,
    graph: CallGraph,
}

impl Session {
    fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            next_serial: 0,
            stack: Vec::new(),
            active: HashMap::new(),
            graph: CallGraph::new(),
        }
    }

    fn push(&mut self, key: FunctionKey, start: Instant) -> (u64, usize) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let depth = self.stack.len();
        let open = self.active.entry(key).or_default();
        let recursive = *open > 0;
        *open += 1;
        self.stack.push(StackEntry {
            key,
            serial,
            start,
            children: Duration::ZERO,
            recursive,
            depth,
        });
        (serial, depth)
    }

    fn exit(&mut self, key: FunctionKey, serial: u64, depth: usize) {
        // Drain orphaned entries left by guards that migrated threads or leaked.
        while self
            .stack
            .last()
            .is_some_and(|e| e.serial != serial && e.depth > depth)
        {
            self.pop();
        }

        // Our own entry may already have been drained by an enclosing frame
        // that exited first; the frame is then simply not recorded.
        if !self.stack.last().is_some_and(|e| e.serial == serial) {
            return;
        }
        let Some(entry) = self.pop() else {
            return;
        };

        let elapsed = entry.start.elapsed();
        let exclusive = elapsed.saturating_sub(entry.children);
        let caller = self.stack.last_mut().map(|parent| {
            parent.children += elapsed;
            parent.key
        });
        self.graph
            .record(key, caller, elapsed, exclusive, entry.recursive);
    }

    fn pop(&mut self) -> Option<StackEntry> {
        let entry = self.stack.pop()?;
        if let Some(open) = self.active.get_mut(&entry.key) {
            *open = open.saturating_sub(1);
        }
        Some(entry)
    }
}

thread_local! {
    static SESSIONS: RefCell<Vec<Session>> = RefCell::new(Vec::new());
}

/// Open a new innermost session on this thread and return its id.
pub(crate) fn open_session() -> u64 {
    let session = Session::new();
    let id = session.id;
    SESSIONS.with(|sessions| sessions.borrow_mut().push(session));
    id
}

/// Close the session with `id`, returning its graph.
///
/// The session must be the innermost one; anything else means a nested
/// capture leaked past its own `run`.
pub(crate) fn close_session(id: u64) -> Result<CallGraph, CaptureError> {
    SESSIONS
        .try_with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            match sessions.last() {
                Some(top) if top.id == id => {}
                _ => {
                    sessions.retain(|s| s.id != id);
                    return Err(CaptureError::SessionLost);
                }
            }
            let session = sessions.pop().ok_or(CaptureError::SessionLost)?;
            if !session.stack.is_empty() {
                return Err(CaptureError::OpenFrames(session.stack.len()));
            }
            Ok(session.graph)
        })
        .unwrap_or(Err(CaptureError::SessionLost))
}

/// Drop the session with `id` without producing a graph. Used on unwind.
pub(crate) fn discard_session(id: u64) {
    let _ = SESSIONS.try_with(|sessions| {
        sessions.borrow_mut().retain(|s| s.id != id);
    });
}

/// Whether a capture session is open on the current thread.
pub fn is_capturing() -> bool {
    SESSIONS
        .try_with(|sessions| !sessions.borrow().is_empty())
        .unwrap_or(false)
}

/// Where an active guard entered.
#[derive(Debug)]
struct Entered {
    session: u64,
    serial: u64,
    depth: usize,
    thread: ThreadId,
}

/// RAII frame guard. Records the frame into its session on drop.
#[derive(Debug)]
#[must_use = "dropping the guard immediately records a ~0s frame; bind it with `let _guard = ...`"]
pub struct Guard {
    key: FunctionKey,
    entered: Option<Entered>,
}

// Guard must be Send so async runtimes can move futures containing guards
// across worker threads. Assert it at compile time to catch regressions
// (e.g. adding an Rc or Cell field).
const _: () = {
    fn _assert_send<T: Send>() {}
    fn _check() {
        _assert_send::<Guard>();
    }
};

impl Guard {
    /// Whether this guard is recording into a capture session.
    pub fn is_active(&self) -> bool {
        self.entered.is_some()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let Some(entered) = self.entered.take() else {
            return;
        };
        if std::thread::current().id() != entered.thread {
            // Migrated: the entering thread's session is unreachable from here.
            return;
        }
        let _ = SESSIONS.try_with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            if let Some(session) = sessions.iter_mut().rev().find(|s| s.id == entered.session) {
                session.exit(self.key, entered.serial, entered.depth);
            }
        });
    }
}

/// Start a frame. Returns a Guard that records the frame on drop.
///
/// Inert unless a capture session is open on the current thread.
pub fn enter(key: FunctionKey) -> Guard {
    let entered = SESSIONS
        .try_with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            let session = sessions.last_mut()?;
            let (serial, depth) = session.push(key, Instant::now());
            Some(Entered {
                session: session.id,
                serial,
                depth,
                thread: std::thread::current().id(),
            })
        })
        .ok()
        .flatten();
    Guard { key, entered }
}

/// CPU-bound workload for testing: hash a buffer `iterations` times.
#[cfg(test)]
pub(crate) fn burn_cpu(iterations: u64) {
    let mut buf = [0x42u8; 4096];
    for i in 0..iterations {
        for b in &mut buf {
            *b = b.wrapping_add(i as u8).wrapping_mul(31);
        }
    }
    std::hint::black_box(&buf);
}
