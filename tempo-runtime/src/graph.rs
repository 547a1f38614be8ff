//! Call-graph snapshot types produced by a capture.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;
use std::time::Duration;

/// Identity of a profiled frame: where it lives and what it is called.
///
/// Equality is structural. Instrumentation sites build keys with
/// [`function_key!`](crate::function_key), so all fields are `'static`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    pub source_path: &'static str,
    pub line_number: u32,
    pub function_name: &'static str,
}

impl FunctionKey {
    pub const fn new(source_path: &'static str, line_number: u32, function_name: &'static str) -> Self {
        Self {
            source_path,
            line_number,
            function_name,
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}({})",
            self.source_path, self.line_number, self.function_name
        )
    }
}

/// Statistics for one caller -> callee edge.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallerStats {
    /// Calls through this edge that were not recursive re-entries.
    pub direct_call_count: u64,
    pub total_call_count: u64,
    pub exclusive_time: Duration,
    /// Wall time of non-recursive calls through this edge, children included.
    pub cumulative_time: Duration,
}

/// Aggregated statistics for one function within a capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStats {
    pub direct_call_count: u64,
    pub total_call_count: u64,
    pub exclusive_time: Duration,
    pub cumulative_time: Duration,
    pub callers: BTreeMap<FunctionKey, CallerStats>,
}

impl CallStats {
    fn tally(&mut self, elapsed: Duration, exclusive: Duration, recursive: bool) {
        self.total_call_count += 1;
        self.exclusive_time += exclusive;
        if !recursive {
            self.direct_call_count += 1;
            self.cumulative_time += elapsed;
        }
    }
}

impl CallerStats {
    fn tally(&mut self, elapsed: Duration, exclusive: Duration, recursive: bool) {
        self.total_call_count += 1;
        self.exclusive_time += exclusive;
        if !recursive {
            self.direct_call_count += 1;
            self.cumulative_time += elapsed;
        }
    }
}

/// Per-function statistics and caller sets for one capture.
///
/// Backed by a `BTreeMap` so iteration order is deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallGraph {
    entries: BTreeMap<FunctionKey, CallStats>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &FunctionKey) -> Option<&CallStats> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: FunctionKey, stats: CallStats) -> Option<CallStats> {
        self.entries.insert(key, stats)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FunctionKey, CallStats> {
        self.entries.iter()
    }

    /// Fold one completed frame into the graph.
    pub(crate) fn record(
        &mut self,
        key: FunctionKey,
        caller: Option<FunctionKey>,
        elapsed: Duration,
        exclusive: Duration,
        recursive: bool,
    ) {
        let stats = self.entries.entry(key).or_default();
        stats.tally(elapsed, exclusive, recursive);
        if let Some(caller) = caller {
            stats
                .callers
                .entry(caller)
                .or_default()
                .tally(elapsed, exclusive, recursive);
        }
    }
}

impl FromIterator<(FunctionKey, CallStats)> for CallGraph {
    fn from_iter<I: IntoIterator<Item = (FunctionKey, CallStats)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CallGraph {
    type Item = (&'a FunctionKey, &'a CallStats);
    type IntoIter = btree_map::Iter<'a, FunctionKey, CallStats>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
