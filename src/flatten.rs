//! Turns a call graph into parent/child edge records.

use std::collections::btree_map;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tempo_runtime::{CallGraph, CallStats, CallerStats, FunctionKey};

use crate::identity::RunIdentity;

/// Parent path of the synthetic edge that anchors the entry function.
pub const ROOT_PARENT_PATH: &str = "~";
/// Parent line number of the synthetic root edge.
pub const ROOT_PARENT_LINE: u32 = 0;

/// One (child, caller) edge of a profiled invocation.
///
/// Times are in seconds. `number_of_calls`, `total_time` and
/// `cumulative_time` describe the child across the whole invocation, not
/// just the calls made through this edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeRecord {
    pub test_id: String,
    pub sample_id: String,
    pub test_case_name: String,
    pub name_of_method_under_test: String,
    pub epoch_timestamp: f64,
    pub human_timestamp: DateTime<Local>,
    pub child_path: String,
    pub child_line_number: u32,
    pub child_function_name: String,
    pub parent_path: String,
    pub parent_line_number: u32,
    pub parent_function_name: String,
    pub number_of_calls: u64,
    pub total_time: f64,
    pub cumulative_time: f64,
    pub total_response_time: f64,
}

impl EdgeRecord {
    /// Whether this is the synthetic edge above the entry function.
    pub fn is_root(&self) -> bool {
        self.parent_path == ROOT_PARENT_PATH && self.parent_line_number == ROOT_PARENT_LINE
    }
}

/// Flattens the call graphs of one invocation.
///
/// Identity fields and both timestamps are fixed when the flattener is
/// built, so every record it yields shares them.
#[derive(Debug, Clone)]
pub struct Flattener<'a> {
    identity: &'a RunIdentity,
    method_name: &'a str,
    total_response_time: f64,
    epoch_timestamp: f64,
    human_timestamp: DateTime<Local>,
}

impl<'a> Flattener<'a> {
    pub fn new(identity: &'a RunIdentity, method_name: &'a str, total_response_time: Duration) -> Self {
        Self::at(identity, method_name, total_response_time, Local::now())
    }

    /// Flattener stamped with `now` instead of the current time.
    pub fn at(
        identity: &'a RunIdentity,
        method_name: &'a str,
        total_response_time: Duration,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            identity,
            method_name,
            total_response_time: total_response_time.as_secs_f64(),
            epoch_timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            human_timestamp: now,
        }
    }

    /// Lazily yield the edge records of `graph`.
    ///
    /// Functions with callers give one record per caller. A function with no
    /// callers gives the root record if it is the method under test and is
    /// skipped otherwise.
    pub fn flatten<'g>(&'g self, graph: &'g CallGraph) -> Edges<'g> {
        Edges {
            flattener: self,
            entries: graph.iter(),
            current: None,
        }
    }

    fn record(
        &self,
        child: &FunctionKey,
        stats: &CallStats,
        parent_path: &str,
        parent_line_number: u32,
        parent_function_name: &str,
    ) -> EdgeRecord {
        EdgeRecord {
            test_id: self.identity.test_id.clone(),
            sample_id: self.identity.sample_id.clone(),
            test_case_name: self.identity.test_case_name.clone(),
            name_of_method_under_test: self.method_name.to_owned(),
            epoch_timestamp: self.epoch_timestamp,
            human_timestamp: self.human_timestamp,
            child_path: child.source_path.to_owned(),
            child_line_number: child.line_number,
            child_function_name: child.function_name.to_owned(),
            parent_path: parent_path.to_owned(),
            parent_line_number,
            parent_function_name: parent_function_name.to_owned(),
            number_of_calls: stats.total_call_count,
            total_time: stats.exclusive_time.as_secs_f64(),
            cumulative_time: stats.cumulative_time.as_secs_f64(),
            total_response_time: self.total_response_time,
        }
    }
}

/// Iterator returned by [`Flattener::flatten`].
pub struct Edges<'g> {
    flattener: &'g Flattener<'g>,
    entries: btree_map::Iter<'g, FunctionKey, CallStats>,
    current: Option<(
        &'g FunctionKey,
        &'g CallStats,
        btree_map::Keys<'g, FunctionKey, CallerStats>,
    )>,
}

impl Iterator for Edges<'_> {
    type Item = EdgeRecord;

    fn next(&mut self) -> Option<EdgeRecord> {
        loop {
            if let Some((child, stats, callers)) = &mut self.current {
                if let Some(parent) = callers.next() {
                    return Some(self.flattener.record(
                        child,
                        stats,
                        parent.source_path,
                        parent.line_number,
                        parent.function_name,
                    ));
                }
                self.current = None;
            }

            let (child, stats) = self.entries.next()?;
            if stats.callers.is_empty() {
                if child.function_name == self.flattener.method_name {
                    return Some(self.flattener.record(
                        child,
                        stats,
                        ROOT_PARENT_PATH,
                        ROOT_PARENT_LINE,
                        &self.flattener.identity.sample_id,
                    ));
                }
                continue;
            }
            self.current = Some((child, stats, stats.callers.keys()));
        }
    }
}
