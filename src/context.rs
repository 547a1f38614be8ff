//! Ambient test identity shared between a harness and its breakpoints.

use std::sync::{Arc, RwLock};

use crate::identity::random_token;

/// Identity a harness publishes for the test currently running.
///
/// Unset fields fall through to the options defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestIdentity {
    pub test_id: Option<String>,
    pub test_case_name: Option<String>,
    pub database_name: Option<String>,
}

/// Cloneable handle to the current [`TestIdentity`].
///
/// A harness keeps one handle and updates it between tests; every
/// breakpoint built with a clone sees the update on its next call.
#[derive(Debug, Clone, Default)]
pub struct TestContext(Arc<RwLock<TestIdentity>>);

impl TestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a test: fresh test id, given case name, database kept.
    /// Returns the new test id.
    pub fn start(&self, test_case_name: impl Into<String>) -> String {
        let test_id = random_token(12);
        let mut current = self.0.write().unwrap_or_else(|e| e.into_inner());
        current.test_id = Some(test_id.clone());
        current.test_case_name = Some(test_case_name.into());
        test_id
    }

    /// Replace the whole identity.
    pub fn set(&self, identity: TestIdentity) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    pub fn set_database_name(&self, database_name: impl Into<String>) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).database_name =
            Some(database_name.into());
    }

    /// Snapshot of the current identity.
    pub fn current(&self) -> TestIdentity {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.set(TestIdentity::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_assigns_fresh_test_ids() {
        let ctx = TestContext::new();
        let first = ctx.start("login");
        let second = ctx.start("logout");
        assert_ne!(first, second);

        let current = ctx.current();
        assert_eq!(current.test_id.as_deref(), Some(second.as_str()));
        assert_eq!(current.test_case_name.as_deref(), Some("logout"));
    }

    #[test]
    fn clones_share_state() {
        let ctx = TestContext::new();
        let seen_by_breakpoint = ctx.clone();
        ctx.set_database_name("bench");
        assert_eq!(
            seen_by_breakpoint.current().database_name.as_deref(),
            Some("bench")
        );
        ctx.clear();
        assert_eq!(seen_by_breakpoint.current(), TestIdentity::default());
    }

    #[test]
    fn start_keeps_database_name() {
        let ctx = TestContext::new();
        ctx.set_database_name("bench");
        ctx.start("case");
        assert_eq!(ctx.current().database_name.as_deref(), Some("bench"));
    }
}
