//! Per-invocation run identity.

use uuid::Uuid;

/// Length of a sample id.
pub const SAMPLE_ID_LEN: usize = 8;
/// Test id used when neither the breakpoint nor the test context sets one.
pub const DEFAULT_TEST_ID: &str = "unassigned";

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Who ran, which sample, and where its records go.
///
/// Built once per instrumented call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub test_id: String,
    pub sample_id: String,
    pub test_case_name: String,
    pub database_name: String,
}

impl RunIdentity {
    /// Identity with a freshly drawn sample id.
    pub fn new(
        test_id: impl Into<String>,
        test_case_name: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            sample_id: new_sample_id(),
            test_case_name: test_case_name.into(),
            database_name: database_name.into(),
        }
    }
}

/// Random `SAMPLE_ID_LEN`-character token over `A-Z0-9`.
pub fn new_sample_id() -> String {
    random_token(SAMPLE_ID_LEN)
}

/// Random token over `A-Z0-9`, used for sample and test ids.
pub fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        // Skip the version and variant nibbles; the rest of a v4 uuid is random.
        let bytes = Uuid::new_v4().into_bytes();
        for b in bytes[..6].iter().chain(&bytes[9..]) {
            if out.len() == len {
                break;
            }
            // 252 = 7 * 36: reject the tail so every symbol is equally likely.
            if *b < 252 {
                out.push(ALPHABET[usize::from(*b) % ALPHABET.len()] as char);
            }
        }
    }
    out
}
