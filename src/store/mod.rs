//! Storage collaborators: binding resolution and payload inserts.

mod ndjson;
mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

pub use ndjson::NdjsonStore;
pub use sqlite::{SqliteStore, TABLE};

use crate::config::Options;
use crate::deliver::Payload;
use crate::error::{Error, InsertFailure};

/// How a connection URL is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Embedded database with a bound-parameter ceiling (`sqlite` scheme).
    Serverless,
    /// Database server reached over the network.
    Server,
    /// Newline-delimited JSON files (`file` scheme).
    File,
}

impl Engine {
    pub fn of_url(url: &str) -> Self {
        if url.starts_with("sqlite") {
            Engine::Serverless
        } else if url.starts_with("file:") {
            Engine::File
        } else {
            Engine::Server
        }
    }
}

/// Where the records of one logical database go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub database_name: String,
    pub url: String,
    pub engine: Engine,
}

impl Binding {
    /// Resolve `database_name` against an optional base URL.
    pub fn resolve(base: Option<&str>, database_name: &str) -> Self {
        let url = connection_url(base, database_name);
        Self {
            database_name: database_name.to_owned(),
            engine: Engine::of_url(&url),
            url,
        }
    }

    pub fn is_serverless(&self) -> bool {
        self.engine == Engine::Serverless
    }

    /// Filesystem path behind a `sqlite` or `file` URL.
    pub fn local_path(&self) -> Option<PathBuf> {
        let rest = match self.engine {
            Engine::Serverless => self.url.strip_prefix("sqlite:///")?,
            Engine::File => self.url.strip_prefix("file://")?,
            Engine::Server => return None,
        };
        Some(PathBuf::from(rest))
    }
}

/// Connection URL of `database_name`.
///
/// No base: a SQLite file in the temp directory. A `sqlite` base is a
/// directory prefix and gets `<name>.db` appended. Any other base gets
/// `/<name>` appended.
pub fn connection_url(base: Option<&str>, database_name: &str) -> String {
    match base {
        None => {
            let mut dir = std::env::temp_dir().display().to_string();
            let sep = if dir.contains('\\') { '\\' } else { '/' };
            if !dir.ends_with(sep) {
                dir.push(sep);
            }
            format!("sqlite:///{dir}{database_name}.db")
        }
        Some(base) if base.starts_with("sqlite") => format!("{base}{database_name}.db"),
        Some(base) => format!("{base}/{database_name}"),
    }
}

/// A destination for edge records.
///
/// Implementations are shared between instrumented calls and the delivery
/// worker, so they must be `Send + Sync`.
pub trait Store: Send + Sync {
    /// Binding for a logical database name.
    fn resolve(&self, database_name: &str) -> Result<Binding, Error>;

    /// Write one payload. A payload is either a flat run of rows or a
    /// single-element batch holding one chunk.
    fn insert(&self, payload: &Payload, binding: &Binding) -> Result<(), InsertFailure>;
}

/// Open the bundled store that writes to `options.connection_url`.
pub fn open_store(options: &Options) -> Result<Arc<dyn Store>, Error> {
    let base = options.connection_url.as_deref();
    match Binding::resolve(base, &options.database_name).engine {
        Engine::Serverless => Ok(Arc::new(SqliteStore::new(base))),
        Engine::File => Ok(Arc::new(NdjsonStore::new(base.unwrap_or("file://")))),
        Engine::Server => Err(Error::UnsupportedEngine {
            url: base.unwrap_or_default().to_owned(),
        }),
    }
}
