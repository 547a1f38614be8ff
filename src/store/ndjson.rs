//! Newline-delimited JSON writer for `file` connection URLs.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use super::{Binding, Engine, Store};
use crate::deliver::Payload;
use crate::error::{Error, InsertFailure};

/// Appends each record as one JSON line to `<dir>/<database>.ndjson`.
#[derive(Debug)]
pub struct NdjsonStore {
    base: String,
    // Serializes appends so lines from concurrent inserts never interleave.
    write_lock: Mutex<()>,
}

impl NdjsonStore {
    /// `base` is a `file://` URL naming the output directory.
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            write_lock: Mutex::new(()),
        }
    }

    /// Output file for a binding.
    pub fn file_for(binding: &Binding) -> Option<PathBuf> {
        let stem = binding.local_path()?;
        let mut name = stem.into_os_string();
        name.push(".ndjson");
        Some(PathBuf::from(name))
    }

    fn append(&self, payload: &Payload, binding: &Binding) -> Result<usize, Error> {
        let path = Self::file_for(binding).ok_or_else(|| Error::UnsupportedEngine {
            url: binding.url.clone(),
        })?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = BufWriter::new(file);
        let mut written = 0;
        for record in payload.rows() {
            serde_json::to_writer(&mut out, record).map_err(std::io::Error::from)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        out.flush()?;
        Ok(written)
    }
}

impl Store for NdjsonStore {
    fn resolve(&self, database_name: &str) -> Result<Binding, Error> {
        let binding = Binding::resolve(Some(&self.base), database_name);
        if binding.engine != Engine::File {
            return Err(Error::UnsupportedEngine { url: binding.url });
        }
        Ok(binding)
    }

    fn insert(&self, payload: &Payload, binding: &Binding) -> Result<(), InsertFailure> {
        let written = self
            .append(payload, binding)
            .map_err(|e| InsertFailure::new(&binding.database_name, e))?;
        tracing::debug!(database = %binding.database_name, rows = written, "appended payload");
        Ok(())
    }
}
