//! JSONL persistence for flushed telemetry.
//!
//! A writer targets either one fixed file for the whole run or one file per
//! UTC day (`<dir>/2026-01-11.jsonl`). Each flushed batch is appended and
//! flushed to disk in one go.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{}:{line}: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

/// Where telemetry lines go.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// The output file when `session_mode` is set, otherwise the directory
    /// holding one file per day.
    pub trace_path: PathBuf,
    pub enabled: bool,
    pub session_mode: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::daily_rotation(".tracewire/traces")
    }
}

impl WriterConfig {
    /// Append everything to `trace_file`.
    pub fn session(trace_file: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_file.into(),
            enabled: true,
            session_mode: true,
        }
    }

    /// One file per UTC day inside `trace_dir`.
    pub fn daily_rotation(trace_dir: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_dir.into(),
            enabled: true,
            session_mode: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            trace_path: PathBuf::new(),
            enabled: false,
            session_mode: false,
        }
    }

    fn file_for(&self, day: NaiveDate) -> PathBuf {
        if self.session_mode {
            self.trace_path.clone()
        } else {
            self.trace_path.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    out: BufWriter<File>,
}

/// Appends serializable records to JSONL files.
///
/// The open file is kept behind a mutex and swapped when the target path
/// changes (day rollover).
#[derive(Debug)]
pub struct TraceWriter {
    config: WriterConfig,
    open: Mutex<Option<OpenFile>>,
}

impl TraceWriter {
    /// Create the writer and its output directory.
    pub fn new(config: WriterConfig) -> Result<Self, WriteError> {
        if config.enabled {
            let dir = if config.session_mode {
                config.trace_path.parent()
            } else {
                Some(config.trace_path.as_path())
            };
            if let Some(dir) = dir.filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
        }

        Ok(Self {
            config,
            open: Mutex::new(None),
        })
    }

    /// Append one record.
    pub fn write<T: Serialize>(&self, record: &T) -> Result<(), WriteError> {
        self.append_all(std::slice::from_ref(record)).map(|_| ())
    }

    /// Append `records` as one batch and return how many lines were written.
    ///
    /// Nothing is written if any record fails to serialize.
    pub fn append_all<T: Serialize>(&self, records: &[T]) -> Result<usize, WriteError> {
        if !self.config.enabled || records.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::new();
        for record in records {
            serde_json::to_writer(&mut batch, record)?;
            batch.push(b'\n');
        }

        let path = self.current_file_path();
        let mut open = self.open.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if open.as_ref().is_none_or(|f| f.path != path) {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *open = Some(OpenFile {
                path,
                out: BufWriter::new(file),
            });
        }

        if let Some(file) = open.as_mut() {
            file.out.write_all(&batch)?;
            file.out.flush()?;
        }
        Ok(records.len())
    }

    /// The file the next batch is appended to.
    pub fn current_file_path(&self) -> PathBuf {
        self.config.file_for(Utc::now().date_naive())
    }

    /// Every JSONL file this writer produces, oldest first.
    pub fn list_files(&self) -> Result<Vec<PathBuf>, WriteError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        if self.config.session_mode {
            return Ok(self
                .config
                .trace_path
                .exists()
                .then(|| self.config.trace_path.clone())
                .into_iter()
                .collect());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.config.trace_path)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        // Dated names sort chronologically
        files.sort();
        Ok(files)
    }

    /// Parse every non-blank line of `path` as a `T`.
    pub fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, WriteError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| WriteError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
