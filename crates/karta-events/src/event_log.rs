use karta_core::events::Event;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ListenerError;
use crate::listener::TestEventListener;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Appends events as JSON lines to `global.jsonl` and `runs/<run>.jsonl`.
#[derive(Debug)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub run_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let run_dir = root.join("runs");
        Self {
            root,
            global_file,
            run_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        fs::create_dir_all(&self.root).map_err(|source| EventLogError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        fs::create_dir_all(&self.run_dir).map_err(|source| EventLogError::CreateDir {
            path: self.run_dir.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let line =
            serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
        // concurrent iterations raise events from many threads
        let _guard = self.write_lock.lock();
        append_line(&self.global_file, &line)?;
        append_line(&self.run_log_path(&event.run_name), &line)?;
        Ok(())
    }

    pub fn run_log_path(&self, run_name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.jsonl", sanitize(run_name)))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }

    pub fn read_run(&self, run_name: &str) -> Result<Vec<Event>, EventLogError> {
        let path = self.run_log_path(run_name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(EventLogError::Append { path, source }),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| EventLogError::Serialize { source })
            })
            .collect()
    }
}

impl TestEventListener for JsonlEventLog {
    fn name(&self) -> &str {
        "jsonl-event-log"
    }

    fn start(&self) -> Result<(), ListenerError> {
        self.ensure_layout()?;
        Ok(())
    }

    fn on_event(&self, event: &Event) -> Result<(), ListenerError> {
        self.append(event)?;
        Ok(())
    }
}

fn sanitize(run_name: &str) -> String {
    run_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

fn append_line(path: &Path, line: &str) -> Result<(), EventLogError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;

    file.write_all(line.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}
