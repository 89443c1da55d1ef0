//! JSONL tool audit writer with daily file rotation.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{NaiveDate, Utc};
use tracing::warn;

use super::{AuditLogger, ToolAuditEvent};
use crate::{AppError, Result};

struct WriterState {
    current_date: NaiveDate,
    writer: BufWriter<fs::File>,
}

/// A daily-rotating JSONL writer for [`ToolAuditEvent`]s.
///
/// Appends one JSON object per line to
/// `<log_dir>/tool-audit-YYYY-MM-DD.jsonl`, opening a new file when the
/// calendar date changes between writes.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    state: Mutex<Option<WriterState>>,
}

impl JsonlAuditWriter {
    /// Construct a writer that stores logs in `log_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create audit log directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            state: Mutex::new(None),
        })
    }

    /// Path of the file written on `date`.
    #[must_use]
    pub fn path_for_date(&self, date: NaiveDate) -> PathBuf {
        Self::file_path(&self.log_dir, date)
    }

    fn file_path(log_dir: &Path, date: NaiveDate) -> PathBuf {
        log_dir.join(format!("tool-audit-{date}.jsonl"))
    }

    fn open_for_date(log_dir: &Path, date: NaiveDate) -> Result<BufWriter<fs::File>> {
        let path = Self::file_path(log_dir, date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open audit log {}: {e}", path.display())))?;
        Ok(BufWriter::new(file))
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_event(&self, event: &ToolAuditEvent) -> Result<()> {
        let today = Utc::now().date_naive();

        let mut guard = self
            .state
            .lock()
            .map_err(|_| AppError::Io("audit writer mutex poisoned".into()))?;

        if guard.as_ref().is_none_or(|s| s.current_date != today) {
            *guard = Some(WriterState {
                current_date: today,
                writer: Self::open_for_date(&self.log_dir, today)?,
            });
        }

        let Some(state) = guard.as_mut() else {
            return Ok(());
        };

        let line = serde_json::to_string(event)?;
        if let Err(e) = writeln!(state.writer, "{line}").and_then(|()| state.writer.flush()) {
            warn!(tool_use_id = %event.tool_use_id, "failed to write tool audit event: {e}");
            return Err(AppError::Io(format!("audit write failed: {e}")));
        }

        Ok(())
    }
}
