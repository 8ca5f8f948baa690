//! JSON-lines metric sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::json;

use super::{MetricLogger, RoundMetrics};
use crate::{Result, TextRlError};

/// Appends one JSON object per record to a file, for plotting reward and
/// KL curves after the run. Write failures are logged and swallowed;
/// metrics are advisory and must not stop training.
#[derive(Debug)]
pub struct JsonlLogger {
    writer: BufWriter<File>,
}

impl JsonlLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref()).map_err(|e| {
            TextRlError::Persistence(format!(
                "failed to create metrics file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, value: &serde_json::Value) {
        if let Err(e) = writeln!(self.writer, "{value}") {
            tracing::debug!("Failed to write metrics line: {e}");
        }
    }
}

impl MetricLogger for JsonlLogger {
    fn log_round(&mut self, metrics: &RoundMetrics) {
        match serde_json::to_value(metrics) {
            Ok(mut value) => {
                value["event"] = "round".into();
                self.write_line(&value);
            }
            Err(e) => tracing::debug!("Failed to serialize round metrics: {e}"),
        }
    }

    fn log_eval(&mut self, step: u64, reward: f64) {
        self.write_line(&json!({ "event": "eval", "step": step, "reward": reward }));
    }

    fn close(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush metrics file: {e}");
        }
    }
}
