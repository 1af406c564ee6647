//! Metrics log written as JSON lines under `output_dir/logging_dir`

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub epoch: usize,
    pub loss: f32,
    pub lr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    pub timestamp: String,
}

impl StepMetrics {
    pub fn new(step: usize, epoch: usize, loss: f32, lr: f64) -> Self {
        Self {
            step,
            epoch,
            loss,
            lr,
            grad_norm: None,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Only the main process owns a writer; other ranks hold a disabled logger
pub struct MetricsLogger {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
}

impl MetricsLogger {
    pub fn create(logging_dir: &Path, enabled: bool) -> Result<Self> {
        let path = logging_dir.join(METRICS_FILE);
        if !enabled {
            return Ok(Self { writer: None, path });
        }

        fs::create_dir_all(logging_dir)
            .with_context(|| format!("Failed to create logging directory: {}", logging_dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics log: {}", path.display()))?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
        })
    }

    pub fn disabled() -> Self {
        Self {
            writer: None,
            path: PathBuf::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, metrics: &StepMetrics) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, metrics)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// One-off record, e.g. the resolved configuration at startup
    pub fn log_value(&mut self, value: &serde_json::Value) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, value)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_line_per_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let logging_dir = dir.path().join("logs");
        let mut logger = MetricsLogger::create(&logging_dir, true)?;
        logger.log(&StepMetrics::new(1, 0, 0.5, 1e-4))?;
        logger.log(&StepMetrics::new(2, 0, 0.25, 1e-4))?;
        logger.flush()?;

        let content = fs::read_to_string(logging_dir.join(METRICS_FILE))?;
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["step"], 2);
        assert!(second.get("grad_norm").is_none());
        Ok(())
    }

    #[test]
    fn test_disabled_logger_touches_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let logging_dir = dir.path().join("logs");
        let mut logger = MetricsLogger::create(&logging_dir, false)?;
        logger.log(&StepMetrics::new(1, 0, 0.5, 1e-4))?;
        assert!(!logger.is_enabled());
        assert!(!logging_dir.exists());
        Ok(())
    }
}
