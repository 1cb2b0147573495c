//! MetricsLogger - Local run directory with the resolved config and a JSONL metric stream

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

fn default_save_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerParams {
    pub project: String,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Run name; a timestamp when absent.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggerSpec {
    /// The `_target_` name the run asked for (`MetricsLogger`, `WandbLogger`, ...).
    pub requested: String,
    pub params: LoggerParams,
}

pub struct MetricsLogger {
    run_dir: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Creates `{save_dir}/{project}/{name}` and stores the resolved run config there.
    pub fn create(spec: &LoggerSpec, resolved_config: &serde_yaml::Value) -> Result<Self> {
        let p = &spec.params;
        let name = p
            .name
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
        let run_dir = p.save_dir.join(&p.project).join(name);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating log dir {}", run_dir.display()))?;

        std::fs::write(
            run_dir.join("config.yaml"),
            serde_yaml::to_string(resolved_config)?,
        )?;
        let file = File::options()
            .create(true)
            .append(true)
            .open(run_dir.join("metrics.jsonl"))?;

        if spec.requested != "MetricsLogger" {
            tracing::info!(
                "{} runs offline: metrics are written locally only",
                spec.requested
            );
        }
        tracing::info!("📁 Logging run to {}", run_dir.display());
        Ok(Self {
            run_dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Appends one row: `step`, `epoch`, then the metrics in the given order.
    pub fn log_metrics(&mut self, step: usize, epoch: usize, metrics: &[(&str, f64)]) -> Result<()> {
        let mut row = Map::new();
        row.insert("step".into(), Value::from(step));
        row.insert("epoch".into(), Value::from(epoch));
        for (name, v) in metrics {
            // NaN and infinities have no JSON form.
            let value = Number::from_f64(*v).map_or(Value::Null, Value::Number);
            row.insert((*name).to_string(), value);
        }
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_config_and_ordered_metric_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = LoggerSpec {
            requested: "WandbLogger".into(),
            params: LoggerParams {
                project: "gomoku-8x8".into(),
                save_dir: dir.path().to_path_buf(),
                name: Some("run-a".into()),
            },
        };
        let config: serde_yaml::Value = serde_yaml::from_str("seed: 123")?;
        let mut logger = MetricsLogger::create(&spec, &config)?;
        logger.log_metrics(10, 0, &[("train_loss", 1.5), ("lr-Adam", 0.001)])?;
        logger.log_metrics(20, 1, &[("val_loss", f64::NAN)])?;
        logger.flush()?;

        let run = dir.path().join("gomoku-8x8/run-a");
        assert_eq!(logger.run_dir(), run);
        let saved: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(run.join("config.yaml"))?)?;
        assert_eq!(saved, config);

        let text = std::fs::read_to_string(run.join("metrics.jsonl"))?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            r#"{"step":10,"epoch":0,"train_loss":1.5,"lr-Adam":0.001}"#
        );
        assert_eq!(lines[1], r#"{"step":20,"epoch":1,"val_loss":null}"#);
        Ok(())
    }

    #[test]
    fn save_dir_defaults_to_logs() {
        let p: LoggerParams = serde_yaml::from_str("project: gomoku").unwrap();
        assert_eq!(p.save_dir, PathBuf::from("logs"));
        assert!(p.name.is_none());
    }
}
