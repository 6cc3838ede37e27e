use crate::store::{LineFile, RecordStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One flushed window, as written to `avg_<metric>_log.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct AverageLogEntry {
    pub timestamp: DateTime<Utc>,
    pub metric_label: String,
    pub mean_value: f64,
    pub sample_count: usize,
    pub mode_label: Option<String>,
}

impl AverageLogEntry {
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}, {}={}, samples={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.metric_label,
            self.mean_value,
            self.sample_count
        );
        if let Some(mode) = &self.mode_label {
            line.push_str(", mode=");
            line.push_str(mode);
        }
        line
    }

    #[cfg(test)]
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split(", ");
        let timestamp = parts.next().ok_or_else(|| anyhow!("missing timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .context("parse average timestamp")?
            .with_timezone(&Utc);
        let (metric_label, value) = parts
            .next()
            .and_then(|part| part.split_once('='))
            .ok_or_else(|| anyhow!("missing metric value"))?;
        let mean_value: f64 = value.parse().context("parse average value")?;
        let sample_count = parts
            .next()
            .and_then(|part| part.strip_prefix("samples="))
            .ok_or_else(|| anyhow!("missing sample count"))?
            .parse()
            .context("parse sample count")?;
        let mode_label = parts
            .next()
            .and_then(|part| part.strip_prefix("mode="))
            .map(str::to_string);
        Ok(Self {
            timestamp,
            metric_label: metric_label.to_string(),
            mean_value,
            sample_count,
            mode_label,
        })
    }
}

/// Directory of per-metric average logs, each trimmed to a bounded length.
pub struct AverageLog {
    dir: PathBuf,
    max_lines: usize,
    files: Mutex<HashMap<String, LineFile>>,
}

impl AverageLog {
    pub fn open(dir: &Path, max_lines: usize) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_lines,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, metric_label: &str) -> PathBuf {
        self.dir.join(format!("avg_{metric_label}_log.txt"))
    }

    pub fn append(&self, entry: &AverageLogEntry) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow!("average log lock poisoned"))?;
        if !files.contains_key(&entry.metric_label) {
            let file = LineFile::open(&self.path_for(&entry.metric_label))?;
            files.insert(entry.metric_label.clone(), file);
        }
        let file = files
            .get_mut(&entry.metric_label)
            .ok_or_else(|| anyhow!("average log for {} missing", entry.metric_label))?;
        file.append(entry.to_line().as_bytes())?;
        file.trim_to_last(self.max_lines)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn entries(&self, metric_label: &str) -> Vec<AverageLogEntry> {
        let path = self.path_for(metric_label);
        if !path.exists() {
            return Vec::new();
        }
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| AverageLogEntry::parse_line(line).unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(value: f64, mode: Option<&str>) -> AverageLogEntry {
        AverageLogEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 19, 12, 0, 0).unwrap(),
            metric_label: "wind_direction".to_string(),
            mean_value: value,
            sample_count: 300,
            mode_label: mode.map(str::to_string),
        }
    }

    #[test]
    fn line_format_is_stable() {
        assert_eq!(
            entry(45.25, Some("NE")).to_line(),
            "2025-06-19T12:00:00.000Z, wind_direction=45.25, samples=300, mode=NE"
        );
        assert_eq!(
            entry(0.1, None).to_line(),
            "2025-06-19T12:00:00.000Z, wind_direction=0.1, samples=300"
        );
    }

    #[test]
    fn parse_reads_back_written_line() {
        let original = entry(12.5, Some("S"));
        let parsed = AverageLogEntry::parse_line(&original.to_line()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn append_trims_each_metric_file() {
        let dir = TempDir::new().unwrap();
        let log = AverageLog::open(dir.path(), 2).unwrap();
        for value in [1.0, 2.0, 3.0] {
            log.append(&entry(value, None)).unwrap();
        }
        let values: Vec<f64> = log
            .entries("wind_direction")
            .iter()
            .map(|entry| entry.mean_value)
            .collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert!(dir.path().join("avg_wind_direction_log.txt").exists());
        assert!(log.entries("flow").is_empty());
    }
}
