//! Tabular telemetry collected from monitored nodes.
//!
//! Every row is tagged with the run that produced it (`sim_name`, `sim_id`, `seed`) so tables
//! from several runs can be concatenated and written once.

use crate::{Error, FlowId, FrameId};
use csv::Writer;
use serde::Serialize;
use std::{
    fs::{self, File},
    path::Path,
};
use tracing::debug;

/// A frame sent by a talker, once per terminal it reached.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TalkerRecord {
    pub sim_name: String,
    pub sim_id: u64,
    pub seed: u64,
    pub frame_id: FrameId,
    pub flow_id: FlowId,
    pub frame_len: usize,
    pub frame_priority: u8,
    pub sender: String,
    pub receiver: Option<String>,
    pub start_time: Option<f64>,
    pub arrival_time: Option<f64>,
    pub delay: Option<f64>,
}

/// A frame that passed through one egress port of a switch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SwitchRecord {
    pub sim_name: String,
    pub sim_id: u64,
    pub seed: u64,
    pub switch_address: String,
    pub egress_address: String,
    pub mode: String,
    pub frame_id: FrameId,
    pub flow_id: FlowId,
    pub frame_len: usize,
    pub frame_priority: u8,
    pub arrival_time: f64,
    pub shaped_queue: String,
    pub transmission_time: f64,
    pub eligible_time: Option<f64>,
    pub forwarding_time: Option<f64>,
    pub nodal_delay: Option<f64>,
    pub queue_delay: Option<f64>,
}

/// Content of one queue over an interval of virtual time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueRecord {
    pub sim_name: String,
    pub sim_id: u64,
    pub seed: u64,
    pub switch_address: String,
    pub egress_address: String,
    pub queue: String,
    pub start: f64,
    pub end: f64,
    pub bytes: usize,
    pub frames: usize,
}

/// Telemetry of one or more runs.
#[derive(Clone, Debug, Default)]
pub struct Results {
    pub talker: Vec<TalkerRecord>,
    pub switch: Vec<SwitchRecord>,
    pub queue: Vec<QueueRecord>,

    /// Encoded metrics registry of each run, in run order.
    pub metrics: Vec<String>,
}

impl Results {
    /// Append the tables of `other`.
    pub fn extend(&mut self, other: Results) {
        self.talker.extend(other.talker);
        self.switch.extend(other.switch);
        self.queue.extend(other.queue);
        self.metrics.extend(other.metrics);
    }

    pub fn is_empty(&self) -> bool {
        self.talker.is_empty() && self.switch.is_empty() && self.queue.is_empty()
    }

    /// Write each non-empty table to `<prefix>_<table>.csv`.
    pub fn write_csv(&self, prefix: impl AsRef<Path>) -> Result<(), Error> {
        let prefix = prefix.as_ref().to_string_lossy().into_owned();
        write_table(&format!("{prefix}_talker.csv"), &self.talker)?;
        write_table(&format!("{prefix}_switch.csv"), &self.switch)?;
        write_table(&format!("{prefix}_queue.csv"), &self.queue)?;
        Ok(())
    }
}

fn write_table<R: Serialize>(path: &str, rows: &[R]) -> Result<(), Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = Writer::from_writer(File::create(path)?);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = rows.len(), "table written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn talker(frame_id: FrameId, receiver: Option<&str>, delay: Option<f64>) -> TalkerRecord {
        TalkerRecord {
            sim_name: "test".into(),
            sim_id: 1,
            seed: 0,
            frame_id,
            flow_id: 1,
            frame_len: 1526,
            frame_priority: 3,
            sender: "talker".into(),
            receiver: receiver.map(String::from),
            start_time: Some(0.0),
            arrival_time: delay,
            delay,
        }
    }

    #[test]
    fn test_extend() {
        let mut results = Results::default();
        assert!(results.is_empty());
        results.extend(Results {
            talker: vec![talker(0, Some("l"), Some(4.0))],
            metrics: vec!["a".into()],
            ..Default::default()
        });
        results.extend(Results {
            talker: vec![talker(1, None, None)],
            metrics: vec!["b".into()],
            ..Default::default()
        });
        assert!(!results.is_empty());
        let ids: Vec<_> = results.talker.iter().map(|r| r.frame_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(results.metrics, vec!["a", "b"]);
    }

    #[test]
    fn test_write_csv() {
        let dir = std::env::temp_dir().join(format!("ubsim-telemetry-{}", std::process::id()));
        let prefix = dir.join("run");
        let results = Results {
            talker: vec![talker(0, Some("l"), Some(4.0)), talker(1, None, None)],
            ..Default::default()
        };
        results.write_csv(&prefix).unwrap();

        let content = fs::read_to_string(dir.join("run_talker.csv")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sim_name,sim_id,seed,frame_id,flow_id"));
        assert_eq!(lines[1], "test,1,0,0,1,1526,3,talker,l,0.0,4.0,4.0");

        // Missing values are empty fields
        assert_eq!(lines[2], "test,1,0,1,1,1526,3,talker,,0.0,,");

        // Empty tables are skipped
        assert!(!dir.join("run_switch.csv").exists());
        assert!(!dir.join("run_queue.csv").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
