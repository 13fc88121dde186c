//! Job and sender progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender-side job progress, distinct from the firmware's active state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No job is streaming
    #[default]
    Idle,
    /// Job lines are being released
    Running,
    /// Operator paused the job
    Paused,
    /// Streaming stopped by an alarm, error policy, desync or disconnect
    Halted,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

/// Metadata of the loaded G-code program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Program name as given by the loader
    pub name: String,
    /// Number of streamable lines
    pub total: usize,
    /// Lines written to the firmware
    pub sent: usize,
    /// Lines acknowledged (ok or error)
    pub received: usize,
    /// Lines the firmware rejected with `error:`
    pub errors: usize,
    /// When streaming started
    pub started_at: Option<DateTime<Utc>>,
    /// When the last line was acknowledged
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// Fresh metadata for a newly loaded program
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            name: name.into(),
            total,
            sent: 0,
            received: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether every line has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.received >= self.total
    }

    /// Progress in percent of acknowledged lines
    pub fn progress_percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        ((self.received as f64 / self.total as f64) * 100.0) as u32
    }
}

/// Snapshot of the streaming sender's ledger and queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderStatus {
    /// Firmware receive buffer capacity in bytes
    pub capacity: usize,
    /// Bytes sent but not yet acknowledged
    pub bytes_in_flight: usize,
    /// Lines sent but not yet acknowledged
    pub lines_in_flight: usize,
    /// Operator lines waiting to be sent
    pub queued_immediate: usize,
    /// Job lines waiting to be sent
    pub queued_job: usize,
    /// Whether the job lane is held
    pub paused: bool,
    /// Whether byte accounting has been declared untrustworthy
    pub desynchronized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        let mut job = JobStatus::new("part.nc", 4);
        assert_eq!(job.progress_percent(), 0);
        job.received = 2;
        assert_eq!(job.progress_percent(), 50);
        assert!(!job.is_complete());
        job.received = 4;
        assert!(job.is_complete());
    }

    #[test]
    fn test_empty_job_is_complete() {
        let job = JobStatus::new("empty.nc", 0);
        assert!(job.is_complete());
        assert_eq!(job.progress_percent(), 100);
    }
}
