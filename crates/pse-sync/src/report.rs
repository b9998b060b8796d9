//! Machine-readable summary of one job run, written next to the run's other reports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::destination::ApplyOutcome;
use crate::error::SyncError;
use crate::extract::ExtractionFailure;
use crate::reconcile::ReconcileStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    PartialExtractionFailure,
    Failed,
}

impl JobStatus {
    pub fn is_success(self) -> bool {
        self == JobStatus::Succeeded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub stats: ReconcileStats,
    pub malformed: usize,
    pub batches: usize,
    pub conflict_retries: usize,
    pub deleted: usize,
    pub inserted: usize,
}

impl EntityReport {
    pub fn record_batch(&mut self, stats: &ReconcileStats, outcome: &ApplyOutcome, retries: usize) {
        self.stats.absorb(stats);
        self.batches += 1;
        self.conflict_retries += retries;
        self.deleted += outcome.deleted;
        self.inserted += outcome.inserted;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
}

impl From<&SyncError> for ErrorReport {
    fn from(err: &SyncError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub action: String,
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub companies: EntityReport,
    pub prices: EntityReport,
    pub extraction_units: usize,
    pub extraction_failures: Vec<ExtractionFailure>,
    pub error: Option<ErrorReport>,
}

impl JobReport {
    pub fn new(run_id: Uuid, action: &str, destination: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            action: action.to_string(),
            destination: destination.to_string(),
            started_at,
            finished_at: None,
            status: JobStatus::Succeeded,
            companies: EntityReport::default(),
            prices: EntityReport::default(),
            extraction_units: 0,
            extraction_failures: Vec::new(),
            error: None,
        }
    }

    /// Settles the final status. A fatal error wins over extraction failures.
    pub fn finish(&mut self, result: Result<(), SyncError>, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.status = match &result {
            Err(err) => {
                self.error = Some(ErrorReport::from(err));
                JobStatus::Failed
            }
            Ok(()) if !self.extraction_failures.is_empty() => {
                let err = SyncError::PartialExtraction {
                    failed: self.extraction_failures.len(),
                    total: self.extraction_units,
                };
                self.error = Some(ErrorReport::from(&err));
                JobStatus::PartialExtractionFailure
            }
            Ok(()) => JobStatus::Succeeded,
        };
    }

    pub async fn write(&self, reports_root: &Path) -> Result<PathBuf> {
        let dir = reports_root.join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("job_report.json");
        let bytes = serde_json::to_vec_pretty(self).context("serializing job report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> JobReport {
        JobReport::new(Uuid::new_v4(), "sync", "memory", Utc::now())
    }

    #[test]
    fn extraction_failures_downgrade_success() {
        let mut report = report();
        report.extraction_units = 3;
        report.extraction_failures.push(ExtractionFailure {
            unit: "XYZ".into(),
            error: "unknown symbol XYZ".into(),
        });
        report.finish(Ok(()), Utc::now());
        assert_eq!(report.status, JobStatus::PartialExtractionFailure);
        let error = report.error.unwrap();
        assert_eq!(error.code, "PARTIAL_EXTRACTION_FAILURE");
        assert!(error.message.contains("1 of 3"));
    }

    #[test]
    fn fatal_errors_fail_the_job() {
        let mut report = report();
        report.finish(Err(SyncError::unavailable("postgres", "connection refused")), Utc::now());
        assert_eq!(report.status, JobStatus::Failed);
        assert!(!report.status.is_success());
        assert_eq!(report.error.unwrap().code, "BACKEND_UNAVAILABLE");
    }

    #[tokio::test]
    async fn report_lands_under_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = report();
        report.finish(Ok(()), Utc::now());
        let path = report.write(dir.path()).await.unwrap();
        assert!(path.ends_with(format!("{}/job_report.json", report.run_id)));
        let saved: JobReport = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved.status, JobStatus::Succeeded);
    }
}
