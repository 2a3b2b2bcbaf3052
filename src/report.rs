//! JSON summary of one supervised run, written once the run settles.
use crate::managed::Tracking;
use crate::supervisor::{ProcessSupervisor, RunHooks, RunState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The JSON payload written to the report file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pid: u32,
    pub program: String,
    pub outcome: RunState,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub tracking: Option<Tracking>,
    pub degraded_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub lines: u64,
}

impl RunReport {
    /// Summarize the supervisor's last run, which started at `started_at`.
    pub fn from_run<H: RunHooks>(
        program: &Path,
        supervisor: &ProcessSupervisor<H>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let process = supervisor.process();
        Self {
            pid: process.map(|p| p.pid()).unwrap_or_default(),
            program: program.display().to_string(),
            outcome: supervisor.state(),
            exit_code: supervisor.exit_code(),
            timed_out: supervisor.timed_out(),
            tracking: process.map(|p| p.tracking()),
            degraded_reason: process.and_then(|p| p.degraded_reason().map(str::to_string)),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            lines: supervisor.line_count(),
        }
    }
}

pub struct ReportFile {
    path: PathBuf,
}

impl ReportFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Replace the report file with `report`.
    ///
    /// The JSON is staged next to the target, flushed to disk and renamed
    /// over it, so a reader sees either the previous report or this one. A
    /// staged file that cannot be published is removed.
    pub fn write(&self, report: &RunReport) -> Result<(), ReportError> {
        let mut json = serde_json::to_vec_pretty(report)
            .map_err(|source| ReportError::Serialize { source })?;
        json.push(b'\n');

        let staged = self.staging_path();
        stage(&staged, &json).map_err(|source| ReportError::Stage {
            staged: staged.clone(),
            source,
        })?;

        if let Err(source) = std::fs::rename(&staged, &self.path) {
            let _ = std::fs::remove_file(&staged);
            return Err(ReportError::Publish {
                report: self.path.clone(),
                source,
            });
        }
        tracing::debug!(path = %self.path.display(), "run report written");
        Ok(())
    }

    /// `<report>.partial-<pid>` in the report's directory.
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "procwarden-report".into());
        name.push(format!(".partial-{}", std::process::id()));
        self.path.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn stage(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize run report: {source}")]
    Serialize { source: serde_json::Error },

    #[error("cannot stage run report at {}: {source}", staged.display())]
    Stage {
        staged: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot publish run report to {}: {source}", report.display())]
    Publish {
        report: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> RunReport {
        let started_at = Utc::now();
        RunReport {
            pid: 4242,
            program: "sleep".to_string(),
            outcome: RunState::TimedOut,
            exit_code: Some(crate::managed::KILLED_EXIT_CODE),
            timed_out: true,
            tracking: Some(Tracking::ProcessGroup),
            degraded_reason: None,
            started_at,
            finished_at: started_at,
            duration_ms: 1003,
            lines: 0,
        }
    }

    #[test]
    fn test_report_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        let file = ReportFile::new(path.clone());

        file.write(&sample()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["pid"], 4242);
        assert_eq!(parsed["outcome"], "timed_out");
        assert_eq!(parsed["exit_code"], -9);
        assert_eq!(parsed["timed_out"], true);
        assert_eq!(parsed["tracking"], "process_group");
        assert!(parsed["degraded_reason"].is_null());

        assert!(!file.staging_path().exists(), "staged file renamed away");
        assert!(contents.ends_with("}\n"));
    }

    #[test]
    fn test_report_overwrites_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        let file = ReportFile::new(path.clone());

        file.write(&sample()).unwrap();
        let mut second = sample();
        second.outcome = RunState::NormalExit;
        second.exit_code = Some(0);
        second.timed_out = false;
        file.write(&second).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["outcome"], "normal_exit");
        assert_eq!(parsed["exit_code"], 0);
    }

    #[test]
    fn test_report_write_to_nonexistent_dir_fails() {
        let file = ReportFile::new(PathBuf::from("/nonexistent/dir/run.json"));
        let err = file.write(&sample()).unwrap_err();
        assert!(matches!(err, ReportError::Stage { .. }));
    }

    #[test]
    fn test_report_publish_failure_removes_staged_file() {
        let dir = tempdir().unwrap();
        // A non-empty directory in the way makes the rename fail.
        let path = dir.path().join("run.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), "x").unwrap();
        let file = ReportFile::new(path.clone());

        let err = file.write(&sample()).unwrap_err();
        assert!(matches!(err, ReportError::Publish { .. }));
        assert!(err.to_string().contains("run.json"));
        assert!(!file.staging_path().exists());
    }

    #[test]
    fn test_staging_path_sits_next_to_report() {
        let file = ReportFile::new(PathBuf::from("/var/run/procwarden/run.json"));
        assert_eq!(
            file.staging_path(),
            PathBuf::from(format!(
                "/var/run/procwarden/run.json.partial-{}",
                std::process::id()
            ))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_report_from_finished_run() {
        use crate::controller::SpawnRequest;
        use crate::supervisor::OutputSink;

        let mut supervisor = ProcessSupervisor::new();
        let started_at = Utc::now();
        let request = SpawnRequest::new("sh").args(["-c", "echo hi; exit 2"]);
        supervisor.run(&request).unwrap();
        supervisor
            .wait_for_finish(Some(std::time::Duration::from_secs(10)), None, false, OutputSink::None)
            .await
            .unwrap();

        let report = RunReport::from_run(&request.program, &supervisor, started_at);
        assert_eq!(report.outcome, RunState::NormalExit);
        assert_eq!(report.exit_code, Some(2));
        assert_eq!(report.tracking, Some(Tracking::ProcessGroup));
        assert_eq!(report.lines, 1);
        assert!(!report.timed_out);
    }
}
