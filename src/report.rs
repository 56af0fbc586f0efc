//! Run report (`report.json`) read/write.

use serde::{Deserialize, Serialize};

use std::path::Path;

use crate::{ArchiveOutcome, PerfResolution, ProfResult, SessionConfig, StepId};

pub const REPORT_FILE: &str = "report.json";
pub const REPORT_SCHEMA: &str = "profsession.run_report.v1";
pub const PLAN_SCHEMA: &str = "profsession.plan.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub schema_version: String,
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub session: SessionConfig,
    pub kernel_release: String,
    pub perf: PerfResolution,
    pub steps: Vec<StepRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub archive: Option<ArchiveOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: StepId,
    pub outcome: StepOutcome,
    pub invocations: Vec<InvocationRecord>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Skipped {
        reason: String,
    },
    Succeeded {
        artifacts: Vec<String>,
    },
    Failed {
        exit_code: Option<i32>,
        reason: String,
        artifacts: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub tool: String,
    pub command: String,
    pub status: InvocationStatus,
    pub artifacts: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationStatus {
    Skipped { reason: String },
    /// `code` is `None` when the process died from a signal.
    Exited { code: Option<i32> },
    /// The `timeout` wrapper stopped the target at the planned bound.
    DurationElapsed,
    /// The runner killed the process at its hard deadline.
    TimedOut,
    SpawnFailed { error: String },
}

impl InvocationStatus {
    pub fn ran(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }

    /// Exit code and description when the invocation counts as failed.
    pub fn failure(&self) -> Option<(Option<i32>, String)> {
        match self {
            Self::Skipped { .. } | Self::DurationElapsed | Self::Exited { code: Some(0) } => None,
            Self::Exited { code: Some(code) } => {
                Some((Some(*code), format!("exited with status {code}")))
            }
            Self::Exited { code: None } => Some((None, "terminated by signal".to_string())),
            Self::TimedOut => Some((None, "killed at deadline".to_string())),
            Self::SpawnFailed { error } => Some((None, error.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub name: String,
    pub bytes: u64,
    pub blake3: String,
}

/// What a run would do, without running anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPlan {
    pub schema_version: String,
    pub session: SessionConfig,
    pub kernel_release: String,
    pub perf: PerfResolution,
    pub steps: Vec<PlannedStep>,
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub step: StepId,
    pub invocations: Vec<PlannedInvocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedInvocation {
    pub tool: String,
    pub command: Option<String>,
    pub outputs: Vec<String>,
    pub skip_reason: Option<String>,
}

impl StepOutcome {
    /// Collapses invocation results: nothing ran means skipped, any failure fails the step.
    pub fn from_invocations(records: &[InvocationRecord]) -> Self {
        if !records.iter().any(|r| r.status.ran()) {
            let reason = records
                .iter()
                .filter_map(|r| match &r.status {
                    InvocationStatus::Skipped { reason } => Some(reason.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Self::Skipped { reason };
        }

        let artifacts: Vec<String> = records
            .iter()
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect();
        match records.iter().find_map(|r| {
            r.status
                .failure()
                .map(|(code, why)| (code, format!("{}: {why}", r.tool)))
        }) {
            Some((exit_code, reason)) => Self::Failed {
                exit_code,
                reason,
                artifacts,
            },
            None => Self::Succeeded { artifacts },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Succeeded { .. } => "ok",
            Self::Failed { .. } => "failed",
        }
    }
}

impl RunReport {
    pub fn step(&self, id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == id)
    }

    pub fn write_json(&self, path: &Path) -> ProfResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> ProfResult<Self> {
        let bytes = std::fs::read(path)?;
        let r: RunReport = serde_json::from_slice(&bytes)?;
        Ok(r)
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tool: &str, status: InvocationStatus, artifacts: &[&str]) -> InvocationRecord {
        InvocationRecord {
            tool: tool.to_string(),
            command: tool.to_string(),
            status,
            artifacts: artifacts.iter().map(|s| s.to_string()).collect(),
            elapsed_ms: 0,
        }
    }

    #[test]
    fn all_skipped_is_skipped_with_joined_reasons() {
        let outcome = StepOutcome::from_invocations(&[
            record(
                "cuobjdump",
                InvocationStatus::Skipped {
                    reason: "cuobjdump not found, skipping".to_string(),
                },
                &[],
            ),
            record(
                "cuobjdump",
                InvocationStatus::Skipped {
                    reason: "cuobjdump not found, skipping".to_string(),
                },
                &[],
            ),
        ]);
        assert_eq!(
            outcome,
            StepOutcome::Skipped {
                reason: "cuobjdump not found, skipping; cuobjdump not found, skipping".to_string()
            }
        );
    }

    #[test]
    fn partial_skip_still_succeeds() {
        let outcome = StepOutcome::from_invocations(&[
            record("ldd", InvocationStatus::Exited { code: Some(0) }, &["ldd.txt"]),
            record(
                "strings",
                InvocationStatus::Skipped {
                    reason: "strings not found, skipping".to_string(),
                },
                &[],
            ),
        ]);
        assert_eq!(
            outcome,
            StepOutcome::Succeeded {
                artifacts: vec!["ldd.txt".to_string()]
            }
        );
    }

    #[test]
    fn first_failure_sets_exit_code() {
        let outcome = StepOutcome::from_invocations(&[
            record("perf", InvocationStatus::DurationElapsed, &["perf.data"]),
            record("perf", InvocationStatus::Exited { code: Some(2) }, &["perf-report.txt"]),
            record("perf", InvocationStatus::TimedOut, &["perf.script"]),
        ]);
        match outcome {
            StepOutcome::Failed {
                exit_code,
                reason,
                artifacts,
            } => {
                assert_eq!(exit_code, Some(2));
                assert!(reason.contains("status 2"), "{reason}");
                assert_eq!(artifacts, ["perf.data", "perf-report.txt", "perf.script"]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let v = serde_json::to_value(StepOutcome::Failed {
            exit_code: Some(1),
            reason: "x".to_string(),
            artifacts: Vec::new(),
        })
        .expect("json");
        assert_eq!(v.get("status").and_then(|s| s.as_str()), Some("failed"));
        assert_eq!(v.get("exit_code").and_then(|s| s.as_i64()), Some(1));
    }
}
