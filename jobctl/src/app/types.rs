// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};

/// Logical file roles understood by the validator and the generators.
pub mod roles {
    pub const PARAMETERS: &str = "parameters";
    pub const STRUCTURE: &str = "structure";
    pub const K_MESH: &str = "k-mesh";
    pub const POTENTIALS: &str = "potentials";
    pub const DESCRIPTOR: &str = "descriptor";

    pub const REQUIRED: [&str; 4] = [PARAMETERS, STRUCTURE, K_MESH, POTENTIALS];

    /// File name the solver expects for a role.
    pub fn default_file_name(role: &str) -> Option<&'static str> {
        match role {
            PARAMETERS => Some("INCAR"),
            STRUCTURE => Some("POSCAR"),
            K_MESH => Some("KPOINTS"),
            POTENTIALS => Some("POTCAR"),
            _ => None,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_name: String,
    pub content: Vec<u8>,
    pub hash: String,
}

impl FileEntry {
    pub fn new(file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let hash = sha256_hex(&content);
        Self {
            file_name: file_name.into(),
            content,
            hash,
        }
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Input files for one job keyed by role. Iteration order is the role order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileBundle {
    entries: BTreeMap<String, FileEntry>,
}

impl FileBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: impl Into<String>, entry: FileEntry) -> Option<FileEntry> {
        self.entries.insert(role.into(), entry)
    }

    /// Returns a copy with `role` replaced.
    pub fn with_role(&self, role: &str, entry: FileEntry) -> Self {
        let mut next = self.clone();
        next.insert(role, entry);
        next
    }

    pub fn get(&self, role: &str) -> Option<&FileEntry> {
        self.entries.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.entries.contains_key(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.entries.iter().map(|(role, entry)| (role.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digest over role names, file names and entry hashes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (role, entry) in &self.entries {
            hasher.update(role.as_bytes());
            hasher.update([0]);
            hasher.update(entry.file_name.as_bytes());
            hasher.update([0]);
            hasher.update(entry.hash.as_bytes());
            hasher.update([b'\n']);
        }
        format!("{:x}", hasher.finalize())
    }

    /// File name to hash, as uploaded next to the inputs.
    pub fn manifest(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .map(|entry| (entry.file_name.clone(), entry.hash.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub wall_clock: Duration,
    pub partition: Option<String>,
}

/// Parses `HH:MM:SS`, `MM:SS`, `MM` or `D-HH:MM:SS` into a duration.
pub fn parse_wall_clock(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("wall clock limit is empty".to_string());
    }
    let (days, rest) = match raw.split_once('-') {
        Some((days, rest)) => (
            days.parse::<u64>()
                .map_err(|_| format!("invalid day count in {raw:?}"))?,
            rest,
        ),
        None => (0, raw),
    };
    let parts = rest
        .split(':')
        .map(|part| part.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("invalid wall clock limit {raw:?}"))?;
    let secs = match parts.as_slice() {
        [m] if days == 0 => m * 60,
        [h] => h * 3600,
        [m, s] if days == 0 => m * 60 + s,
        [h, m] => h * 3600 + m * 60,
        [h, m, s] => h * 3600 + m * 60 + s,
        _ => return Err(format!("invalid wall clock limit {raw:?}")),
    };
    let total = days * 86_400 + secs;
    if total == 0 {
        return Err("wall clock limit must be positive".to_string());
    }
    Ok(Duration::from_secs(total))
}

/// Formats a duration the way Slurm's `--time` accepts it.
pub fn format_wall_clock(limit: Duration) -> String {
    let total = limit.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// K-point sampling, one variant per KPOINTS layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KMesh {
    Gamma {
        grid: [u32; 3],
        #[serde(default)]
        shift: [f64; 3],
    },
    MonkhorstPack {
        grid: [u32; 3],
        #[serde(default)]
        shift: [f64; 3],
    },
    LineMode {
        divisions: u32,
        /// Pairs of labelled points in reciprocal coordinates.
        path: Vec<[KPathPoint; 2]>,
    },
    Explicit {
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KPathPoint {
    pub label: String,
    pub coords: [f64; 3],
}

/// Parameter mapping handed over by the upstream planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverParams {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub k_mesh: Option<KMesh>,
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub bundle: FileBundle,
    pub resources: ResourceRequest,
    pub params: SolverParams,
    /// Remote path of a restart artifact from an earlier run.
    pub checkpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Prepared,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Interrupted,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Prepared => "prepared",
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether a poll reported a final outcome for the current attempt.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Interrupted
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Succeeded | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Prepared, Submitted | Failed) => true,
            (Submitted, Running | Succeeded | Failed | Interrupted) => true,
            // Requeue after preemption or node failure.
            (Running, Submitted | Succeeded | Failed | Interrupted) => true,
            (Interrupted | Failed, Submitted | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRecord {
    /// Retry count at the time of the decision.
    pub attempt: u32,
    pub plan: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Scheduler view of a job after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Queued,
    Running,
    Completed,
    Failed,
    /// Killed by the platform (time limit, node failure, preemption).
    Lost,
    NotFound,
}

impl SchedulerState {
    pub fn is_active(self) -> bool {
        matches!(self, SchedulerState::Queued | SchedulerState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    RetriesExhausted,
    Unrecoverable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    ResubmitFromCheckpoint {
        role: String,
        artifact: FileEntry,
        reason: String,
    },
    RegenerateAndResubmit {
        files: Vec<(String, FileEntry)>,
        reason: String,
    },
    ResubmitUnchanged {
        reason: String,
    },
    Abort {
        cause: AbortCause,
        reason: String,
    },
}

impl RecoveryPlan {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryPlan::ResubmitFromCheckpoint { .. } => "resubmit_from_checkpoint",
            RecoveryPlan::RegenerateAndResubmit { .. } => "regenerate_and_resubmit",
            RecoveryPlan::ResubmitUnchanged { .. } => "resubmit_unchanged",
            RecoveryPlan::Abort { .. } => "abort",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RecoveryPlan::ResubmitFromCheckpoint { reason, .. }
            | RecoveryPlan::RegenerateAndResubmit { reason, .. }
            | RecoveryPlan::ResubmitUnchanged { reason }
            | RecoveryPlan::Abort { reason, .. } => reason,
        }
    }

    pub fn is_resubmit(&self) -> bool {
        !matches!(self, RecoveryPlan::Abort { .. })
    }
}

/// Mutable record of one supervised job.
#[derive(Debug, Clone)]
pub struct RemoteJob {
    pub name: String,
    pub remote_dir: String,
    pub scheduler_id: Option<String>,
    pub state: JobState,
    pub submitted_at: Option<OffsetDateTime>,
    pub last_poll_at: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub spec: Arc<JobSpec>,
    pub history: Vec<StateTransition>,
    pub decisions: Vec<DecisionRecord>,
    pub cancel_requests: u32,
    pub finished: bool,
}

impl RemoteJob {
    pub fn new(spec: Arc<JobSpec>, remote_dir: String) -> Self {
        Self {
            name: spec.name.clone(),
            remote_dir,
            scheduler_id: None,
            state: JobState::Prepared,
            submitted_at: None,
            last_poll_at: None,
            retry_count: 0,
            spec,
            history: Vec::new(),
            decisions: Vec::new(),
            cancel_requests: 0,
            finished: false,
        }
    }

    /// Moves to `next`, recording the transition. Repeating the current
    /// state is a no-op so steady polls do not flood the history.
    pub fn transition(
        &mut self,
        next: JobState,
        at: OffsetDateTime,
        reason: impl Into<String>,
    ) -> AppResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("job {} cannot move from {} to {}", self.name, self.state, next),
            ));
        }
        self.history.push(StateTransition {
            from: self.state,
            to: next,
            at,
            reason: reason.into(),
        });
        self.state = next;
        Ok(())
    }

    pub fn record_decision(&mut self, plan: &RecoveryPlan, at: OffsetDateTime) {
        self.decisions.push(DecisionRecord {
            attempt: self.retry_count,
            plan: plan.label().to_string(),
            reason: plan.reason().to_string(),
            at,
        });
    }

    pub fn last_decision_reason(&self) -> Option<String> {
        self.decisions.last().map(|d| d.reason.clone())
    }

    /// Cancellation is accepted until the record is finalized.
    pub fn is_cancellable(&self) -> bool {
        !self.finished && self.state != JobState::Cancelled
    }
}

/// Audit record persisted once supervision ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub scheduler_id: Option<String>,
    pub final_state: JobState,
    pub remote_dir: String,
    pub bundle_hash: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub retry_count: u32,
    pub metrics: BTreeMap<String, f64>,
    pub history: Vec<StateTransition>,
    pub decisions: Vec<DecisionRecord>,
    pub failure: Option<String>,
    pub results_dir: Option<String>,
}

/// Connection parameters for the cluster login node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub identity_path: Option<String>,
    pub known_hosts_path: Option<String>,
    pub keepalive_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> FileBundle {
        let mut bundle = FileBundle::new();
        bundle.insert(roles::PARAMETERS, FileEntry::new("INCAR", "ENCUT = 520\n"));
        bundle.insert(roles::STRUCTURE, FileEntry::new("POSCAR", "Si\n1.0\n"));
        bundle
    }

    #[test]
    fn unchanged_bundle_keeps_content_hash() {
        let original = bundle();
        let resubmitted = original.with_role(
            roles::PARAMETERS,
            FileEntry::new("INCAR", "ENCUT = 520\n"),
        );
        assert_eq!(original.content_hash(), resubmitted.content_hash());
    }

    #[test]
    fn replaced_role_changes_content_hash() {
        let original = bundle();
        let changed = original.with_role(
            roles::STRUCTURE,
            FileEntry::new("POSCAR", "Si relaxed\n1.0\n"),
        );
        assert_ne!(original.content_hash(), changed.content_hash());
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn parses_wall_clock_formats() {
        assert_eq!(parse_wall_clock("02:00:00"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_wall_clock("1-00:30:00"), Ok(Duration::from_secs(88_200)));
        assert_eq!(parse_wall_clock("45"), Ok(Duration::from_secs(2700)));
        assert!(parse_wall_clock("").is_err());
        assert!(parse_wall_clock("aa:bb").is_err());
        assert!(parse_wall_clock("00:00:00").is_err());
    }

    #[test]
    fn formats_wall_clock_for_slurm() {
        assert_eq!(format_wall_clock(Duration::from_secs(7200)), "02:00:00");
        assert_eq!(format_wall_clock(Duration::from_secs(90_061)), "1-01:01:01");
    }

    #[test]
    fn state_machine_rejects_leaving_terminal_states() {
        assert!(JobState::Prepared.can_transition_to(JobState::Submitted));
        assert!(JobState::Interrupted.can_transition_to(JobState::Submitted));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Submitted));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Running));
        assert!(!JobState::Prepared.can_transition_to(JobState::Running));
    }

    #[test]
    fn running_job_can_be_requeued() {
        assert!(JobState::Running.can_transition_to(JobState::Submitted));
        assert!(JobState::Submitted.can_transition_to(JobState::Running));
    }

    #[test]
    fn transition_records_history_once_per_change() {
        let spec = Arc::new(JobSpec {
            name: "si".into(),
            bundle: bundle(),
            resources: ResourceRequest {
                nodes: 1,
                tasks_per_node: 4,
                wall_clock: Duration::from_secs(60),
                partition: None,
            },
            params: SolverParams::default(),
            checkpoint: None,
        });
        let mut job = RemoteJob::new(spec, "/scratch/si".into());
        let now = OffsetDateTime::UNIX_EPOCH;
        job.transition(JobState::Submitted, now, "submitted").unwrap();
        job.transition(JobState::Running, now, "poll").unwrap();
        job.transition(JobState::Running, now, "poll").unwrap();
        assert_eq!(job.history.len(), 2);
        let err = job.transition(JobState::Prepared, now, "bogus").unwrap_err();
        assert_eq!(err.code(), codes::CONFLICT);
    }
}
