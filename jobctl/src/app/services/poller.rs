// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::RemoteSessionPort;
use crate::app::services::scheduler::{
    SchedulerCommands, classify_state, history_state, is_invalid_job_id, parse_status_output,
};
use crate::app::services::shell::remote_join;
use crate::app::types::{JobState, RemoteJob, SchedulerState};

/// Version-pinned marker strings searched in the primary log.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    pub success: Vec<String>,
    pub fatal: Vec<String>,
    /// Fatal markers that no resubmission can fix.
    pub unrecoverable: Vec<String>,
}

impl Default for MarkerSet {
    fn default() -> Self {
        let owned =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            success: owned(&["General timing and accounting informations for this job"]),
            fatal: owned(&[
                "VERY BAD NEWS",
                "ZBRENT: fatal error",
                "Error EDDDAV",
                "EDDDAV: Call to ZHEGV failed",
                "ERROR",
                "Error reading item",
                "number of potentials on File POTCAR incompatible",
            ]),
            unrecoverable: owned(&[
                "Error reading item",
                "number of potentials on File POTCAR incompatible",
                "ERROR: there must be 1 or 3 items on line 2 of POSCAR",
            ]),
        }
    }
}

/// What the log says, independent of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogMarkers {
    pub fatal: Option<String>,
    pub success: bool,
    pub unrecoverable: Option<String>,
}

impl MarkerSet {
    pub fn scan(&self, log: &str) -> LogMarkers {
        let find = |markers: &[String]| {
            markers
                .iter()
                .find(|marker| !marker.is_empty() && log.contains(marker.as_str()))
                .cloned()
        };
        LogMarkers {
            fatal: find(&self.fatal).or_else(|| find(&self.unrecoverable)),
            success: find(&self.success).is_some(),
            unrecoverable: find(&self.unrecoverable),
        }
    }
}

/// Result of one poll. `state` is the canonical classification; the rest
/// is evidence for logging and recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub state: JobState,
    pub scheduler: SchedulerState,
    pub raw_state: Option<String>,
    pub markers: LogMarkers,
    pub reason: String,
}

/// Combines scheduler state and log markers. Fatal beats success, and a
/// finished job without a success marker is never a success.
pub fn reconcile(scheduler: SchedulerState, markers: &LogMarkers) -> (JobState, String) {
    match scheduler {
        SchedulerState::Queued => (JobState::Submitted, "queued".to_string()),
        SchedulerState::Running => (JobState::Running, "running".to_string()),
        _ => {
            if let Some(marker) = &markers.fatal {
                return (JobState::Failed, format!("fatal marker {marker:?} in log"));
            }
            match (scheduler, markers.success) {
                (SchedulerState::Completed | SchedulerState::NotFound, true) => {
                    (JobState::Succeeded, "success marker in log".to_string())
                }
                (_, true) => (
                    JobState::Interrupted,
                    format!("success marker but scheduler reports {scheduler:?}"),
                ),
                (SchedulerState::Failed, false) => (
                    JobState::Failed,
                    "scheduler reports failure without log markers".to_string(),
                ),
                (SchedulerState::Completed, false) => (
                    JobState::Interrupted,
                    "scheduler reports completion without a success marker".to_string(),
                ),
                (SchedulerState::Lost, false) => (
                    JobState::Interrupted,
                    "job was stopped by the platform".to_string(),
                ),
                _ => (
                    JobState::Interrupted,
                    "scheduler no longer knows the job and the log has no terminal marker"
                        .to_string(),
                ),
            }
        }
    }
}

/// Stateless reader of scheduler and log state.
#[derive(Debug, Clone)]
pub struct Poller {
    commands: SchedulerCommands,
    markers: MarkerSet,
    primary_log: String,
}

impl Poller {
    pub fn new(
        commands: SchedulerCommands,
        markers: MarkerSet,
        primary_log: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            markers,
            primary_log: primary_log.into(),
        }
    }

    pub async fn poll(
        &self,
        session: &dyn RemoteSessionPort,
        job: &RemoteJob,
    ) -> AppResult<PollReport> {
        let scheduler_id = job.scheduler_id.as_deref().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("job {} has no scheduler id to poll", job.name),
            )
        })?;
        let (scheduler, raw_state) = self.scheduler_state(session, scheduler_id).await?;
        let markers = if scheduler.is_active() {
            Default::default()
        } else {
            self.read_markers(session, &job.remote_dir).await?
        };
        let (state, reason) = reconcile(scheduler, &markers);
        tracing::debug!(
            job = %job.name,
            scheduler_id,
            raw_state = raw_state.as_deref().unwrap_or(""),
            state = state.as_str(),
            %reason,
            "poll"
        );
        Ok(PollReport {
            state,
            scheduler,
            raw_state,
            markers,
            reason,
        })
    }

    /// Live queue first; accounting history once the queue forgets the job.
    pub async fn scheduler_state(
        &self,
        session: &dyn RemoteSessionPort,
        scheduler_id: &str,
    ) -> AppResult<(SchedulerState, Option<String>)> {
        let capture = session.run(&self.commands.status_command(scheduler_id)).await?;
        if capture.exit_code == 0 {
            if let Some(raw) = parse_status_output(&capture.stdout_text()) {
                match classify_state(&raw) {
                    Some(class) => return Ok((class, Some(raw))),
                    None => {
                        tracing::warn!(scheduler_id, state = %raw, "unrecognized scheduler state");
                    }
                }
            }
        } else if !is_invalid_job_id(&capture.detail()) {
            return Err(AppError::with_message(
                AppErrorKind::Aborted,
                codes::REMOTE_ERROR,
                format!(
                    "status query for job {scheduler_id} failed with exit code {}: {}",
                    capture.exit_code,
                    capture.detail()
                ),
            ));
        }

        let Some(history) = self.commands.history_command(scheduler_id) else {
            return Ok((SchedulerState::NotFound, None));
        };
        let capture = session.run(&history).await?;
        if capture.exit_code != 0 {
            tracing::debug!(
                scheduler_id,
                exit_code = capture.exit_code,
                "history query failed; treating job as not found"
            );
            return Ok((SchedulerState::NotFound, None));
        }
        Ok(match history_state(&capture.stdout_text()) {
            Some((class, raw)) => (class, Some(raw)),
            None => (SchedulerState::NotFound, None),
        })
    }

    async fn read_markers(
        &self,
        session: &dyn RemoteSessionPort,
        remote_dir: &str,
    ) -> AppResult<LogMarkers> {
        let path = remote_join(remote_dir, &self.primary_log);
        match session.get_file(&path).await {
            Ok(bytes) => Ok(self.markers.scan(&String::from_utf8_lossy(&bytes))),
            Err(err) if err.is_not_found() => {
                tracing::debug!(%path, "primary log is missing");
                Ok(LogMarkers::default())
            }
            Err(err) => Err(err),
        }
    }
}
