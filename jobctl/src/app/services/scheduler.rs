// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use regex::Regex;

use crate::app::errors::{AppError, AppErrorKind, AppResult, SubmissionError, codes};
use crate::app::services::shell::render_command;
use crate::app::types::SchedulerState;

pub const DEFAULT_SUBMIT_COMMAND: &str = "cd {workdir} && sbatch {script}";
pub const DEFAULT_STATUS_COMMAND: &str = "squeue -j {job_id} -h -o %T";
pub const DEFAULT_HISTORY_COMMAND: &str = "sacct -j {job_id} -n -P -o State";
pub const DEFAULT_CANCEL_COMMAND: &str = "scancel {job_id}";
pub const DEFAULT_LOOKUP_COMMAND: &str = "squeue -h -n {job_name} -o %i";
pub const DEFAULT_JOB_ID_PATTERN: &str = r"^Submitted batch job (\d+)$";

/// Scheduler CLI templates. Placeholders: `{workdir}`, `{script}`,
/// `{job_id}`, `{job_name}`.
#[derive(Debug, Clone)]
pub struct SchedulerCommands {
    pub submit: String,
    pub status: String,
    pub history: Option<String>,
    pub cancel: String,
    pub lookup: Option<String>,
}

impl Default for SchedulerCommands {
    fn default() -> Self {
        Self {
            submit: DEFAULT_SUBMIT_COMMAND.to_string(),
            status: DEFAULT_STATUS_COMMAND.to_string(),
            history: Some(DEFAULT_HISTORY_COMMAND.to_string()),
            cancel: DEFAULT_CANCEL_COMMAND.to_string(),
            lookup: Some(DEFAULT_LOOKUP_COMMAND.to_string()),
        }
    }
}

impl SchedulerCommands {
    pub fn submit_command(&self, workdir: &str, script: &str, job_name: &str) -> String {
        render_command(
            &self.submit,
            &[("workdir", workdir), ("script", script), ("job_name", job_name)],
        )
    }

    pub fn status_command(&self, job_id: &str) -> String {
        render_command(&self.status, &[("job_id", job_id)])
    }

    pub fn history_command(&self, job_id: &str) -> Option<String> {
        self.history
            .as_deref()
            .map(|template| render_command(template, &[("job_id", job_id)]))
    }

    pub fn cancel_command(&self, job_id: &str) -> String {
        render_command(&self.cancel, &[("job_id", job_id)])
    }

    pub fn lookup_command(&self, job_name: &str) -> Option<String> {
        self.lookup
            .as_deref()
            .map(|template| render_command(template, &[("job_name", job_name)]))
    }
}

/// Strict job id extractor for submit output.
#[derive(Debug, Clone)]
pub struct JobIdPattern {
    regex: Regex,
}

impl JobIdPattern {
    pub fn new(pattern: &str) -> AppResult<Self> {
        let regex = Regex::new(pattern).map_err(|err| {
            AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("invalid job id pattern {pattern:?}: {err}"),
            )
        })?;
        if regex.captures_len() < 2 {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("job id pattern {pattern:?} has no capture group"),
            ));
        }
        Ok(Self { regex })
    }

    /// Matches each trimmed stdout line; the first capture group is the id.
    pub fn parse(&self, stdout: &str) -> Result<String, SubmissionError> {
        stdout
            .lines()
            .map(str::trim)
            .find_map(|line| {
                self.regex
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SubmissionError::UnparsableJobId {
                output: stdout.trim().to_string(),
            })
    }
}

pub fn normalize_state(state: &str) -> String {
    let token = state
        .split(|c: char| c == '+' || c == ':' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

pub fn classify_state(state: &str) -> Option<SchedulerState> {
    let normalized = normalize_state(state);
    let class = match normalized.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
        | "SUSPENDED" | "RESIZING" => SchedulerState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_IN" | "STAGE_OUT" | "SIGNALING" => {
            SchedulerState::Running
        }
        "COMPLETED" => SchedulerState::Completed,
        "FAILED" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" | "CANCELLED" | "REVOKED"
        | "SPECIAL_EXIT" => SchedulerState::Failed,
        "TIMEOUT" | "NODE_FAIL" | "PREEMPTED" => SchedulerState::Lost,
        _ => return None,
    };
    Some(class)
}

/// First non-empty line of a status query, as reported.
pub fn parse_status_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

pub fn parse_history_states(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let state = line.split('|').next().unwrap_or(line).trim();
            if state.is_empty() {
                None
            } else {
                Some(state.to_string())
            }
        })
        .collect()
}

/// Collapses accounting rows (job plus its steps) into one state.
/// Any active row wins; otherwise the first non-completed row wins.
pub fn history_state(output: &str) -> Option<(SchedulerState, String)> {
    let mut classified = Vec::new();
    for raw in parse_history_states(output) {
        let Some(class) = classify_state(&raw) else {
            continue;
        };
        if class.is_active() {
            return Some((class, normalize_state(&raw)));
        }
        classified.push((class, normalize_state(&raw)));
    }
    if classified.is_empty() {
        return None;
    }
    classified
        .iter()
        .find(|(class, _)| *class != SchedulerState::Completed)
        .or_else(|| classified.first())
        .cloned()
}

pub fn is_invalid_job_id(output: &str) -> bool {
    output.to_ascii_lowercase().contains("invalid job id")
}
