// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::app::errors::{AppError, SubmissionError};
use crate::app::ports::RemoteSessionPort;
use crate::app::services::scheduler::{JobIdPattern, SchedulerCommands};
use crate::app::types::{FileBundle, FileEntry, ResourceRequest, format_wall_clock, roles};

pub const MANIFEST_FILE_NAME: &str = "hashes.json";
const MANIFEST_ROLE: &str = "manifest";

/// How the solver is launched inside the batch script.
#[derive(Debug, Clone)]
pub struct SolverLaunch {
    pub modules: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub launch_command: String,
    /// Scheduler stdout file, relative to the job directory.
    pub stdout_log: String,
}

impl Default for SolverLaunch {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            environment: BTreeMap::new(),
            launch_command: "mpirun -np $SLURM_NTASKS vasp_std".to_string(),
            stdout_log: "vasp.out".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum SubmitFailure {
    Transport(AppError),
    Rejected(SubmissionError),
}

impl From<AppError> for SubmitFailure {
    fn from(err: AppError) -> Self {
        SubmitFailure::Transport(err)
    }
}

impl From<SubmissionError> for SubmitFailure {
    fn from(err: SubmissionError) -> Self {
        SubmitFailure::Rejected(err)
    }
}

#[derive(Debug, Clone)]
pub struct Submitter {
    commands: SchedulerCommands,
    job_id: JobIdPattern,
    launch: SolverLaunch,
    descriptor_name: String,
}

impl Submitter {
    pub fn new(
        commands: SchedulerCommands,
        job_id: JobIdPattern,
        launch: SolverLaunch,
        descriptor_name: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            job_id,
            launch,
            descriptor_name: descriptor_name.into(),
        }
    }

    pub fn render_descriptor(
        &self,
        job_name: &str,
        resources: &ResourceRequest,
    ) -> Result<String, SubmissionError> {
        if resources.nodes == 0 || resources.tasks_per_node == 0 {
            return Err(SubmissionError::InvalidRequest(
                "node and task counts must be positive".to_string(),
            ));
        }
        if job_name.trim().is_empty() || job_name.chars().any(char::is_whitespace) {
            return Err(SubmissionError::InvalidRequest(format!(
                "job name {job_name:?} must be non-empty without whitespace"
            )));
        }
        let mut out = String::from("#!/bin/bash\n");
        let _ = writeln!(out, "#SBATCH --job-name={job_name}");
        let _ = writeln!(out, "#SBATCH --nodes={}", resources.nodes);
        let _ = writeln!(out, "#SBATCH --ntasks-per-node={}", resources.tasks_per_node);
        let _ = writeln!(out, "#SBATCH --time={}", format_wall_clock(resources.wall_clock));
        if let Some(partition) = resources.partition.as_deref().filter(|p| !p.is_empty()) {
            let _ = writeln!(out, "#SBATCH --partition={partition}");
        }
        let _ = writeln!(out, "#SBATCH --output={}", self.launch.stdout_log);
        out.push('\n');
        for module in &self.launch.modules {
            let _ = writeln!(out, "module load {module}");
        }
        for (key, value) in &self.launch.environment {
            let _ = writeln!(out, "export {key}={value}");
        }
        let _ = writeln!(out, "{}", self.launch.launch_command);
        Ok(out)
    }

    /// The inputs plus the rendered descriptor and the hash manifest.
    pub fn stage(
        &self,
        job_name: &str,
        bundle: &FileBundle,
        resources: &ResourceRequest,
    ) -> Result<FileBundle, SubmissionError> {
        let descriptor = self.render_descriptor(job_name, resources)?;
        let manifest = serde_json::to_string_pretty(&bundle.manifest())
            .map_err(|err| SubmissionError::InvalidRequest(err.to_string()))?;
        let mut staged = bundle.clone();
        staged.insert(
            roles::DESCRIPTOR,
            FileEntry::new(self.descriptor_name.clone(), descriptor),
        );
        staged.insert(MANIFEST_ROLE, FileEntry::new(MANIFEST_FILE_NAME, manifest));
        Ok(staged)
    }

    /// Issues the submit command in `remote_dir` and reads the job id.
    pub async fn issue(
        &self,
        session: &dyn RemoteSessionPort,
        job_name: &str,
        remote_dir: &str,
    ) -> Result<String, SubmitFailure> {
        let command = self
            .commands
            .submit_command(remote_dir, &self.descriptor_name, job_name);
        let capture = session.run(&command).await?;
        if capture.exit_code != 0 {
            return Err(SubmissionError::Rejected {
                exit_code: capture.exit_code,
                detail: capture.detail(),
            }
            .into());
        }
        Ok(self.job_id.parse(&capture.stdout_text())?)
    }

    /// Finds a job with this name that the scheduler already knows about.
    pub async fn lookup(
        &self,
        session: &dyn RemoteSessionPort,
        job_name: &str,
    ) -> Result<Option<String>, AppError> {
        let Some(command) = self.commands.lookup_command(job_name) else {
            return Ok(None);
        };
        let capture = session.run(&command).await?;
        if capture.exit_code != 0 {
            return Ok(None);
        }
        Ok(capture
            .stdout_text()
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string))
    }
}
