// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::errors::{
    AppError, AppErrorKind, AppResult, JobError, JobFailure, SubmissionError, codes,
};
use crate::app::ports::{
    ClockPort, JobSummaryStorePort, LocalFilesystemPort, RemoteSessionPort, RemoteTransportPort,
    TelemetryEvent, TelemetryPort,
};
use crate::app::services::backoff::RetryPolicy;
use crate::app::services::generators::RoleGenerators;
use crate::app::services::metrics::extract_metrics;
use crate::app::services::poller::{MarkerSet, PollReport, Poller};
use crate::app::services::recovery::{RecoveryEngine, RecoveryEvidence, RecoveryPolicy};
use crate::app::services::scheduler::{JobIdPattern, SchedulerCommands};
use crate::app::services::shell::remote_join;
use crate::app::services::submitter::{SolverLaunch, SubmitFailure, Submitter};
use crate::app::services::validator::validate;
use crate::app::types::{
    AbortCause, FileBundle, FileEntry, JobSpec, JobState, JobSummary, RecoveryPlan, RemoteJob,
    SshConfig, roles,
};

#[derive(Debug, Clone)]
pub struct ResultsConfig {
    pub dir: PathBuf,
    pub artifacts: Vec<String>,
    pub large_artifacts: Vec<String>,
    pub fetch_large: bool,
}

/// Everything the controller needs, resolved once at startup and never
/// changed afterwards.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ssh: SshConfig,
    pub work_dir: String,
    pub commands: SchedulerCommands,
    pub job_id: JobIdPattern,
    pub descriptor_name: String,
    pub launch: SolverLaunch,
    pub markers: MarkerSet,
    pub primary_log: String,
    pub recovery: RecoveryPolicy,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub results: ResultsConfig,
}

struct JobSlot {
    job: Mutex<RemoteJob>,
    cancel: watch::Sender<bool>,
}

impl JobSlot {
    fn lock(&self) -> MutexGuard<'_, RemoteJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle held by one supervision task.
struct Supervision {
    slot: Arc<JobSlot>,
    cancel: watch::Receiver<bool>,
}

impl Supervision {
    fn snapshot(&self) -> RemoteJob {
        self.slot.lock().clone()
    }

    fn check(&self) -> Result<(), JobFailure> {
        if *self.cancel.borrow() {
            return Err(JobFailure::Cancelled);
        }
        Ok(())
    }

    async fn wait(&self, delay: Duration) -> Result<(), JobFailure> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancellation(self.cancel.clone()) => Err(JobFailure::Cancelled),
        }
    }
}

/// Resolves once the flag is raised. Never resolves if the sender is gone.
async fn cancellation(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn optional<T>(result: AppResult<T>) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

fn check_job_name(name: &str) -> Result<(), SubmissionError> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SubmissionError::InvalidRequest(format!(
            "job name {name:?} cannot be used as a directory name"
        )));
    }
    Ok(())
}

/// Failures after which the job can no longer be considered alive.
fn ends_in_failure(failure: &JobFailure) -> bool {
    matches!(
        failure,
        JobFailure::Validation(_)
            | JobFailure::Submission(_)
            | JobFailure::RecoveryExhausted { .. }
            | JobFailure::Unrecoverable(_)
    )
}

fn job_error(job: &RemoteJob, failure: JobFailure) -> JobError {
    JobError {
        failure,
        last_state: job.state,
        last_decision: job.last_decision_reason(),
        history: job.history.clone(),
        decisions: job.decisions.clone(),
    }
}

struct Collected {
    results_dir: PathBuf,
    metrics: BTreeMap<String, f64>,
}

#[derive(Clone)]
pub struct JobController {
    config: Arc<ControllerConfig>,
    submitter: Arc<Submitter>,
    poller: Arc<Poller>,
    recovery: Arc<RecoveryEngine>,
    transport: Arc<dyn RemoteTransportPort>,
    store: Arc<dyn JobSummaryStorePort>,
    local_fs: Arc<dyn LocalFilesystemPort>,
    clock: Arc<dyn ClockPort>,
    telemetry: Arc<dyn TelemetryPort>,
    jobs: Arc<Mutex<HashMap<String, Arc<JobSlot>>>>,
}

impl JobController {
    pub fn new(
        config: Arc<ControllerConfig>,
        transport: Arc<dyn RemoteTransportPort>,
        store: Arc<dyn JobSummaryStorePort>,
        local_fs: Arc<dyn LocalFilesystemPort>,
        clock: Arc<dyn ClockPort>,
        telemetry: Arc<dyn TelemetryPort>,
    ) -> Self {
        let submitter = Submitter::new(
            config.commands.clone(),
            config.job_id.clone(),
            config.launch.clone(),
            config.descriptor_name.clone(),
        );
        let poller = Poller::new(
            config.commands.clone(),
            config.markers.clone(),
            config.primary_log.clone(),
        );
        let recovery = RecoveryEngine::new(config.recovery.clone(), RoleGenerators::default());
        Self {
            config,
            submitter: Arc::new(submitter),
            poller: Arc::new(poller),
            recovery: Arc::new(recovery),
            transport,
            store,
            local_fs,
            clock,
            telemetry,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs [`JobController::run`] on its own task.
    pub fn spawn(&self, spec: JobSpec) -> JoinHandle<Result<JobSummary, JobError>> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run(spec).await })
    }

    /// Supervises one job from validation to a terminal outcome.
    pub async fn run(&self, spec: JobSpec) -> Result<JobSummary, JobError> {
        let spec = Arc::new(spec);
        let ctx = self.register(spec.clone())?;
        let span = tracing::info_span!("job", name = %spec.name, attempt = 0u32);
        async move {
            let mut bundle = spec.bundle.clone();
            let outcome = self.supervise(&ctx, &mut bundle).await;
            self.finish(&ctx, &bundle, outcome).await
        }
        .instrument(span)
        .await
    }

    /// Snapshot of a job's record, finished jobs included.
    pub fn status(&self, name: &str) -> AppResult<RemoteJob> {
        Ok(self.slot(name)?.lock().clone())
    }

    /// Marks the job cancelled right away, then asks the scheduler to drop
    /// it. The remote request is best effort.
    pub async fn cancel(&self, name: &str) -> AppResult<()> {
        let slot = self.slot(name)?;
        let now = self.clock.now_utc();
        let job = {
            let mut job = slot.lock();
            if !job.is_cancellable() {
                return Err(AppError::with_message(
                    AppErrorKind::Conflict,
                    codes::CONFLICT,
                    format!("job {name} is already {}", job.state),
                ));
            }
            job.transition(JobState::Cancelled, now, "cancel requested")?;
            job.clone()
        };
        slot.cancel.send_replace(true);
        tracing::info!(job = %name, "cancel requested");
        self.emit("job.cancel.requested", &job, None);
        if let Some(scheduler_id) = job.scheduler_id.as_deref() {
            self.remote_cancel(&slot, scheduler_id).await;
        }
        Ok(())
    }

    /// Cancels every job still under supervision. Returns how many were hit.
    pub async fn cancel_all(&self) -> usize {
        let names: Vec<String> = self.registry().keys().cloned().collect();
        let mut cancelled = 0;
        for name in names {
            match self.cancel(&name).await {
                Ok(()) => cancelled += 1,
                Err(err) if err.kind() == AppErrorKind::Conflict => {}
                Err(err) => tracing::warn!(job = %name, error = %err, "cancel failed"),
            }
        }
        cancelled
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<JobSlot>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, name: &str) -> AppResult<Arc<JobSlot>> {
        self.registry().get(name).cloned().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("job {name} is not known"),
            )
        })
    }

    fn register(&self, spec: Arc<JobSpec>) -> Result<Supervision, JobError> {
        if let Err(err) = check_job_name(&spec.name) {
            return Err(JobError::bare(JobFailure::Submission(err), JobState::Prepared));
        }
        let mut jobs = self.registry();
        if let Some(existing) = jobs.get(&spec.name) {
            let existing = existing.lock();
            if !existing.finished {
                return Err(JobError::bare(
                    JobFailure::Conflict(spec.name.clone()),
                    existing.state,
                ));
            }
        }
        let name = spec.name.clone();
        let remote_dir = remote_join(&self.config.work_dir, &name);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let slot = Arc::new(JobSlot {
            job: Mutex::new(RemoteJob::new(spec, remote_dir)),
            cancel: cancel_tx,
        });
        jobs.insert(name, slot.clone());
        Ok(Supervision {
            slot,
            cancel: cancel_rx,
        })
    }

    async fn supervise(
        &self,
        ctx: &Supervision,
        bundle: &mut FileBundle,
    ) -> Result<Collected, JobFailure> {
        validate(bundle)?;
        let checkpoint = ctx.slot.lock().spec.checkpoint.clone();
        if let Some(path) = checkpoint {
            self.seed_checkpoint(ctx, bundle, &path).await?;
            validate(bundle)?;
        }

        loop {
            self.submit_attempt(ctx, bundle).await?;
            let report = self.await_outcome(ctx).await?;
            if report.state == JobState::Succeeded {
                return self.collect_results(ctx).await;
            }

            match self.plan_recovery(ctx, bundle, &report).await? {
                RecoveryPlan::Abort {
                    cause: AbortCause::RetriesExhausted,
                    ..
                } => {
                    let attempts = ctx.snapshot().retry_count + 1;
                    return Err(JobFailure::RecoveryExhausted { attempts });
                }
                RecoveryPlan::Abort {
                    cause: AbortCause::Unrecoverable,
                    reason,
                } => return Err(JobFailure::Unrecoverable(reason)),
                RecoveryPlan::ResubmitFromCheckpoint { role, artifact, .. } => {
                    bundle.insert(role, artifact);
                }
                RecoveryPlan::RegenerateAndResubmit { files, .. } => {
                    for (role, entry) in files {
                        bundle.insert(role, entry);
                    }
                }
                RecoveryPlan::ResubmitUnchanged { .. } => {}
            }
            // A resubmitted bundle passes the same checks as the first one.
            validate(bundle)?;
        }
    }

    /// Replaces the checkpoint role with a restart file from an earlier run.
    async fn seed_checkpoint(
        &self,
        ctx: &Supervision,
        bundle: &mut FileBundle,
        path: &str,
    ) -> Result<(), JobFailure> {
        let content = self
            .retrying(ctx, "checkpoint fetch", move || async move {
                let session = self.open(Some(&ctx.cancel)).await?;
                self.deadline("checkpoint fetch", session.get_file(path)).await
            })
            .await?;
        let role = self.config.recovery.checkpoint_role.as_str();
        let file_name = bundle
            .get(role)
            .map(|entry| entry.file_name.clone())
            .or_else(|| roles::default_file_name(role).map(str::to_string))
            .unwrap_or_else(|| role.to_string());
        tracing::info!(%path, role, "starting from checkpoint");
        bundle.insert(role, FileEntry::new(file_name, content));
        Ok(())
    }

    /// Files a finished attempt leaves in the job directory. Inputs are
    /// never listed.
    fn attempt_outputs(&self, bundle: &FileBundle) -> Vec<String> {
        let candidates = [
            &self.config.primary_log,
            &self.config.launch.stdout_log,
            &self.config.recovery.checkpoint_artifact,
        ]
        .into_iter()
        .chain(self.config.results.artifacts.iter());
        let mut outputs: Vec<String> = Vec::new();
        for name in candidates {
            let is_input = bundle.iter().any(|(_, entry)| entry.file_name == *name);
            if !name.is_empty() && !is_input && !outputs.contains(name) {
                outputs.push(name.clone());
            }
        }
        outputs
    }

    /// Clears outputs of earlier attempts, uploads the staged bundle and
    /// submits it. Markers found later always belong to this attempt.
    async fn submit_attempt(
        &self,
        ctx: &Supervision,
        bundle: &FileBundle,
    ) -> Result<(), JobFailure> {
        let job = ctx.snapshot();
        let staged = self
            .submitter
            .stage(&job.name, bundle, &job.spec.resources)?;
        let stale = self.attempt_outputs(bundle);
        self.emit("job.submit.started", &job, None);

        let (name, remote_dir) = (job.name.as_str(), job.remote_dir.as_str());
        let (staged_ref, stale_ref) = (&staged, &stale);
        self.retrying(ctx, "upload", move || async move {
            let session = self.open(Some(&ctx.cancel)).await?;
            for file_name in stale_ref {
                let path = remote_join(remote_dir, file_name);
                let removed = self.deadline("cleanup", session.remove_file(&path)).await;
                if optional(removed)?.is_some() {
                    tracing::debug!(%path, "removed output of an earlier attempt");
                }
            }
            self.deadline("upload", session.put_tree(staged_ref, remote_dir)).await
        })
        .await?;
        let scheduler_id = self.issue_submit(ctx, name, remote_dir).await?;

        let now = self.clock.now_utc();
        let cancelled = {
            let mut job = ctx.slot.lock();
            job.scheduler_id = Some(scheduler_id.clone());
            if job.state == JobState::Cancelled {
                true
            } else {
                job.submitted_at = Some(now);
                let reason = format!("scheduler accepted job {scheduler_id}");
                if let Err(err) = job.transition(JobState::Submitted, now, reason) {
                    tracing::warn!(error = %err, "state transition rejected");
                }
                false
            }
        };
        if cancelled {
            // The submit raced a cancel; the new job must not be left behind.
            self.remote_cancel(&ctx.slot, &scheduler_id).await;
            return Err(JobFailure::Cancelled);
        }
        tracing::info!(
            %scheduler_id,
            bundle_hash = %staged.content_hash(),
            "job submitted"
        );
        self.emit("job.submitted", &ctx.snapshot(), None);
        Ok(())
    }

    /// Issues the submit command. A transient failure may hide an accepted
    /// job, so the scheduler is asked by name before trying again.
    async fn issue_submit(
        &self,
        ctx: &Supervision,
        name: &str,
        remote_dir: &str,
    ) -> Result<String, JobFailure> {
        let mut attempt = 1;
        loop {
            ctx.check()?;
            let issued = async {
                let session = self.open(Some(&ctx.cancel)).await?;
                self.deadline("submit", self.submitter.issue(&*session, name, remote_dir))
                    .await
            }
            .await;
            match issued {
                Ok(scheduler_id) => return Ok(scheduler_id),
                Err(SubmitFailure::Rejected(err)) => return Err(err.into()),
                Err(SubmitFailure::Transport(err)) if err.kind() == AppErrorKind::Cancelled => {
                    return Err(JobFailure::Cancelled);
                }
                Err(SubmitFailure::Transport(err))
                    if err.is_transient() && self.config.retry.allows_retry(attempt) =>
                {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "submit failed; looking the job up by name"
                    );
                    ctx.wait(self.config.retry.delay(attempt)).await?;
                    let found = self
                        .retrying(ctx, "lookup", move || async move {
                            let session = self.open(Some(&ctx.cancel)).await?;
                            self.deadline("lookup", self.submitter.lookup(&*session, name))
                                .await
                        })
                        .await?;
                    if let Some(scheduler_id) = found {
                        tracing::info!(%scheduler_id, "scheduler already had the job; adopting it");
                        return Ok(scheduler_id);
                    }
                    attempt += 1;
                }
                Err(SubmitFailure::Transport(err)) => return Err(JobFailure::Transport(err)),
            }
        }
    }

    /// Polls until the current attempt reaches an outcome. Polls for one
    /// job never overlap.
    async fn await_outcome(&self, ctx: &Supervision) -> Result<PollReport, JobFailure> {
        loop {
            ctx.wait(self.config.poll_interval).await?;
            let job = ctx.snapshot();
            let job_ref = &job;
            let report = self
                .retrying(ctx, "poll", move || async move {
                    let session = self.open(Some(&ctx.cancel)).await?;
                    self.deadline("poll", self.poller.poll(&*session, job_ref)).await
                })
                .await?;

            let now = self.clock.now_utc();
            let cancelled = {
                let mut job = ctx.slot.lock();
                job.last_poll_at = Some(now);
                if job.state == JobState::Cancelled {
                    true
                } else {
                    let requeued =
                        job.state == JobState::Running && report.state == JobState::Submitted;
                    let reason = if requeued {
                        let raw = report.raw_state.as_deref().unwrap_or("queued");
                        format!("requeued by the scheduler ({raw})")
                    } else {
                        report.reason.clone()
                    };
                    if let Err(err) = job.transition(report.state, now, reason) {
                        tracing::warn!(error = %err, "ignoring poll result");
                    }
                    false
                }
            };
            if cancelled {
                return Err(self.cancelled_during_poll(ctx, &report).await);
            }
            self.emit("job.poll", &ctx.snapshot(), Some(report.reason.clone()));
            if report.state.is_outcome() {
                return Ok(report);
            }
        }
    }

    /// A poll that was already in flight when the job got cancelled.
    async fn cancelled_during_poll(&self, ctx: &Supervision, report: &PollReport) -> JobFailure {
        let scheduler_id = ctx.snapshot().scheduler_id;
        match scheduler_id {
            Some(scheduler_id) if report.scheduler.is_active() => {
                tracing::warn!(
                    %scheduler_id,
                    raw_state = report.raw_state.as_deref().unwrap_or(""),
                    "job still active after cancel; cancelling once more"
                );
                self.remote_cancel(&ctx.slot, &scheduler_id).await;
                JobFailure::Cancellation { scheduler_id }
            }
            _ => JobFailure::Cancelled,
        }
    }

    async fn plan_recovery(
        &self,
        ctx: &Supervision,
        bundle: &FileBundle,
        report: &PollReport,
    ) -> Result<RecoveryPlan, JobFailure> {
        let job = ctx.snapshot();
        let checkpoint_path =
            remote_join(&job.remote_dir, &self.config.recovery.checkpoint_artifact);
        let (remote_dir, checkpoint_path) = (job.remote_dir.as_str(), checkpoint_path.as_str());
        let gathered = self
            .retrying(ctx, "recovery probe", move || async move {
                let session = self.open(Some(&ctx.cancel)).await?;
                let probed = self
                    .deadline("checkpoint probe", session.get_file(checkpoint_path))
                    .await;
                let checkpoint = optional(probed)?;
                let mut remote = FileBundle::new();
                for (role, entry) in bundle.iter() {
                    let path = remote_join(remote_dir, &entry.file_name);
                    let fetched = self.deadline("bundle fetch", session.get_file(&path)).await;
                    if let Some(content) = optional(fetched)? {
                        remote.insert(role, FileEntry::new(entry.file_name.clone(), content));
                    }
                }
                Ok::<_, AppError>((checkpoint, remote))
            })
            .await;
        let (checkpoint, remote) = match gathered {
            Ok(gathered) => gathered,
            Err(JobFailure::Transport(err)) => {
                return Err(JobFailure::Interrupted(format!(
                    "{}; recovery context unavailable: {err}",
                    report.reason
                )));
            }
            Err(other) => return Err(other),
        };

        let evidence = RecoveryEvidence {
            checkpoint,
            unrecoverable: report.markers.unrecoverable.clone(),
        };
        let plan = self.recovery.plan(&job, &remote, &evidence);
        let now = self.clock.now_utc();
        let job = {
            let mut job = ctx.slot.lock();
            job.record_decision(&plan, now);
            if plan.is_resubmit() {
                job.retry_count += 1;
            }
            job.clone()
        };
        tracing::Span::current().record("attempt", job.retry_count);
        tracing::info!(plan = plan.label(), reason = plan.reason(), "recovery decision");
        self.emit(
            "job.recovery.plan",
            &job,
            Some(format!("{}: {}", plan.label(), plan.reason())),
        );
        Ok(plan)
    }

    async fn collect_results(&self, ctx: &Supervision) -> Result<Collected, JobFailure> {
        let job = ctx.snapshot();
        let results = &self.config.results;
        let mut wanted: Vec<(&str, bool)> = vec![
            (self.config.primary_log.as_str(), true),
            (self.config.launch.stdout_log.as_str(), true),
        ];
        let optional_names = results
            .artifacts
            .iter()
            .chain(results.large_artifacts.iter().filter(|_| results.fetch_large));
        for name in optional_names {
            if !wanted.iter().any(|(known, _)| *known == name.as_str()) {
                wanted.push((name.as_str(), false));
            }
        }

        let (remote_dir, wanted_ref) = (job.remote_dir.as_str(), &wanted);
        let fetched = self
            .retrying(ctx, "results fetch", move || async move {
                let session = self.open(Some(&ctx.cancel)).await?;
                let mut files = Vec::with_capacity(wanted_ref.len());
                for (name, required) in wanted_ref {
                    let path = remote_join(remote_dir, name);
                    match self.deadline("results fetch", session.get_file(&path)).await {
                        Ok(content) => files.push((name.to_string(), content)),
                        Err(err) if err.is_not_found() && !required => {
                            tracing::debug!(%path, "optional artifact is missing");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok::<_, AppError>(files)
            })
            .await
            .map_err(|failure| match failure {
                JobFailure::Transport(err) => JobFailure::Collection(err),
                other => other,
            })?;

        let local_dir = results.dir.join(&job.name);
        self.local_fs
            .create_dir_all(&local_dir)
            .await
            .map_err(JobFailure::Collection)?;
        let mut metrics = BTreeMap::new();
        for (name, content) in &fetched {
            self.local_fs
                .write_file(&local_dir.join(name), content)
                .await
                .map_err(JobFailure::Collection)?;
            if *name == self.config.primary_log {
                metrics = extract_metrics(&String::from_utf8_lossy(content));
            }
        }
        tracing::info!(dir = %local_dir.display(), files = fetched.len(), "results collected");
        Ok(Collected {
            results_dir: local_dir,
            metrics,
        })
    }

    async fn finish(
        &self,
        ctx: &Supervision,
        bundle: &FileBundle,
        outcome: Result<Collected, JobFailure>,
    ) -> Result<JobSummary, JobError> {
        let now = self.clock.now_utc();
        let job = {
            let mut job = ctx.slot.lock();
            if let Err(failure) = &outcome {
                if ends_in_failure(failure) && job.state != JobState::Failed {
                    if let Err(err) = job.transition(JobState::Failed, now, failure.to_string()) {
                        tracing::debug!(error = %err, "final state kept");
                    }
                }
            }
            job.finished = true;
            job.clone()
        };

        let (results_dir, metrics, failure) = match &outcome {
            Ok(collected) => (
                Some(collected.results_dir.display().to_string()),
                collected.metrics.clone(),
                None,
            ),
            Err(failure) => (None, BTreeMap::new(), Some(failure.to_string())),
        };
        let summary = JobSummary {
            name: job.name.clone(),
            scheduler_id: job.scheduler_id.clone(),
            final_state: job.state,
            remote_dir: job.remote_dir.clone(),
            bundle_hash: bundle.content_hash(),
            submitted_at: job.submitted_at,
            finished_at: now,
            retry_count: job.retry_count,
            metrics,
            history: job.history.clone(),
            decisions: job.decisions.clone(),
            failure,
            results_dir,
        };
        let stored = self.store.insert_summary(&summary).await;
        self.emit("job.finished", &job, summary.failure.clone());

        match (outcome, stored) {
            (Ok(_), Ok(id)) => {
                tracing::info!(summary_id = id, state = %job.state, "job finished");
                Ok(summary)
            }
            (Ok(_), Err(err)) => {
                tracing::error!(error = %err, "job finished but its summary was not stored");
                Err(job_error(&job, JobFailure::Store(err)))
            }
            (Err(failure), stored) => {
                if let Err(err) = stored {
                    tracing::error!(error = %err, "failed to store job summary");
                }
                tracing::warn!(state = %job.state, error = %failure, "job stopped");
                Err(job_error(&job, failure))
            }
        }
    }

    /// Best-effort scheduler cancel. Never fails and ignores the job's own
    /// cancellation signal.
    async fn remote_cancel(&self, slot: &JobSlot, scheduler_id: &str) {
        let job = {
            let mut job = slot.lock();
            job.cancel_requests += 1;
            job.clone()
        };
        let command = self.config.commands.cancel_command(scheduler_id);
        let result = async {
            let session = self.open(None).await?;
            self.deadline("cancel", session.run(&command)).await
        }
        .await;
        match result {
            Ok(capture) if capture.exit_code == 0 => {
                tracing::info!(scheduler_id, "scheduler cancel issued");
            }
            Ok(capture) => tracing::warn!(
                scheduler_id,
                exit_code = capture.exit_code,
                detail = %capture.detail(),
                "scheduler cancel failed"
            ),
            Err(err) => {
                tracing::warn!(scheduler_id, error = %err, "scheduler cancel not delivered")
            }
        }
        self.emit("job.cancel.issued", &job, None);
    }

    /// Opens a pooled session. Waiting for a free slot stops early when the
    /// job gets cancelled.
    async fn open(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> AppResult<Box<dyn RemoteSessionPort>> {
        let connect = self.deadline("connect", self.transport.connect(&self.config.ssh));
        match cancel {
            None => connect.await,
            Some(cancel) => tokio::select! {
                session = connect => session,
                _ = cancellation(cancel.clone()) => {
                    Err(AppError::new(AppErrorKind::Cancelled, codes::CANCELED))
                }
            },
        }
    }

    async fn deadline<T, E, F>(&self, op: &str, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<AppError>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(op).into()),
        }
    }

    /// Retries transient failures with backoff. Each try starts with a
    /// cancellation check so a cancelled job issues no further calls.
    async fn retrying<T, F, Fut>(
        &self,
        ctx: &Supervision,
        op: &'static str,
        mut call: F,
    ) -> Result<T, JobFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            ctx.check()?;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == AppErrorKind::Cancelled => {
                    return Err(JobFailure::Cancelled);
                }
                Err(err) if err.is_transient() && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        ?delay,
                        error = %err,
                        "transient failure; retrying"
                    );
                    ctx.wait(delay).await?;
                    attempt += 1;
                }
                Err(err) => return Err(JobFailure::Transport(err)),
            }
        }
    }

    fn emit(&self, name: &'static str, job: &RemoteJob, detail: Option<String>) {
        self.telemetry.event(
            name,
            TelemetryEvent {
                job_name: Some(job.name.clone()),
                scheduler_id: job.scheduler_id.clone(),
                state: Some(job.state.as_str()),
                attempt: Some(job.retry_count),
                remote_dir: Some(job.remote_dir.clone()),
                detail,
            },
        );
    }
}
