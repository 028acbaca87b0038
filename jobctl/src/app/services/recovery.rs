// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::services::generators::RoleGenerators;
use crate::app::services::validator::{validate, validate_role};
use crate::app::types::{AbortCause, FileBundle, FileEntry, RecoveryPlan, RemoteJob, roles};

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    /// Restart file left in the job directory by an earlier attempt.
    pub checkpoint_artifact: String,
    /// Bundle role the restart file replaces.
    pub checkpoint_role: String,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            checkpoint_artifact: "CONTCAR".to_string(),
            checkpoint_role: roles::STRUCTURE.to_string(),
        }
    }
}

/// Facts gathered from the cluster before planning.
#[derive(Debug, Clone, Default)]
pub struct RecoveryEvidence {
    pub checkpoint: Option<Vec<u8>>,
    pub unrecoverable: Option<String>,
}

#[derive(Clone)]
pub struct RecoveryEngine {
    policy: RecoveryPolicy,
    generators: RoleGenerators,
}

impl RecoveryEngine {
    pub fn new(policy: RecoveryPolicy, generators: RoleGenerators) -> Self {
        Self { policy, generators }
    }

    /// Decision table, first match wins:
    /// 1. checkpoint present and retries left: resume from it
    /// 2. a broken support file has a generator and retries left: rebuild it
    /// 3. retries exhausted or an unrecoverable marker: abort
    /// 4. otherwise resubmit as is
    pub fn plan(
        &self,
        job: &RemoteJob,
        bundle: &FileBundle,
        evidence: &RecoveryEvidence,
    ) -> RecoveryPlan {
        let retries_left = job.retry_count < self.policy.max_retries;

        if retries_left {
            if let Some(plan) = self.checkpoint_plan(job, bundle, evidence) {
                return plan;
            }
            if let Some(plan) = self.regeneration_plan(job, bundle) {
                return plan;
            }
        }

        if !retries_left {
            return RecoveryPlan::Abort {
                cause: AbortCause::RetriesExhausted,
                reason: format!(
                    "retry count {} reached the limit of {}",
                    job.retry_count, self.policy.max_retries
                ),
            };
        }
        if let Some(marker) = &evidence.unrecoverable {
            return RecoveryPlan::Abort {
                cause: AbortCause::Unrecoverable,
                reason: format!("solver rejected its input ({marker:?})"),
            };
        }
        RecoveryPlan::ResubmitUnchanged {
            reason: format!(
                "no checkpoint and no actionable cause after {} in state {}",
                job.scheduler_id.as_deref().unwrap_or("submission"),
                job.state
            ),
        }
    }

    fn checkpoint_plan(
        &self,
        job: &RemoteJob,
        bundle: &FileBundle,
        evidence: &RecoveryEvidence,
    ) -> Option<RecoveryPlan> {
        let content = evidence.checkpoint.as_ref().filter(|c| !c.is_empty())?;
        let role = self.policy.checkpoint_role.as_str();
        let file_name = job
            .spec
            .bundle
            .get(role)
            .map(|entry| entry.file_name.clone())
            .or_else(|| roles::default_file_name(role).map(str::to_string))
            .unwrap_or_else(|| role.to_string());
        let artifact = FileEntry::new(file_name, content.clone());
        if let Err(err) = validate_role(&bundle.with_role(role, artifact.clone()), role) {
            tracing::warn!(
                job = %job.name,
                artifact = %self.policy.checkpoint_artifact,
                error = %err,
                "checkpoint artifact is not a usable {role}; ignoring it"
            );
            return None;
        }
        Some(RecoveryPlan::ResubmitFromCheckpoint {
            role: role.to_string(),
            artifact,
            reason: format!(
                "{} from the previous attempt replaces {role}",
                self.policy.checkpoint_artifact
            ),
        })
    }

    fn regeneration_plan(&self, job: &RemoteJob, bundle: &FileBundle) -> Option<RecoveryPlan> {
        let err = validate(bundle).err()?;
        let mut broken: Vec<&str> = err.roles().collect();
        broken.dedup();
        if broken.iter().any(|role| !self.generators.has(role)) {
            return None;
        }
        let mut candidate = bundle.clone();
        let mut files = Vec::with_capacity(broken.len());
        for role in &broken {
            match self.generators.regenerate_into(&candidate, role, &job.spec.params) {
                Ok(entry) => {
                    candidate.insert(*role, entry.clone());
                    files.push((role.to_string(), entry));
                }
                Err(gen_err) => {
                    tracing::warn!(job = %job.name, role, error = %gen_err, "cannot regenerate");
                    return None;
                }
            }
        }
        Some(RecoveryPlan::RegenerateAndResubmit {
            reason: format!("regenerated {} ({err})", broken.join(", ")),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::services::validator::fixtures::{POSCAR, complete_bundle};
    use crate::app::types::{JobSpec, JobState, KMesh, ResourceRequest, SolverParams};
    use std::sync::Arc;
    use std::time::Duration;

    fn job(retry_count: u32) -> RemoteJob {
        let spec = Arc::new(JobSpec {
            name: "si".into(),
            bundle: complete_bundle(),
            resources: ResourceRequest {
                nodes: 1,
                tasks_per_node: 8,
                wall_clock: Duration::from_secs(3600),
                partition: None,
            },
            params: SolverParams {
                parameters: Default::default(),
                k_mesh: Some(KMesh::MonkhorstPack {
                    grid: [4, 4, 4],
                    shift: [0.0; 3],
                }),
            },
            checkpoint: None,
        });
        let mut job = RemoteJob::new(spec, "/scratch/si".into());
        job.state = JobState::Interrupted;
        job.scheduler_id = Some("5".into());
        job.retry_count = retry_count;
        job
    }

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(RecoveryPolicy::default(), RoleGenerators::default())
    }

    fn checkpoint() -> RecoveryEvidence {
        RecoveryEvidence {
            checkpoint: Some(POSCAR.as_bytes().to_vec()),
            unrecoverable: None,
        }
    }

    #[test]
    fn checkpoint_wins_while_retries_remain() {
        let plan = engine().plan(&job(0), &complete_bundle(), &checkpoint());
        let RecoveryPlan::ResubmitFromCheckpoint { role, artifact, .. } = plan else {
            panic!("expected checkpoint plan, got {plan:?}");
        };
        assert_eq!(role, "structure");
        assert_eq!(artifact.file_name, "POSCAR");
    }

    #[test]
    fn checkpoint_beats_unrecoverable_marker() {
        let mut evidence = checkpoint();
        evidence.unrecoverable = Some("Error reading item".into());
        let plan = engine().plan(&job(1), &complete_bundle(), &evidence);
        assert_eq!(plan.label(), "resubmit_from_checkpoint");
    }

    #[test]
    fn invalid_checkpoint_is_ignored() {
        let evidence = RecoveryEvidence {
            checkpoint: Some(b"garbage".to_vec()),
            unrecoverable: None,
        };
        let plan = engine().plan(&job(0), &complete_bundle(), &evidence);
        assert_eq!(plan.label(), "resubmit_unchanged");
    }

    #[test]
    fn missing_regenerable_file_is_rebuilt() {
        let mut bundle = FileBundle::new();
        for (role, entry) in complete_bundle().iter() {
            if role != roles::K_MESH {
                bundle.insert(role, entry.clone());
            }
        }
        let plan = engine().plan(&job(0), &bundle, &RecoveryEvidence::default());
        let RecoveryPlan::RegenerateAndResubmit { files, .. } = plan else {
            panic!("expected regeneration, got {plan:?}");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "k-mesh");
        assert!(files[0].1.text().contains("Monkhorst-Pack"));
    }

    #[test]
    fn broken_file_without_generator_falls_through() {
        let bundle =
            complete_bundle().with_role(roles::POTENTIALS, FileEntry::new("POTCAR", "truncated"));
        let plan = engine().plan(&job(0), &bundle, &RecoveryEvidence::default());
        assert_eq!(plan.label(), "resubmit_unchanged");
    }

    #[test]
    fn unrecoverable_marker_aborts() {
        let evidence = RecoveryEvidence {
            checkpoint: None,
            unrecoverable: Some("Error reading item".into()),
        };
        let plan = engine().plan(&job(0), &complete_bundle(), &evidence);
        assert!(matches!(
            plan,
            RecoveryPlan::Abort {
                cause: AbortCause::Unrecoverable,
                ..
            }
        ));
    }

    #[test]
    fn reaching_the_limit_always_aborts() {
        for evidence in [checkpoint(), RecoveryEvidence::default()] {
            for retries in [3, 4, 10] {
                let plan = engine().plan(&job(retries), &complete_bundle(), &evidence);
                assert!(
                    matches!(
                        plan,
                        RecoveryPlan::Abort {
                            cause: AbortCause::RetriesExhausted,
                            ..
                        }
                    ),
                    "retries {retries}: {plan:?}"
                );
            }
        }
    }

    #[test]
    fn limit_comes_from_policy() {
        let engine = RecoveryEngine::new(
            RecoveryPolicy {
                max_retries: 1,
                ..RecoveryPolicy::default()
            },
            RoleGenerators::default(),
        );
        assert!(engine.plan(&job(0), &complete_bundle(), &Default::default()).is_resubmit());
        assert!(!engine.plan(&job(1), &complete_bundle(), &Default::default()).is_resubmit());
    }
}
