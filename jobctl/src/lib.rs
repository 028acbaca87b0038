// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Supervises solver jobs on a Slurm cluster reached over SSH: validates
//! input bundles, submits them, polls until an outcome is known, recovers
//! from interruptions within a retry bound and collects the results.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;

pub use app::controller::{ControllerConfig, JobController, ResultsConfig};
pub use app::errors::{JobError, JobFailure};
pub use app::types::{JobSpec, JobState, JobSummary};
