// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::{TelemetryEvent, TelemetryPort};

#[derive(Clone, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryPort for TracingTelemetry {
    fn event(&self, name: &'static str, fields: TelemetryEvent) {
        let TelemetryEvent {
            job_name,
            scheduler_id,
            state,
            attempt,
            remote_dir,
            detail,
        } = fields;

        tracing::info!(
            target: "jobctl::telemetry",
            event = name,
            job_name = job_name.as_deref(),
            scheduler_id = scheduler_id.as_deref(),
            state = state,
            attempt = attempt,
            remote_dir = remote_dir.as_deref(),
            detail = detail.as_deref(),
        );
    }
}
