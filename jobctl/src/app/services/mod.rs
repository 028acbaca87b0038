// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod backoff;
pub mod generators;
pub mod metrics;
pub mod poller;
pub mod recovery;
pub mod scheduler;
pub mod shell;
pub mod submitter;
pub mod validator;
