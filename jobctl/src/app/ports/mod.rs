// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod local_fs;
pub mod summary_store;
pub mod telemetry;
pub mod transport;

pub use clock::ClockPort;
pub use local_fs::LocalFilesystemPort;
pub use summary_store::JobSummaryStorePort;
#[allow(unused_imports)]
pub use telemetry::{NoopTelemetry, TelemetryEvent, TelemetryPort};
pub use transport::{ExecCapture, RemoteSessionPort, RemoteTransportPort};
