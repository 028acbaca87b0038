// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{FileBundle, SshConfig};

#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stderr when present, stdout otherwise.
    pub fn detail(&self) -> String {
        let stderr = self.stderr_text();
        let stderr = stderr.trim();
        if stderr.is_empty() {
            self.stdout_text().trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Authenticated channel to the cluster.
/// The returned session holds a pooled connection until it is dropped.
#[async_trait]
pub trait RemoteTransportPort: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> AppResult<Box<dyn RemoteSessionPort>>;
}

/// Operations available on an open session. Nothing here retries.
#[async_trait]
pub trait RemoteSessionPort: Send + Sync {
    /// Creates `remote_dir` and writes every bundle entry into it.
    async fn put_tree(&self, bundle: &FileBundle, remote_dir: &str) -> AppResult<()>;
    async fn run(&self, command: &str) -> AppResult<ExecCapture>;
    /// Fails with `not_found` when the path does not exist.
    async fn get_file(&self, remote_path: &str) -> AppResult<Vec<u8>>;
    /// Fails with `not_found` when the path does not exist.
    async fn remove_file(&self, remote_path: &str) -> AppResult<()>;
}
