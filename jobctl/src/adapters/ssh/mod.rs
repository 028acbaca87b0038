// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteSessionPort, RemoteTransportPort};
use crate::app::types::{FileBundle, SshConfig};

mod error;
mod pool;
mod session;

pub use error::AuthenticationFailure;
pub use pool::{DefaultSessionFactory, PooledSession, SessionFactory, SessionPool};
pub use session::{SessionManager, SshParams};

/// Production transport: pooled russh connections with SFTP for files.
#[derive(Clone)]
pub struct SshTransport {
    pool: Arc<SessionPool>,
}

impl SshTransport {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        let factory = Arc::new(DefaultSessionFactory);
        Self::new(Arc::new(SessionPool::new(factory, max_sessions)))
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn ssh_error_code(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<AuthenticationFailure>().is_some() {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    }
}

fn map_connect_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Aborted,
        ssh_error_code(&err),
        format!("ssh connect failed: {err:#}"),
    )
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Internal,
        codes::REMOTE_ERROR,
        format!("ssh exec failed: {err:#}"),
    )
}

fn map_transfer_error(err: anyhow::Error, path: &str) -> AppError {
    if is_sftp_missing_path(&err) {
        return AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!("remote path not found: {path}"),
        );
    }
    AppError::with_message(
        AppErrorKind::Internal,
        codes::REMOTE_ERROR,
        format!("sftp transfer failed: {err:#}"),
    )
    .with_context(path.to_string())
}

fn is_sftp_missing_path(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let Some(sftp_error) = cause.downcast_ref::<russh_sftp::client::error::Error>() else {
            return false;
        };
        matches!(
            sftp_error,
            russh_sftp::client::error::Error::Status(status)
                if status.status_code == russh_sftp::protocol::StatusCode::NoSuchFile
        )
    })
}

#[async_trait]
impl RemoteTransportPort for SshTransport {
    async fn connect(&self, config: &SshConfig) -> AppResult<Box<dyn RemoteSessionPort>> {
        let lease = self.pool.acquire(config).await?;
        let manager = lease.manager().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "pooled session already released",
            )
        })?;
        manager.ensure_connected().await.map_err(map_connect_error)?;
        Ok(Box::new(SshSession {
            lease,
            host: config.host.clone(),
        }))
    }
}

/// One lent connection. Returned to the pool on drop.
pub struct SshSession {
    lease: PooledSession,
    host: String,
}

impl SshSession {
    fn manager(&self) -> AppResult<&SessionManager> {
        self.lease.manager().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "pooled session already released",
            )
        })
    }
}

#[async_trait]
impl RemoteSessionPort for SshSession {
    #[tracing::instrument(name = "ssh", skip(self, bundle), fields(op = "put_tree", host = %self.host))]
    async fn put_tree(&self, bundle: &FileBundle, remote_dir: &str) -> AppResult<()> {
        let files: Vec<(&str, &[u8])> = bundle
            .iter()
            .map(|(_, entry)| (entry.file_name.as_str(), entry.content.as_slice()))
            .collect();
        self.manager()?
            .put_files(remote_dir, &files)
            .await
            .map_err(|err| map_transfer_error(err, remote_dir))
    }

    #[tracing::instrument(name = "ssh", skip(self), fields(op = "run", host = %self.host))]
    async fn run(&self, command: &str) -> AppResult<ExecCapture> {
        let (stdout, stderr, exit_code) = self
            .manager()?
            .exec_capture(command)
            .await
            .map_err(map_exec_error)?;
        tracing::debug!(exit_code, "remote command finished");
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
        })
    }

    #[tracing::instrument(name = "ssh", skip(self), fields(op = "get_file", host = %self.host))]
    async fn get_file(&self, remote_path: &str) -> AppResult<Vec<u8>> {
        self.manager()?
            .read_file(remote_path)
            .await
            .map_err(|err| map_transfer_error(err, remote_path))
    }

    #[tracing::instrument(name = "ssh", skip(self), fields(op = "remove_file", host = %self.host))]
    async fn remove_file(&self, remote_path: &str) -> AppResult<()> {
        self.manager()?
            .remove_file(remote_path)
            .await
            .map_err(|err| map_transfer_error(err, remote_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn authentication_failures_keep_their_code() {
        let err = anyhow!("publickey rejected").context(AuthenticationFailure);
        let mapped = map_connect_error(err);
        assert_eq!(mapped.code(), codes::AUTHENTICATION_FAILURE);
        assert!(!mapped.is_transient());
    }

    #[test]
    fn other_connect_failures_are_transient() {
        let mapped = map_connect_error(anyhow!("connection refused"));
        assert_eq!(mapped.code(), codes::CONNECTION_FAILURE);
        assert!(mapped.is_transient());
    }

    #[test]
    fn exec_failures_are_remote_errors() {
        let mapped = map_exec_error(anyhow!("channel closed"));
        assert_eq!(mapped.code(), codes::REMOTE_ERROR);
        assert!(mapped.is_transient());
    }

    #[test]
    fn missing_sftp_path_maps_to_not_found() {
        let status = russh_sftp::protocol::Status {
            id: 1,
            status_code: russh_sftp::protocol::StatusCode::NoSuchFile,
            error_message: "no such file".into(),
            language_tag: "en".into(),
        };
        let err = anyhow::Error::new(russh_sftp::client::error::Error::Status(status));
        let mapped = map_transfer_error(err, "/scratch/si/CONTCAR");
        assert!(mapped.is_not_found());
    }

    #[test]
    fn other_transfer_failures_carry_the_path() {
        let mapped = map_transfer_error(anyhow!("broken pipe"), "/scratch/si");
        assert_eq!(mapped.code(), codes::REMOTE_ERROR);
        assert_eq!(mapped.context(), Some("/scratch/si"));
    }
}
