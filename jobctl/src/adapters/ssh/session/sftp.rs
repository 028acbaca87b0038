// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::SessionManager;

/// Every ancestor of `remote_dir`, shortest first, ending with the dir itself.
fn build_remote_dir_paths(remote_dir: &str) -> Vec<String> {
    let absolute = remote_dir.starts_with('/');
    let mut current = String::new();
    let mut out = Vec::new();
    for part in remote_dir.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if current.is_empty() {
            if absolute {
                current.push('/');
            }
        } else {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

impl SessionManager {
    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    async fn ensure_remote_dir(&self, sftp: &SftpSession, remote_dir: &str) -> Result<()> {
        for cur in build_remote_dir_paths(remote_dir) {
            match sftp.metadata(&cur).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(anyhow!("remote path exists but is not a directory: {cur}"));
                }
                Err(_) => {
                    tracing::debug!(path = %cur, "creating remote directory");
                    sftp.create_dir(&cur)
                        .await
                        .with_context(|| format!("creating path {cur}"))?;
                    let attrs = FileAttributes {
                        permissions: Some(0o700),
                        ..Default::default()
                    };
                    if let Err(err) = sftp.set_metadata(&cur, attrs).await {
                        tracing::debug!(path = %cur, error = %err, "could not set permissions");
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates `remote_dir` and writes each file into it, replacing what is
    /// already there.
    pub async fn put_files(&self, remote_dir: &str, files: &[(&str, &[u8])]) -> Result<()> {
        let sftp = self.sftp().await?;
        self.ensure_remote_dir(&sftp, remote_dir).await?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        for (name, content) in files {
            let path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
            let mut file = sftp
                .open_with_flags(&path, flags)
                .await
                .with_context(|| format!("open remote file {path}"))?;
            file.write_all(content)
                .await
                .with_context(|| format!("write remote file {path}"))?;
            file.flush().await?;
            file.shutdown().await?;
            tracing::debug!(%path, bytes = content.len(), "uploaded");
        }
        Ok(())
    }

    pub async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>> {
        let sftp = self.sftp().await?;
        let mut file = sftp.open(remote_path).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .with_context(|| format!("read remote file {remote_path}"))?;
        Ok(content)
    }

    pub async fn remove_file(&self, remote_path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        sftp.remove_file(remote_path).await?;
        tracing::debug!(path = %remote_path, "removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::build_remote_dir_paths;

    #[test]
    fn absolute_paths_keep_leading_slash() {
        assert_eq!(
            build_remote_dir_paths("/scratch/alice/si/"),
            vec!["/scratch", "/scratch/alice", "/scratch/alice/si"]
        );
    }

    #[test]
    fn relative_paths_stay_relative() {
        assert_eq!(build_remote_dir_paths("jobs//si"), vec!["jobs", "jobs/si"]);
        assert!(build_remote_dir_paths("/").is_empty());
    }
}
