// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::client::AuthResult;
use russh::keys::PrivateKeyWithHashAlg;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::ssh::AuthenticationFailure;

use super::{ClientHandler, SessionManager};

/// Key files tried in order when no identity is configured.
const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

#[derive(Debug, PartialEq, Eq)]
enum AuthDecision {
    Success,
    /// The key was accepted but the server wants a second factor.
    SecondFactorRequired,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } if partial_success
            && remaining_methods.contains(&russh::MethodKind::KeyboardInteractive) =>
        {
            AuthDecision::SecondFactorRequired
        }
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

fn identity_candidates(configured: Option<&PathBuf>) -> Vec<PathBuf> {
    if let Some(path) = configured {
        return vec![path.clone()];
    }
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

impl SessionManager {
    /// Connects and authenticates if there is no live handle.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut handle_field = self.handle.lock().await;
        let needs_connect = match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        };
        if !needs_connect {
            return Ok(());
        }

        tracing::info!(
            user = %self.params.username,
            addr = %self.params.addr,
            "establishing ssh connection"
        );
        let handler = ClientHandler {
            host: self.params.host.clone(),
            addr: self.params.addr,
            known_hosts_path: self.params.known_hosts_path.clone(),
        };
        let mut handle = russh::client::connect(self.config.clone(), self.params.addr, handler)
            .await
            .context("SSH connect failed")?;

        let candidates = identity_candidates(self.params.identity_path.as_ref());
        if candidates.is_empty() {
            return Err(anyhow!("no identity file configured or found in ~/.ssh")
                .context(AuthenticationFailure));
        }
        let mut authenticated = false;
        for path in &candidates {
            let key = russh::keys::load_secret_key(path, None)
                .with_context(|| format!("failed to load secret key at {}", path.display()))?;
            let key = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );
            let result = handle
                .authenticate_publickey(self.params.username.clone(), key)
                .await?;
            match auth_decision(result) {
                AuthDecision::Success => {
                    authenticated = true;
                    break;
                }
                AuthDecision::SecondFactorRequired => {
                    return Err(anyhow!(
                        "server requires keyboard-interactive after publickey; unattended sessions cannot answer it"
                    )
                    .context(AuthenticationFailure));
                }
                AuthDecision::Failure => {
                    tracing::debug!(identity = %path.display(), "publickey rejected");
                }
            }
        }
        if !authenticated {
            return Err(AuthenticationFailure.into());
        }

        *handle_field = Some(handle);
        drop(handle_field);
        self.start_keepalive().await;
        Ok(())
    }

    async fn start_keepalive(&self) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        let handle = self.handle.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let guard = handle.lock().await;
                let Some(handle) = guard.as_ref() else {
                    break;
                };
                if handle.is_closed() {
                    tracing::debug!("keepalive handle is closed");
                    break;
                }
                if let Err(err) = handle.send_keepalive(true).await {
                    tracing::debug!(error = %err, "keepalive failed");
                }
            }
        });
        if let Some(previous) = self.keepalive_task_handle.lock().await.replace(task) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthDecision, auth_decision, identity_candidates};
    use russh::client::AuthResult;
    use russh::{MethodKind, MethodSet};
    use std::path::PathBuf;

    #[test]
    fn auth_decision_success() {
        assert_eq!(auth_decision(AuthResult::Success), AuthDecision::Success);
    }

    #[test]
    fn partial_success_with_keyboard_interactive_needs_second_factor() {
        let methods = [MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: true,
        });
        assert_eq!(decision, AuthDecision::SecondFactorRequired);
    }

    #[test]
    fn plain_rejection_is_failure() {
        let methods = [MethodKind::PublicKey];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: false,
        });
        assert_eq!(decision, AuthDecision::Failure);
    }

    #[test]
    fn configured_identity_is_the_only_candidate() {
        let path = PathBuf::from("/keys/cluster_ed25519");
        assert_eq!(identity_candidates(Some(&path)), vec![path]);
    }
}
