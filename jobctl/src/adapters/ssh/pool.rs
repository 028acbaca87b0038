// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::SshConfig;

use super::{SessionManager, SshParams};

pub trait SessionFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<SessionManager>;
}

#[derive(Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn build(&self, params: SshParams) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(params))
    }
}

struct Endpoint {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<SessionManager>>>,
}

/// Bounded set of connections per `user@host:port`. At most `max_sessions`
/// connections to one endpoint are lent out at a time.
pub struct SessionPool {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    factory: Arc<dyn SessionFactory>,
    max_sessions: usize,
}

/// A connection lent out by the pool. Dropping it hands the connection back
/// and frees its slot.
pub struct PooledSession {
    session: Option<Arc<SessionManager>>,
    endpoint: Arc<Endpoint>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn manager(&self) -> Option<&SessionManager> {
        self.session.as_deref()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if !session.is_connected_nonblocking() {
            return;
        }
        if let Ok(mut idle) = self.endpoint.idle.lock() {
            idle.push(session);
        }
    }
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, max_sessions: usize) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            factory,
            max_sessions: max_sessions.max(1),
        }
    }

    fn endpoint(&self, key: &str) -> AppResult<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.lock().map_err(|_| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "session pool lock poisoned",
            )
        })?;
        let endpoint = endpoints.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Endpoint {
                permits: Arc::new(Semaphore::new(self.max_sessions)),
                idle: Mutex::new(Vec::new()),
            })
        });
        Ok(endpoint.clone())
    }

    /// Waits for a free slot, then reuses an idle connection or builds a new
    /// one. The returned manager may still need `ensure_connected`.
    pub async fn acquire(&self, config: &SshConfig) -> AppResult<PooledSession> {
        let params = to_params(config)?;
        let key = endpoint_key(&params);
        let endpoint = self.endpoint(&key)?;
        let permit = endpoint.permits.clone().acquire_owned().await.map_err(|_| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "session pool closed",
            )
        })?;
        let reused = endpoint
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .filter(|session| session.params() == &params);
        let session = match reused {
            Some(session) => {
                tracing::trace!(endpoint = %key, "reusing pooled ssh session");
                session
            }
            None => self.factory.build(params),
        };
        Ok(PooledSession {
            session: Some(session),
            endpoint,
            _permit: permit,
        })
    }

    pub async fn shutdown(&self) {
        let endpoints: Vec<Arc<Endpoint>> = match self.endpoints.lock() {
            Ok(endpoints) => endpoints.values().cloned().collect(),
            Err(_) => return,
        };
        for endpoint in endpoints {
            let idle: Vec<Arc<SessionManager>> = match endpoint.idle.lock() {
                Ok(mut idle) => idle.drain(..).collect(),
                Err(_) => continue,
            };
            for session in idle {
                session.shutdown().await;
            }
        }
    }
}

fn endpoint_key(params: &SshParams) -> String {
    format!("{}@{}:{}", params.username, params.host, params.addr.port())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn to_params(config: &SshConfig) -> AppResult<SshParams> {
    if config.username.trim().is_empty() {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            "ssh username is empty",
        ));
    }
    if config.host.trim().is_empty() {
        return Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            "ssh host is empty",
        ));
    }
    Ok(SshParams {
        host: config.host.clone(),
        addr: config.addr,
        username: config.username.clone(),
        identity_path: config.identity_path.as_deref().map(expand_path),
        known_hosts_path: config.known_hosts_path.as_deref().map(expand_path),
        keepalive_secs: config.keepalive_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> SshConfig {
        SshConfig {
            host: "cluster.example.org".into(),
            addr: "127.0.0.1:2222".parse().unwrap(),
            username: "alice".into(),
            identity_path: Some("/keys/id_ed25519".into()),
            known_hosts_path: None,
            keepalive_secs: 30,
        }
    }

    #[test]
    fn to_params_rejects_blank_username() {
        let mut cfg = config();
        cfg.username = "  ".into();
        let err = to_params(&cfg).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ARGUMENT);
    }

    #[test]
    fn endpoint_key_includes_user_host_and_port() {
        let params = to_params(&config()).unwrap();
        assert_eq!(endpoint_key(&params), "alice@cluster.example.org:2222");
    }

    #[tokio::test]
    async fn acquire_blocks_once_every_slot_is_lent() {
        let pool = SessionPool::new(Arc::new(DefaultSessionFactory), 1);
        let first = pool.acquire(&config()).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), pool.acquire(&config())).await;
        assert!(blocked.is_err());
        drop(first);
        let second =
            tokio::time::timeout(Duration::from_millis(200), pool.acquire(&config())).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn unconnected_sessions_are_not_returned_to_idle() {
        let pool = SessionPool::new(Arc::new(DefaultSessionFactory), 2);
        let lease = pool.acquire(&config()).await.unwrap();
        let endpoint = lease.endpoint.clone();
        drop(lease);
        assert!(endpoint.idle.lock().unwrap().is_empty());
    }
}
