// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::{io, net::SocketAddr};
use thiserror::Error as ThisError;
use tokio::net::lookup_host;

#[derive(ThisError, Debug)]
pub enum NetError {
    #[error("DNS name not found for {0}")]
    DnsNotFound(String),
    #[error("couldn't resolve host {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses resolved from {0}")]
    NoAddrs(String),
}

/// First address the resolver returns for `host:port`.
pub async fn lookup_first_addr(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let mut addrs = lookup_host((host, port)).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => NetError::DnsNotFound(host.to_owned()),
        _ => NetError::Resolve {
            host: host.to_owned(),
            source: e,
        },
    })?;
    addrs.next().ok_or_else(|| NetError::NoAddrs(host.to_owned()))
}
