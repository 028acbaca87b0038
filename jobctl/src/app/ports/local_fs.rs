// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[async_trait]
/// Local filesystem boundary used when collecting results.
pub trait LocalFilesystemPort: Send + Sync {
    async fn create_dir_all(&self, path: &Path) -> AppResult<()>;
    async fn write_file(&self, path: &Path, content: &[u8]) -> AppResult<()>;
}
