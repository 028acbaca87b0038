// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use jobctl::adapters;
use jobctl::adapters::cli::{Command, render_summary};
use jobctl::app::ports::JobSummaryStorePort;
use jobctl::app::services::validator;
use jobctl::config::{self, Config};
use jobctl::{JobController, JobSpec};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::info!(
            path = %path.display(),
            source = source.as_str(),
            present = report.config_file_present,
            "config path"
        ),
        (Some(path), None) => tracing::info!(
            path = %path.display(),
            present = report.config_file_present,
            "config path"
        ),
        (None, _) => tracing::info!("config path: (none)"),
    }
    for value in &report.values {
        tracing::info!(
            key = value.key,
            value = %value.value,
            source = value.source.as_str(),
            "config"
        );
    }
}

async fn load_manifests(paths: &[PathBuf]) -> anyhow::Result<Vec<JobSpec>> {
    let mut specs = Vec::with_capacity(paths.len());
    for path in paths {
        specs.push(adapters::fs::load_manifest(path).await?);
    }
    Ok(specs)
}

async fn validate_manifest(path: &Path) -> anyhow::Result<()> {
    let spec = adapters::fs::load_manifest(path).await?;
    match validator::validate(&spec.bundle) {
        Ok(()) => {
            println!(
                "{}: ok ({} files, hash {})",
                spec.name,
                spec.bundle.len(),
                spec.bundle.content_hash()
            );
            Ok(())
        }
        Err(err) => anyhow::bail!("{}: {err}", spec.name),
    }
}

async fn open_store(config: &Config) -> anyhow::Result<adapters::db::SqliteStoreAdapter> {
    config::ensure_parent_dir(&config.database_path)?;
    let db = adapters::db::SummaryStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;
    Ok(adapters::db::SqliteStoreAdapter::new(db))
}

async fn show_history(config: &Config, name: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let rows: Vec<_> = match name {
        Some(name) => store.latest_summary(name).await?.into_iter().collect(),
        None => store.list_summaries().await?,
    };
    if rows.is_empty() {
        match name {
            Some(name) => println!("no summary stored for {name}"),
            None => println!("no summaries stored"),
        }
    }
    for row in &rows {
        println!("{}", render_summary(row));
    }
    Ok(())
}

async fn run_jobs(config: Config, manifests: &[PathBuf]) -> anyhow::Result<()> {
    let specs = load_manifests(manifests).await?;
    let cluster = config
        .cluster
        .as_ref()
        .context("`run` needs a [cluster] section with host, username and work_dir")?;
    let addr = adapters::network::lookup_first_addr(&cluster.host, cluster.port).await?;
    let controller_config = config.controller_config(addr)?;

    let store = Arc::new(open_store(&config).await?);
    let transport = Arc::new(adapters::ssh::SshTransport::with_max_sessions(cluster.max_sessions));
    let local_fs = Arc::new(adapters::fs::LocalFilesystem::new());
    let clock = Arc::new(adapters::time::SystemClock::new());
    let telemetry = Arc::new(adapters::telemetry::TracingTelemetry::new());

    let controller = JobController::new(
        Arc::new(controller_config),
        transport.clone(),
        store,
        local_fs,
        clock,
        telemetry,
    );

    let interrupt = controller.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = interrupt.cancel_all().await;
            tracing::warn!(cancelled, "interrupted; cancelling supervised jobs");
        }
    });

    let handles: Vec<_> = specs
        .into_iter()
        .map(|spec| (spec.name.clone(), controller.spawn(spec)))
        .collect();
    let total = handles.len();
    let mut failed = 0usize;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(summary)) => {
                println!(
                    "{name}: {} (scheduler id {}, retries {}, results {})",
                    summary.final_state,
                    summary.scheduler_id.as_deref().unwrap_or("-"),
                    summary.retry_count,
                    summary.results_dir.as_deref().unwrap_or("-"),
                );
            }
            Ok(Err(err)) => {
                failed += 1;
                eprintln!("{name}: {err}");
            }
            Err(join_err) => {
                failed += 1;
                tracing::error!(job = %name, error = %join_err, "supervision task panicked");
                eprintln!("{name}: supervision task aborted: {join_err}");
            }
        }
    }
    ctrl_c.abort();
    transport.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} of {total} jobs did not succeed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database,
            poll_interval_secs: opts.poll_interval,
            max_retries: opts.max_retries,
            verbose: parsed.verbose_override,
        },
    )?;
    jobctl::logging::init(config.verbose);
    log_config_report(&report);

    match opts.command {
        Command::Validate { manifest } => validate_manifest(&manifest).await,
        Command::Run { manifests } => run_jobs(config, &manifests).await,
        Command::History { name } => show_history(&config, name.as_deref()).await,
    }
}
