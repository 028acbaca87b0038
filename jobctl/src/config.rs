// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::controller::{ControllerConfig, ResultsConfig};
use crate::app::services::backoff::RetryPolicy;
use crate::app::services::poller::MarkerSet;
use crate::app::services::recovery::RecoveryPolicy;
use crate::app::services::scheduler::{
    DEFAULT_CANCEL_COMMAND, DEFAULT_HISTORY_COMMAND, DEFAULT_JOB_ID_PATTERN,
    DEFAULT_LOOKUP_COMMAND, DEFAULT_STATUS_COMMAND, DEFAULT_SUBMIT_COMMAND, JobIdPattern,
    SchedulerCommands,
};
use crate::app::services::submitter::SolverLaunch;
use crate::app::types::SshConfig;

const APP_DIR_NAME: &str = "jobctl";
const CONFIG_FILE_NAME: &str = "jobctl.toml";
const CONFIG_ENV_VAR: &str = "JOBCTL_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "jobctl.sqlite";
const RESULTS_DIR_NAME: &str = "results";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_MAX_SESSIONS: usize = 4;
const DEFAULT_DESCRIPTOR_NAME: &str = "run.slurm";
const DEFAULT_PRIMARY_LOG: &str = "OUTCAR";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ARTIFACTS: [&str; 3] = ["CONTCAR", "OSZICAR", "vasprun.xml"];
const DEFAULT_LARGE_ARTIFACTS: [&str; 2] = ["WAVECAR", "CHGCAR"];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<String>,
    verbose: Option<bool>,
    #[serde(default)]
    cluster: FileCluster,
    #[serde(default)]
    scheduler: FileScheduler,
    #[serde(default)]
    solver: FileSolver,
    #[serde(default)]
    markers: FileMarkers,
    #[serde(default)]
    recovery: FileRecovery,
    #[serde(default)]
    polling: FilePolling,
    #[serde(default)]
    transport: FileTransport,
    #[serde(default)]
    results: FileResults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCluster {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    work_dir: Option<String>,
    keepalive_secs: Option<u64>,
    max_sessions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileScheduler {
    submit_command: Option<String>,
    status_command: Option<String>,
    /// Empty string disables the accounting fallback.
    history_command: Option<String>,
    cancel_command: Option<String>,
    /// Empty string disables lookup before resubmitting.
    lookup_command: Option<String>,
    job_id_pattern: Option<String>,
    descriptor_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSolver {
    modules: Option<Vec<String>>,
    environment: Option<BTreeMap<String, String>>,
    launch_command: Option<String>,
    stdout_log: Option<String>,
    primary_log: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMarkers {
    success: Option<Vec<String>>,
    fatal: Option<Vec<String>>,
    unrecoverable: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRecovery {
    max_retries: Option<u32>,
    checkpoint_artifact: Option<String>,
    checkpoint_role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePolling {
    interval_secs: Option<u64>,
    remote_call_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransport {
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileResults {
    dir: Option<String>,
    artifacts: Option<Vec<String>>,
    large_artifacts: Option<Vec<String>>,
    fetch_large: Option<bool>,
}

/// Login node settings. Absent when the config names no cluster, which is
/// fine for `validate`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    pub work_dir: String,
    pub keepalive_secs: u64,
    pub max_sessions: usize,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub verbose: bool,
    pub cluster: Option<ClusterConfig>,
    pub commands: SchedulerCommands,
    pub job_id: JobIdPattern,
    pub descriptor_name: String,
    pub launch: SolverLaunch,
    pub primary_log: String,
    pub markers: MarkerSet,
    pub recovery: RecoveryPolicy,
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub results: ResultsConfig,
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Controller settings for a cluster resolved to `addr`.
    pub fn controller_config(&self, addr: SocketAddr) -> Result<ControllerConfig> {
        let cluster = self
            .cluster
            .as_ref()
            .context("no [cluster] section configured; host, username and work_dir are required")?;
        Ok(ControllerConfig {
            ssh: SshConfig {
                host: cluster.host.clone(),
                addr,
                username: cluster.username.clone(),
                identity_path: cluster
                    .identity_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                known_hosts_path: cluster
                    .known_hosts_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                keepalive_secs: cluster.keepalive_secs,
            },
            work_dir: cluster.work_dir.clone(),
            commands: self.commands.clone(),
            job_id: self.job_id.clone(),
            descriptor_name: self.descriptor_name.clone(),
            launch: self.launch.clone(),
            markers: self.markers.clone(),
            primary_log: self.primary_log.clone(),
            recovery: self.recovery.clone(),
            poll_interval: self.poll_interval,
            call_timeout: self.call_timeout,
            retry: self.retry,
            results: self.results.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config_file",
            ConfigSource::Default => "default",
        }
    }
}

/// One resolved setting, rendered for the startup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedValue {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub values: Vec<ReportedValue>,
}

impl ConfigReport {
    pub fn source_of(&self, key: &str) -> Option<ConfigSource> {
        self.values.iter().find(|v| v.key == key).map(|v| v.source)
    }
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub verbose: Option<bool>,
}

/// Picks override, then file, then default, and records which one won.
#[derive(Default)]
struct Resolver {
    values: Vec<ReportedValue>,
}

impl Resolver {
    fn pick<T: Display>(
        &mut self,
        key: &'static str,
        over: Option<T>,
        file: Option<T>,
        default: impl FnOnce() -> T,
    ) -> T {
        let (value, source) = match (over, file) {
            (Some(v), _) => (v, ConfigSource::Override),
            (None, Some(v)) => (v, ConfigSource::ConfigFile),
            (None, None) => (default(), ConfigSource::Default),
        };
        self.record(key, &value, source);
        value
    }

    fn pick_list(
        &mut self,
        key: &'static str,
        file: Option<Vec<String>>,
        default: impl FnOnce() -> Vec<String>,
    ) -> Vec<String> {
        let (value, source) = match file {
            Some(v) => (v, ConfigSource::ConfigFile),
            None => (default(), ConfigSource::Default),
        };
        self.record(key, &format!("[{}]", value.join(", ")), source);
        value
    }

    fn record(&mut self, key: &'static str, value: &dyn Display, source: ConfigSource) {
        self.values.push(ReportedValue {
            key,
            value: value.to_string(),
            source,
        });
    }
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let mut r = Resolver::default();

    let database_path = match overrides.database_path {
        Some(path) => {
            let path = expand_path(path);
            r.record("database_path", &path.display(), ConfigSource::Override);
            path
        }
        None => match file.database_path.as_deref() {
            Some(raw) => {
                let path = resolve_path(raw, base_dir);
                r.record("database_path", &path.display(), ConfigSource::ConfigFile);
                path
            }
            None => {
                let path = default_data_dir()
                    .with_context(|| {
                        "failed to resolve default database path; specify --database or set database_path in the config file"
                    })?
                    .join(DATABASE_FILE_NAME);
                r.record("database_path", &path.display(), ConfigSource::Default);
                path
            }
        },
    };
    let verbose = r.pick("verbose", overrides.verbose, file.verbose, || false);

    let cluster = resolve_cluster(file.cluster, base_dir, &mut r)?;

    let scheduler = file.scheduler;
    let commands = SchedulerCommands {
        submit: r.pick("scheduler.submit_command", None, scheduler.submit_command, || {
            DEFAULT_SUBMIT_COMMAND.to_string()
        }),
        status: r.pick("scheduler.status_command", None, scheduler.status_command, || {
            DEFAULT_STATUS_COMMAND.to_string()
        }),
        history: non_empty(r.pick(
            "scheduler.history_command",
            None,
            scheduler.history_command,
            || DEFAULT_HISTORY_COMMAND.to_string(),
        )),
        cancel: r.pick("scheduler.cancel_command", None, scheduler.cancel_command, || {
            DEFAULT_CANCEL_COMMAND.to_string()
        }),
        lookup: non_empty(r.pick(
            "scheduler.lookup_command",
            None,
            scheduler.lookup_command,
            || DEFAULT_LOOKUP_COMMAND.to_string(),
        )),
    };
    let job_id_pattern = r.pick("scheduler.job_id_pattern", None, scheduler.job_id_pattern, || {
        DEFAULT_JOB_ID_PATTERN.to_string()
    });
    let job_id = JobIdPattern::new(&job_id_pattern)
        .map_err(|err| anyhow::anyhow!("invalid [scheduler] job_id_pattern: {err}"))?;
    let descriptor_name = r.pick("scheduler.descriptor_name", None, scheduler.descriptor_name, || {
        DEFAULT_DESCRIPTOR_NAME.to_string()
    });

    let solver = file.solver;
    let launch_defaults = SolverLaunch::default();
    let launch = SolverLaunch {
        modules: r.pick_list("solver.modules", solver.modules, Vec::new),
        environment: solver.environment.unwrap_or_default(),
        launch_command: r.pick("solver.launch_command", None, solver.launch_command, || {
            launch_defaults.launch_command.clone()
        }),
        stdout_log: r.pick("solver.stdout_log", None, solver.stdout_log, || {
            launch_defaults.stdout_log.clone()
        }),
    };
    let primary_log = r.pick("solver.primary_log", None, solver.primary_log, || {
        DEFAULT_PRIMARY_LOG.to_string()
    });

    let marker_defaults = MarkerSet::default();
    let mut markers = MarkerSet {
        success: r.pick_list("markers.success", file.markers.success, || {
            marker_defaults.success.clone()
        }),
        fatal: r.pick_list("markers.fatal", file.markers.fatal, || marker_defaults.fatal.clone()),
        unrecoverable: r.pick_list("markers.unrecoverable", file.markers.unrecoverable, || {
            marker_defaults.unrecoverable.clone()
        }),
    };
    // Unrecoverable markers are fatal markers too.
    for marker in &markers.unrecoverable {
        if !markers.fatal.contains(marker) {
            markers.fatal.push(marker.clone());
        }
    }

    let recovery_defaults = RecoveryPolicy::default();
    let recovery = RecoveryPolicy {
        max_retries: r.pick(
            "recovery.max_retries",
            overrides.max_retries,
            file.recovery.max_retries,
            || recovery_defaults.max_retries,
        ),
        checkpoint_artifact: r.pick(
            "recovery.checkpoint_artifact",
            None,
            file.recovery.checkpoint_artifact,
            || recovery_defaults.checkpoint_artifact.clone(),
        ),
        checkpoint_role: r.pick(
            "recovery.checkpoint_role",
            None,
            file.recovery.checkpoint_role,
            || recovery_defaults.checkpoint_role.clone(),
        ),
    };

    let poll_secs = r.pick(
        "polling.interval_secs",
        overrides.poll_interval_secs,
        file.polling.interval_secs,
        || DEFAULT_POLL_INTERVAL_SECS,
    );
    if poll_secs == 0 {
        anyhow::bail!("polling interval must be at least one second");
    }
    let timeout_secs = r.pick(
        "polling.remote_call_timeout_secs",
        None,
        file.polling.remote_call_timeout_secs,
        || DEFAULT_CALL_TIMEOUT_SECS,
    );
    if timeout_secs == 0 {
        anyhow::bail!("remote_call_timeout_secs must be at least one second");
    }

    let retry_defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_attempts: r.pick(
            "transport.max_attempts",
            None,
            file.transport.max_attempts,
            || retry_defaults.max_attempts,
        ),
        base: Duration::from_millis(r.pick(
            "transport.backoff_base_ms",
            None,
            file.transport.backoff_base_ms,
            || retry_defaults.base.as_millis() as u64,
        )),
        max: Duration::from_millis(r.pick(
            "transport.backoff_max_ms",
            None,
            file.transport.backoff_max_ms,
            || retry_defaults.max.as_millis() as u64,
        )),
    };

    let results_dir = match file.results.dir.as_deref() {
        Some(raw) => {
            let path = resolve_path(raw, base_dir);
            r.record("results.dir", &path.display(), ConfigSource::ConfigFile);
            path
        }
        None => {
            let path = default_data_dir()
                .context("failed to resolve default results directory; set [results] dir")?
                .join(RESULTS_DIR_NAME);
            r.record("results.dir", &path.display(), ConfigSource::Default);
            path
        }
    };
    let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    let results = ResultsConfig {
        dir: results_dir,
        artifacts: r.pick_list("results.artifacts", file.results.artifacts, || {
            owned(&DEFAULT_ARTIFACTS)
        }),
        large_artifacts: r.pick_list("results.large_artifacts", file.results.large_artifacts, || {
            owned(&DEFAULT_LARGE_ARTIFACTS)
        }),
        fetch_large: r.pick("results.fetch_large", None, file.results.fetch_large, || false),
    };

    let config = Config {
        database_path,
        verbose,
        cluster,
        commands,
        job_id,
        descriptor_name,
        launch,
        primary_log,
        markers,
        recovery,
        poll_interval: Duration::from_secs(poll_secs),
        call_timeout: Duration::from_secs(timeout_secs),
        retry,
        results,
        config_path: config_path.clone(),
    };
    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        values: r.values,
    };
    Ok(LoadResult { config, report })
}

fn resolve_cluster(
    file: FileCluster,
    base_dir: Option<&Path>,
    r: &mut Resolver,
) -> Result<Option<ClusterConfig>> {
    let Some(host) = file.host.filter(|h| !h.trim().is_empty()) else {
        if file.username.is_some() || file.work_dir.is_some() {
            anyhow::bail!("[cluster] host is required when other cluster settings are given");
        }
        return Ok(None);
    };
    let username = file
        .username
        .filter(|u| !u.trim().is_empty())
        .context("[cluster] username is required")?;
    let work_dir = file
        .work_dir
        .filter(|w| !w.trim().is_empty())
        .context("[cluster] work_dir is required")?;
    let work_dir = shellexpand::tilde(&work_dir).into_owned();
    r.record("cluster.host", &host, ConfigSource::ConfigFile);
    r.record("cluster.username", &username, ConfigSource::ConfigFile);
    r.record("cluster.work_dir", &work_dir, ConfigSource::ConfigFile);

    let port = r.pick("cluster.port", None, file.port, || DEFAULT_SSH_PORT);
    if port == 0 {
        anyhow::bail!("[cluster] port must be between 1 and 65535");
    }
    let identity_path = file
        .identity_path
        .as_deref()
        .map(|raw| resolve_path(raw, base_dir));
    if let Some(path) = &identity_path {
        r.record("cluster.identity_path", &path.display(), ConfigSource::ConfigFile);
    }
    let known_hosts_path = file
        .known_hosts_path
        .as_deref()
        .map(|raw| resolve_path(raw, base_dir));
    if let Some(path) = &known_hosts_path {
        r.record("cluster.known_hosts_path", &path.display(), ConfigSource::ConfigFile);
    }
    let keepalive_secs = r.pick("cluster.keepalive_secs", None, file.keepalive_secs, || {
        DEFAULT_KEEPALIVE_SECS
    });
    let max_sessions = r.pick("cluster.max_sessions", None, file.max_sessions, || {
        DEFAULT_MAX_SESSIONS
    });
    if max_sessions == 0 {
        anyhow::bail!("[cluster] max_sessions must be at least 1");
    }
    Ok(Some(ClusterConfig {
        host,
        port,
        username,
        identity_path,
        known_hosts_path,
        work_dir,
        keepalive_secs,
        max_sessions,
    }))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::set_var(self.key, value);
                    }
                }
                None => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::remove_var(self.key);
                    }
                }
            }
        }
    }

    const CLUSTER: &str = r#"
database_path = "db/jobctl.sqlite"

[cluster]
host = "login.cluster.example.org"
username = "alice"
identity_path = "keys/id_ed25519"
work_dir = "/scratch/alice/jobs"
"#;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("jobctl.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.cluster.host.is_none());
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[polling]\ninterval = 5\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(format!("{err:#}").contains("interval"));
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CLUSTER);
        let LoadResult { config, report } =
            load_with_report(Some(path), Overrides::default()).unwrap();

        let cluster = config.cluster.as_ref().unwrap();
        assert_eq!(cluster.port, DEFAULT_SSH_PORT);
        assert_eq!(cluster.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.call_timeout, Duration::from_secs(120));
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.recovery.checkpoint_artifact, "CONTCAR");
        assert_eq!(config.descriptor_name, "run.slurm");
        assert_eq!(config.primary_log, "OUTCAR");
        assert_eq!(config.commands.submit, DEFAULT_SUBMIT_COMMAND);
        assert!(config.commands.lookup.is_some());
        assert!(!config.results.fetch_large);
        assert_eq!(report.source_of("polling.interval_secs"), Some(ConfigSource::Default));
        assert_eq!(report.source_of("cluster.host"), Some(ConfigSource::ConfigFile));
    }

    #[test]
    fn relative_paths_resolve_from_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CLUSTER);
        let config_dir = path.parent().unwrap().to_path_buf();
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.database_path, config_dir.join("db").join("jobctl.sqlite"));
        assert_eq!(
            config.cluster.unwrap().identity_path,
            Some(config_dir.join("keys").join("id_ed25519"))
        );
    }

    #[test]
    fn cli_overrides_take_precedence_over_file_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{CLUSTER}\n[polling]\ninterval_secs = 30\n\n[recovery]\nmax_retries = 5\n"),
        );
        let LoadResult { config, report } = load_with_report(
            Some(path),
            Overrides {
                database_path: Some(PathBuf::from("from_flag.sqlite")),
                poll_interval_secs: Some(2),
                max_retries: Some(1),
                verbose: Some(true),
            },
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("from_flag.sqlite"));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.recovery.max_retries, 1);
        assert!(config.verbose);
        assert_eq!(report.source_of("recovery.max_retries"), Some(ConfigSource::Override));
    }

    #[test]
    fn file_values_win_over_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "{CLUSTER}\n[recovery]\nmax_retries = 5\n\n[transport]\nbackoff_base_ms = 100\n\n[results]\nfetch_large = true\n"
            ),
        );
        let LoadResult { config, report } =
            load_with_report(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.retry.base, Duration::from_millis(100));
        assert!(config.results.fetch_large);
        assert_eq!(report.source_of("recovery.max_retries"), Some(ConfigSource::ConfigFile));
    }

    #[test]
    fn empty_optional_commands_disable_them() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{CLUSTER}\n[scheduler]\nhistory_command = \"\"\nlookup_command = \"\"\n"),
        );
        let config = load(Some(path), Overrides::default()).unwrap();
        assert!(config.commands.history.is_none());
        assert!(config.commands.lookup.is_none());
    }

    #[test]
    fn job_id_pattern_without_capture_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{CLUSTER}\n[scheduler]\njob_id_pattern = \"^Submitted\"\n"),
        );
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("job_id_pattern"));
    }

    #[test]
    fn unrecoverable_markers_join_the_fatal_set() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!("{CLUSTER}\n[markers]\nfatal = [\"VERY BAD NEWS\"]\nunrecoverable = [\"POTCAR mismatch\"]\n"),
        );
        let config = load(Some(path), Overrides::default()).unwrap();
        assert_eq!(config.markers.fatal, vec!["VERY BAD NEWS", "POTCAR mismatch"]);
    }

    #[test]
    fn cluster_without_username_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[cluster]\nhost = \"login\"\nwork_dir = \"/scratch\"\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn controller_config_requires_a_cluster() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"db.sqlite\"\n");
        let config = load(Some(path), Overrides::default()).unwrap();
        assert!(config.cluster.is_none());
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();
        assert!(config.controller_config(addr).is_err());
    }

    #[test]
    fn controller_config_carries_cluster_settings() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CLUSTER);
        let config = load(Some(path), Overrides::default()).unwrap();
        let addr: SocketAddr = "10.0.0.5:22".parse().unwrap();
        let controller = config.controller_config(addr).unwrap();
        assert_eq!(controller.ssh.username, "alice");
        assert_eq!(controller.ssh.addr, addr);
        assert_eq!(controller.work_dir, "/scratch/alice/jobs");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, CLUSTER);
        let err = load(
            Some(path),
            Overrides {
                poll_interval_secs: Some(0),
                ..Overrides::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("polling interval"));
    }

    #[test]
    fn ensure_parent_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("jobctl.sqlite");
        ensure_parent_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("{CLUSTER}\n[polling]\ninterval_secs = 7\n"));
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(7));
        assert_eq!(config.config_path, Some(path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn cli_config_path_takes_precedence_over_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("env.toml");
        let cli_path = dir.path().join("cli.toml");
        fs::write(&env_path, "[polling]\ninterval_secs = 7\n").unwrap();
        fs::write(&cli_path, "[polling]\ninterval_secs = 9\n").unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, env_path.to_str().unwrap());

        let LoadResult { config, report } =
            load_with_report(Some(cli_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(9));
        assert_eq!(config.config_path, Some(cli_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }

    #[test]
    fn empty_env_config_path_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, "");
        let err = load_with_report(None, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("set but empty"));
    }

    #[test]
    fn bundled_demo_config_parses() {
        let raw = include_str!("../../demos/jobctl.toml");
        let file: FileConfig = toml::from_str(raw).unwrap();
        assert_eq!(file.cluster.max_sessions, Some(4));
        assert_eq!(file.scheduler.job_id_pattern.as_deref(), Some(DEFAULT_JOB_ID_PATTERN));
    }
}
