// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::app::ports::summary_store::StoredSummary;

#[derive(Parser, Debug)]
#[command(
    name = "jobctl",
    version,
    about,
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: default location < JOBCTL_CONFIG_PATH < --config.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory.\n\
Logging: JOBCTL_LOG (filter), JOBCTL_LOG_FORMAT (compact|pretty|json), JOBCTL_LOG_FILE, JOBCTL_LOG_SPAN_EVENTS."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, jobctl uses JOBCTL_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Seconds between scheduler polls. Overrides `[polling] interval_secs`."
    )]
    pub poll_interval: Option<u64>,
    #[arg(
        long,
        global = true,
        value_name = "N",
        help = "Resubmissions allowed per job. Overrides `[recovery] max_retries`."
    )]
    pub max_retries: Option<u32>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit and supervise one job per manifest until each finishes.
    Run {
        #[arg(value_name = "MANIFEST", required = true, num_args = 1..)]
        manifests: Vec<PathBuf>,
    },
    /// Check a manifest's input files without contacting the cluster.
    Validate {
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },
    /// Print the stored job summaries, or only the latest one for NAME.
    History {
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    from_matches(&matches).unwrap_or_else(|err| err.exit())
}

fn from_matches(matches: &clap::ArgMatches) -> Result<ParsedOpts, clap::Error> {
    let opts = Opts::from_arg_matches(matches)?;
    let verbose_override = opts.verbose.then_some(true);
    Ok(ParsedOpts {
        opts,
        verbose_override,
    })
}

/// One line per stored summary, tab separated.
pub fn render_summary(row: &StoredSummary) -> String {
    let mut line = format!(
        "{}\t{}\t{}\tscheduler id {}\tretries {}\tfinished {}",
        row.id,
        row.name,
        row.final_state,
        row.scheduler_id.as_deref().unwrap_or("-"),
        row.retry_count,
        row.finished_at,
    );
    if let Some(dir) = &row.results_dir {
        line.push_str(&format!("\tresults {dir}"));
    }
    if let Some(failure) = &row.failure {
        line.push_str(&format!("\t{failure}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ParsedOpts, clap::Error> {
        let matches = cli_command().try_get_matches_from(args)?;
        from_matches(&matches)
    }

    #[test]
    fn command_definition_is_consistent() {
        cli_command().debug_assert();
    }

    #[test]
    fn run_accepts_several_manifests_and_overrides() {
        let parsed = parse(&[
            "jobctl",
            "run",
            "si.toml",
            "fe.toml",
            "--poll-interval",
            "5",
            "--max-retries",
            "2",
            "-v",
        ])
        .unwrap();
        assert_eq!(parsed.opts.poll_interval, Some(5));
        assert_eq!(parsed.opts.max_retries, Some(2));
        assert_eq!(parsed.verbose_override, Some(true));
        match parsed.opts.command {
            Command::Run { manifests } => assert_eq!(manifests.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_requires_a_manifest() {
        assert!(parse(&["jobctl", "run"]).is_err());
    }

    #[test]
    fn history_name_is_optional() {
        match parse(&["jobctl", "history"]).unwrap().opts.command {
            Command::History { name } => assert_eq!(name, None),
            other => panic!("unexpected command {other:?}"),
        }
        match parse(&["jobctl", "history", "si-relax"]).unwrap().opts.command {
            Command::History { name } => assert_eq!(name.as_deref(), Some("si-relax")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn summary_line_shows_failure_and_results() {
        let mut row = StoredSummary {
            id: 7,
            name: "si".into(),
            scheduler_id: Some("812".into()),
            final_state: "failed".into(),
            remote_dir: "/scratch/si".into(),
            retry_count: 3,
            bundle_hash: "abc".into(),
            submitted_at: None,
            finished_at: "2026-01-02T03:04:05Z".into(),
            failure: Some("recovery exhausted after 4 attempts".into()),
            results_dir: None,
            metrics_json: "{}".into(),
            history_json: "[]".into(),
            decisions_json: "[]".into(),
        };
        assert_eq!(
            render_summary(&row),
            "7\tsi\tfailed\tscheduler id 812\tretries 3\tfinished 2026-01-02T03:04:05Z\t\
             recovery exhausted after 4 attempts"
        );
        row.failure = None;
        row.results_dir = Some("/results/si".into());
        assert!(render_summary(&row).ends_with("\tresults /results/si"));
    }

    #[test]
    fn verbose_is_not_an_override_unless_given() {
        let parsed =
            parse(&["jobctl", "--config", "/etc/jobctl.toml", "validate", "si.toml"]).unwrap();
        assert_eq!(parsed.verbose_override, None);
        assert_eq!(parsed.opts.config, Some(PathBuf::from("/etc/jobctl.toml")));
    }
}
