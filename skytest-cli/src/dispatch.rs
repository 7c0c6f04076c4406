// Copyright (c) The skytest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing and command dispatch.

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::WrapErr, Result};
use skytest_runner::{
    config::{RunConfig, DEFAULT_CONFIG_FILE},
    exec_manager::{ExecutionManager, FsExecutionManager},
    providers::{default_registry, InstanceOptions},
    signal::SignalMode,
    Arguments,
};
use std::sync::Arc;
use tracing::info;

/// skytest is a cloud helper continuous integration testing tool: it
/// executes a set of individual tests across all clouds provided.
#[derive(Debug, Parser)]
#[command(name = "skytest", version)]
pub(crate) struct CliOpts {
    /// Config file
    #[arg(long, value_name = "PATH")]
    config: Option<Utf8PathBuf>,

    /// Enable only specified cluster config(s)
    #[arg(long = "cluster", short = 'c', value_name = "NAME")]
    clusters: Vec<String>,

    /// Enable only specified cluster kind(s)
    #[arg(long = "kind", short = 'k', value_name = "KIND")]
    kinds: Vec<String>,

    /// Run tests with given tag(s) only
    #[arg(long = "tags", short = 't', value_name = "TAG")]
    tags: Vec<String>,

    /// Execute only count of tests
    #[arg(long, default_value_t = -1)]
    count: i64,

    /// Skip stop operations
    #[arg(long = "noStop")]
    no_stop: bool,

    /// Skip install operations
    #[arg(long = "noInstall")]
    no_install: bool,

    /// Skip prepare operations
    #[arg(long = "noPrepare")]
    no_prepare: bool,

    /// Disable masking of environment variables in output
    #[arg(long = "noMask")]
    no_mask: bool,

    /// A list of tests to run
    #[arg(value_name = "TEST")]
    only_run: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the version number of skytest
    Version,
}

impl CliOpts {
    fn arguments(&self) -> Arguments {
        Arguments {
            clusters: self.clusters.clone(),
            kinds: self.kinds.clone(),
            tags: self.tags.clone(),
            count: usize::try_from(self.count).ok().filter(|count| *count > 0),
            only_run: self.only_run.clone(),
            instance_options: InstanceOptions {
                no_stop: self.no_stop,
                no_install: self.no_install,
                no_prepare: self.no_prepare,
                no_mask: self.no_mask,
            },
        }
    }
}

pub(crate) fn exec() -> Result<()> {
    let opts = CliOpts::parse();
    if let Some(Command::Version) = opts.command {
        println!("skytest {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    crate::output::init_logging();

    let config_path = opts
        .config
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = RunConfig::load(&config_path)
        .wrap_err_with(|| format!("failed to load configuration from {config_path}"))?;
    info!("configuration file loaded successfully");

    let manager: Arc<dyn ExecutionManager> =
        Arc::new(FsExecutionManager::new(artifact_root(&config)));
    let providers = default_registry(&manager).wrap_err("failed to set up providers")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build the runtime")?;
    let outcome = runtime.block_on(skytest_runner::perform_testing(
        config,
        opts.arguments(),
        providers,
        manager,
        SignalMode::Terminate,
    ))?;

    if let Some(fatal) = &outcome.fatal {
        tracing::error!("{fatal}");
    }
    if !outcome.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn artifact_root(config: &RunConfig) -> Utf8PathBuf {
    if config.root.as_str().is_empty() {
        Utf8Path::new(".results").to_owned()
    } else {
        config.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_and_repeat() {
        let opts = CliOpts::try_parse_from([
            "skytest",
            "--config",
            "run.yaml",
            "-c",
            "packet-a",
            "-c",
            "packet-b",
            "-k",
            "shell",
            "-t",
            "basic",
            "--count",
            "3",
            "--noStop",
            "TestOne",
            "TestTwo",
        ])
        .unwrap();
        assert_eq!(opts.config.as_deref(), Some(Utf8Path::new("run.yaml")));
        assert_eq!(opts.clusters, vec!["packet-a", "packet-b"]);
        assert_eq!(opts.kinds, vec!["shell"]);
        assert_eq!(opts.tags, vec!["basic"]);
        assert_eq!(opts.count, 3);
        assert!(opts.no_stop);
        assert_eq!(opts.only_run, vec!["TestOne", "TestTwo"]);

        let args = opts.arguments();
        assert_eq!(args.count, Some(3));
        assert!(args.instance_options.no_stop);
    }

    #[test]
    fn count_defaults_to_unlimited() {
        let opts = CliOpts::try_parse_from(["skytest"]).unwrap();
        assert_eq!(opts.count, -1);
        assert_eq!(opts.arguments().count, None);
    }

    #[test]
    fn version_subcommand_parses() {
        let opts = CliOpts::try_parse_from(["skytest", "version"]).unwrap();
        assert!(matches!(opts.command, Some(Command::Version)));
    }
}
