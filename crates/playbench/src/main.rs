//! playbench CLI - build media player versions in chroot jails and compare
//! resource usage while playing a reference media file.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use playbench_core::logging::{LogConfig, LogFormat, init_logging};
use playbench_core::{Config, JailPlayer, Store, build_all, compare};
use tracing::{error, info};

/// External tools the pipeline shells out to.
const REQUIRED_TOOLS: [&str; 4] = ["debootstrap", "wget", "tar", "chroot"];

#[derive(Debug, Parser)]
#[command(
    name = "playbench",
    version,
    about = "Media player version measurement and comparison tool"
)]
struct Cli {
    /// Media file to play in every version
    media: PathBuf,

    /// Player versions to build and compare
    #[arg(required = true)]
    versions: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "./playbench.yaml")]
    config: PathBuf,

    /// Build directory override (archives, jails, logs)
    #[arg(short, long)]
    build_dir: Option<PathBuf>,

    /// Pass external tool output through instead of suppressing it
    #[arg(long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: if cli.debug { "debug" } else { "info" }.to_string(),
        format: if cli.json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        file: None,
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("playbench: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.config)?;
    if let Some(build_dir) = &cli.build_dir {
        config.build_dir = build_dir.clone();
    }

    preflight(&cli, &config)?;

    std::fs::create_dir_all(&config.build_dir)
        .with_context(|| format!("cannot create build dir {}", config.build_dir.display()))?;

    let store = Store::open(&config.db)?.into_shared();
    let config = Arc::new(config);

    build_all(
        &cli.versions,
        Arc::clone(&config),
        Arc::clone(&store),
        cli.verbose,
    )
    .await?;

    let comparison_id = compare(
        &cli.versions,
        &cli.media,
        &config,
        &store,
        &JailPlayer,
        cli.verbose,
    )
    .await?;

    info!(comparison_id, "finished");
    Ok(())
}

/// Fail fast on anything that would otherwise surface halfway through an
/// hours-long build: privileges, external tools, unknown versions, a
/// missing media file.
fn preflight(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    if !running_as_root() {
        bail!("root privileges are required (debootstrap and chroot)");
    }

    let missing = missing_tools();
    if !missing.is_empty() {
        bail!("please install {} to run playbench", missing.join(", "));
    }

    for version in &cli.versions {
        config.version(version)?;
    }

    if !cli.media.is_file() {
        bail!("media file {} not found", cli.media.display());
    }

    Ok(())
}

fn running_as_root() -> bool {
    Command::new("id")
        .arg("-u")
        .output()
        .is_ok_and(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "0")
}

fn missing_tools() -> Vec<&'static str> {
    REQUIRED_TOOLS
        .into_iter()
        .filter(|tool| {
            !Command::new(tool)
                .arg("--version")
                .output()
                .is_ok_and(|o| o.status.success())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_media_and_versions() {
        let cli = Cli::parse_from(["playbench", "movie.mkv", "2.1.0", "3.0.1", "--debug"]);
        assert_eq!(cli.media, PathBuf::from("movie.mkv"));
        assert_eq!(cli.versions, vec!["2.1.0".to_string(), "3.0.1".to_string()]);
        assert!(cli.debug);
        assert!(!cli.verbose);
    }

    #[test]
    fn versions_are_required() {
        assert!(Cli::try_parse_from(["playbench", "movie.mkv"]).is_err());
    }
}
