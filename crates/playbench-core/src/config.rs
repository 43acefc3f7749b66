//! Configuration management.
//!
//! The configuration file is YAML: global settings (database path, download
//! base URL, build directory, sampling cadence) plus one entry per player
//! version describing how to bootstrap and configure its jail.
//!
//! Components receive the loaded [`Config`] explicitly (usually as
//! `Arc<Config>`); there is no process-wide configuration global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors from configuration loading and lookups.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file missing or unreadable.
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid YAML or does not match the schema.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A requested version has no entry in the `versions` table.
    #[error("version {0} is not described in the config")]
    UnknownVersion(String),
}

/// Per-version build description.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionConfig {
    /// Distribution identifier handed to debootstrap (e.g. "bookworm").
    pub distribution: String,

    /// Optional CPU architecture (debootstrap `--arch`).
    #[serde(default)]
    pub arch: Option<String>,

    /// Extra packages installed into the jail, on top of the build
    /// toolchain that is always included.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Extra arguments appended to `./configure --prefix=/usr`.
    #[serde(default)]
    pub configure_args: String,

    /// Source archive file name override. When absent the name is derived
    /// as `<package>-<version>.tar.xz`.
    #[serde(default)]
    pub archive: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path.
    pub db: PathBuf,

    /// Base URL the source archives are downloaded from. The version and
    /// archive file name are appended as path segments.
    pub download_url: String,

    /// Working directory holding archives, jails and per-version logs.
    pub build_dir: PathBuf,

    /// Package name used to derive source archive file names.
    pub package: String,

    /// Seconds between resource samples (also the CPU% averaging window).
    pub sample_interval_secs: u64,

    /// Maximum number of concurrent version builds. Defaults to one worker
    /// per requested version.
    pub build_jobs: Option<usize>,

    /// Per-version build descriptions, keyed by version string.
    pub versions: HashMap<String, VersionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: PathBuf::from("./playbench.sqlite"),
            download_url: "https://download.videolan.org/pub/videolan/vlc".to_string(),
            build_dir: PathBuf::from("./build"),
            package: "vlc".to_string(),
            sample_interval_secs: 1,
            build_jobs: None,
            versions: HashMap::new(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Look up the build description for a version.
    pub fn version(&self, version: &str) -> Result<&VersionConfig, ConfigError> {
        self.versions
            .get(version)
            .ok_or_else(|| ConfigError::UnknownVersion(version.to_string()))
    }

    /// Source archive file name for a version.
    pub fn archive_name(&self, version: &str) -> Result<String, ConfigError> {
        let vcfg = self.version(version)?;
        Ok(vcfg
            .archive
            .clone()
            .unwrap_or_else(|| format!("{}-{version}.tar.xz", self.package)))
    }

    /// Download URL for a version's source archive.
    pub fn archive_url(&self, version: &str) -> Result<String, ConfigError> {
        let name = self.archive_name(version)?;
        Ok(format!(
            "{}/{version}/{name}",
            self.download_url.trim_end_matches('/')
        ))
    }

    /// Sampling cadence as a [`Duration`].
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
db: /tmp/pb.sqlite
download_url: https://example.org/pub/player
build_dir: /tmp/pb-build
package: player
versions:
  "2.1.0":
    distribution: wheezy
    arch: i386
    dependencies: [libx11-dev]
    configure_args: "--disable-qt"
  "3.0.1":
    distribution: bookworm
    archive: player-3.0.1-src.tar.xz
"#;

    #[test]
    fn parse_example_config() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.package, "player");
        assert_eq!(config.sample_interval_secs, 1);

        let old = config.version("2.1.0").unwrap();
        assert_eq!(old.distribution, "wheezy");
        assert_eq!(old.arch.as_deref(), Some("i386"));
        assert_eq!(old.dependencies, vec!["libx11-dev".to_string()]);
        assert_eq!(old.configure_args, "--disable-qt");
    }

    #[test]
    fn unknown_version_is_an_error() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert!(matches!(
            config.version("9.9.9"),
            Err(ConfigError::UnknownVersion(_))
        ));
    }

    #[test]
    fn archive_name_derived_and_overridden() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.archive_name("2.1.0").unwrap(), "player-2.1.0.tar.xz");
        assert_eq!(
            config.archive_name("3.0.1").unwrap(),
            "player-3.0.1-src.tar.xz"
        );
    }

    #[test]
    fn archive_url_joins_segments() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(
            config.archive_url("2.1.0").unwrap(),
            "https://example.org/pub/player/2.1.0/player-2.1.0.tar.xz"
        );
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = serde_yaml::from_str("versions: {}").unwrap();
        assert_eq!(config.package, "vlc");
        assert_eq!(config.build_dir, PathBuf::from("./build"));
        assert!(config.build_jobs.is_none());
    }
}
