//! Resumable per-version build pipeline.
//!
//! Each version advances through a fixed stage order: environment creation,
//! source unpack, configure, compile, install. The current stage is
//! persisted after every completed transition, and a stage only executes
//! when it is strictly ahead of the persisted state, so an interrupted
//! build resumes where it stopped instead of repeating expensive work like
//! the jail bootstrap or a full compilation.
//!
//! The source download is a pre-stage outside the persisted machine: it is
//! spawned first, runs while the environment bootstraps, and is joined
//! immediately before the unpack stage that needs the archive.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jail::{ChrootOpts, Jail};
use crate::store::{SharedStore, lock_store};

/// Persisted build progress, in stage order. The derived `Ord` is the
/// stage order the pipeline advances through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildState {
    Unstarted,
    EnvironmentCreated,
    SourceUnpacked,
    Configured,
    Compiled,
    Installed,
}

impl BuildState {
    /// All states in pipeline order.
    pub const ORDER: [BuildState; 6] = [
        BuildState::Unstarted,
        BuildState::EnvironmentCreated,
        BuildState::SourceUnpacked,
        BuildState::Configured,
        BuildState::Compiled,
        BuildState::Installed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Unstarted => "unstarted",
            BuildState::EnvironmentCreated => "environment_created",
            BuildState::SourceUnpacked => "source_unpacked",
            BuildState::Configured => "configured",
            BuildState::Compiled => "compiled",
            BuildState::Installed => "installed",
        }
    }

    /// Inverse of [`BuildState::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|state| state.as_str() == s)
    }
}

/// Drives one version through the build pipeline.
pub struct Builder {
    version: String,
    config: Arc<Config>,
    store: SharedStore,
    jail: Jail,
    /// Unpacked source tree path inside the jail.
    source_dir: String,
}

impl Builder {
    /// Prepare a builder for a version. Fails when the version has no
    /// config entry.
    pub fn new(
        version: &str,
        config: Arc<Config>,
        store: SharedStore,
        verbose: bool,
    ) -> Result<Self> {
        config.version(version)?;
        let jail = Jail::new(version, &config.build_dir, verbose)?;

        Ok(Self {
            version: version.to_string(),
            source_dir: format!("/usr/local/src/{}-{version}", config.package),
            config,
            store,
            jail,
        })
    }

    /// Run the pipeline: start the download, then advance every stage that
    /// is still ahead of the persisted state.
    pub async fn run(&self) -> Result<()> {
        let download = self.start_download()?;

        self.run_stage(BuildState::EnvironmentCreated, self.create_environment())
            .await?;
        self.finish_download(download).await?;
        self.run_stage(BuildState::SourceUnpacked, self.unpack_source())
            .await?;
        self.run_stage(BuildState::Configured, self.configure())
            .await?;
        self.run_stage(BuildState::Compiled, self.compile()).await?;
        self.run_stage(BuildState::Installed, self.install()).await?;

        info!(version = %self.version, "build finished");
        Ok(())
    }

    /// Execute `op` and persist `target` only when `target` is strictly
    /// ahead of the persisted state; otherwise skip. This is what makes
    /// every stage idempotent at the granularity of "has this stage ever
    /// succeeded".
    async fn run_stage(
        &self,
        target: BuildState,
        op: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        let current = lock_store(&self.store)?.build_state(&self.version)?;
        if target <= current {
            debug!(
                version = %self.version,
                stage = target.as_str(),
                state = current.as_str(),
                "stage already completed, skipping"
            );
            return Ok(());
        }

        op.await?;
        lock_store(&self.store)?.set_build_state(&self.version, target)?;
        info!(version = %self.version, stage = target.as_str(), "stage completed");
        Ok(())
    }

    // ── Download pre-stage ──────────────────────────────────────────────

    fn archive_path(&self) -> Result<PathBuf> {
        Ok(self
            .config
            .build_dir
            .join(self.config.archive_name(&self.version)?))
    }

    /// Spawn the source archive download. `-c` resumes a partial file, so
    /// re-running after an interruption does not restart from zero.
    fn start_download(&self) -> Result<Child> {
        let url = self.config.archive_url(&self.version)?;
        let archive = self.archive_path()?;
        info!(version = %self.version, url = %url, "starting source download");

        let archive = archive.display().to_string();
        self.jail.spawn(
            &["wget", "-c", "-O", archive.as_str(), url.as_str()],
            Some("download.log"),
        )
    }

    /// Join point for the download, placed immediately before unpack.
    async fn finish_download(&self, mut download: Child) -> Result<()> {
        let status = download.wait().await?;
        if !status.success() {
            return Err(Error::Download(format!(
                "download of {} failed ({status}), see download.log for details",
                self.config.archive_url(&self.version)?
            )));
        }
        Ok(())
    }

    // ── Stages ──────────────────────────────────────────────────────────

    async fn create_environment(&self) -> Result<()> {
        self.jail.create(self.config.version(&self.version)?).await
    }

    async fn unpack_source(&self) -> Result<()> {
        let target = self.jail.host_path("usr/local/src");
        std::fs::create_dir_all(&target)?;

        let target = target.display().to_string();
        let archive = self.archive_path()?.display().to_string();
        self.jail
            .run(
                &["tar", "-C", target.as_str(), "-xf", archive.as_str()],
                Some("unpack.log"),
            )
            .await
    }

    async fn configure(&self) -> Result<()> {
        let vcfg = self.config.version(&self.version)?;
        let command = format!("./configure --prefix=/usr {}", vcfg.configure_args);
        let opts = ChrootOpts {
            cwd: &self.source_dir,
            log_to: Some("configure.log"),
            ..ChrootOpts::default()
        };
        self.jail.run_in_root(command.trim_end(), &opts).await
    }

    async fn compile(&self) -> Result<()> {
        let opts = ChrootOpts {
            cwd: &self.source_dir,
            log_to: Some("make.log"),
            ..ChrootOpts::default()
        };
        self.jail.run_in_root("make", &opts).await
    }

    async fn install(&self) -> Result<()> {
        let opts = ChrootOpts {
            cwd: &self.source_dir,
            log_to: Some("install.log"),
            ..ChrootOpts::default()
        };
        self.jail.run_in_root("make install", &opts).await
    }
}

/// Build every requested version on a bounded worker pool.
///
/// Pool width defaults to one worker per version, capped by the
/// `build_jobs` config key. One version's failure does not cancel siblings
/// already in flight; the first failure is reported once all workers have
/// finished.
pub async fn build_all(
    versions: &[String],
    config: Arc<Config>,
    store: SharedStore,
    verbose: bool,
) -> Result<()> {
    let workers = config.build_jobs.unwrap_or(versions.len()).max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut set: JoinSet<(String, Result<()>)> = JoinSet::new();

    for version in versions {
        let version = version.clone();
        let config = Arc::clone(&config);
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);

        let span = info_span!("build", version = %version);
        set.spawn(
            async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::CommandExecution("worker pool closed".to_string()))?;
                    Builder::new(&version, config, store, verbose)?.run().await
                }
                .await;
                (version, result)
            }
            .instrument(span),
        );
    }

    let mut first_failure = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((version, Err(e))) => {
                error!(version = %version, error = %e, "build failed");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
            Err(join_error) => {
                error!(error = %join_error, "build worker panicked");
                if first_failure.is_none() {
                    first_failure = Some(Error::CommandExecution(format!(
                        "build worker panicked: {join_error}"
                    )));
                }
            }
        }
    }

    first_failure.map_or(Ok(()), Err)
}
