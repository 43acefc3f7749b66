//! Playback sampling for one version within one comparison.
//!
//! The sampler copies the playback driver and the media file into the
//! version's jail, launches the driver under the unprivileged account, and
//! polls the live process once per interval for CPU, memory and thread
//! readings. Each reading is appended as a sample row; once the player
//! exits, the time-averaged overview row is written, together with leak
//! totals parsed from the mtrace artifact the driver leaves behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::jail::{ChrootOpts, JAIL_USER, Jail};
use crate::mtrace::{self, LeakReport};
use crate::procinfo::{self, ProcSample};
use crate::store::{Overview, Sample, SharedStore, lock_store};

/// Driver file name inside the jail root.
pub const DRIVER_FILE: &str = "play.py";

/// Playback driver source, written into the jail at prepare time.
const DRIVER_SOURCE: &str = include_str!("../assets/play.py");

/// Starts the player process to be monitored.
///
/// The production implementation is [`JailPlayer`]; tests substitute a
/// launcher that spawns a plain host process.
pub trait PlayerLauncher: Send + Sync {
    /// Launch the player for `media_file` (a file name inside the jail
    /// root) and return the live process handle.
    fn launch(&self, jail: &Jail, media_file: &str) -> Result<Child>;
}

/// Launches the playback driver chrooted into the jail, running as the
/// unprivileged account, with output captured to the jail's log directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JailPlayer;

impl PlayerLauncher for JailPlayer {
    fn launch(&self, jail: &Jail, media_file: &str) -> Result<Child> {
        let opts = ChrootOpts {
            user: Some(JAIL_USER),
            log_to: Some("play.log"),
            ..ChrootOpts::default()
        };
        jail.spawn_in_root(&format!("python3 {DRIVER_FILE} {media_file}"), &opts)
    }
}

/// Running sums for the overview averages.
#[derive(Debug, Default)]
struct Totals {
    cpu: f64,
    ram: f64,
    ram_bytes: f64,
    threads: f64,
}

impl Totals {
    fn add(&mut self, reading: &ProcSample) {
        self.cpu += reading.cpu;
        self.ram += reading.ram;
        self.ram_bytes += reading.ram_bytes as f64;
        self.threads += reading.threads as f64;
    }
}

/// Measures one version's playback within one comparison run.
pub struct Sampler {
    version: String,
    comparison_build_id: i64,
    jail: Jail,
    store: SharedStore,
    media: PathBuf,
    interval: Duration,
}

impl Sampler {
    pub fn new(
        version: &str,
        comparison_build_id: i64,
        jail: Jail,
        store: SharedStore,
        media: &Path,
        interval: Duration,
    ) -> Self {
        Self {
            version: version.to_string(),
            comparison_build_id,
            jail,
            store,
            media: media.to_path_buf(),
            interval,
        }
    }

    /// Prepare the jail, launch the player, monitor it to completion.
    pub async fn run(&self, launcher: &dyn PlayerLauncher) -> Result<()> {
        self.prepare()?;

        let media_file = self.media_file()?;
        info!(version = %self.version, media = %media_file, "starting playback");
        let player = launcher.launch(&self.jail, &media_file)?;

        self.monitor(player).await
    }

    /// Copy the playback driver and the media file into the jail. Skips
    /// anything already present. Copies rather than hard-links: the build
    /// directory and the media source may sit on different filesystems.
    pub fn prepare(&self) -> Result<()> {
        let driver = self.jail.host_path(DRIVER_FILE);
        if !driver.exists() {
            if let Some(parent) = driver.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&driver, DRIVER_SOURCE)?;
            debug!(version = %self.version, "driver installed into jail");
        }

        let media_dest = self.jail.host_path(&self.media_file()?);
        if !media_dest.exists() {
            std::fs::copy(&self.media, &media_dest)?;
            debug!(version = %self.version, "media copied into jail");
        }

        Ok(())
    }

    /// Poll the player once per interval until it exits, appending a
    /// sample row per completed interval; then verify the exit code and
    /// write the overview.
    pub async fn monitor(&self, mut player: Child) -> Result<()> {
        let pid = player
            .id()
            .ok_or_else(|| Error::Playback("player exited before monitoring began".to_string()))?;

        let mut totals = Totals::default();
        let mut intervals: u64 = 0;

        let exit_status = loop {
            if let Some(status) = player.try_wait()? {
                break status;
            }

            // Blocks for the sampling window to compute the CPU figure.
            let Some(reading) = procinfo::sample(pid, self.interval).await else {
                // Exited mid-window; the next liveness check picks it up.
                continue;
            };

            lock_store(&self.store)?.insert_sample(&Sample {
                comparison_build_id: self.comparison_build_id,
                interval: intervals,
                cpu: reading.cpu,
                ram: reading.ram,
                threads: reading.threads,
                ram_bytes: reading.ram_bytes,
            })?;

            info!(
                version = %self.version,
                interval = intervals,
                cpu = reading.cpu,
                ram = reading.ram,
                ram_bytes = reading.ram_bytes,
                threads = reading.threads,
                "sampled"
            );

            totals.add(&reading);
            intervals += 1;
        };

        if !exit_status.success() {
            return Err(Error::Playback(
                "unable to start or continue playback for unknown reason".to_string(),
            ));
        }

        self.finalize(&totals, intervals)
    }

    /// Write the overview row: time-averaged metrics plus leak totals.
    /// With zero completed intervals there is nothing to average, so no
    /// row is written.
    fn finalize(&self, totals: &Totals, intervals: u64) -> Result<()> {
        let leaks = self.read_leak_trace();

        if intervals == 0 {
            warn!(version = %self.version, "no sampling intervals completed, skipping overview");
            return Ok(());
        }

        let n = intervals as f64;
        let overview = Overview {
            comparison_build_id: self.comparison_build_id,
            cpu: totals.cpu / n,
            ram: totals.ram / n,
            threads: totals.threads / n,
            ram_bytes: totals.ram_bytes / n,
            leak_count: leaks.map(|l| l.count),
            leak_bytes: leaks.map(|l| l.bytes),
        };
        lock_store(&self.store)?.insert_overview(&overview)?;

        info!(
            version = %self.version,
            intervals,
            cpu = overview.cpu,
            ram = overview.ram,
            "overview written"
        );
        Ok(())
    }

    /// Parse the mtrace artifact the driver leaves in the unprivileged
    /// account's home directory. A missing artifact is only worth a
    /// warning; leak fields stay absent.
    fn read_leak_trace(&self) -> Option<LeakReport> {
        let path = self
            .jail
            .host_path(&format!("home/{JAIL_USER}/mtrace.txt"));

        match std::fs::read_to_string(&path) {
            Ok(contents) => mtrace::parse(&contents),
            Err(_) => {
                warn!(
                    version = %self.version,
                    path = %path.display(),
                    "leak trace artifact not found"
                );
                None
            }
        }
    }

    fn media_file(&self) -> Result<String> {
        self.media
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Playback(format!(
                    "media path {} has no file name",
                    self.media.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::TempDir;

    fn sampler(tmp: &TempDir) -> Sampler {
        let media = tmp.path().join("movie.mkv");
        std::fs::write(&media, b"not really a movie").unwrap();

        let jail = Jail::new("2.1.0", tmp.path(), false).unwrap();
        let store = Store::open_in_memory().unwrap().into_shared();
        Sampler::new("2.1.0", 1, jail, store, &media, Duration::from_millis(100))
    }

    #[test]
    fn prepare_installs_driver_and_media_once() {
        let tmp = TempDir::new().unwrap();
        let sampler = sampler(&tmp);

        sampler.prepare().unwrap();
        let driver = sampler.jail.host_path(DRIVER_FILE);
        let media = sampler.jail.host_path("movie.mkv");
        assert!(driver.is_file());
        assert!(media.is_file());

        // Second prepare is a no-op on existing files.
        let modified = driver.metadata().unwrap().modified().unwrap();
        sampler.prepare().unwrap();
        assert_eq!(driver.metadata().unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn missing_leak_trace_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        assert!(sampler(&tmp).read_leak_trace().is_none());
    }

    #[test]
    fn leak_trace_is_read_from_jail_home() {
        let tmp = TempDir::new().unwrap();
        let sampler = sampler(&tmp);

        let trace = sampler.jail.host_path("home/playbench/mtrace.txt");
        std::fs::create_dir_all(trace.parent().unwrap()).unwrap();
        std::fs::write(
            &trace,
            "Memory not freed:\n0x0000000000601460 16 at 0x400544\n",
        )
        .unwrap();

        let leaks = sampler.read_leak_trace().unwrap();
        assert_eq!(leaks.count, 1);
        assert_eq!(leaks.bytes, 16);
    }
}
