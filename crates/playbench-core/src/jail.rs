//! Chroot jail management.
//!
//! Each version owns one filesystem-isolated root under the build
//! directory, bootstrapped with debootstrap, plus a log directory holding
//! one file per stage. Every external tool invocation, host-side or
//! chrooted, funnels through this module so command logging, output
//! capture and failure translation stay uniform across the build and
//! sampling paths.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::VersionConfig;
use crate::error::{Error, Result};

/// Name of the unprivileged account provisioned inside every jail. The
/// player runs under it, and its home directory is where the leak-trace
/// artifact lands.
pub const JAIL_USER: &str = "playbench";

/// Options for chrooted execution.
#[derive(Debug, Clone)]
pub struct ChrootOpts<'a> {
    /// Working directory inside the jail.
    pub cwd: &'a str,
    /// Unprivileged account to run as (`chroot --userspec`).
    pub user: Option<&'a str>,
    /// Log file name under the jail's log directory; combined stdout and
    /// stderr are redirected there.
    pub log_to: Option<&'a str>,
}

impl Default for ChrootOpts<'_> {
    fn default() -> Self {
        Self {
            cwd: "/",
            user: None,
            log_to: None,
        }
    }
}

/// One version's isolated execution environment.
#[derive(Debug, Clone)]
pub struct Jail {
    version: String,
    chroot_dir: PathBuf,
    log_dir: PathBuf,
    verbose: bool,
}

impl Jail {
    /// Set up paths for a version's jail under the build directory and
    /// create its log directory. The isolated root itself is only
    /// materialized by [`Jail::create`].
    pub fn new(version: &str, build_dir: &Path, verbose: bool) -> Result<Self> {
        let log_dir = build_dir.join(format!("log-{version}"));
        std::fs::create_dir_all(&log_dir)?;

        Ok(Self {
            version: version.to_string(),
            chroot_dir: build_dir.join(format!("jail-{version}")),
            log_dir,
            verbose,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Map a path inside the jail to the corresponding host path.
    #[must_use]
    pub fn host_path(&self, relative: &str) -> PathBuf {
        self.chroot_dir.join(relative.trim_start_matches('/'))
    }

    /// Materialize the isolated root with debootstrap and provision the
    /// unprivileged playback account.
    ///
    /// The package list always includes the build toolchain; the
    /// per-version dependency list is deduplicated into it.
    pub async fn create(&self, vcfg: &VersionConfig) -> Result<()> {
        let mut packages: BTreeSet<&str> = vcfg.dependencies.iter().map(String::as_str).collect();
        packages.insert("build-essential");
        let include = format!(
            "--include={}",
            packages.into_iter().collect::<Vec<_>>().join(",")
        );

        let mut argv = vec!["debootstrap", include.as_str()];
        let arch;
        if let Some(a) = &vcfg.arch {
            arch = format!("--arch={a}");
            argv.push(&arch);
        }
        let chroot_dir = self.chroot_dir.display().to_string();
        argv.push(&vcfg.distribution);
        argv.push(&chroot_dir);

        self.run(&argv, Some("debootstrap.log"))
            .await
            .map_err(|e| Error::EnvironmentCreation(e.to_string()))?;

        if !self.host_path(&format!("home/{JAIL_USER}")).exists() {
            let opts = ChrootOpts {
                log_to: Some("account.log"),
                ..ChrootOpts::default()
            };
            self.run_in_root(&format!("useradd -m -s /bin/sh {JAIL_USER}"), &opts)
                .await
                .map_err(|e| Error::EnvironmentCreation(e.to_string()))?;
        }

        Ok(())
    }

    /// Run a command on the host, blocking until it exits. A non-zero exit
    /// code is a [`Error::CommandExecution`].
    pub async fn run(&self, argv: &[&str], log_to: Option<&str>) -> Result<()> {
        let mut child = self.spawn(argv, log_to)?;
        let status = child.wait().await?;
        self.check_status(argv[0], status, log_to)
    }

    /// Spawn a command on the host, returning the live process handle.
    pub fn spawn(&self, argv: &[&str], log_to: Option<&str>) -> Result<Child> {
        debug!(version = %self.version, command = %argv.join(" "), "executing");

        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]);
        self.spawn_with_io(command, log_to)
    }

    /// Run a command line inside the jail, blocking until it exits.
    pub async fn run_in_root(&self, command_line: &str, opts: &ChrootOpts<'_>) -> Result<()> {
        let mut child = self.spawn_in_root(command_line, opts)?;
        let status = child.wait().await?;
        self.check_status(command_line, status, opts.log_to)
    }

    /// Spawn a command line inside the jail, returning the live handle.
    ///
    /// The invocation shape is `chroot [--userspec=u:u] <root> sh -c
    /// "cd <cwd>; <command>"`, so relative build steps run from the
    /// unpacked source tree.
    pub fn spawn_in_root(&self, command_line: &str, opts: &ChrootOpts<'_>) -> Result<Child> {
        debug!(
            version = %self.version,
            cwd = opts.cwd,
            user = opts.user.unwrap_or("root"),
            command = command_line,
            "executing in jail"
        );

        let mut command = Command::new("chroot");
        if let Some(user) = opts.user {
            command.arg(format!("--userspec={user}:{user}"));
        }
        command
            .arg(&self.chroot_dir)
            .arg("sh")
            .arg("-c")
            .arg(format!("cd {}; {}", opts.cwd, command_line));

        self.spawn_with_io(command, opts.log_to)
    }

    fn spawn_with_io(&self, mut command: Command, log_to: Option<&str>) -> Result<Child> {
        match log_to {
            Some(name) => {
                let log_path = self.log_dir.join(name);
                let file = std::fs::File::create(&log_path)?;
                command
                    .stdout(Stdio::from(file.try_clone()?))
                    .stderr(Stdio::from(file));
            }
            // Quiet by default, passthrough on request.
            None if self.verbose => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        command.stdin(Stdio::null()).kill_on_drop(true);

        Ok(command.spawn()?)
    }

    fn check_status(
        &self,
        what: &str,
        status: std::process::ExitStatus,
        log_to: Option<&str>,
    ) -> Result<()> {
        if status.success() {
            return Ok(());
        }
        let detail = log_to.map_or_else(String::new, |name| {
            format!(", see {} for details", self.log_dir.join(name).display())
        });
        Err(Error::CommandExecution(format!(
            "execution of `{what}` failed ({status}){detail}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn jail(tmp: &TempDir) -> Jail {
        Jail::new("2.1.0", tmp.path(), false).unwrap()
    }

    #[test]
    fn new_creates_log_dir() {
        let tmp = TempDir::new().unwrap();
        let jail = jail(&tmp);
        assert!(jail.log_dir().is_dir());
        assert!(jail.log_dir().ends_with("log-2.1.0"));
        assert!(!jail.chroot_dir().exists());
    }

    #[test]
    fn host_path_maps_into_jail() {
        let tmp = TempDir::new().unwrap();
        let jail = jail(&tmp);
        assert_eq!(
            jail.host_path("/usr/local/src"),
            tmp.path().join("jail-2.1.0/usr/local/src")
        );
        assert_eq!(
            jail.host_path("home/playbench/mtrace.txt"),
            tmp.path().join("jail-2.1.0/home/playbench/mtrace.txt")
        );
    }

    #[tokio::test]
    async fn run_succeeds_on_zero_exit() {
        let tmp = TempDir::new().unwrap();
        jail(&tmp).run(&["true"], None).await.unwrap();
    }

    #[tokio::test]
    async fn run_fails_on_nonzero_exit() {
        let tmp = TempDir::new().unwrap();
        let result = jail(&tmp).run(&["false"], None).await;
        assert!(matches!(result, Err(Error::CommandExecution(_))));
    }

    #[tokio::test]
    async fn run_captures_output_to_log() {
        let tmp = TempDir::new().unwrap();
        let jail = jail(&tmp);
        jail.run(&["sh", "-c", "echo captured"], Some("echo.log"))
            .await
            .unwrap();

        let logged = std::fs::read_to_string(jail.log_dir().join("echo.log")).unwrap();
        assert_eq!(logged.trim(), "captured");
    }

    #[tokio::test]
    async fn failure_message_names_the_log() {
        let tmp = TempDir::new().unwrap();
        let result = jail(&tmp)
            .run(&["sh", "-c", "exit 7"], Some("failing.log"))
            .await;
        let Err(Error::CommandExecution(message)) = result else {
            panic!("expected CommandExecution");
        };
        assert!(message.contains("failing.log"));
    }

    #[tokio::test]
    async fn spawn_returns_live_handle() {
        let tmp = TempDir::new().unwrap();
        let mut child = jail(&tmp).spawn(&["sleep", "0.2"], None).unwrap();
        assert!(child.try_wait().unwrap().is_none());
        assert!(child.wait().await.unwrap().success());
    }
}
