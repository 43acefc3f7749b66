//! playbench-core: builds media player versions from source inside chroot
//! jails, plays a reference media file in each, and records resource
//! consumption for later comparison.
//!
//! # Architecture
//!
//! ```text
//! build_all ─▶ Builder (per version) ─▶ Jail exec ─▶ Store (build state)
//! compare ──▶ Sampler (per version) ─▶ Jail exec + procinfo ─▶ Store (samples/overview)
//! ```
//!
//! # Modules
//!
//! - `config`: YAML configuration (versions table, paths, cadence)
//! - `jail`: chroot jail bootstrap and the uniform command-execution contract
//! - `build`: resumable build state machine and the bounded worker pool
//! - `procinfo`: per-PID CPU/memory/thread sampling
//! - `sampler`: playback launch and the per-interval polling loop
//! - `mtrace`: leak-trace artifact parsing
//! - `compare`: comparison run coordination
//! - `store`: SQLite persistence read by the external dashboard
//! - `logging`: tracing subscriber setup
//! - `error`: crate-wide error type
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod build;
pub mod compare;
pub mod config;
pub mod error;
pub mod jail;
pub mod logging;
pub mod mtrace;
pub mod procinfo;
pub mod sampler;
pub mod store;

pub use build::{BuildState, Builder, build_all};
pub use compare::compare;
pub use config::Config;
pub use error::{Error, Result};
pub use jail::Jail;
pub use sampler::{JailPlayer, PlayerLauncher, Sampler};
pub use store::{SharedStore, Store};
