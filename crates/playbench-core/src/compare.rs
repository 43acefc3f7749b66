//! Comparison coordination.
//!
//! One comparison run measures playback of a single media file across
//! several built versions: create the comparison row (not ready), run one
//! sampler per version against its own jail, and flip `ready` only after
//! every sampler has finished and committed its rows. A sampler failure
//! leaves the comparison visibly incomplete; partial data is kept for
//! diagnosis, never rolled back.
//!
//! Versions are sampled one at a time. Their jails are independent, so
//! concurrent sampling would be sound, but sequential runs keep host CPU
//! interference out of the numbers being compared.

use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, info, info_span};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::jail::Jail;
use crate::sampler::{PlayerLauncher, Sampler};
use crate::store::{SharedStore, lock_store};

/// Run one comparison over `versions`, returning the comparison id once it
/// is marked ready.
pub async fn compare(
    versions: &[String],
    media: &Path,
    config: &Arc<Config>,
    store: &SharedStore,
    launcher: &dyn PlayerLauncher,
    verbose: bool,
) -> Result<i64> {
    let media_name = media
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Playback(format!("media path {} has no file name", media.display()))
        })?;

    let comparison_id = lock_store(store)?.create_comparison(&media_name)?;
    info!(comparison_id, media = %media.display(), "comparison started");

    for version in versions {
        let comparison_build_id = lock_store(store)?.create_comparison_build(comparison_id, version)?;
        let jail = Jail::new(version, &config.build_dir, verbose)?;
        let sampler = Sampler::new(
            version,
            comparison_build_id,
            jail,
            Arc::clone(store),
            media,
            config.sample_interval(),
        );

        sampler
            .run(launcher)
            .instrument(info_span!("sample", version = %version))
            .await?;
    }

    lock_store(store)?.finish_comparison(comparison_id)?;
    info!(comparison_id, "comparison ready");
    Ok(comparison_id)
}
