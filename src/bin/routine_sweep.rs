#![forbid(unsafe_code)]

//! One-shot maintenance job meant for cron: runs an availability sweep over
//! the stored YouTube links, then fills in missing titles.

use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use studybeats_tools::{
    app::{Services, init_tracing},
    config::{RuntimeOverrides, RuntimeSettings, resolve_settings},
    security::ensure_not_root,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct RoutineArgs {
    settings: RuntimeSettings,
    skip_backfill: bool,
}

impl RoutineArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut skip_backfill = false;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                overrides.data_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    overrides.data_root = Some(PathBuf::from(value));
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                "--skip-backfill" => skip_backfill = true,
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self {
            settings: resolve_settings(overrides)?,
            skip_backfill,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    ensure_not_root("routine_sweep")?;

    let RoutineArgs {
        settings,
        skip_backfill,
    } = RoutineArgs::parse()?;
    info!("data root: {}", settings.data_root.display());

    let services = Services::open(&settings)
        .await
        .context("initializing services")?;
    let removed = services.metadata.cleanup();
    if removed > 0 {
        info!("dropped {removed} expired metadata entries");
    }

    let sweep = services
        .sweeper
        .sweep()
        .await
        .context("running availability sweep")?;
    info!(
        "sweep: {} checked, {} removed, {} deferred, {} errors",
        sweep.checked, sweep.removed, sweep.deferred, sweep.errors
    );

    if skip_backfill {
        return Ok(());
    }
    if settings.youtube_api_key.is_none() {
        warn!("YOUTUBE_API_KEY not set; YouTube titles cannot be backfilled");
    }
    services
        .backfill
        .run()
        .await
        .context("running title backfill")?;

    Ok(())
}
