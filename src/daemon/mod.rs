//! Daemon orchestration: startup validation that fails fast before serving,
//! tier bring-up through observable mount handles, background loops (cache
//! poller, cron scheduler, remote health probe) and signal-driven shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, RemoteCredentials};
use crate::local::LocalTier;
use crate::models::CycleReport;
use crate::mount::MountHandle;
use crate::remote::RemoteClient;
use crate::remote::s3::{S3Backend, S3Options};
use crate::sched::MigrationScheduler;
use crate::union::UnionView;

struct Tiers {
    local: Arc<LocalTier>,
    remote: Arc<RemoteClient<S3Backend>>,
    local_mount: Arc<MountHandle>,
    remote_mount: Arc<MountHandle>,
}

/// Validate configuration against the world and bring both tiers to
/// `Ready`. Any failure here aborts the process before the serve loop.
async fn bring_up(cfg: &Config) -> anyhow::Result<Tiers> {
    let local_mount = Arc::new(MountHandle::new("local", cfg.local_path.clone()));
    local_mount.set_mounting();
    tokio::fs::create_dir_all(&cfg.local_path)
        .await
        .with_context(|| format!("create local tier root {}", cfg.local_path.display()))?;
    let local = Arc::new(LocalTier::new(&cfg.local_path, cfg.min_free_space));
    let free = local.free_space().context("probe local free space")?;
    info!(
        "local tier {}: {free} bytes free, floor {}",
        cfg.local_path.display(),
        cfg.min_free_space
    );
    local_mount.set_ready();

    let remote_mount = Arc::new(MountHandle::new("remote", PathBuf::from(&cfg.remote)));
    remote_mount.set_mounting();
    let creds_path = cfg
        .remote_config
        .as_ref()
        .context("TIERFS_REMOTE_CONFIG is required to reach the remote")?;
    let creds = RemoteCredentials::load(creds_path)?;
    let backend = S3Backend::new(
        cfg.remote.clone(),
        cfg.remote_path.clone(),
        S3Options {
            endpoint: creds.endpoint.clone(),
            region: creds.region.clone(),
            access_key_id: creds.access_key_id.clone(),
            secret_access_key: creds.secret_access_key.clone(),
            ..S3Options::default()
        },
    )
    .await?;
    let remote = Arc::new(RemoteClient::new(backend, cfg.remote_tuning()));
    remote
        .probe()
        .await
        .with_context(|| format!("remote {} unreachable", cfg.remote))?;
    info!("remote tier {} reachable", cfg.remote);
    remote_mount.set_ready();

    Ok(Tiers {
        local,
        remote,
        local_mount,
        remote_mount,
    })
}

/// Periodic remote probe keeping the mount handle's health current.
async fn health_loop(
    remote: Arc<RemoteClient<S3Backend>>,
    mount: Arc<MountHandle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(remote.tuning().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match remote.probe().await {
                    Ok(()) => {
                        if !mount.state().is_ready() {
                            info!("remote tier recovered");
                            mount.set_ready();
                        }
                    }
                    Err(e) => {
                        warn!("remote tier health probe failed: {e}");
                        mount.set_failed(e.to_string());
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Long-lived foreground process for the external supervisor.
pub async fn serve(cfg: Config) -> anyhow::Result<()> {
    let tiers = bring_up(&cfg).await?;
    let union = UnionView::new(
        tiers.local.clone(),
        tiers.remote.clone(),
        cfg.attr_policy,
        tiers.local_mount.clone(),
        tiers.remote_mount.clone(),
    );
    let entries = union.list("/").await?;
    info!(
        "merged namespace {}: {} top-level entries, schedule {}",
        cfg.mount_path.display(),
        entries.len(),
        cfg.schedule
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(tiers.remote.clone().run_poller(shutdown_rx.clone()));
    let sched = Arc::new(MigrationScheduler::new(
        tiers.local.clone(),
        tiers.remote.clone(),
        cfg.migrate_config(),
    ));
    let sched_loop = tokio::spawn(sched.clone().run(shutdown_rx.clone()));
    let health = tokio::spawn(health_loop(
        tiers.remote.clone(),
        tiers.remote_mount.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown signal received");
    sched.cancel();
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(poller, sched_loop, health);
    tiers.remote_mount.teardown();
    tiers.local_mount.teardown();
    Ok(())
}

/// Run one migration cycle immediately and report it.
pub async fn migrate_once(cfg: Config) -> anyhow::Result<CycleReport> {
    let tiers = bring_up(&cfg).await?;
    let sched = MigrationScheduler::new(tiers.local, tiers.remote, cfg.migrate_config());
    match sched.trigger().await {
        Some(result) => Ok(result?),
        // A fresh scheduler has no concurrent cycle to queue behind.
        None => anyhow::bail!("migration cycle unexpectedly queued"),
    }
}

/// Validate configuration and remote reachability, then exit.
pub async fn check(cfg: Config) -> anyhow::Result<()> {
    let tiers = bring_up(&cfg).await?;
    tiers.remote_mount.teardown();
    tiers.local_mount.teardown();
    info!("configuration ok; both tiers reachable");
    Ok(())
}
