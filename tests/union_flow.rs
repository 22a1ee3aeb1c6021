//! End-to-end flow over the union view and the migration scheduler, with
//! the in-memory backend standing in for the remote object store.

use std::sync::Arc;
use std::time::Duration;

use tierfs::local::LocalTier;
use tierfs::models::{AttrPolicy, EntryKind, TierKind};
use tierfs::mount::MountHandle;
use tierfs::remote::memfs::MemBackend;
use tierfs::remote::{CacheMode, RemoteClient, RemoteTuning};
use tierfs::sched::{MigrateConfig, MigrationScheduler};
use tierfs::union::UnionView;

struct Harness {
    _tmp: tempfile::TempDir,
    local: Arc<LocalTier>,
    remote: Arc<RemoteClient<MemBackend>>,
    union: UnionView<MemBackend>,
    sched: MigrationScheduler<MemBackend>,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let local = Arc::new(LocalTier::new(tmp.path(), 0));
    let remote = Arc::new(RemoteClient::new(
        MemBackend::new(),
        RemoteTuning {
            cache_mode: CacheMode::Off,
            max_retries: 0,
            initial_retry_delay_ms: 1,
            ..RemoteTuning::default()
        },
    ));
    let local_mount = Arc::new(MountHandle::new("local", tmp.path()));
    let remote_mount = Arc::new(MountHandle::new("remote", "/remote"));
    local_mount.set_ready();
    remote_mount.set_ready();
    let union = UnionView::new(
        local.clone(),
        remote.clone(),
        AttrPolicy::Newest,
        local_mount,
        remote_mount,
    );
    let sched = MigrationScheduler::new(
        local.clone(),
        remote.clone(),
        MigrateConfig {
            quiescence: Duration::ZERO,
            initial_backoff_ms: 1,
            ..MigrateConfig::default()
        },
    );
    Harness {
        _tmp: tmp,
        local,
        remote,
        union,
        sched,
    }
}

#[tokio::test]
async fn seeded_remote_local_write_and_migration_roundtrip() {
    let h = harness();
    h.remote.backend().seed("/remote1.txt", b"remote file 1").await;

    // The seeded remote file is visible through the union.
    let names: Vec<String> = h
        .union
        .list("/")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(names, vec!["remote1.txt"]);

    // Writes route to the local tier only.
    h.union.write("/local1.txt", b"local file").await.unwrap();
    assert!(h.local.stat("/local1.txt").await.unwrap().is_some());
    assert!(!h.remote.backend().contains("/local1.txt").await);

    let entry = h.union.stat("/local1.txt").await.unwrap();
    assert_eq!(entry.tier, TierKind::LocalOnly);
    assert_eq!(entry.kind, EntryKind::File);
    let data = h.union.read("/local1.txt", 0, 64).await.unwrap();
    assert_eq!(&data[..], b"local file");

    // One migration cycle drains the local tier into the remote.
    let report = h.sched.trigger().await.unwrap().unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(report.failed, 0);
    assert!(h.remote.backend().contains("/local1.txt").await);
    assert!(h.local.stat("/local1.txt").await.unwrap().is_none());

    // Same content, now served from the remote tier.
    let entry = h.union.stat("/local1.txt").await.unwrap();
    assert_eq!(entry.tier, TierKind::RemoteOnly);
    let data = h.union.read("/local1.txt", 0, 64).await.unwrap();
    assert_eq!(&data[..], b"local file");

    let names: Vec<String> = h
        .union
        .list("/")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(names, vec!["local1.txt", "remote1.txt"]);
}

#[tokio::test]
async fn migration_is_idempotent_and_lossless_end_to_end() {
    let h = harness();
    h.union.write("/docs/a.txt", b"aaa").await.unwrap();
    h.union.write("/docs/b.txt", b"bbbb").await.unwrap();

    // A dead remote loses nothing.
    h.remote.backend().set_unavailable(true);
    let report = h.sched.trigger().await.unwrap().unwrap();
    assert_eq!(report.failed, 2);
    assert!(h.local.stat("/docs/a.txt").await.unwrap().is_some());
    assert!(h.local.stat("/docs/b.txt").await.unwrap().is_some());

    // With the remote back, the backlog drains and the empty dir is pruned.
    h.remote.backend().set_unavailable(false);
    let report = h.sched.trigger().await.unwrap().unwrap();
    assert_eq!(report.transferred, 2);
    assert_eq!(report.pruned_dirs, 1);

    // A further cycle with no new writes does nothing.
    let report = h.sched.trigger().await.unwrap().unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.transferred, 0);

    // Content unchanged through the whole dance.
    let data = h.union.read("/docs/b.txt", 0, 16).await.unwrap();
    assert_eq!(&data[..], b"bbbb");
}
