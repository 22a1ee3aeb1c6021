//! Union view: one namespace over a read-write local tier and a read-only
//! remote tier.
//!
//! Precedence follows the configured [`AttrPolicy`]; every path resolves to
//! exactly one authoritative tier at a time. All writes land in the local
//! tier, gated by its free-space floor. Operations are refused until both
//! tiers report ready.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::error::{FsError, FsResult};
use crate::local::LocalTier;
use crate::models::{AttrPolicy, Entry, EntryKind, TierKind};
use crate::mount::MountHandle;
use crate::remote::{RemoteBackend, RemoteClient};
use crate::util::norm_path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Winner {
    Local,
    Remote,
}

pub struct UnionView<B: RemoteBackend> {
    local: Arc<LocalTier>,
    remote: Arc<RemoteClient<B>>,
    policy: AttrPolicy,
    local_mount: Arc<MountHandle>,
    remote_mount: Arc<MountHandle>,
}

impl<B: RemoteBackend> UnionView<B> {
    pub fn new(
        local: Arc<LocalTier>,
        remote: Arc<RemoteClient<B>>,
        policy: AttrPolicy,
        local_mount: Arc<MountHandle>,
        remote_mount: Arc<MountHandle>,
    ) -> Self {
        Self {
            local,
            remote,
            policy,
            local_mount,
            remote_mount,
        }
    }

    fn ensure_ready(&self) -> FsResult<()> {
        self.local_mount.ensure_ready()?;
        self.remote_mount.ensure_ready()?;
        Ok(())
    }

    fn pick(&self, local: &Entry, remote: &Entry) -> Winner {
        match self.policy {
            AttrPolicy::LocalFirst => Winner::Local,
            // Local wins exact ties.
            AttrPolicy::Newest => {
                if local.mtime >= remote.mtime {
                    Winner::Local
                } else {
                    Winner::Remote
                }
            }
        }
    }

    /// Merge a duplicate pair into the entry served for the path.
    fn merge(&self, local: Entry, remote: Entry) -> Entry {
        let mut entry = match self.pick(&local, &remote) {
            Winner::Local => local,
            Winner::Remote => remote,
        };
        entry.tier = TierKind::Both;
        entry
    }

    async fn resolve(&self, path: &str) -> FsResult<(Option<Entry>, Option<Entry>)> {
        let local = self.local.stat(path).await?;
        let remote = self.remote.stat(path).await?;
        Ok((local, remote))
    }

    pub async fn stat(&self, path: &str) -> FsResult<Entry> {
        self.ensure_ready()?;
        let path = norm_path(path);
        match self.resolve(&path).await? {
            (None, None) => Err(FsError::NotFound(path)),
            (Some(l), None) => Ok(l),
            (None, Some(r)) => Ok(r),
            (Some(l), Some(r)) => Ok(self.merge(l, r)),
        }
    }

    /// Merged listing; duplicate names collapse to the winning tier's entry.
    pub async fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        self.ensure_ready()?;
        let dir = norm_path(path);
        let local = match self.local.list_dir(&dir).await {
            Ok(entries) => Some(entries),
            Err(FsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let remote = self.remote.list(&dir).await?;

        if local.is_none() && remote.is_empty() && dir != "/" {
            // Neither tier knows the directory.
            match self.remote.stat(&dir).await? {
                Some(e) if e.kind == EntryKind::Dir => {}
                _ => return Err(FsError::NotFound(dir)),
            }
        }

        let mut merged: BTreeMap<String, Entry> = BTreeMap::new();
        for entry in remote {
            merged.insert(entry.name().to_string(), entry);
        }
        for entry in local.unwrap_or_default() {
            let name = entry.name().to_string();
            match merged.remove(&name) {
                Some(remote_entry) => {
                    merged.insert(name, self.merge(entry, remote_entry));
                }
                None => {
                    merged.insert(name, entry);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        self.ensure_ready()?;
        let path = norm_path(path);
        let winner = match self.resolve(&path).await? {
            (None, None) => return Err(FsError::NotFound(path)),
            (Some(l), None) => {
                if l.kind == EntryKind::Dir {
                    return Err(FsError::Io(std::io::Error::other(format!(
                        "is a directory: {path}"
                    ))));
                }
                Winner::Local
            }
            (None, Some(_)) => Winner::Remote,
            (Some(l), Some(r)) => self.pick(&l, &r),
        };
        match winner {
            Winner::Local => self.local.read(&path, offset, len).await,
            Winner::Remote => self.remote.read(&path, offset, len).await,
        }
    }

    /// All writes land in the local tier; the remote tier is never written
    /// through the union view. The local free-space floor applies even when
    /// the remote tier has room.
    pub async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry> {
        self.ensure_ready()?;
        self.local.write(&norm_path(path), data).await
    }

    pub async fn mkdir_p(&self, path: &str) -> FsResult<()> {
        self.ensure_ready()?;
        self.local.mkdir_p(&norm_path(path)).await
    }

    /// Delete the local copy. A remote-only path cannot be deleted here.
    pub async fn delete(&self, path: &str) -> FsResult<()> {
        self.ensure_ready()?;
        let path = norm_path(path);
        match self.resolve(&path).await? {
            (None, None) => Err(FsError::NotFound(path)),
            (None, Some(_)) => Err(FsError::RemoteReadOnly(path)),
            (Some(_), remote) => {
                if remote.is_some() {
                    warn!("{path}: deleting local shadow, remote copy stays visible");
                }
                self.local.delete(&path).await
            }
        }
    }

    /// Rename within the authoritative tier. Endpoints resolving in
    /// different tiers are unsupported.
    pub async fn rename(&self, old: &str, new: &str) -> FsResult<Entry> {
        self.ensure_ready()?;
        let old = norm_path(old);
        let new = norm_path(new);
        let cross = || FsError::CrossTierRenameUnsupported {
            from: old.clone(),
            to: new.clone(),
        };
        match self.resolve(&old).await? {
            (None, None) => Err(FsError::NotFound(old.clone())),
            (Some(l), r) => {
                if let Some(r) = r {
                    if self.pick(&l, &r) == Winner::Remote {
                        // Authoritative copy lives remotely; moving the
                        // stale local shadow would change what is served.
                        return Err(cross());
                    }
                    warn!("{old}: renaming local shadow, remote copy stays visible");
                }
                self.local.rename(&old, &new).await?;
                self.local
                    .stat(&new)
                    .await?
                    .ok_or(FsError::NotFound(new))
            }
            (None, Some(_)) => {
                if self.local.stat(&new).await?.is_some() {
                    return Err(cross());
                }
                self.remote.rename(&old, &new).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MountState;
    use crate::remote::RemoteTuning;
    use crate::remote::memfs::MemBackend;
    use std::time::{Duration, SystemTime};

    struct Fixture {
        _tmp: tempfile::TempDir,
        union: UnionView<MemBackend>,
        local: Arc<LocalTier>,
        remote: Arc<RemoteClient<MemBackend>>,
        local_mount: Arc<MountHandle>,
    }

    fn fixture() -> Fixture {
        fixture_with(AttrPolicy::Newest, 0)
    }

    fn fixture_with(policy: AttrPolicy, min_free: u64) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let local = if min_free > 0 {
            const GIB: u64 = 1024 * 1024 * 1024;
            Arc::new(LocalTier::with_free_probe(
                tmp.path(),
                min_free,
                Box::new(|_| Ok(5 * GIB)),
            ))
        } else {
            Arc::new(LocalTier::new(tmp.path(), 0))
        };
        let remote = Arc::new(RemoteClient::new(
            MemBackend::new(),
            RemoteTuning {
                cache_mode: crate::remote::CacheMode::Off,
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
            policy,
            local_mount.clone(),
            remote_mount,
        );
        Fixture {
            _tmp: tmp,
            union,
            local,
            remote,
            local_mount,
        }
    }

    fn backend(f: &Fixture) -> &MemBackend {
        // RemoteClient in these tests runs with caching off, so poking the
        // backend directly is immediately visible through the client.
        f.remote.backend()
    }

    #[tokio::test]
    async fn refuses_everything_until_both_tiers_ready() {
        let f = fixture();
        f.local_mount.set_mounting();
        assert!(matches!(
            f.union.stat("/x").await,
            Err(FsError::NotReady(_))
        ));
        assert!(matches!(
            f.union.write("/x", b"x").await,
            Err(FsError::NotReady(_))
        ));
        f.local_mount.set_ready();
        assert!(matches!(
            f.union.stat("/x").await,
            Err(FsError::NotFound(_))
        ));
        assert_eq!(f.local_mount.state(), MountState::Ready);
    }

    #[tokio::test]
    async fn writes_route_to_local_only() {
        let f = fixture();
        f.union.write("/new.txt", b"local bytes").await.unwrap();
        assert!(f.local.stat("/new.txt").await.unwrap().is_some());
        assert!(!backend(&f).contains("/new.txt").await);

        let data = f.union.read("/new.txt", 0, 64).await.unwrap();
        assert_eq!(&data[..], b"local bytes");
    }

    #[tokio::test]
    async fn newest_policy_serves_the_fresher_tier() {
        let f = fixture();
        f.union.write("/doc.txt", b"local version").await.unwrap();
        backend(&f).seed("/doc.txt", b"remote version!").await;

        // Remote pinned older than the local copy: local wins.
        backend(&f).set_mtime("/doc.txt", SystemTime::now() - Duration::from_secs(3600));
        let entry = f.union.stat("/doc.txt").await.unwrap();
        assert_eq!(entry.tier, TierKind::Both);
        assert_eq!(entry.size, 13);
        let data = f.union.read("/doc.txt", 0, 64).await.unwrap();
        assert_eq!(&data[..], b"local version");

        // Remote pinned newer: remote wins.
        backend(&f).set_mtime("/doc.txt", SystemTime::now() + Duration::from_secs(3600));
        let entry = f.union.stat("/doc.txt").await.unwrap();
        assert_eq!(entry.size, 15);
        let data = f.union.read("/doc.txt", 0, 64).await.unwrap();
        assert_eq!(&data[..], b"remote version!");
    }

    #[tokio::test]
    async fn local_first_policy_ignores_mtime() {
        let f = fixture_with(AttrPolicy::LocalFirst, 0);
        f.union.write("/doc.txt", b"local").await.unwrap();
        backend(&f).seed("/doc.txt", b"remote-longer").await;
        backend(&f).set_mtime("/doc.txt", SystemTime::now() + Duration::from_secs(3600));

        let data = f.union.read("/doc.txt", 0, 64).await.unwrap();
        assert_eq!(&data[..], b"local");
    }

    #[tokio::test]
    async fn listing_merges_both_tiers() {
        let f = fixture();
        backend(&f).seed("/dir/remote.txt", b"r").await;
        f.union.write("/dir/local.txt", b"l").await.unwrap();

        let names: Vec<String> = f
            .union
            .list("/dir")
            .await
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["local.txt", "remote.txt"]);

        assert!(matches!(
            f.union.list("/nope").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn free_space_floor_guards_union_writes() {
        const GIB: u64 = 1024 * 1024 * 1024;
        let f = fixture_with(AttrPolicy::Newest, 10 * GIB);
        let err = f.union.write("/big.bin", b"data").await.unwrap_err();
        assert!(matches!(err, FsError::InsufficientSpace { .. }));
        assert!(f.local.stat("/big.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_routing() {
        let f = fixture();
        backend(&f).seed("/remote-only.txt", b"r").await;
        assert!(matches!(
            f.union.delete("/remote-only.txt").await,
            Err(FsError::RemoteReadOnly(_))
        ));

        f.union.write("/local.txt", b"l").await.unwrap();
        f.union.delete("/local.txt").await.unwrap();
        assert!(matches!(
            f.union.stat("/local.txt").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_same_tier_and_cross_tier() {
        let f = fixture();
        // Local -> local.
        f.union.write("/a.txt", b"a").await.unwrap();
        let entry = f.union.rename("/a.txt", "/sub/b.txt").await.unwrap();
        assert_eq!(entry.path, "/sub/b.txt");
        assert!(f.local.stat("/a.txt").await.unwrap().is_none());

        // Remote -> remote.
        backend(&f).seed("/r1.txt", b"r").await;
        f.union.rename("/r1.txt", "/r2.txt").await.unwrap();
        assert!(backend(&f).contains("/r2.txt").await);

        // Remote source with a local destination is cross-tier.
        backend(&f).seed("/r3.txt", b"r").await;
        f.union.write("/taken.txt", b"t").await.unwrap();
        assert!(matches!(
            f.union.rename("/r3.txt", "/taken.txt").await,
            Err(FsError::CrossTierRenameUnsupported { .. })
        ));
    }
}
