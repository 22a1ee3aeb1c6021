//! Local tier: a thin wrapper over a directory tree. Writes are durable
//! before returning and are rejected when they would push free space under
//! the configured floor.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{FsError, FsResult};
use crate::models::{Entry, EntryKind, TierKind};
use crate::util::{join, norm_path};

/// Reports free bytes for the filesystem holding the tier root. Injectable
/// so tests can pin a value instead of depending on the host disk.
pub type FreeProbe = Box<dyn Fn(&Path) -> std::io::Result<u64> + Send + Sync>;

fn statvfs_free(path: &Path) -> std::io::Result<u64> {
    let st = nix::sys::statvfs::statvfs(path)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(st.blocks_available() as u64 * st.fragment_size() as u64)
}

pub struct LocalTier {
    root: PathBuf,
    min_free: u64,
    free_probe: FreeProbe,
}

impl LocalTier {
    pub fn new<P: AsRef<Path>>(root: P, min_free: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            min_free,
            free_probe: Box::new(statvfs_free),
        }
    }

    /// Test constructor with a pinned free-space probe.
    pub fn with_free_probe<P: AsRef<Path>>(root: P, min_free: u64, probe: FreeProbe) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            min_free,
            free_probe: probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn min_free(&self) -> u64 {
        self.min_free
    }

    pub fn free_space(&self) -> std::io::Result<u64> {
        (self.free_probe)(&self.root)
    }

    fn abs(&self, path: &str) -> PathBuf {
        let p = norm_path(path);
        self.root.join(p.trim_start_matches('/'))
    }

    fn entry_from_meta(path: String, meta: &std::fs::Metadata) -> FsResult<Entry> {
        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        Ok(Entry {
            path,
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mtime: meta.modified()?,
            tier: TierKind::LocalOnly,
        })
    }

    pub async fn stat(&self, path: &str) -> FsResult<Option<Entry>> {
        match fs::metadata(self.abs(path)).await {
            Ok(meta) => Self::entry_from_meta(norm_path(path), &meta).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ranged read; reading past EOF returns the available prefix.
    pub async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        let mut file = match fs::File::open(self.abs(path)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(norm_path(path)));
            }
            Err(e) => return Err(e.into()),
        };
        if len == 0 {
            return Ok(Bytes::new());
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    /// Durable write: parents are created, contents synced before returning.
    /// The tree is untouched when the free-space floor would be crossed.
    pub async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry> {
        let free = self.free_space()?;
        let needed = data.len() as u64;
        if free.saturating_sub(needed) < self.min_free {
            return Err(FsError::InsufficientSpace {
                needed,
                free,
                floor: self.min_free,
            });
        }
        let abs = self.abs(path);
        if let Some(dir) = abs.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(&abs).await?;
        f.write_all(data).await?;
        f.sync_all().await?;
        let meta = f.metadata().await?;
        Self::entry_from_meta(norm_path(path), &meta)
    }

    pub async fn delete(&self, path: &str) -> FsResult<()> {
        match fs::remove_file(self.abs(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound(norm_path(path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mkdir_p(&self, path: &str) -> FsResult<()> {
        fs::create_dir_all(self.abs(path)).await?;
        Ok(())
    }

    /// Remove an empty directory. The tier root itself is never removed.
    pub async fn remove_dir(&self, path: &str) -> FsResult<()> {
        let path = norm_path(path);
        if path == "/" {
            return Err(FsError::DirectoryNotEmpty("/".into()));
        }
        match fs::remove_dir(self.abs(&path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FsError::NotFound(path)),
            Err(e) if e.raw_os_error() == Some(nix::libc::ENOTEMPTY) => {
                Err(FsError::DirectoryNotEmpty(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let from = self.abs(old);
        let to = self.abs(new);
        if fs::metadata(&from).await.is_err() {
            return Err(FsError::NotFound(norm_path(old)));
        }
        if let Some(dir) = to.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(from, to).await?;
        Ok(())
    }

    pub async fn list_dir(&self, path: &str) -> FsResult<Vec<Entry>> {
        let dir = norm_path(path);
        let abs = self.abs(&dir);
        let meta = match fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(dir));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(dir));
        }
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&abs).await?;
        while let Some(ent) = rd.next_entry().await? {
            let name = ent.file_name().to_string_lossy().into_owned();
            let meta = ent.metadata().await?;
            out.push(Self::entry_from_meta(join(&dir, &name), &meta)?);
        }
        Ok(out)
    }

    /// Recursive walk collecting every file under the tier root.
    pub async fn scan_files(&self) -> FsResult<Vec<Entry>> {
        let mut files = Vec::new();
        let mut stack = vec![String::from("/")];
        while let Some(dir) = stack.pop() {
            for entry in self.list_dir(&dir).await? {
                match entry.kind {
                    EntryKind::Dir => stack.push(entry.path.clone()),
                    EntryKind::File => files.push(entry),
                }
            }
        }
        Ok(files)
    }

    /// Every directory under the root, deepest first, for bottom-up pruning.
    pub async fn dirs_bottom_up(&self) -> FsResult<Vec<String>> {
        let mut dirs = Vec::new();
        let mut stack = vec![String::from("/")];
        while let Some(dir) = stack.pop() {
            for entry in self.list_dir(&dir).await? {
                if entry.kind == EntryKind::Dir {
                    stack.push(entry.path.clone());
                    dirs.push(entry.path);
                }
            }
        }
        dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(tmp: &tempfile::TempDir) -> LocalTier {
        LocalTier::new(tmp.path(), 0)
    }

    #[tokio::test]
    async fn write_read_stat_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tier(&tmp);

        let entry = t.write("/a/b/hello.txt", b"hello world").await.unwrap();
        assert_eq!(entry.path, "/a/b/hello.txt");
        assert_eq!(entry.size, 11);
        assert_eq!(entry.kind, EntryKind::File);

        let out = t.read("/a/b/hello.txt", 0, 11).await.unwrap();
        assert_eq!(&out[..], b"hello world");
        let mid = t.read("/a/b/hello.txt", 6, 100).await.unwrap();
        assert_eq!(&mid[..], b"world");

        assert!(t.stat("/a/b/hello.txt").await.unwrap().is_some());
        t.delete("/a/b/hello.txt").await.unwrap();
        assert!(t.stat("/a/b/hello.txt").await.unwrap().is_none());
        assert!(matches!(
            t.delete("/a/b/hello.txt").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn free_space_floor_rejects_write_and_leaves_tree_unchanged() {
        const GIB: u64 = 1024 * 1024 * 1024;
        let tmp = tempfile::tempdir().unwrap();
        let t = LocalTier::with_free_probe(tmp.path(), 10 * GIB, Box::new(|_| Ok(5 * GIB)));

        let err = t.write("/data/x.bin", b"payload").await.unwrap_err();
        match err {
            FsError::InsufficientSpace { free, floor, .. } => {
                assert_eq!(free, 5 * GIB);
                assert_eq!(floor, 10 * GIB);
            }
            other => panic!("expected InsufficientSpace, got {other:?}"),
        }
        // Parent dir must not have been created by the rejected write.
        assert!(t.stat("/data").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_and_prune_helpers() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tier(&tmp);
        t.write("/a/one.txt", b"1").await.unwrap();
        t.write("/a/b/two.txt", b"22").await.unwrap();
        t.mkdir_p("/a/b/empty").await.unwrap();

        let files = t.scan_files().await.unwrap();
        let mut paths: Vec<_> = files.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/a/b/two.txt", "/a/one.txt"]);

        let dirs = t.dirs_bottom_up().await.unwrap();
        // Deepest first so empty leaves go before their parents.
        assert_eq!(dirs[0], "/a/b/empty");

        t.remove_dir("/a/b/empty").await.unwrap();
        assert!(matches!(
            t.remove_dir("/a/b").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
        // The tier root is never removable.
        assert!(matches!(
            t.remove_dir("/").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn list_dir_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let t = tier(&tmp);
        t.write("/f.txt", b"x").await.unwrap();
        assert!(matches!(
            t.list_dir("/missing").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            t.list_dir("/f.txt").await,
            Err(FsError::NotADirectory(_))
        ));
    }
}
