//! In-memory remote backend for tests and local development.
//!
//! Fault switches are injected at the trait seam so the orchestration layers
//! can be exercised without a real object store.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FsError, FsResult};
use crate::models::{Entry, EntryKind, TierKind};
use crate::remote::client::RemoteBackend;
use crate::util::{norm_path, parent_of};

#[derive(Clone)]
struct MemObject {
    data: Bytes,
    mtime: SystemTime,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<String, MemObject>,
    unavailable: bool,
    quota_exceeded: bool,
    fail_next_writes: u32,
    fail_next_lists: u32,
}

#[derive(Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing the fault switches.
    pub async fn seed(&self, path: &str, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.objects.insert(
            norm_path(path),
            MemObject {
                data: Bytes::copy_from_slice(data),
                mtime: SystemTime::now(),
            },
        );
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .contains_key(&norm_path(path))
    }

    /// Pin an object's mtime; precedence tests need deterministic ordering.
    pub fn set_mtime(&self, path: &str, mtime: SystemTime) {
        let mut st = self.state.lock().unwrap();
        if let Some(obj) = st.objects.get_mut(&norm_path(path)) {
            obj.mtime = mtime;
        }
    }

    pub fn set_unavailable(&self, v: bool) {
        self.state.lock().unwrap().unavailable = v;
    }

    pub fn set_quota_exceeded(&self, v: bool) {
        self.state.lock().unwrap().quota_exceeded = v;
    }

    /// The next `n` write calls fail with `RemoteUnavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().unwrap().fail_next_writes = n;
    }

    /// The next `n` list calls fail with `RemoteUnavailable`.
    pub fn fail_next_lists(&self, n: u32) {
        self.state.lock().unwrap().fail_next_lists = n;
    }

    fn check_available(st: &MemState) -> FsResult<()> {
        if st.unavailable {
            return Err(FsError::RemoteUnavailable("backend offline".into()));
        }
        Ok(())
    }

    fn entry_for(path: &str, obj: &MemObject) -> Entry {
        Entry {
            path: path.to_string(),
            kind: EntryKind::File,
            size: obj.data.len() as u64,
            mtime: obj.mtime,
            tier: TierKind::RemoteOnly,
        }
    }

    fn dir_entry(path: String) -> Entry {
        Entry {
            path,
            kind: EntryKind::Dir,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            tier: TierKind::RemoteOnly,
        }
    }
}

#[async_trait]
impl RemoteBackend for MemBackend {
    async fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        let dir = norm_path(path);
        let mut st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        if st.fail_next_lists > 0 {
            st.fail_next_lists -= 1;
            return Err(FsError::RemoteUnavailable("injected list failure".into()));
        }
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            format!("{dir}/")
        };
        let mut out = Vec::new();
        let mut seen_dirs = std::collections::BTreeSet::new();
        for (key, obj) in st.objects.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                None => out.push(Self::entry_for(key, obj)),
                Some(n) => {
                    let sub = format!("{prefix}{}", &rest[..n]);
                    if seen_dirs.insert(sub.clone()) {
                        out.push(Self::dir_entry(sub));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        let path = norm_path(path);
        let st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        let obj = st
            .objects
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        let start = (offset as usize).min(obj.data.len());
        let end = start.saturating_add(len).min(obj.data.len());
        Ok(obj.data.slice(start..end))
    }

    async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry> {
        let path = norm_path(path);
        let mut st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        if st.quota_exceeded {
            return Err(FsError::QuotaExceeded("provider throttled".into()));
        }
        if st.fail_next_writes > 0 {
            st.fail_next_writes -= 1;
            return Err(FsError::RemoteUnavailable("injected write failure".into()));
        }
        let obj = MemObject {
            data: Bytes::copy_from_slice(data),
            mtime: SystemTime::now(),
        };
        let entry = Self::entry_for(&path, &obj);
        st.objects.insert(path, obj);
        Ok(entry)
    }

    async fn rename(&self, path: &str, new_path: &str) -> FsResult<Entry> {
        let path = norm_path(path);
        let new_path = norm_path(new_path);
        let mut st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        let obj = st
            .objects
            .remove(&path)
            .ok_or_else(|| FsError::NotFound(path))?;
        let entry = Self::entry_for(&new_path, &obj);
        st.objects.insert(new_path, obj);
        Ok(entry)
    }

    async fn delete(&self, path: &str) -> FsResult<()> {
        let path = norm_path(path);
        let mut st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        st.objects
            .remove(&path)
            .map(|_| ())
            .ok_or(FsError::NotFound(path))
    }

    async fn stat(&self, path: &str) -> FsResult<Option<Entry>> {
        let path = norm_path(path);
        let st = self.state.lock().unwrap();
        Self::check_available(&st)?;
        if let Some(obj) = st.objects.get(&path) {
            return Ok(Some(Self::entry_for(&path, obj)));
        }
        // Directories are implicit: any deeper key makes the prefix a dir.
        let prefix = if path == "/" {
            String::from("/")
        } else {
            format!("{path}/")
        };
        let is_dir = st
            .objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix));
        if is_dir || path == "/" {
            Ok(Some(Self::dir_entry(path)))
        } else {
            Ok(None)
        }
    }
}
