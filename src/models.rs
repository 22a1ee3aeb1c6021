//! Shared data model for tiers, the union namespace and the migration job.

use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    File,
    Dir,
}

/// Which tier(s) a path currently resolves to. `Both` means a local copy
/// shadows a remote one; precedence decides which metadata is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierKind {
    LocalOnly,
    RemoteOnly,
    Both,
}

/// One visible namespace entry. `path` is always normalized (leading `/`,
/// no empty segments).
#[derive(Clone, Debug)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub tier: TierKind,
}

impl Entry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Tie-break policy for paths present in both tiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttrPolicy {
    /// Higher mtime wins; the local entry wins exact ties.
    #[default]
    Newest,
    /// The local entry always wins when present.
    LocalFirst,
}

impl std::str::FromStr for AttrPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(AttrPolicy::Newest),
            "local-first" => Ok(AttrPolicy::LocalFirst),
            other => Err(format!("unknown attr policy {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One unit of migration work: move `source` from the local tier to the
/// remote tier under the same logical path.
#[derive(Clone, Debug)]
pub struct TransferTask {
    pub source: String,
    pub dest: String,
    pub state: TransferState,
    pub attempts: u32,
}

impl TransferTask {
    pub fn new(path: &str) -> Self {
        Self {
            source: path.to_string(),
            dest: path.to_string(),
            state: TransferState::Pending,
            attempts: 0,
        }
    }
}

/// Observable lifecycle of a mounted tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Ready,
    Failed(String),
}

impl MountState {
    pub fn is_ready(&self) -> bool {
        matches!(self, MountState::Ready)
    }
}

/// Phases of one migration cycle. A new trigger arriving in `Scanning` or
/// later is queued, never interleaved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Scanning,
    Transferring,
    Pruning,
}

/// Counters for one settled migration cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Files seen by the scan (before quiescence filtering).
    pub scanned: usize,
    /// Files uploaded and removed locally.
    pub transferred: usize,
    /// Files already confirmed present remotely; local copy removed.
    pub skipped: usize,
    /// Files left in place after exhausting retries.
    pub failed: usize,
    /// Empty directories pruned after the tasks settled.
    pub pruned_dirs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_name_is_last_segment() {
        let e = Entry {
            path: "/a/b/c.txt".into(),
            kind: EntryKind::File,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            tier: TierKind::LocalOnly,
        };
        assert_eq!(e.name(), "c.txt");
    }

    #[test]
    fn attr_policy_parses() {
        assert_eq!("newest".parse::<AttrPolicy>().unwrap(), AttrPolicy::Newest);
        assert_eq!(
            "local-first".parse::<AttrPolicy>().unwrap(),
            AttrPolicy::LocalFirst
        );
        assert!("oldest".parse::<AttrPolicy>().is_err());
    }
}
