//! Per-tier mount lifecycle.
//!
//! Each tier owns a [`MountHandle`] whose state walks
//! `Unmounted -> Mounting -> Ready -> Failed` and is observable through a
//! watch channel instead of polling a side channel.

use std::path::{Path, PathBuf};

use tokio::sync::watch;

use crate::error::{FsError, FsResult};
use crate::models::MountState;

pub struct MountHandle {
    name: String,
    mount_point: PathBuf,
    tx: watch::Sender<MountState>,
}

impl MountHandle {
    pub fn new(name: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(MountState::Unmounted);
        Self {
            name: name.into(),
            mount_point: mount_point.into(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Current state snapshot.
    pub fn state(&self) -> MountState {
        self.tx.borrow().clone()
    }

    /// Watch state transitions without polling.
    pub fn subscribe(&self) -> watch::Receiver<MountState> {
        self.tx.subscribe()
    }

    pub fn set_mounting(&self) {
        self.tx.send_replace(MountState::Mounting);
    }

    pub fn set_ready(&self) {
        self.tx.send_replace(MountState::Ready);
    }

    pub fn set_failed(&self, reason: impl Into<String>) {
        self.tx.send_replace(MountState::Failed(reason.into()));
    }

    /// Shutdown transition; the handle can be re-mounted afterwards.
    pub fn teardown(&self) {
        self.tx.send_replace(MountState::Unmounted);
    }

    /// Gate used by the union view before any operation.
    pub fn ensure_ready(&self) -> FsResult<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(FsError::NotReady(format!(
                "{} ({}): {:?}",
                self.name,
                self.mount_point.display(),
                state
            )))
        }
    }
}
