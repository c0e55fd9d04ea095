//! Frame source abstraction and the shared latest-frame buffer.
//!
//! Capture pipelines call [`FrameHub::publish`]; the snapshot handler and
//! every MJPEG viewer read from the same hub. Only the newest frame is kept.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camcast_protocol::{Frame, FrameId};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no frame captured within {0:?}")]
    NoFrame(Duration),
    #[error("frame source is shut down")]
    Closed,
}

/// What the snapshot and MJPEG paths need from the camera.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// One-shot capture of an encoded image.
    async fn snapshot(&self) -> Result<Bytes, SourceError>;

    /// Suspend until a frame whose id differs from `last` is available.
    /// `None` means the source is shutting down.
    async fn next_frame(&self, last: Option<FrameId>) -> Option<Frame>;

    /// Admit one more streaming viewer. `false` when at capacity or closed.
    fn register_listener(&self) -> bool;

    fn unregister_listener(&self);
}

#[derive(Debug, Clone, Default)]
struct Slot {
    frame: Option<Frame>,
    closed: bool,
}

/// Who currently wants frames. Capture pipelines idle while `total()` is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand {
    pub listeners: usize,
    pub snapshots: usize,
    pub held: bool,
    pub closed: bool,
}

impl Demand {
    pub fn total(&self) -> usize {
        self.listeners + self.snapshots + usize::from(self.held)
    }
}

pub struct FrameHub {
    slot: watch::Sender<Slot>,
    demand: watch::Sender<Demand>,
    max_listeners: usize,
    snapshot_timeout: Duration,
}

impl FrameHub {
    /// `max_listeners` of 0 admits any number of viewers.
    pub fn new(max_listeners: usize, snapshot_timeout: Duration) -> Self {
        let (slot, _) = watch::channel(Slot::default());
        let (demand, _) = watch::channel(Demand::default());
        Self {
            slot,
            demand,
            max_listeners,
            snapshot_timeout,
        }
    }

    /// Replace the current frame. Returns the id assigned to it, or `None`
    /// once the hub is closed.
    pub fn publish(&self, data: impl Into<Bytes>) -> Option<FrameId> {
        let data = data.into();
        let mut assigned = None;
        self.slot.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            let id = slot
                .frame
                .as_ref()
                .map_or(FrameId(0), |frame| frame.id.next());
            slot.frame = Some(Frame::new(id, data));
            assigned = Some(id);
            true
        });
        assigned
    }

    pub fn latest(&self) -> Option<Frame> {
        self.slot.borrow().frame.clone()
    }

    pub fn viewers(&self) -> usize {
        self.demand.borrow().listeners
    }

    /// Watch demand changes, e.g. to start capture only while someone is watching.
    pub fn demand(&self) -> watch::Receiver<Demand> {
        self.demand.subscribe()
    }

    /// Keep one unit of demand while `active` (used while WebRTC peers are connected).
    pub fn hold(&self, active: bool) {
        self.demand.send_if_modified(|d| {
            let changed = d.held != active;
            d.held = active;
            changed
        });
    }

    /// Wake every pending reader with `None` and refuse new viewers.
    pub fn close(&self) {
        self.slot.send_modify(|slot| slot.closed = true);
        self.demand.send_modify(|d| d.closed = true);
        tracing::info!("Frame hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.slot.borrow().closed
    }
}

/// Counts a pending snapshot as demand until dropped.
struct SnapshotDemand<'a>(&'a watch::Sender<Demand>);

impl<'a> SnapshotDemand<'a> {
    fn new(demand: &'a watch::Sender<Demand>) -> Self {
        demand.send_modify(|d| d.snapshots += 1);
        Self(demand)
    }
}

impl Drop for SnapshotDemand<'_> {
    fn drop(&mut self) {
        self.0
            .send_modify(|d| d.snapshots = d.snapshots.saturating_sub(1));
    }
}

#[async_trait]
impl FrameSource for FrameHub {
    async fn snapshot(&self) -> Result<Bytes, SourceError> {
        if self.is_closed() {
            return Err(SourceError::Closed);
        }
        let current = self.latest();
        let capturing = self.demand.borrow().total() > 0;
        if capturing && let Some(frame) = &current {
            return Ok(frame.data.clone());
        }

        // Capture is idle: request a fresh frame rather than serving a stale one.
        let _pending = SnapshotDemand::new(&self.demand);
        let last = current.map(|frame| frame.id);
        match tokio::time::timeout(self.snapshot_timeout, self.next_frame(last)).await {
            Ok(Some(frame)) => Ok(frame.data),
            Ok(None) => Err(SourceError::Closed),
            Err(_) => Err(SourceError::NoFrame(self.snapshot_timeout)),
        }
    }

    async fn next_frame(&self, last: Option<FrameId>) -> Option<Frame> {
        let mut rx = self.slot.subscribe();
        let slot = rx
            .wait_for(|slot| {
                slot.closed
                    || slot
                        .frame
                        .as_ref()
                        .is_some_and(|frame| frame.is_newer_than(last))
            })
            .await
            .ok()?;
        if slot.closed {
            return None;
        }
        slot.frame.clone()
    }

    fn register_listener(&self) -> bool {
        let mut admitted = false;
        self.demand.send_if_modified(|d| {
            if d.closed || (self.max_listeners != 0 && d.listeners >= self.max_listeners) {
                return false;
            }
            d.listeners += 1;
            admitted = true;
            true
        });
        admitted
    }

    fn unregister_listener(&self) {
        self.demand
            .send_modify(|d| d.listeners = d.listeners.saturating_sub(1));
    }
}
