//! File-backed stand-ins for a camera pipeline.
//!
//! The JPEG feeder loops over a directory of stills and publishes them into
//! the [`FrameHub`] while anyone is watching. The H.264 feeder replays an
//! Annex-B file into the shared WebRTC track while any peer is connected.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use webrtc::media::io::h264_reader::H264Reader;

use crate::engine::VideoSink;
use crate::source::FrameHub;

/// Largest NAL unit the H.264 reader will buffer.
const MAX_NAL_BYTES: usize = 1 << 20;

fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// Read every `.jpg`/`.jpeg` file in `dir`, sorted by file name.
pub fn load_jpegs(dir: &Path) -> Result<Vec<Bytes>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read frame directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_jpeg(path))
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in &paths {
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        if data.is_empty() {
            warn!(path = %path.display(), "Skipping empty JPEG file");
            continue;
        }
        frames.push(Bytes::from(data));
    }

    if frames.is_empty() {
        bail!("No JPEG files found in {}", dir.display());
    }
    Ok(frames)
}

/// Publish `frames` round-robin at `fps` while the hub has demand.
/// Returns once the hub is closed.
pub async fn run_jpeg_feeder(hub: Arc<FrameHub>, frames: Vec<Bytes>, fps: u32) {
    if frames.is_empty() {
        return;
    }
    let mut demand = hub.demand();
    let mut ticker = tokio::time::interval(frame_interval(fps));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next = 0usize;

    info!(frames = frames.len(), fps, "JPEG feeder ready");
    loop {
        let wanted = match demand.wait_for(|d| d.closed || d.total() > 0).await {
            Ok(d) => !d.closed,
            Err(_) => false,
        };
        if !wanted {
            break;
        }

        debug!(viewers = hub.viewers(), "JPEG feeder capturing");
        ticker.reset_immediately();
        loop {
            ticker.tick().await;
            let current = *demand.borrow_and_update();
            if current.closed || current.total() == 0 {
                break;
            }
            if hub.publish(frames[next].clone()).is_none() {
                break;
            }
            next = (next + 1) % frames.len();
        }
        debug!("JPEG feeder idle");
    }
    info!("JPEG feeder stopped");
}

/// Replay an Annex-B H.264 byte stream into `sink` while `active` is true,
/// looping at end of file. Every resume starts again from the top of the
/// file. Returns once `active`'s sender is dropped.
pub async fn run_h264_feeder(
    sink: Arc<dyn VideoSink>,
    stream: Bytes,
    fps: u32,
    mut active: watch::Receiver<bool>,
) {
    let interval = frame_interval(fps);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(bytes = stream.len(), fps, "H.264 feeder ready");
    'outer: loop {
        if active.wait_for(|on| *on).await.is_err() {
            break;
        }
        info!("H.264 feeder streaming");

        let mut reader = H264Reader::new(Cursor::new(stream.clone()), MAX_NAL_BYTES);
        let mut written = 0usize;
        loop {
            if active.has_changed().is_err() {
                break 'outer;
            }
            if !*active.borrow() {
                info!("H.264 feeder paused");
                continue 'outer;
            }
            let nal = match reader.next_nal() {
                Ok(nal) => nal,
                Err(_) if written == 0 => {
                    warn!("H.264 file contains no NAL units");
                    break 'outer;
                }
                Err(_) => {
                    debug!("H.264 file exhausted, rewinding");
                    reader = H264Reader::new(Cursor::new(stream.clone()), MAX_NAL_BYTES);
                    written = 0;
                    continue;
                }
            };
            written += 1;
            if let Err(e) = sink.write_sample(nal.data.freeze(), interval).await {
                warn!("Failed to write H.264 sample: {e}");
            }
            ticker.tick().await;
        }
    }
    info!("H.264 feeder stopped");
}

/// Load the H.264 file once so the feeder never touches the filesystem again.
pub fn load_h264(path: &Path) -> Result<Bytes> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.is_empty() {
        bail!("H.264 file {} is empty", path.display());
    }
    Ok(Bytes::from(data))
}
