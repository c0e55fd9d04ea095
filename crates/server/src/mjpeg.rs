//! MJPEG fan-out: one long-lived multipart response per viewer, all fed from
//! the same [`FrameSource`].

use std::sync::Arc;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use camcast_protocol::{FrameId, encode_mjpeg_part, mjpeg_preamble, multipart_content_type};
use futures_util::{Stream, StreamExt, stream};
use tracing::{debug, info, warn};

use crate::source::FrameSource;

/// One registered MJPEG viewer. Unregisters from the source when dropped,
/// whether the stream ended or the client went away mid-write.
pub struct Viewer {
    source: Arc<dyn FrameSource>,
    last: Option<FrameId>,
    sent: u64,
}

impl Viewer {
    /// `None` when the source refuses another listener.
    pub fn register(source: Arc<dyn FrameSource>) -> Option<Self> {
        if !source.register_listener() {
            return None;
        }
        Some(Self {
            source,
            last: None,
            sent: 0,
        })
    }

    /// Wait for the next frame this viewer has not seen and encode it.
    pub async fn next_part(&mut self, boundary: &str) -> Option<Bytes> {
        let frame = self.source.next_frame(self.last).await?;
        self.last = Some(frame.id);
        self.sent += 1;
        Some(encode_mjpeg_part(boundary, &frame))
    }

    pub fn last_sent(&self) -> Option<FrameId> {
        self.last
    }

    /// Stream body bytes: the opening boundary, then one part per frame.
    pub fn into_stream(
        self,
        boundary: String,
    ) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static {
        let preamble = stream::once(std::future::ready(mjpeg_preamble(&boundary)));
        let parts = stream::unfold((self, boundary), |(mut viewer, boundary)| async move {
            let part = viewer.next_part(&boundary).await?;
            Some((part, (viewer, boundary)))
        });
        preamble.chain(parts).map(Ok)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.source.unregister_listener();
        debug!(
            frames_sent = self.sent,
            last_frame = ?self.last_sent(),
            "MJPEG viewer unregistered"
        );
    }
}

/// Build the streaming response for `GET /mjpeg`.
pub fn response(source: Arc<dyn FrameSource>, boundary: &str) -> Response {
    let Some(viewer) = Viewer::register(source) else {
        warn!("MJPEG viewer rejected: frame source at capacity or shut down");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "MJPEG stream unavailable",
        )
            .into_response();
    };
    info!("MJPEG viewer connected");

    (
        [
            (header::CONTENT_TYPE, multipart_content_type(boundary)),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(viewer.into_stream(boundary.to_string())),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FrameHub;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const BOUNDARY: &str = "testframe";

    fn hub() -> Arc<FrameHub> {
        Arc::new(FrameHub::new(0, Duration::from_secs(1)))
    }

    fn part_len(payload: usize) -> usize {
        let header = format!("Content-Type: image/jpeg\r\nContent-Length: {payload}\r\n\r\n");
        header.len() + payload + format!("\r\n--{BOUNDARY}\r\n").len()
    }

    #[tokio::test]
    async fn every_viewer_sees_every_frame_in_order() {
        let hub = hub();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<(usize, FrameId)>();
        let viewers = 4;
        let frames = 20u64;

        let mut tasks = Vec::new();
        for n in 0..viewers {
            let mut viewer = Viewer::register(hub.clone()).unwrap();
            let ack = ack_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while viewer.next_part(BOUNDARY).await.is_some() {
                    let id = viewer.last_sent().unwrap();
                    seen.push(id.0);
                    let _ = ack.send((n, id));
                }
                seen
            }));
        }
        drop(ack_tx);

        for i in 0..frames {
            let id = hub.publish(vec![i as u8]).unwrap();
            for _ in 0..viewers {
                let (_, acked) = tokio::time::timeout(Duration::from_secs(5), ack_rx.recv())
                    .await
                    .expect("viewer should receive frame")
                    .unwrap();
                assert_eq!(acked, id);
            }
        }
        hub.close();

        let expected: Vec<u64> = (0..frames).collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), expected);
        }
        assert_eq!(hub.viewers(), 0);
    }

    #[tokio::test]
    async fn late_viewer_starts_at_latest_frame() {
        let hub = hub();
        hub.publish(vec![1u8]);
        hub.publish(vec![2u8]);

        let mut viewer = Viewer::register(hub.clone()).unwrap();
        viewer.next_part(BOUNDARY).await.unwrap();
        assert_eq!(viewer.last_sent(), Some(FrameId(1)));
    }

    #[tokio::test]
    async fn slow_viewer_does_not_block_others() {
        let hub = hub();
        let _stalled = Viewer::register(hub.clone()).unwrap();
        let mut active = Viewer::register(hub.clone()).unwrap();

        for i in 0..5u8 {
            hub.publish(vec![i]);
            tokio::time::timeout(Duration::from_secs(5), active.next_part(BOUNDARY))
                .await
                .expect("active viewer must not wait on stalled one")
                .unwrap();
        }
        assert_eq!(active.last_sent(), Some(FrameId(4)));
        assert_eq!(hub.viewers(), 2);
    }

    #[test]
    fn capacity_rejects_extra_viewers() {
        let hub = Arc::new(FrameHub::new(1, Duration::from_secs(1)));
        let first = Viewer::register(hub.clone()).unwrap();
        assert!(Viewer::register(hub.clone()).is_none());
        drop(first);
        assert!(Viewer::register(hub.clone()).is_some());
    }

    #[test]
    fn dropping_viewer_unregisters_exactly_once() {
        let hub = hub();
        let a = Viewer::register(hub.clone()).unwrap();
        let b = Viewer::register(hub.clone()).unwrap();
        assert_eq!(hub.viewers(), 2);
        drop(a);
        assert_eq!(hub.viewers(), 1);
        drop(b);
        assert_eq!(hub.viewers(), 0);
    }

    #[tokio::test]
    async fn stream_emits_preamble_then_parts() {
        let hub = hub();
        hub.publish(vec![0xFFu8, 0xD8, 0xFF, 0xD9]);
        let viewer = Viewer::register(hub.clone()).unwrap();
        let mut body = Box::pin(viewer.into_stream(BOUNDARY.to_string()));

        let preamble = body.next().await.unwrap().unwrap();
        assert_eq!(&preamble[..], format!("--{BOUNDARY}\r\n").as_bytes());

        let part = body.next().await.unwrap().unwrap();
        assert_eq!(part.len(), part_len(4));
        assert!(part.starts_with(b"Content-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(part.ends_with(format!("\r\n--{BOUNDARY}\r\n").as_bytes()));
    }

    #[tokio::test]
    async fn close_ends_stream_and_releases_viewer() {
        let hub = hub();
        let viewer = Viewer::register(hub.clone()).unwrap();
        let mut body = Box::pin(viewer.into_stream(BOUNDARY.to_string()));
        body.next().await.unwrap().unwrap();

        hub.close();
        let end = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("stream should end");
        assert!(end.is_none());
        drop(body);
        assert_eq!(hub.viewers(), 0);
    }

    #[tokio::test]
    async fn dropping_stream_mid_wait_unregisters() {
        let hub = hub();
        let viewer = Viewer::register(hub.clone()).unwrap();
        let mut body = Box::pin(viewer.into_stream(BOUNDARY.to_string()));
        body.next().await.unwrap().unwrap();

        // Client disconnects while the viewer waits for a frame.
        let pending = tokio::time::timeout(Duration::from_millis(20), body.next()).await;
        assert!(pending.is_err());
        drop(body);
        assert_eq!(hub.viewers(), 0);
    }

    #[test]
    fn rejected_viewer_gets_service_unavailable() {
        let hub = hub();
        hub.close();
        let rejected = response(hub, BOUNDARY);
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
