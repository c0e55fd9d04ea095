//! Camera frames and their multipart MJPEG framing.
//!
//! A stream opens with `--<boundary>\r\n`, then each part is laid out as:
//! ```text
//! Content-Type: image/jpeg\r\n
//! Content-Length: <payload length>\r\n
//! \r\n
//! <payload>\r\n
//! --<boundary>\r\n
//! ```
//! Each part carries its own closing boundary.

use bytes::{BufMut, Bytes, BytesMut};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Opaque frame identifier. Only equality is meaningful: ids come from a
/// wrapping counter, so ordering comparisons break at wraparound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

impl FrameId {
    /// The id assigned to the frame published after this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An encoded image. Cloning shares the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub data: Bytes,
}

impl Frame {
    pub fn new(id: FrameId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// True when this frame should be delivered to a viewer that last saw `last`.
    pub fn is_newer_than(&self, last: Option<FrameId>) -> bool {
        last != Some(self.id)
    }
}

/// `Content-Type` header value for an MJPEG stream using `boundary`.
pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// Opening delimiter written once before the first part.
pub fn mjpeg_preamble(boundary: &str) -> Bytes {
    Bytes::from(format!("--{boundary}\r\n"))
}

/// Encode one frame as a `multipart/x-mixed-replace` part, boundary included.
pub fn encode_mjpeg_part(boundary: &str, frame: &Frame) -> Bytes {
    let header = format!(
        "Content-Type: {JPEG_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        frame.data.len()
    );
    let trailer = format!("\r\n--{boundary}\r\n");
    let mut buf = BytesMut::with_capacity(header.len() + frame.data.len() + trailer.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(&frame.data);
    buf.put_slice(trailer.as_bytes());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_layout() {
        let frame = Frame::new(FrameId(7), vec![0xFF, 0xD8, 0xFF, 0xD9]);
        let part = encode_mjpeg_part("bnd", &frame);
        let expected_header = b"Content-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n";
        assert!(part.starts_with(expected_header));
        assert_eq!(&part[expected_header.len()..expected_header.len() + 4], &frame.data[..]);
        assert!(part.ends_with(b"\r\n--bnd\r\n"));
        assert_eq!(part.len(), expected_header.len() + 4 + 9);
    }

    #[test]
    fn content_length_matches_payload() {
        let frame = Frame::new(FrameId(1), vec![0u8; 12_345]);
        let part = encode_mjpeg_part("x", &frame);
        let text = String::from_utf8_lossy(&part[..64]);
        assert!(text.contains("Content-Length: 12345\r\n"));
    }

    #[test]
    fn empty_payload_still_framed() {
        let frame = Frame::new(FrameId(1), Vec::new());
        let part = encode_mjpeg_part("x", &frame);
        assert_eq!(&part[..], b"Content-Type: image/jpeg\r\nContent-Length: 0\r\n\r\n\r\n--x\r\n");
    }

    #[test]
    fn preamble_opens_first_part() {
        assert_eq!(&mjpeg_preamble("x")[..], b"--x\r\n");
    }

    #[test]
    fn content_type_names_boundary() {
        assert_eq!(
            multipart_content_type("abc"),
            "multipart/x-mixed-replace; boundary=abc"
        );
    }

    #[test]
    fn frame_id_wraps() {
        assert_eq!(FrameId(u64::MAX).next(), FrameId(0));
        assert_eq!(FrameId(41).next(), FrameId(42));
    }

    #[test]
    fn newness_uses_equality_not_order() {
        let frame = Frame::new(FrameId(0), Vec::new());
        assert!(frame.is_newer_than(None));
        assert!(frame.is_newer_than(Some(FrameId(u64::MAX))));
        assert!(frame.is_newer_than(Some(FrameId(5))));
        assert!(!frame.is_newer_than(Some(FrameId(0))));
    }
}
