use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages of the multi-peer trickle flow, where the server is the offerer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrickleMessage {
    /// Ask the server to open a new peer session and send its offer
    Request,
    /// Client's SDP answer to a previously issued offer
    Answer { id: Uuid, sdp: String },
    /// Batch of trickled client ICE candidates
    RemoteCandidate {
        id: Uuid,
        #[serde(default)]
        candidates: Vec<IceCandidatePayload>,
    },
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// A parsed `POST /webrtc` body.
#[derive(Debug, Clone)]
pub enum SignalingPayload {
    /// Server-offers, multi-peer, trickle-capable flow
    Trickle(TrickleMessage),
    /// Client-offers, single-shot flow: the client's SDP offer
    Offer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("empty request body")]
    Empty,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct OfferEnvelope {
    sdp: Option<String>,
}

impl SignalingPayload {
    /// Classify a request body by its shape.
    ///
    /// Bodies not starting with `{` are raw SDP offers. JSON objects typed
    /// `request` or `remote_candidate`, or typed `answer` and carrying an
    /// `id`, belong to the trickle flow. Any other object must carry `sdp`
    /// and is treated as a single-shot offer whatever its `type`.
    pub fn parse(body: &str) -> Result<Self, PayloadError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(PayloadError::Empty);
        }
        if !trimmed.starts_with('{') {
            return Ok(Self::Offer(body.to_string()));
        }

        let value: Value = serde_json::from_str(trimmed)?;
        let kind = value.get("type").and_then(Value::as_str);
        let is_trickle = match kind {
            Some("request") | Some("remote_candidate") => true,
            Some("answer") => value.get("id").is_some(),
            _ => false,
        };
        if is_trickle {
            return Ok(Self::Trickle(serde_json::from_value(value)?));
        }

        let envelope: OfferEnvelope = serde_json::from_value(value)?;
        match envelope.sdp {
            Some(sdp) if !sdp.trim().is_empty() => Ok(Self::Offer(sdp)),
            _ => Err(PayloadError::MissingField("sdp")),
        }
    }
}

/// ICE server configuration returned to clients for WebRTC setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Successful `POST /webrtc` response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingResponse {
    /// Server offer for the trickle flow
    Offer {
        sdp: String,
        id: Uuid,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerInfo>,
    },
    /// Server answer for the single-shot flow
    Answer { sdp: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\n";

    #[test]
    fn request_is_trickle() {
        match SignalingPayload::parse(r#"{"type":"request"}"#).unwrap() {
            SignalingPayload::Trickle(TrickleMessage::Request) => {}
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn answer_with_id_is_trickle() {
        let body = r#"{"type":"answer","id":"00000000-0000-0000-0000-000000000000","sdp":"v=0"}"#;
        match SignalingPayload::parse(body).unwrap() {
            SignalingPayload::Trickle(TrickleMessage::Answer { id, sdp }) => {
                assert_eq!(id, Uuid::nil());
                assert_eq!(sdp, "v=0");
            }
            other => panic!("expected Answer, got {other:?}"),
        }
    }

    #[test]
    fn remote_candidates_browser_format() {
        let body = r#"{
            "type": "remote_candidate",
            "id": "00000000-0000-0000-0000-000000000000",
            "candidates": [
                {"sdpMid": "0", "sdpMLineIndex": 0, "candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host"},
                {"sdpMid": null, "sdpMLineIndex": 1, "candidate": "candidate:2 1 UDP 1694498815 203.0.113.5 50001 typ srflx"}
            ]
        }"#;
        match SignalingPayload::parse(body).unwrap() {
            SignalingPayload::Trickle(TrickleMessage::RemoteCandidate { id, candidates }) => {
                assert_eq!(id, Uuid::nil());
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidates[0].sdp_mline_index, Some(0));
                assert!(candidates[1].sdp_mid.is_none());
                assert!(candidates[1].candidate.contains("srflx"));
            }
            other => panic!("expected RemoteCandidate, got {other:?}"),
        }
    }

    #[test]
    fn remote_candidate_without_list_is_empty_batch() {
        let body = r#"{"type":"remote_candidate","id":"00000000-0000-0000-0000-000000000000"}"#;
        match SignalingPayload::parse(body).unwrap() {
            SignalingPayload::Trickle(TrickleMessage::RemoteCandidate { candidates, .. }) => {
                assert!(candidates.is_empty())
            }
            other => panic!("expected RemoteCandidate, got {other:?}"),
        }
    }

    #[test]
    fn json_sdp_and_raw_sdp_are_equivalent_offers() {
        let json = serde_json::json!({ "sdp": OFFER }).to_string();
        let from_json = SignalingPayload::parse(&json).unwrap();
        let from_raw = SignalingPayload::parse(OFFER).unwrap();
        match (from_json, from_raw) {
            (SignalingPayload::Offer(a), SignalingPayload::Offer(b)) => assert_eq!(a, b),
            other => panic!("expected two offers, got {other:?}"),
        }
    }

    #[test]
    fn typed_offer_and_answer_without_id_are_single_shot() {
        let typed = serde_json::json!({ "type": "offer", "sdp": OFFER }).to_string();
        assert!(matches!(
            SignalingPayload::parse(&typed).unwrap(),
            SignalingPayload::Offer(_)
        ));

        let no_id = serde_json::json!({ "type": "answer", "sdp": OFFER }).to_string();
        assert!(matches!(
            SignalingPayload::parse(&no_id).unwrap(),
            SignalingPayload::Offer(_)
        ));
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(SignalingPayload::parse(""), Err(PayloadError::Empty)));
        assert!(matches!(SignalingPayload::parse("  \r\n"), Err(PayloadError::Empty)));
        assert!(matches!(
            SignalingPayload::parse("{not json"),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            SignalingPayload::parse(r#"{"type":"offer"}"#),
            Err(PayloadError::MissingField("sdp"))
        ));
        assert!(matches!(
            SignalingPayload::parse(r#"{"sdp":""}"#),
            Err(PayloadError::MissingField("sdp"))
        ));
        // Answer with an id that is not a session id
        assert!(matches!(
            SignalingPayload::parse(r#"{"type":"answer","id":"nope","sdp":"v=0"}"#),
            Err(PayloadError::Json(_))
        ));
        // Candidate entry without its candidate line
        assert!(matches!(
            SignalingPayload::parse(
                r#"{"type":"remote_candidate","id":"00000000-0000-0000-0000-000000000000","candidates":[{"sdpMid":"0"}]}"#
            ),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn offer_response_shape() {
        let resp = SignalingResponse::Offer {
            sdp: "v=0".to_string(),
            id: Uuid::nil(),
            ice_servers: Vec::new(),
        };
        let json: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["iceServers"], serde_json::json!([]));
    }

    #[test]
    fn answer_response_shape() {
        let resp = SignalingResponse::Answer {
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0"}"#);
    }

    #[test]
    fn ice_server_info_skips_missing_credentials() {
        let info = IceServerInfo {
            urls: vec!["stun:stun.example.com:3478".to_string()],
            username: None,
            credential: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("username"));
        assert!(!json.contains("credential"));
    }
}
