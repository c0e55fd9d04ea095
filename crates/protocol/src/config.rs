use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CamcastConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted signaling request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Snapshot and MJPEG delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Multipart boundary token used on the MJPEG stream
    #[serde(default = "default_boundary")]
    pub boundary: String,
    /// Maximum concurrent MJPEG viewers (0 = unlimited)
    #[serde(default)]
    pub max_viewers: usize,
    /// How long /snapshot waits for a first frame when none is buffered
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Directory of JPEG files replayed as camera frames (demo capture)
    pub feeder_dir: Option<String>,
    /// Replay rate for the JPEG directory feeder
    #[serde(default = "default_feeder_fps")]
    pub feeder_fps: u32,
}

/// WebRTC negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Upper bound on waiting for local ICE gathering to complete
    #[serde(default = "default_negotiation_step_secs")]
    pub gathering_timeout_secs: u64,
    /// Upper bound on applying a remote answer
    #[serde(default = "default_negotiation_step_secs")]
    pub answer_timeout_secs: u64,
    /// Sessions that have not connected after this many seconds are reaped (0 = never)
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
    /// Maximum concurrently tracked peer sessions (0 = unlimited)
    #[serde(default)]
    pub max_peers: usize,
    /// Hold single-shot answers until local ICE gathering completes
    #[serde(default)]
    pub answer_waits_for_gathering: bool,
    /// H.264 Annex-B file looped into the WebRTC video track (demo capture)
    pub h264_file: Option<String>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
    /// Echo the configured servers in the offer's `iceServers` field
    #[serde(default)]
    pub advertise: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            max_viewers: 0,
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            feeder_dir: None,
            feeder_fps: default_feeder_fps(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            gathering_timeout_secs: default_negotiation_step_secs(),
            answer_timeout_secs: default_negotiation_step_secs(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
            max_peers: 0,
            answer_waits_for_gathering: false,
            h264_file: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            advertise: false,
        }
    }
}

impl CamcastConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Port ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.max_body_bytes < 1024 {
            issues.push(format!(
                "WARNING: server.max_body_bytes is {} bytes. SDP offers are usually several \
                 kilobytes and will be rejected.",
                self.server.max_body_bytes
            ));
        }

        // --- Boundary ---
        if self.stream.boundary.is_empty()
            || self.stream.boundary.chars().any(|c| c.is_whitespace())
        {
            issues.push(format!(
                "ERROR: stream.boundary must be non-empty and contain no whitespace, got '{}'.",
                self.stream.boundary
            ));
        }

        // --- Feeder ---
        if self.stream.feeder_fps == 0 || self.stream.feeder_fps > 120 {
            issues.push(format!(
                "ERROR: stream.feeder_fps must be between 1 and 120, got {}.",
                self.stream.feeder_fps
            ));
        }
        if let Some(dir) = &self.stream.feeder_dir
            && !std::path::Path::new(dir).is_dir()
        {
            issues.push(format!(
                "ERROR: stream.feeder_dir '{}' is not a directory.",
                dir
            ));
        }
        if let Some(file) = &self.signaling.h264_file
            && !std::path::Path::new(file).is_file()
        {
            issues.push(format!(
                "ERROR: signaling.h264_file '{}' does not exist.",
                file
            ));
        }

        if self.stream.snapshot_timeout_ms == 0 {
            issues.push(
                "WARNING: stream.snapshot_timeout_ms is 0. /snapshot fails unless a frame \
                 is already buffered."
                    .to_string(),
            );
        }

        // --- Negotiation timeouts ---
        if self.signaling.gathering_timeout_secs == 0 {
            issues.push("ERROR: signaling.gathering_timeout_secs must be >= 1.".to_string());
        }
        if self.signaling.answer_timeout_secs == 0 {
            issues.push("ERROR: signaling.answer_timeout_secs must be >= 1.".to_string());
        }
        if self.signaling.negotiation_timeout_secs > 0
            && self.signaling.negotiation_timeout_secs < self.signaling.gathering_timeout_secs
        {
            issues.push(format!(
                "WARNING: signaling.negotiation_timeout_secs ({}) is shorter than \
                 gathering_timeout_secs ({}). Sessions may be reaped before their offer is sent.",
                self.signaling.negotiation_timeout_secs, self.signaling.gathering_timeout_secs
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    65_536
}
fn default_boundary() -> String {
    "camcastframe".to_string()
}
fn default_snapshot_timeout_ms() -> u64 {
    3000
}
fn default_feeder_fps() -> u32 {
    15
}
fn default_negotiation_step_secs() -> u64 {
    10
}
fn default_negotiation_timeout_secs() -> u64 {
    60
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
