use std::time::Duration;

/// Configuration for a mesh node.
#[derive(Clone, Debug)]
pub struct Config {
    /// TCP port the acceptor binds to. 0 picks an ephemeral port. Default: 3479.
    pub port: u16,
    /// Size of the per-socket read buffer. Default: 1024 bytes.
    pub read_buffer: usize,
    /// Interval between keep-alive frames to direct neighbors. Default: 5 seconds.
    pub keep_alive: Duration,
    /// Silence after which a direct neighbor is considered dead. Default: 120 seconds.
    pub timeout: Duration,
    /// Interval between dead-peer scans. Default: `timeout / 5`.
    pub timeout_check: Duration,
    /// Deadline for the dial + identity exchange. Default: 6 seconds.
    pub handshake_timeout: Duration,
    /// Maximum accepted frame payload. Default: 16 MiB.
    pub max_payload: usize,
    /// Dial peers learned through the overlay to upgrade forwarded routes
    /// into direct links. When disabled the node relies on forwarders for
    /// every peer it did not dial itself. Default: true.
    pub auto_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3479,
            read_buffer: 1024,
            keep_alive: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            timeout_check: Duration::from_secs(24),
            handshake_timeout: Duration::from_secs(6),
            max_payload: 16 * 1024 * 1024,
            auto_connect: true,
        }
    }
}

impl Config {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn with_keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    /// Set the dead-peer timeout; the scan interval follows at `d / 5`.
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self.timeout_check = d / 5;
        self
    }

    pub fn with_timeout_check(mut self, d: Duration) -> Self {
        self.timeout_check = d;
        self
    }

    pub fn with_handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    pub fn with_max_payload(mut self, size: usize) -> Self {
        self.max_payload = size;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }
}
