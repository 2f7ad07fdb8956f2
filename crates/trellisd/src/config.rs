use serde::{Deserialize, Serialize};

use trellis::PeerId;

/// Daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity as a UUID string. Generated when empty.
    #[serde(default)]
    pub id: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Mesh members to join through, e.g. `["tcp://host:3479"]`. The first
    /// reachable one is used; gossip takes care of the rest.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Dial peers learned through the overlay to turn forwarded routes into
    /// direct links.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
}

fn default_port() -> u16 {
    3479
}

fn default_auto_connect() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            port: default_port(),
            peers: Vec::new(),
            auto_connect: true,
        }
    }
}

impl NodeConfig {
    /// A fresh configuration with a generated identity.
    pub fn generate() -> Self {
        Self {
            id: PeerId::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Parse the configured identity, generating one if the field is empty.
    pub fn node_id(&self) -> Result<PeerId, String> {
        if self.id.is_empty() {
            return Ok(PeerId::new_v4());
        }
        PeerId::parse_str(&self.id).map_err(|e| format!("invalid node id: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_round_trips() {
        let config = NodeConfig::generate();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, config.id);
        assert_eq!(parsed.port, 3479);
        parsed.node_id().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: NodeConfig = serde_json::from_str("{}").unwrap();
        assert!(parsed.id.is_empty());
        assert_eq!(parsed.port, 3479);
        assert!(parsed.peers.is_empty());
        assert!(parsed.auto_connect);
        // An empty id still yields a usable identity.
        parsed.node_id().unwrap();
    }

    #[test]
    fn bad_id_is_rejected() {
        let parsed: NodeConfig =
            serde_json::from_str(r#"{"id": "not-a-uuid"}"#).unwrap();
        assert!(parsed.node_id().is_err());
    }
}
