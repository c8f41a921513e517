use serde::{Deserialize, Serialize};

/// Capability flags granted to a client.
///
/// Missing fields deserialize to the defaults, so tokens minted before a flag
/// existed still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPermissions {
    /// Assistant endpoints (`/neon/*`).
    pub assist: bool,
    /// Backend proxied endpoints.
    pub backend: bool,
    /// Node websocket connections.
    pub node: bool,
}

impl Default for ClientPermissions {
    fn default() -> Self {
        Self {
            assist: true,
            backend: true,
            node: false,
        }
    }
}

impl ClientPermissions {
    pub fn all() -> Self {
        Self {
            assist: true,
            backend: true,
            node: true,
        }
    }

    pub fn none() -> Self {
        Self {
            assist: false,
            backend: false,
            node: false,
        }
    }

    /// Default permissions, with `node` set as given.
    pub fn with_node(node: bool) -> Self {
        Self {
            node,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn default_denies_node_only() {
        let p = ClientPermissions::default();
        assert!(p.assist && p.backend && !p.node);
        assert_eq!(ClientPermissions::with_node(true), ClientPermissions::all());
    }

    #[test]
    fn partial_payload_uses_defaults() {
        let p: ClientPermissions = serde_json::from_value(json!({"node": true})).unwrap();
        assert_eq!(p, ClientPermissions::all());
        let p: ClientPermissions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(p, ClientPermissions::default());
    }
}
