//! Client identity types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Information about the client behind a request.
///
/// Populated by the protocol adapter that accepted the connection and
/// carried on the request context for every downstream plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Remote address as reported by the transport.
    pub remote_addr: String,

    /// User agent, or `"unknown"` when the transport has none.
    pub user_agent: String,

    /// Transport-specific attributes (headers, frame metadata).
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Name of the adapter that produced this request.
    pub transport: String,
}

impl ClientInfo {
    /// Create client info with empty attributes.
    #[must_use]
    pub fn new(
        remote_addr: impl Into<String>,
        user_agent: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            user_agent: user_agent.into(),
            attributes: HashMap::new(),
            transport: transport.into(),
        }
    }

    /// Stable client key derived from the remote address and user agent.
    ///
    /// Used as the fallback session identifier when the client does not
    /// supply its own id. The key is the truncated hex of a blake3 hash,
    /// so it never exposes the raw address in logs or session maps.
    #[must_use]
    pub fn client_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.remote_addr.as_bytes());
        hasher.update(b":");
        hasher.update(self.user_agent.as_bytes());
        let hash = hasher.finalize();
        hash.to_hex()[..32].to_string()
    }

    /// The remote IP without the ephemeral source port.
    ///
    /// Rate limiting and similar per-client accounting must not key on
    /// the full socket address: the source port changes on every
    /// reconnect. Addresses that do not parse (IPC peers, `"unknown"`)
    /// are returned as-is.
    #[must_use]
    pub fn remote_ip(&self) -> String {
        self.remote_addr
            .parse::<std::net::SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| self.remote_addr.clone())
    }
}

/// An authenticated identity attached to a request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier.
    pub user_id: Uuid,

    /// Roles granted to this user.
    pub roles: Vec<String>,

    /// How the principal authenticated (e.g. `"session_token"`).
    pub auth_method: String,
}

impl Principal {
    /// Check whether the principal holds the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key_is_stable() {
        let a = ClientInfo::new("127.0.0.1:5000", "hearth-test/1.0", "rest");
        let b = ClientInfo::new("127.0.0.1:5000", "hearth-test/1.0", "websocket");
        // Transport does not participate in the key.
        assert_eq!(a.client_key(), b.client_key());
        assert_eq!(a.client_key().len(), 32);
    }

    #[test]
    fn test_client_key_differs_by_agent() {
        let a = ClientInfo::new("127.0.0.1:5000", "hearth-test/1.0", "rest");
        let b = ClientInfo::new("127.0.0.1:5000", "hearth-test/2.0", "rest");
        assert_ne!(a.client_key(), b.client_key());
    }

    #[test]
    fn test_remote_ip_strips_port() {
        let client = ClientInfo::new("192.168.1.20:49152", "agent", "rest");
        assert_eq!(client.remote_ip(), "192.168.1.20");

        let client = ClientInfo::new("[::1]:8080", "agent", "rest");
        assert_eq!(client.remote_ip(), "::1");

        // Non-socket peers come back unchanged.
        let client = ClientInfo::new("unix-peer", "agent", "ipc");
        assert_eq!(client.remote_ip(), "unix-peer");
    }

    #[test]
    fn test_principal_roles() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            roles: vec!["user".into(), "admin".into()],
            auth_method: "session_token".into(),
        };
        assert!(principal.has_role("admin"));
        assert!(!principal.has_role("operator"));
    }
}
