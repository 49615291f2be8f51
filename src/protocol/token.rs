//! Join credentials.
//!
//! Signature verification is done by the identity service that issues a
//! [`MeshToken`]; this module only parses tokens and checks expiry.

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::invite::URL_SAFE_LENIENT;
use crate::error::{Error, Result};
use crate::types::{unix_millis, unix_secs};

/// Signed mesh authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshToken {
    pub mesh_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Issue time, seconds since the Unix epoch.
    pub issued_at: u64,
    /// Expiry, seconds since the Unix epoch.
    pub expires_at: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub issuer_id: String,
    pub nonce: String,
    pub signature: String,
}

impl MeshToken {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_secs())
    }

    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }

    /// Seconds of validity left, zero once expired.
    pub fn remaining_secs(&self) -> u64 {
        self.expires_at.saturating_sub(unix_secs())
    }

    /// Decode from the URL-safe base64 JSON form used in invites.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_LENIENT
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidInvite(format!("token is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInvite(format!("token is not a mesh token: {e}")))
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_LENIENT.encode(json))
    }
}

/// Legacy shared-secret token, re-wrapped for every connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyToken {
    pub token: String,
    /// 16 random bytes, hex.
    pub nonce: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Token carried in a `join` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinToken {
    Signed(MeshToken),
    Legacy(LegacyToken),
}

impl JoinToken {
    /// Wrap a legacy token with a fresh nonce and timestamp.
    ///
    /// The server rejects replayed nonces, so this must be called once per
    /// connection attempt.
    pub fn legacy(token: impl Into<String>) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::Legacy(LegacyToken {
            token: token.into(),
            nonce: hex::encode(nonce),
            timestamp: unix_millis(),
        })
    }

    pub fn nonce(&self) -> &str {
        match self {
            Self::Signed(t) => &t.nonce,
            Self::Legacy(t) => &t.nonce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: u64) -> MeshToken {
        MeshToken {
            mesh_id: "mesh-1".into(),
            node_id: Some("node-1".into()),
            issued_at: 1_700_000_000,
            expires_at,
            capabilities: vec!["llm".into()],
            issuer_id: "issuer".into(),
            nonce: "abcd".into(),
            signature: "sig".into(),
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let t = token(1_700_003_600);
        assert!(!t.is_expired_at(1_700_003_599));
        assert!(t.is_expired_at(1_700_003_600));
        assert!(token(0).is_expired());
        assert!(!token(u64::MAX).is_expired());
    }

    #[test]
    fn test_legacy_wrap_is_fresh() {
        let a = JoinToken::legacy("secret");
        let b = JoinToken::legacy("secret");
        assert_ne!(a.nonce(), b.nonce());
        assert_eq!(a.nonce().len(), 32);
    }

    #[test]
    fn test_untagged_join_token_parses_both_forms() {
        let signed: JoinToken =
            serde_json::from_value(serde_json::to_value(token(10)).unwrap()).unwrap();
        assert!(matches!(signed, JoinToken::Signed(_)));

        let legacy: JoinToken = serde_json::from_str(
            r#"{"token":"secret","nonce":"00ff","timestamp":1700000000000}"#,
        )
        .unwrap();
        assert!(matches!(legacy, JoinToken::Legacy(ref l) if l.token == "secret"));
    }

    #[test]
    fn test_base64_form() {
        let t = token(42);
        let encoded = t.encode().unwrap();
        assert!(!encoded.contains('='));
        assert_eq!(MeshToken::decode(&encoded).unwrap(), t);
        assert!(MeshToken::decode("!!!").is_err());
    }
}
