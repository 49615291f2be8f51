//! Candidate endpoints and invite links.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use super::classify_address;
use crate::error::{Error, Result};
use crate::types::EndpointKind;

/// URI scheme of invite links.
pub const INVITE_SCHEME: &str = "meshconn";

/// URL-safe base64 that encodes without padding and decodes either way.
pub(crate) const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Up to three addresses that all reach the same peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
}

impl MeshEndpoints {
    pub fn new(local: Option<String>, public: Option<String>, relay: Option<String>) -> Self {
        Self {
            local,
            public,
            relay,
        }
    }

    /// Configured endpoints in fixed precedence: local, public, relay.
    pub fn to_ordered_list(&self) -> Vec<(EndpointKind, String)> {
        [
            (EndpointKind::Local, &self.local),
            (EndpointKind::Public, &self.public),
            (EndpointKind::Relay, &self.relay),
        ]
        .into_iter()
        .filter_map(|(kind, addr)| addr.clone().map(|a| (kind, a)))
        .collect()
    }

    pub fn get(&self, kind: EndpointKind) -> Option<&str> {
        match kind {
            EndpointKind::Local => self.local.as_deref(),
            EndpointKind::Public => self.public.as_deref(),
            EndpointKind::Relay => self.relay.as_deref(),
            EndpointKind::Ble => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.public.is_none() && self.relay.is_none()
    }

    /// Sort raw addresses into slots; the first address per slot wins and
    /// unparsable addresses are skipped.
    pub fn from_addresses<S: AsRef<str>>(addresses: &[S]) -> Self {
        let mut endpoints = Self::default();
        for address in addresses {
            let address = address.as_ref().trim();
            let slot = match classify_address(address) {
                Some(EndpointKind::Local) => &mut endpoints.local,
                Some(EndpointKind::Public) => &mut endpoints.public,
                Some(EndpointKind::Relay) => &mut endpoints.relay,
                Some(EndpointKind::Ble) | None => continue,
            };
            if slot.is_none() {
                *slot = Some(address.to_string());
            }
        }
        endpoints
    }
}

/// Invitation to join a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshInvite {
    pub token: String,
    pub mesh_name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_public_key: Option<String>,
}

impl MeshInvite {
    /// URL-safe base64 of the JSON form, without padding.
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_LENIENT.encode(serde_json::to_vec(self)?))
    }

    /// Inverse of [`encode`](Self::encode); padded input is accepted too.
    pub fn decode(blob: &str) -> Result<Self> {
        let bytes = URL_SAFE_LENIENT
            .decode(blob.trim())
            .map_err(|e| Error::InvalidInvite(format!("not base64: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidInvite(e.to_string()))
    }

    /// `meshconn://join/<blob>`.
    pub fn to_uri(&self) -> Result<String> {
        Ok(format!("{INVITE_SCHEME}://join/{}", self.encode()?))
    }

    /// Parse an invite in any accepted form: `meshconn://join/<blob>` (or any
    /// URL whose last path segment is the blob), a bare blob, or the legacy
    /// query form `?token=..&endpoint=..&mesh=..`.
    pub fn parse_uri(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidInvite("empty invite".into()));
        }

        let Ok(url) = Url::parse(input) else {
            return Self::decode(input);
        };

        if url.query_pairs().any(|(k, _)| k == "token") {
            return Self::from_legacy_query(&url);
        }

        let blob = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .ok_or_else(|| Error::InvalidInvite(format!("no invite payload in {input}")))?;
        Self::decode(blob)
    }

    fn from_legacy_query(url: &Url) -> Result<Self> {
        let mut token = None;
        let mut mesh_name = None;
        let mut endpoints = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "mesh" => mesh_name = Some(value.into_owned()),
                "endpoint" => endpoints.push(value.into_owned()),
                _ => {}
            }
        }

        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::InvalidInvite("legacy invite without token".into()))?;
        Ok(Self {
            token,
            mesh_name: mesh_name.unwrap_or_default(),
            endpoints,
            mesh_public_key: None,
        })
    }

    /// Endpoints sorted into local/public/relay slots.
    pub fn mesh_endpoints(&self) -> MeshEndpoints {
        MeshEndpoints::from_addresses(&self.endpoints)
    }
}
