use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// Which realtime protocol a session speaks. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Realtime over a WebRTC peer connection with a data channel.
    #[serde(alias = "openai", alias = "webrtc")]
    Peer,
    /// Gemini Live over a bidirectional WebSocket.
    #[serde(alias = "gemini", alias = "websocket")]
    DuplexSocket,
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown realtime provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "peer" | "openai" | "webrtc" => Ok(ProviderKind::Peer),
            "duplex_socket" | "duplex" | "gemini" | "websocket" => Ok(ProviderKind::DuplexSocket),
            other => Err(UnknownProvider(other.to_owned())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Peer => f.write_str("peer"),
            ProviderKind::DuplexSocket => f.write_str("duplex_socket"),
        }
    }
}

/// Ephemeral parameters for one connection attempt.
///
/// Fetched fresh on every `connect()` and dropped once the transport is up.
/// The credential is never logged.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    #[serde(alias = "providerKind")]
    pub provider: ProviderKind,
    #[serde(
        alias = "key",
        alias = "token",
        alias = "clientSecret",
        deserialize_with = "secret_from_string"
    )]
    pub credential: SecretString,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "expiresAt")]
    pub expiry: Option<DateTime<Utc>>,
}

impl SessionDescriptor {
    pub fn new(provider: ProviderKind, credential: impl Into<String>) -> Self {
        Self {
            provider,
            credential: SecretString::from(credential.into()),
            voice: None,
            instructions: None,
            model: None,
            expiry: None,
        }
    }

    pub fn credential(&self) -> &str {
        self.credential.expose_secret()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

fn secret_from_string<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}
