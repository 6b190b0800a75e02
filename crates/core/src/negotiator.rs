//! Session negotiation: where a connect attempt gets its descriptor.

use crate::descriptor::{ProviderKind, SessionDescriptor};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

/// Obtains a fresh, short-lived session descriptor. Called once per `connect()`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    async fn negotiate(&self) -> VoiceResult<SessionDescriptor>;
}

/// Asks the application backend for a descriptor over HTTP.
///
/// The backend answers `POST <url>` with a JSON descriptor. Any transport
/// failure, non-success status or malformed body is a `NegotiationFailed`.
pub struct HttpNegotiator {
    client: reqwest::Client,
    url: String,
    bearer: Option<SecretString>,
}

impl HttpNegotiator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer: None,
        }
    }

    pub fn with_bearer_token(mut self, token: SecretString) -> Self {
        self.bearer = Some(token);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl SessionNegotiator for HttpNegotiator {
    async fn negotiate(&self) -> VoiceResult<SessionDescriptor> {
        debug!(url = %self.url, "Requesting session descriptor");
        let mut request = self.client.post(&self.url).json(&serde_json::json!({}));
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::NegotiationFailed(format!(
                "backend returned {status}: {body}"
            )));
        }
        let body = response.text().await?;
        let descriptor: SessionDescriptor = serde_json::from_str(&body)
            .map_err(|e| VoiceError::NegotiationFailed(format!("malformed descriptor: {e}")))?;
        info!(provider = %descriptor.provider, "Session descriptor received");
        Ok(descriptor)
    }
}

/// Builds descriptors from locally configured keys, for development
/// setups without an application backend.
pub struct StaticNegotiator {
    provider: ProviderKind,
    credential: SecretString,
    voice: Option<String>,
    instructions: Option<String>,
    model: Option<String>,
}

impl StaticNegotiator {
    pub fn new(provider: ProviderKind, credential: SecretString) -> Self {
        Self {
            provider,
            credential,
            voice: None,
            instructions: None,
            model: None,
        }
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl SessionNegotiator for StaticNegotiator {
    async fn negotiate(&self) -> VoiceResult<SessionDescriptor> {
        Ok(SessionDescriptor {
            provider: self.provider,
            credential: SecretString::from(self.credential.expose_secret().to_owned()),
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
            expiry: None,
        })
    }
}
