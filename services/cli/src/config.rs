use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use voicelink_core::config::{DuplexSettings, PeerSettings};
use voicelink_core::{HttpNegotiator, ProviderKind, SessionConfig, SessionNegotiator, StaticNegotiator};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// With `BACKEND_URL` set, descriptors come from the application backend.
/// Without it the provider's API key is used directly, which is only meant
/// for local development.
#[derive(Debug)]
pub struct Config {
    pub backend_url: Option<String>,
    pub backend_token: Option<SecretString>,
    pub provider: ProviderKind,
    pub openai_api_key: Option<SecretString>,
    pub gemini_api_key: Option<SecretString>,
    pub voice: Option<String>,
    pub instructions_path: Option<PathBuf>,
    pub transcription_language: Option<String>,
    pub openai_realtime_url: Option<String>,
    pub gemini_live_url: Option<String>,
    pub log_level: Level,
}

fn secret_var(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url = std::env::var("BACKEND_URL").ok().filter(|v| !v.is_empty());
        if let Some(url) = &backend_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::InvalidValue("BACKEND_URL".to_string(), e.to_string()))?;
        }
        let backend_token = secret_var("BACKEND_TOKEN");

        let provider_str =
            std::env::var("REALTIME_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = provider_str
            .parse::<ProviderKind>()
            .map_err(|e| ConfigError::InvalidValue("REALTIME_PROVIDER".to_string(), e.to_string()))?;

        let openai_api_key = secret_var("OPENAI_API_KEY");
        let gemini_api_key = secret_var("GEMINI_API_KEY");

        let voice = std::env::var("VOICE").ok();
        let instructions_path = std::env::var("INSTRUCTIONS_PATH").ok().map(PathBuf::from);
        let transcription_language = std::env::var("TRANSCRIPTION_LANGUAGE").ok();
        let openai_realtime_url = std::env::var("OPENAI_REALTIME_URL").ok();
        let gemini_live_url = std::env::var("GEMINI_LIVE_URL").ok();

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        if backend_url.is_none() {
            match provider {
                ProviderKind::Peer if openai_api_key.is_none() => {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider without BACKEND_URL"
                            .to_string(),
                    ));
                }
                ProviderKind::DuplexSocket if gemini_api_key.is_none() => {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider without BACKEND_URL"
                            .to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(Self {
            backend_url,
            backend_token,
            provider,
            openai_api_key,
            gemini_api_key,
            voice,
            instructions_path,
            transcription_language,
            openai_realtime_url,
            gemini_live_url,
            log_level,
        })
    }

    /// Where each `connect()` gets its descriptor.
    pub fn negotiator(&self, instructions: Option<&str>) -> Arc<dyn SessionNegotiator> {
        if let Some(url) = &self.backend_url {
            let mut negotiator = HttpNegotiator::new(url.clone());
            if let Some(token) = &self.backend_token {
                negotiator = negotiator
                    .with_bearer_token(SecretString::from(token.expose_secret().to_owned()));
            }
            return Arc::new(negotiator);
        }

        let key = match self.provider {
            ProviderKind::Peer => self.openai_api_key.as_ref(),
            ProviderKind::DuplexSocket => self.gemini_api_key.as_ref(),
        };
        let credential = key.map(|k| k.expose_secret().to_owned()).unwrap_or_default();
        let mut negotiator = StaticNegotiator::new(self.provider, SecretString::from(credential));
        if let Some(voice) = &self.voice {
            negotiator = negotiator.voice(voice.clone());
        }
        if let Some(instructions) = instructions {
            negotiator = negotiator.instructions(instructions);
        }
        Arc::new(negotiator)
    }

    pub fn session_config(&self, opening_prompt: String) -> SessionConfig {
        let mut peer = PeerSettings::default();
        let mut duplex = DuplexSettings::default();
        if let Some(url) = &self.openai_realtime_url {
            peer.sdp_url = url.clone();
        }
        if let Some(url) = &self.gemini_live_url {
            duplex.socket_url = url.clone();
        }
        if let Some(voice) = &self.voice {
            peer.voice = voice.clone();
            duplex.voice = voice.clone();
        }
        peer.transcription_language = self.transcription_language.clone();
        SessionConfig {
            peer,
            duplex,
            opening_prompt,
            ..SessionConfig::default()
        }
    }
}
