use std::future::Future;
use tracing::info;
use voicelink_core::{VoiceResult, VoiceSession};

/// How the connect phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    Connected,
    ShutdownRequested,
}

/// Connects unless `shutdown` resolves first.
///
/// A cancelled or failed connect goes through the same teardown as
/// `disconnect()`, so nothing opened during negotiation outlives the process.
pub async fn connect_until<F>(session: &VoiceSession, shutdown: F) -> VoiceResult<Startup>
where
    F: Future,
{
    let result = tokio::select! {
        result = session.connect() => result,
        _ = shutdown => {
            info!("Received shutdown signal while connecting.");
            session.disconnect();
            return Ok(Startup::ShutdownRequested);
        }
    };
    match result {
        Ok(()) => Ok(Startup::Connected),
        Err(e) => {
            session.disconnect();
            Err(e)
        }
    }
}
