//! Provider vocabularies mapped onto [`CanonicalEvent`]s.
//!
//! One translator instance lives per transport and sees every inbound frame
//! in arrival order, so transcript accumulation stays consistent.

mod gemini;
mod openai;
mod transcript;

pub use gemini::DuplexTranslator;
pub use openai::PeerTranslator;
pub use transcript::TranscriptBuffer;

use crate::events::CanonicalEvent;

pub trait EventTranslator: Send {
    /// Translates one raw JSON frame. Frames that carry nothing the session
    /// cares about yield no events.
    fn translate(&mut self, frame: &str) -> Vec<CanonicalEvent>;
}
