//! Wire Types for Realtime Voice Providers
//!
//! Serde models for the two remote protocols spoken by `voicelink-core`:
//!
//! - `openai`: the OpenAI Realtime control-channel vocabulary (JSON events
//!   tagged by a `type` field), used over the WebRTC data channel.
//! - `gemini`: the Gemini Live bidirectional socket frames (externally tagged
//!   JSON objects such as `{"setup": {...}}`).
//!
//! Only the fields the connection manager reads or writes are modelled;
//! everything else is ignored on input.

pub mod gemini;
pub mod openai;
