//! Command-line front end for the voicelink session manager.

pub mod commands;
pub mod config;
pub mod devices;
pub mod lifecycle;
