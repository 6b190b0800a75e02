//! Audio plumbing shared by both transports: device traits, capture and
//! playback graphs, codecs and the waveform analyser.

pub mod capture;
pub mod devices;
pub mod g711;
pub mod pcm;
pub mod playback;
pub mod visualizer;
