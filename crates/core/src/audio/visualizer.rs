use crate::config::VisualizationSettings;
use crate::registry::{Release, ReleaseError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_WINDOW: usize = 2048;

/// Read-only tap keeping the most recent samples of a signal.
pub struct Analyser {
    window: usize,
    state: Mutex<AnalyserState>,
}

struct AnalyserState {
    samples: VecDeque<f32>,
    detached: bool,
}

impl Analyser {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: Mutex::new(AnalyserState {
                samples: VecDeque::with_capacity(window),
                detached: false,
            }),
        }
    }

    pub fn push(&self, samples: &[f32]) {
        let mut state = self.state.lock();
        if state.detached {
            return;
        }
        let skip = samples.len().saturating_sub(self.window);
        state.samples.extend(&samples[skip..]);
        let excess = state.samples.len().saturating_sub(self.window);
        state.samples.drain(..excess);
    }

    /// `points` evenly spaced time-domain samples from the current window.
    pub fn snapshot(&self, points: usize) -> Vec<f32> {
        let state = self.state.lock();
        let len = state.samples.len();
        if len == 0 || points == 0 {
            return vec![0.0; points];
        }
        (0..points)
            .map(|i| state.samples[i * len / points])
            .collect()
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.detached = true;
        state.samples.clear();
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Registry handle for an analyser tap.
pub struct AnalyserHandle(pub Arc<Analyser>);

impl Release for AnalyserHandle {
    fn release(self) -> Result<(), ReleaseError> {
        self.0.detach();
        Ok(())
    }
}

/// The analysers a transport exposes for visualization.
#[derive(Clone)]
pub struct WaveformSources {
    pub capture: Arc<Analyser>,
    pub playback: Arc<Analyser>,
}

/// Scales samples so the loudest one has magnitude 1. Silence stays silent.
pub fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > f32::EPSILON {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

pub struct VisualizationSampler;

impl VisualizationSampler {
    /// Samples the playback analyser while the AI is speaking and the capture
    /// analyser otherwise, once per refresh interval. Stops as soon as
    /// `abort` is cancelled.
    pub fn spawn(
        sources: WaveformSources,
        settings: VisualizationSettings,
        abort: CancellationToken,
        is_speaking: impl Fn() -> bool + Send + 'static,
        emit: impl Fn(Vec<f32>) + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => break,
                    _ = ticker.tick() => {
                        let source = if is_speaking() { &sources.playback } else { &sources.capture };
                        let mut points = source.snapshot(settings.points);
                        normalize(&mut points);
                        emit(points);
                    }
                }
            }
            debug!("Visualization sampler stopped");
        })
    }
}
