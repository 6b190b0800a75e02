use super::devices::AudioOutput;
use super::visualizer::Analyser;
use crate::registry::{Release, ReleaseError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// FIFO of decoded inbound audio buffers.
///
/// Clearing bumps a generation counter so the player can abandon a buffer
/// that is already playing.
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    generation: watch::Sender<u64>,
}

struct QueueState {
    buffers: VecDeque<Vec<f32>>,
    closed: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffers: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            generation: watch::Sender::new(0),
        }
    }

    pub fn push(&self, buffer: Vec<f32>) {
        {
            let mut state = self.state.lock();
            if state.closed || buffer.is_empty() {
                return;
            }
            state.buffers.push_back(buffer);
        }
        self.notify.notify_one();
    }

    /// Drops every queued buffer and cuts off the one playing. Returns the
    /// number of queued buffers discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.buffers.len();
        state.buffers.clear();
        self.generation.send_modify(|g| *g += 1);
        dropped
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffers.clear();
            self.generation.send_modify(|g| *g += 1);
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Waits for the next buffer. `None` once the queue is closed.
    async fn next(&self) -> Option<(Vec<f32>, u64)> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(buffer) = state.buffers.pop_front() {
                    return Some((buffer, *self.generation.borrow()));
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SequentialPlayer;

impl SequentialPlayer {
    /// Plays queued buffers strictly in order; the next one starts only when
    /// the previous one has finished.
    pub fn spawn(
        queue: Arc<PlaybackQueue>,
        output: Arc<dyn AudioOutput>,
        tap: Arc<Analyser>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut generation = queue.generation.subscribe();
            while let Some((buffer, popped_at)) = queue.next().await {
                if *generation.borrow_and_update() != popped_at {
                    continue;
                }
                tap.push(&buffer);
                let finished = output.play(buffer);
                tokio::select! {
                    _ = finished => {}
                    changed = generation.changed() => {
                        output.stop();
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Sequential player stopped");
        })
    }
}

/// Registry handle for the duplex playback graph.
pub struct PlaybackGraph {
    pub queue: Arc<PlaybackQueue>,
    pub player: JoinHandle<()>,
}

impl Release for PlaybackGraph {
    fn release(self) -> Result<(), ReleaseError> {
        self.queue.close();
        self.player.abort();
        Ok(())
    }
}

/// Output wrapper feeding everything written into an analyser.
pub struct TappedOutput {
    inner: Arc<dyn AudioOutput>,
    tap: Arc<Analyser>,
}

impl TappedOutput {
    pub fn new(inner: Arc<dyn AudioOutput>, tap: Arc<Analyser>) -> Self {
        Self { inner, tap }
    }
}

impl AudioOutput for TappedOutput {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn write(&self, samples: &[f32]) {
        self.tap.push(samples);
        self.inner.write(samples);
    }

    fn play(&self, samples: Vec<f32>) -> oneshot::Receiver<()> {
        self.tap.push(&samples);
        self.inner.play(samples)
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn close(&self) -> Result<(), ReleaseError> {
        self.inner.close()
    }
}
