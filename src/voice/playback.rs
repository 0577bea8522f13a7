//! Audio playback queue
//!
//! Fragments are decoded on enqueue and appended to an ordered queue. The
//! output device pulls samples through a [`Renderer`]; when the current clip
//! runs out the next queued clip starts in the same callback, so fragments
//! play back-to-back and never overlap. [`PlaybackQueue::interrupt`] is a
//! hard cut: the queue is cleared and the current clip dropped, so the very
//! next device buffer is silence.
//!
//! The queue state is behind one mutex shared by the owner and the device
//! callback. Nothing else touches it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::{Notify, mpsc};

use super::decode::{AudioFragment, DecodedFragment};
use crate::{Error, Result};

/// Default playback sample rate (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Playback progress notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A fragment started playing
    Started {
        /// Fragment sequence index
        seq: u64,
    },
    /// A fragment played to the end
    Finished {
        /// Fragment sequence index
        seq: u64,
    },
    /// The queue ran empty after the last fragment finished
    Drained,
    /// Playback was cut by [`PlaybackQueue::interrupt`]
    Interrupted,
}

/// A decoded fragment
struct Clip {
    seq: u64,
    samples: Vec<f32>,
    pos: usize,
}

struct QueueState {
    queue: VecDeque<Clip>,
    current: Option<Clip>,
    destroyed: bool,
    events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
}

impl QueueState {
    fn emit(&self, event: PlaybackEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone just means nobody is listening
            let _ = tx.send(event);
        }
    }

    fn is_playing(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    gain: AtomicU32,
    idle: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pulls samples out of the queue for an output device
#[derive(Clone)]
pub struct Renderer {
    shared: Arc<Shared>,
}

impl Renderer {
    /// Fill an interleaved buffer with `channels` channels
    ///
    /// The mono signal is copied to every channel. Silence is written once
    /// the queue is empty.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let gain = f32::from_bits(self.shared.gain.load(Ordering::Relaxed));
        let mut state = self.shared.lock();
        let mut drained = false;

        for frame in out.chunks_mut(channels.max(1)) {
            let sample = next_sample(&mut state, &mut drained).map_or(0.0, |s| s * gain);
            frame.fill(sample);
        }

        drop(state);
        if drained {
            self.shared.idle.notify_waiters();
        }
    }
}

/// Take the next sample, advancing through the queue as clips finish
fn next_sample(state: &mut QueueState, drained: &mut bool) -> Option<f32> {
    loop {
        if state.current.is_none() {
            let next = state.queue.pop_front()?;
            state.emit(PlaybackEvent::Started { seq: next.seq });
            state.current = Some(next);
        }

        let clip = state.current.as_mut()?;
        let sample = clip.samples.get(clip.pos).copied();
        if sample.is_some() {
            clip.pos += 1;
        }

        if clip.pos >= clip.samples.len() {
            let seq = clip.seq;
            state.current = None;
            state.emit(PlaybackEvent::Finished { seq });
            if state.queue.is_empty() {
                state.emit(PlaybackEvent::Drained);
                *drained = true;
            }
        }

        if sample.is_some() {
            return sample;
        }
    }
}

/// Device thread holding the output stream alive
struct OutputThread {
    stop: std::sync::mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Ordered, interruptible audio playback
pub struct PlaybackQueue {
    shared: Arc<Shared>,
    sample_rate: u32,
    output: Option<OutputThread>,
}

impl PlaybackQueue {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no output device or config is available
    pub fn open(sample_rate: u32) -> Result<Self> {
        let mut queue = Self::headless(sample_rate);
        queue.output = Some(spawn_output(queue.renderer(), sample_rate)?);
        Ok(queue)
    }

    /// Create a queue with no output device
    ///
    /// Samples only advance when [`Renderer::render`] is called.
    #[must_use]
    pub fn headless(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    current: None,
                    destroyed: false,
                    events: None,
                }),
                gain: AtomicU32::new(1.0_f32.to_bits()),
                idle: Notify::new(),
            }),
            sample_rate,
            output: None,
        }
    }

    /// Handle for pulling samples (device callbacks, tests)
    #[must_use]
    pub fn renderer(&self) -> Renderer {
        Renderer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Receive playback progress events (replaces any earlier subscriber)
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().events = Some(tx);
        rx
    }

    /// Decode and append a fragment
    ///
    /// Never waits for playback. A fragment that fails to decode is logged
    /// and dropped; the rest of the queue is unaffected.
    ///
    /// # Errors
    ///
    /// Returns error only if the queue has been destroyed
    pub fn enqueue(&self, fragment: &AudioFragment) -> Result<()> {
        if self.shared.lock().destroyed {
            return Err(Error::Audio("playback queue destroyed".to_string()));
        }

        match fragment.decode(self.sample_rate) {
            Ok(decoded) => self.enqueue_decoded(decoded),
            Err(e) => {
                tracing::warn!(
                    seq = fragment.seq,
                    format = fragment.format.as_str(),
                    error = %e,
                    "failed to decode audio fragment, skipping"
                );
                Ok(())
            }
        }
    }

    /// Append a fragment already decoded at [`sample_rate`](Self::sample_rate)
    ///
    /// # Errors
    ///
    /// Returns error only if the queue has been destroyed
    pub fn enqueue_decoded(&self, fragment: DecodedFragment) -> Result<()> {
        let mut state = self.shared.lock();
        if state.destroyed {
            return Err(Error::Audio("playback queue destroyed".to_string()));
        }

        if fragment.samples.is_empty() {
            tracing::debug!(seq = fragment.seq, "empty audio fragment, skipping");
            return Ok(());
        }

        tracing::debug!(
            seq = fragment.seq,
            format = fragment.format.as_str(),
            samples = fragment.samples.len(),
            queued = state.queue.len(),
            "audio fragment queued"
        );
        state.queue.push_back(Clip {
            seq: fragment.seq,
            samples: fragment.samples,
            pos: 0,
        });
        Ok(())
    }

    /// Clear the queue and cut the current fragment immediately
    pub fn interrupt(&self) {
        let mut state = self.shared.lock();
        let cut = state.current.take().map(|clip| clip.seq);
        let dropped = state.queue.len();
        state.queue.clear();

        if cut.is_some() || dropped > 0 {
            state.emit(PlaybackEvent::Interrupted);
            tracing::info!(current = ?cut, dropped, "playback interrupted");
        }
        drop(state);

        self.shared.idle.notify_waiters();
    }

    /// Check if a fragment is playing or queued
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.lock().is_playing()
    }

    /// Number of fragments waiting behind the current one
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Set output gain (clamped to 0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.shared.gain.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Current output gain
    #[must_use]
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.gain.load(Ordering::Relaxed))
    }

    /// Playback sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Wait until nothing is playing or queued
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_playing() {
                return;
            }
            notified.await;
        }
    }

    /// Interrupt and release the output device
    ///
    /// Safe to call more than once; later calls do nothing. The queue
    /// rejects further fragments afterwards.
    pub fn destroy(&mut self) {
        if self.shared.lock().destroyed {
            return;
        }

        self.interrupt();
        self.shared.lock().destroyed = true;

        if let Some(output) = self.output.take() {
            let _ = output.stop.send(());
            if output.handle.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }

        tracing::debug!("playback destroyed");
    }

    /// Check if [`destroy`](Self::destroy) has been called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Start the device thread
///
/// cpal streams aren't `Send`, so the stream lives on its own thread until
/// the stop signal arrives.
fn spawn_output(renderer: Renderer, sample_rate: u32) -> Result<OutputThread> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let handle = std::thread::Builder::new()
        .name("duplex-playback".to_string())
        .spawn(move || {
            let stream = match open_output_stream(renderer, sample_rate) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Returns on stop signal or when the queue is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })?;

    ready_rx
        .recv()
        .map_err(|_| Error::Audio("playback thread exited during startup".to_string()))??;

    Ok(OutputThread {
        stop: stop_tx,
        handle,
    })
}

/// Open the default output device, preferring mono
fn open_output_stream(renderer: Renderer, sample_rate: u32) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |channels: u16| {
        device.supported_output_configs().ok().and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == channels
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
    };

    let supported_config = supports(1)
        .or_else(|| supports(2))
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                renderer.render(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}
