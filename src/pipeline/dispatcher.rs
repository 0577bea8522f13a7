//! Ordered synthesis dispatch
//!
//! Every submitted sentence starts synthesizing right away on its own task,
//! so a slow sentence never delays the ones after it. The same task decodes
//! the audio for playback off the async workers. Results come back in
//! whatever order the provider finishes them and pass through a
//! [`ReorderBuffer`], which releases them strictly by sequence index. A
//! failed sentence still occupies its slot: it is released as
//! [`Delivery::Failed`] and the sequence moves on. A synthesizer that panics
//! counts as a failure of its own sentence.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::segmenter::{FIRST_SEQ, SentenceFragment};
use crate::providers::Synthesizer;
use crate::voice::{AudioFragment, DecodedFragment};
use crate::{Error, Result};

/// Holds out-of-order results until every earlier index has been released
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    held: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer expecting `first` as the first index
    #[must_use]
    pub const fn new(first: u64) -> Self {
        Self {
            next: first,
            held: BTreeMap::new(),
        }
    }

    /// Add a result and return every result that is now releasable, in order
    ///
    /// An index that was already released or is already held is an internal
    /// ordering bug; it is logged and dropped.
    pub fn insert(&mut self, seq: u64, item: T) -> Vec<T> {
        debug_assert!(
            seq >= self.next && !self.held.contains_key(&seq),
            "duplicate or stale sequence index {seq}"
        );
        if seq < self.next || self.held.contains_key(&seq) {
            tracing::error!(seq, next = self.next, "duplicate sequence index dropped");
            return Vec::new();
        }

        self.held.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.held.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Lowest index not yet released
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next
    }

    /// Number of results waiting on an earlier index
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

/// One released slot of the output sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Synthesized audio, decoded for playback
    Audio(DecodedFragment),
    /// Synthesis failed; the slot is skipped
    Failed {
        /// Sequence index of the failed sentence
        seq: u64,
        /// Failure description
        error: String,
    },
}

impl Delivery {
    /// Sequence index of this slot
    #[must_use]
    pub const fn seq(&self) -> u64 {
        match self {
            Self::Audio(fragment) => fragment.seq,
            Self::Failed { seq, .. } => *seq,
        }
    }
}

/// Totals reported once the dispatcher is drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Sentences submitted
    pub submitted: u64,
    /// Audio fragments released
    pub delivered: u64,
    /// Failed slots released
    pub failed: u64,
    /// Results dropped because the turn was cancelled
    pub discarded: u64,
    /// Sum of per-sentence synthesis time
    pub synthesis: Duration,
}

/// A synthesis task's result
struct Completion {
    seq: u64,
    result: Result<DecodedFragment>,
    elapsed: Duration,
}

/// Runs synthesis concurrently and releases results in sequence order
pub struct SynthesisDispatcher {
    synthesizer: Arc<dyn Synthesizer>,
    output_rate: u32,
    cancel: CancellationToken,
    completions: Option<mpsc::UnboundedSender<Completion>>,
    sequencer: Option<JoinHandle<DispatchStats>>,
    submitted: u64,
}

impl SynthesisDispatcher {
    /// Create a dispatcher and the channel its ordered output arrives on
    ///
    /// Audio is decoded to mono at `output_rate`. Once `cancel` fires
    /// nothing more is released and the output channel closes.
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        output_rate: u32,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let sequencer = tokio::spawn(sequence(completion_rx, delivery_tx, cancel.clone()));

        let dispatcher = Self {
            synthesizer,
            output_rate,
            cancel,
            completions: Some(completion_tx),
            sequencer: Some(sequencer),
            submitted: 0,
        };
        (dispatcher, delivery_rx)
    }

    /// Start synthesizing a sentence without waiting for it
    pub fn submit(&mut self, fragment: SentenceFragment) {
        let Some(completions) = self.completions.clone() else {
            tracing::warn!(seq = fragment.seq, "dispatcher closed, sentence dropped");
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }

        self.submitted += 1;
        let synthesizer = Arc::clone(&self.synthesizer);
        let output_rate = self.output_rate;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let seq = fragment.seq;
            let started = Instant::now();

            let work = AssertUnwindSafe(render(synthesizer, fragment, output_rate)).catch_unwind();
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::trace!(seq, "synthesis abandoned");
                    return;
                }
                result = work => result.unwrap_or_else(|panic| {
                    Err(Error::Tts(format!("synthesizer panicked: {}", panic_message(&*panic))))
                }),
            };

            // Sequencer gone means the turn is over
            let _ = completions.send(Completion {
                seq,
                result,
                elapsed: started.elapsed(),
            });
        });
    }

    /// Stop accepting sentences
    ///
    /// The output channel closes after the last outstanding result is
    /// released.
    pub fn close(&mut self) {
        self.completions = None;
    }

    /// Number of sentences submitted
    #[must_use]
    pub const fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Close and wait for all outstanding work
    pub async fn drain(mut self) -> DispatchStats {
        self.close();

        let mut stats = match self.sequencer.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "sequencer task failed");
                DispatchStats::default()
            }),
            None => DispatchStats::default(),
        };
        stats.submitted = self.submitted;
        stats
    }
}

/// Synthesize one sentence and decode it for playback
async fn render(
    synthesizer: Arc<dyn Synthesizer>,
    fragment: SentenceFragment,
    output_rate: u32,
) -> Result<DecodedFragment> {
    let audio = synthesizer.synthesize(&fragment.text).await?;
    let encoded = AudioFragment {
        seq: fragment.seq,
        format: audio.format,
        bytes: audio.bytes,
    };

    tokio::task::spawn_blocking(move || encoded.decode(output_rate))
        .await
        .map_err(|e| Error::Decode(format!("decoder task failed: {e}")))?
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Release completions in sequence order until input closes or the turn is
/// cancelled
async fn sequence(
    mut completions: mpsc::UnboundedReceiver<Completion>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    cancel: CancellationToken,
) -> DispatchStats {
    let mut reorder = ReorderBuffer::new(FIRST_SEQ);
    let mut stats = DispatchStats::default();

    loop {
        let completion = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            completion = completions.recv() => match completion {
                Some(completion) => completion,
                None => break,
            },
        };

        stats.synthesis += completion.elapsed;
        let seq = completion.seq;
        let delivery = match completion.result {
            Ok(audio) => {
                tracing::debug!(
                    seq,
                    format = audio.format.as_str(),
                    samples = audio.samples.len(),
                    elapsed_ms = completion.elapsed.as_millis(),
                    "sentence synthesized"
                );
                Delivery::Audio(audio)
            }
            Err(e) => {
                tracing::warn!(seq, error = %e, "synthesis failed, skipping sentence");
                Delivery::Failed {
                    seq,
                    error: e.to_string(),
                }
            }
        };

        for ready in reorder.insert(seq, delivery) {
            let failed = matches!(ready, Delivery::Failed { .. });
            if deliveries.send(ready).is_err() {
                stats.discarded += 1;
                continue;
            }
            if failed {
                stats.failed += 1;
            } else {
                stats.delivered += 1;
            }
        }
    }

    let held = reorder.held();
    if cancel.is_cancelled() {
        stats.discarded += held as u64;
        tracing::debug!(held, next = reorder.next_seq(), "dispatch cancelled");
    } else if held > 0 {
        tracing::error!(held, next = reorder.next_seq(), "dispatch ended with a gap");
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_releases_in_order() {
        let mut buffer = ReorderBuffer::new(1);

        assert!(buffer.insert(3, "c").is_empty());
        assert!(buffer.insert(2, "b").is_empty());
        assert_eq!(buffer.held(), 2);

        assert_eq!(buffer.insert(1, "a"), vec!["a", "b", "c"]);
        assert_eq!(buffer.next_seq(), 4);
        assert_eq!(buffer.insert(4, "d"), vec!["d"]);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_reorder_drops_duplicates() {
        let mut buffer = ReorderBuffer::new(1);
        assert_eq!(buffer.insert(1, "a"), vec!["a"]);
        assert!(buffer.insert(1, "again").is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate or stale")]
    #[cfg(debug_assertions)]
    fn test_reorder_duplicate_is_a_bug() {
        let mut buffer = ReorderBuffer::new(1);
        buffer.insert(1, "a");
        buffer.insert(1, "again");
    }

    #[test]
    fn test_delivery_seq() {
        let failed = Delivery::Failed {
            seq: 7,
            error: "boom".to_string(),
        };
        assert_eq!(failed.seq(), 7);
    }
}
