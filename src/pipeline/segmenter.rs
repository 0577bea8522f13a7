//! Sentence segmentation of a streamed reply
//!
//! Text arrives in arbitrary deltas. The segmenter accumulates them and cuts
//! a fragment at the first `.`, `!` or `?` that is followed by whitespace or
//! sits at the very end of the buffer, repeating until no boundary is left.
//! Whatever remains at stream end is emitted as one final fragment.

use std::collections::VecDeque;

use futures::{Stream, StreamExt, stream};

use crate::Result;

/// Sequence index of the first fragment in a reply
pub const FIRST_SEQ: u64 = 1;

/// An incremental piece of generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    /// Arrival order within the reply, starting at 0
    pub index: u64,
    /// Text content
    pub text: String,
}

/// A complete unit of text ready for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceFragment {
    /// Strictly increasing sequence index, starting at [`FIRST_SEQ`]
    pub seq: u64,
    /// Trimmed sentence text (never empty)
    pub text: String,
}

/// Accumulates deltas and cuts them into sentence fragments
#[derive(Debug)]
pub struct Segmenter {
    buffer: String,
    next_seq: u64,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    /// Create an empty segmenter
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: String::new(),
            next_seq: FIRST_SEQ,
        }
    }

    /// Append text and return every fragment completed by it
    pub fn push(&mut self, text: &str) -> Vec<SentenceFragment> {
        self.buffer.push_str(text);

        let mut fragments = Vec::new();
        while let Some(cut) = find_boundary(&self.buffer) {
            let rest = self.buffer.split_off(cut);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            fragments.extend(self.make_fragment(&sentence));
        }
        fragments
    }

    /// Flush the remaining buffer as a final fragment
    pub fn finish(&mut self) -> Option<SentenceFragment> {
        let rest = std::mem::take(&mut self.buffer);
        self.make_fragment(&rest)
    }

    /// Text not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Number of fragments emitted so far
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.next_seq - FIRST_SEQ
    }

    fn make_fragment(&mut self, text: &str) -> Option<SentenceFragment> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        Some(SentenceFragment {
            seq,
            text: text.to_string(),
        })
    }
}

/// Byte offset just past the first sentence-terminal mark
fn find_boundary(buffer: &str) -> Option<usize> {
    let mut chars = buffer.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        match chars.peek() {
            None => return Some(pos + c.len_utf8()),
            Some((_, next)) if next.is_whitespace() => return Some(pos + c.len_utf8()),
            Some(_) => {}
        }
    }

    None
}

/// Turn a stream of deltas into a stream of fragments
///
/// A generation error is passed through, after which the buffered remainder
/// is flushed and the stream ends.
pub fn segment_stream<S>(deltas: S) -> impl Stream<Item = Result<SentenceFragment>>
where
    S: Stream<Item = Result<TextDelta>> + Unpin,
{
    struct State<S> {
        deltas: S,
        segmenter: Segmenter,
        ready: VecDeque<Result<SentenceFragment>>,
        done: bool,
    }

    let state = State {
        deltas,
        segmenter: Segmenter::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.deltas.next().await {
                Some(Ok(delta)) => {
                    state
                        .ready
                        .extend(state.segmenter.push(&delta.text).into_iter().map(Ok));
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.ready.push_back(Err(e));
                    state.ready.extend(state.segmenter.finish().map(Ok));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.segmenter.finish().map(Ok));
                }
            }
        }
    })
}
