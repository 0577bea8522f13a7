//! Streaming reply pipeline
//!
//! Generated text → [`Segmenter`] → [`SynthesisDispatcher`] → playback, run
//! per [`Turn`] by the [`Coordinator`].

mod coordinator;
mod dispatcher;
mod segmenter;
mod turn;

pub use coordinator::{Backends, Coordinator, CoordinatorConfig, DEFAULT_HISTORY_LIMIT, TurnAborter};
pub use dispatcher::{Delivery, DispatchStats, ReorderBuffer, SynthesisDispatcher};
pub use segmenter::{FIRST_SEQ, Segmenter, SentenceFragment, TextDelta, segment_stream};
pub use turn::{
    ConversationSink, ProviderIds, Turn, TurnEvent, TurnOutcome, TurnSummary, TurnTimings,
};
