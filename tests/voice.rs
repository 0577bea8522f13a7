//! Voice pipeline integration tests
//!
//! Tests gating and playback without requiring audio hardware

use std::time::Duration;

use tokio::sync::mpsc;

use duplex_voice::voice::{
    AudioFormat, AudioFragment, AudioFrame, CaptureGate, FrameProcessor, GateConfig, GateState,
    ListenerConfig, PLAYBACK_SAMPLE_RATE, PlaybackEvent, PlaybackQueue, SAMPLE_RATE,
    SpeechEventKind, samples_to_wav,
};

mod common;

/// Frame whose RMS equals `level`
fn frame(seq: u64, level: f32) -> AudioFrame {
    AudioFrame {
        seq,
        samples: vec![level; 160],
    }
}

fn gate_config() -> GateConfig {
    GateConfig {
        threshold: 0.01,
        activation_frames: 3,
        silence_frames: 5,
    }
}

#[test]
fn test_gate_hysteresis() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut gate = CaptureGate::new(gate_config(), tx);
    let mut seq = 0;
    let mut feed = |gate: &mut CaptureGate, level: f32| {
        seq += 1;
        gate.process(&frame(seq, level))
    };

    assert!(!feed(&mut gate, 0.02));
    assert!(!feed(&mut gate, 0.02));
    assert!(rx.try_recv().is_err());

    // Third consecutive loud frame starts speech
    assert!(feed(&mut gate, 0.02));
    assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechStart);

    for _ in 0..4 {
        assert!(feed(&mut gate, 0.0));
    }
    assert!(rx.try_recv().is_err());

    // Fifth quiet frame ends it
    assert!(!feed(&mut gate, 0.0));
    assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechEnd);
    assert_eq!(gate.state(), GateState::Idle);
}

#[test]
fn test_gate_broken_activation_run_does_not_start() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut gate = CaptureGate::new(gate_config(), tx);

    for (seq, level) in [0.02, 0.02, 0.0, 0.02, 0.02].into_iter().enumerate() {
        gate.process(&frame(seq as u64, level));
    }

    assert!(!gate.is_speaking());
    assert_eq!(gate.state(), GateState::Activating);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_gate_loud_frame_resets_silence_count() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut gate = CaptureGate::new(gate_config(), tx);

    for seq in 0..3 {
        gate.process(&frame(seq, 0.5));
    }
    for seq in 3..7 {
        gate.process(&frame(seq, 0.0));
    }
    // One loud frame inside the grace period keeps speech going
    gate.process(&frame(7, 0.5));
    for seq in 8..12 {
        assert!(gate.process(&frame(seq, 0.0)));
    }

    assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechStart);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_frame_processor_splits_raw_samples() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ListenerConfig {
        gate: gate_config(),
        sample_rate: SAMPLE_RATE,
        frame_size: 160,
        pre_roll_frames: 2,
        min_utterance: Duration::ZERO,
    };
    let mut processor = FrameProcessor::new(&config, tx);

    // Pushes that don't align with frame boundaries
    let loud = vec![0.3; 160 * 4];
    for chunk in loud.chunks(100) {
        assert!(processor.feed(chunk).is_empty());
    }
    assert!(processor.is_speaking());

    let quiet = vec![0.0; 160 * 5];
    let done: Vec<_> = quiet.chunks(70).flat_map(|c| processor.feed(c)).collect();

    assert_eq!(done.len(), 1);
    assert_eq!(done[0].samples.len(), 160 * 9);
    assert_eq!(done[0].sample_rate, SAMPLE_RATE);
    assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechStart);
    assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechEnd);
}

#[test]
fn test_interrupt_cuts_and_clears() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    let mut events = queue.subscribe();
    let renderer = queue.renderer();

    queue.enqueue(&common::pcm_fragment(1, 100)).unwrap();
    queue.enqueue(&common::pcm_fragment(2, 100)).unwrap();

    // Partway through fragment 1
    let mut buf = vec![0.0; 40];
    renderer.render(&mut buf, 1);
    assert!(buf.iter().all(|s| *s > 0.0));

    queue.interrupt();
    assert!(!queue.is_playing());
    assert_eq!(queue.queued(), 0);

    // Next buffer is silence and fragment 2 never starts
    renderer.render(&mut buf, 1);
    assert!(buf.iter().all(|s| *s == 0.0));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![PlaybackEvent::Started { seq: 1 }, PlaybackEvent::Interrupted]
    );
}

#[test]
fn test_interrupt_when_idle_is_silent() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    let mut events = queue.subscribe();

    queue.interrupt();
    assert!(events.try_recv().is_err());
}

#[test]
fn test_destroy_is_idempotent_and_final() {
    let mut queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(&common::pcm_fragment(1, 100)).unwrap();

    queue.destroy();
    queue.destroy();

    assert!(queue.is_destroyed());
    assert!(!queue.is_playing());
    assert!(queue.enqueue(&common::pcm_fragment(2, 100)).is_err());
}

#[test]
fn test_undecodable_fragment_skipped() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);

    let broken = AudioFragment {
        seq: 1,
        format: AudioFormat::Mp3,
        bytes: vec![0x13, 0x37, 0x00],
    };
    assert!(queue.enqueue(&broken).is_ok());
    assert!(!queue.is_playing());

    queue.enqueue(&common::pcm_fragment(2, 10)).unwrap();
    assert!(queue.is_playing());
}

#[test]
fn test_wav_fragment_plays() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    let renderer = queue.renderer();

    let samples = vec![0.25; 240];
    let wav = samples_to_wav(&samples, PLAYBACK_SAMPLE_RATE).unwrap();
    queue
        .enqueue(&AudioFragment {
            seq: 1,
            format: AudioFormat::Wav,
            bytes: wav,
        })
        .unwrap();

    let mut buf = vec![0.0; 240];
    renderer.render(&mut buf, 1);
    assert!((buf[0] - 0.25).abs() < 0.01);
    assert!(!queue.is_playing());
}

#[tokio::test]
async fn test_wait_idle_returns_after_drain() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(&common::pcm_fragment(1, 1000)).unwrap();
    queue.enqueue(&common::pcm_fragment(2, 1000)).unwrap();

    let driver = common::drive(queue.renderer());
    tokio::time::timeout(Duration::from_secs(2), queue.wait_idle())
        .await
        .expect("queue never drained");
    driver.abort();

    assert!(!queue.is_playing());
}

#[tokio::test]
async fn test_wait_idle_wakes_on_interrupt() {
    let queue = PlaybackQueue::headless(PLAYBACK_SAMPLE_RATE);
    queue.enqueue(&common::pcm_fragment(1, 1000)).unwrap();

    let (wait, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(2), queue.wait_idle()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.interrupt();
        }
    );
    assert!(wait.is_ok());
}
