use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use duplex_voice::db::{self, ConversationRepo};
use duplex_voice::providers::resolve_synthesizer;
use duplex_voice::voice::{
    AudioCapture, AudioFormat, AudioFragment, FrameSplitter, PlaybackQueue, rms,
};
use duplex_voice::{Config, Daemon};

/// Duplex - real-time spoken conversation with barge-in
#[derive(Parser)]
#[command(name = "duplex", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Listen and converse until Ctrl-C (default)
    Run,
    /// Answer one typed message out loud
    Say {
        /// What to say to the assistant
        text: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Show recently logged turns
    History {
        /// Number of turns to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,duplex_voice=info",
        1 => "info,duplex_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!("starting duplex");
            Daemon::new(config)?.run().await?;
        }
        Command::Say { text } => {
            let summary = Daemon::new(config)?.say(&text).await?;
            println!("{}", summary.assistant_text);
            println!("[{}]", summary.outcome);
        }
        Command::TestMic { duration } => test_mic(&config, duration).await?,
        Command::TestSpeaker => test_speaker(&config).await?,
        Command::TestTts { text } => test_tts(&config, &text).await?,
        Command::History { limit } => history(&config, limit)?,
    }

    Ok(())
}

/// Test microphone input against the gate threshold
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::with_sample_rate(config.capture.sample_rate)?;
    capture.start()?;

    let threshold = config.gate.threshold;
    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("Gate threshold: {threshold:.4}");
    println!("---");

    let mut splitter = FrameSplitter::new(config.capture.frame_size);
    for second in 1..=duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let frames = splitter.push(&capture.take_buffer());
        let levels: Vec<f32> = frames.iter().map(|f| rms(&f.samples)).collect();
        let loud = levels.iter().filter(|level| **level > threshold).count();
        let peak = levels.iter().copied().fold(0.0_f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bar = "#".repeat((peak * 100.0).min(50.0) as usize);
        println!(
            "[{second:2}s] peak frame RMS {peak:.4} | {loud:3}/{} frames over threshold | {bar}",
            frames.len()
        );
    }

    capture.stop();

    println!("---");
    println!(
        "Speech starts after {} loud frames in a row; raise DUPLEX_VAD_THRESHOLD if room noise gets there too.",
        config.gate.activation_frames
    );

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = config.playback.sample_rate;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let bytes: Vec<u8> = (0..sample_rate * 2)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            // 30% volume
            let sample = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            ((sample * f32::from(i16::MAX)) as i16).to_le_bytes()
        })
        .collect();

    let mut playback = PlaybackQueue::open(sample_rate)?;
    playback.set_volume(config.playback.volume);
    playback.enqueue(&AudioFragment {
        seq: 1,
        format: AudioFormat::Pcm16 { sample_rate },
        bytes,
    })?;
    playback.wait_idle().await;
    playback.destroy();

    println!("Done. No tone means the default output device is wrong or muted.");

    Ok(())
}

/// Test the configured TTS provider
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing {} TTS with text: \"{text}\"\n", config.providers.tts);

    let synthesizer = resolve_synthesizer(config)?
        .ok_or_else(|| anyhow::anyhow!("TTS provider is 'none' (text-only mode)"))?;

    println!("Synthesizing speech...");
    let audio = synthesizer.synthesize(text).await?;
    println!("Got {} bytes of {:?} audio", audio.bytes.len(), audio.format);

    println!("Playing audio...");
    let mut playback = PlaybackQueue::open(config.playback.sample_rate)?;
    playback.set_volume(config.playback.volume);
    playback.enqueue(&AudioFragment {
        seq: 1,
        format: audio.format,
        bytes: audio.bytes,
    })?;
    playback.wait_idle().await;
    playback.destroy();

    println!("Done.");

    Ok(())
}

/// Print recently logged turns
fn history(config: &Config, limit: usize) -> anyhow::Result<()> {
    let pool = db::init(config.database_path())?;
    let repo = ConversationRepo::new(pool);

    let entries = repo.recent(limit)?;
    if entries.is_empty() {
        println!("No conversations logged yet");
        return Ok(());
    }

    for entry in entries.iter().rev() {
        let latency = entry
            .first_audio_ms
            .or(entry.llm_first_ms)
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        println!(
            "{} [{}] {}/{}/{} first audio {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.outcome,
            entry.stt_provider,
            entry.llm_provider,
            entry.tts_provider,
            latency
        );
        println!("  you: {}", entry.user_text);
        println!("  assistant: {}", entry.assistant_text);
        if let Some(error) = &entry.error {
            println!("  error: {error}");
        }
    }

    Ok(())
}
