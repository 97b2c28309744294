use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, mpsc};
use tracing_subscriber::EnvFilter;

use voice_relay::api::ApiServerBuilder;
use voice_relay::client::role_label;
use voice_relay::realtime::{ConnectLimiter, Transcript, WsConnector};
use voice_relay::voice::{
    CaptureConfig, CapturePipeline, CpalInput, DeviceOutput, PlaybackScheduler, decode_pcm16,
    peak, write_wav,
};
use voice_relay::{
    Bridge, BridgeEvent, BridgeHandle, BridgeSettings, Config, SessionId, VoiceClient,
};

/// Voice Relay - real-time voice streaming to a realtime speech API
#[derive(Parser)]
#[command(name = "voice-relay", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true, env = "VOICE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Never open the microphone
    #[arg(long, global = true)]
    no_capture: bool,

    /// Do not play audio locally
    #[arg(long, global = true)]
    mute: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket relay server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Speak text verbatim
    Speak {
        text: String,
        #[arg(long)]
        voice: Option<String>,
        /// Go through a relay server instead of the upstream endpoint
        #[arg(long)]
        relay: Option<String>,
    },
    /// Live conversation: microphone in, speech out; typed lines are spoken verbatim
    Converse {
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        relay: Option<String>,
    },
    /// Record from the microphone into a WAV file
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        #[arg(short, long, default_value = "mic-test.wav")]
        out: PathBuf,
    },
    /// Play a tone through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_relay=info",
        1 => "info,voice_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.audio.capture_enabled = !cli.no_capture;
    config.audio.muted = cli.mute;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(
                addr = %config.server.socket_addr(),
                voice = %config.upstream.voice,
                "starting voice relay"
            );
            ApiServerBuilder::new(config).build()?.run().await?;
            Ok(())
        }
        Command::Speak { text, voice, relay } => match relay {
            Some(url) => speak_via_relay(&config, &url, voice.as_deref(), text).await,
            None => speak(&config, voice.as_deref(), text).await,
        },
        Command::Converse { voice, relay } => match relay {
            Some(url) => converse_via_relay(&config, &url, voice.as_deref()).await,
            None => converse(&config, voice.as_deref()).await,
        },
        Command::TestMic { seconds, out } => test_mic(&config, seconds, &out).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Open the default output device behind a scheduler, unless muted
fn open_playback(config: &Config) -> anyhow::Result<Option<Arc<PlaybackScheduler>>> {
    if config.audio.muted {
        return Ok(None);
    }
    let output = DeviceOutput::open_default()?;
    Ok(Some(Arc::new(PlaybackScheduler::new(
        Arc::new(output),
        config.audio.scheduler_config(),
    ))))
}

fn local_bridge(
    config: &Config,
    playback: Option<&Arc<PlaybackScheduler>>,
    with_capture: bool,
) -> anyhow::Result<BridgeHandle> {
    let connector = Arc::new(WsConnector::from_config(&config.upstream)?);
    let mut builder = Bridge::builder(BridgeSettings::from_config(config), connector)
        .limiter(ConnectLimiter::new(config.timing.min_connect_interval));
    if let Some(playback) = playback {
        builder = builder.playback(Arc::clone(playback));
    }
    if with_capture {
        let pipeline = CapturePipeline::new(
            CpalInput::new(),
            config.audio.capture_config(),
            builder.capture_frames(),
        )
        .with_device_id(config.audio.input_device.clone());
        builder = builder.capture(Box::new(pipeline));
    }
    Ok(builder.spawn())
}

fn print_transcript(t: &Transcript) {
    if t.is_final {
        println!("[{}] {}", role_label(t.role), t.text);
    }
}

/// Let scheduled audio finish before tearing down the device
async fn drain_playback(playback: Option<&Arc<PlaybackScheduler>>, session: &SessionId) {
    if let Some(playback) = playback {
        tokio::time::sleep(playback.remaining(session) + Duration::from_millis(200)).await;
    }
}

async fn speak(config: &Config, voice: Option<&str>, text: String) -> anyhow::Result<()> {
    let playback = open_playback(config)?;
    let bridge = local_bridge(config, playback.as_ref(), false)?;
    let mut events = bridge.subscribe();

    let info = bridge.connect(voice).await?;
    bridge.send_text(text).await?;

    let mut chunks = 0usize;
    loop {
        match events.recv().await {
            Ok(BridgeEvent::AudioChunk(_)) => chunks += 1,
            Ok(BridgeEvent::Transcript(t)) => print_transcript(&t),
            Ok(BridgeEvent::ResponseComplete { .. }) => break,
            Ok(BridgeEvent::Error(e)) => anyhow::bail!("{}: {}", e.code, e.message),
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                anyhow::bail!("bridge stopped before the response completed")
            }
        }
    }
    tracing::info!(session_id = %info.session_id, chunks, "response complete");

    drain_playback(playback.as_ref(), &info.session_id).await;
    bridge.close().await;
    Ok(())
}

async fn speak_via_relay(
    config: &Config,
    url: &str,
    voice: Option<&str>,
    text: String,
) -> anyhow::Result<()> {
    let playback = open_playback(config)?;
    let done = Arc::new(Notify::new());
    let notify = Arc::clone(&done);

    let mut builder = VoiceClient::builder(url)?
        .retry(config.reconnect.clone())
        .on_transcript(print_transcript)
        .on_error(|e| eprintln!("error: {} ({})", e.message, e.code))
        .on_response_complete(move |_| notify.notify_one());
    if let Some(playback) = &playback {
        builder = builder.playback(Arc::clone(playback));
    }
    let client = builder.spawn();

    let session = client.connect(voice).await?;
    client.send_text(text).await?;
    done.notified().await;

    drain_playback(playback.as_ref(), &session).await;
    client.close().await;
    Ok(())
}

async fn converse(config: &Config, voice: Option<&str>) -> anyhow::Result<()> {
    let playback = open_playback(config)?;
    let bridge = local_bridge(config, playback.as_ref(), config.audio.capture_enabled)?;

    let mut events = bridge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::Transcript(t) => print_transcript(&t),
                BridgeEvent::Error(e) => eprintln!("error: {} ({})", e.message, e.code),
                _ => {}
            }
        }
    });

    bridge.connect(voice).await?;
    if config.audio.capture_enabled {
        bridge.start_capture().await?;
    }
    println!("Listening. Type a line to have it spoken, /stop to halt, Ctrl-C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/stop" => bridge.interrupt().await?,
                Some(line) => bridge.send_text(line).await?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bridge.stop().await?;
    bridge.close().await;
    Ok(())
}

async fn converse_via_relay(config: &Config, url: &str, voice: Option<&str>) -> anyhow::Result<()> {
    let playback = open_playback(config)?;

    let mut builder = VoiceClient::builder(url)?
        .retry(config.reconnect.clone())
        .on_transcript(print_transcript)
        .on_error(|e| eprintln!("error: {} ({})", e.message, e.code));
    if let Some(playback) = &playback {
        builder = builder.playback(Arc::clone(playback));
    }
    if config.audio.capture_enabled {
        let pipeline = CapturePipeline::new(
            CpalInput::new(),
            config.audio.capture_config(),
            builder.capture_frames(),
        )
        .with_device_id(config.audio.input_device.clone());
        builder = builder.capture(Box::new(pipeline));
    }
    let client = builder.spawn();

    client.connect(voice).await?;
    if config.audio.capture_enabled {
        client.start_capture().await?;
    }
    println!("Listening via {url}. Type a line to have it spoken, /stop to halt, Ctrl-C to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/stop" => client.interrupt().await?,
                Some(line) => client.send_text(line).await?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await?;
    client.close().await;
    Ok(())
}

/// Record the microphone at the wire rate and dump it to a WAV file
async fn test_mic(config: &Config, seconds: u64, out: &std::path::Path) -> anyhow::Result<()> {
    println!("Recording for {seconds} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::channel(64);
    // Keep silent frames so the recording has real timing
    let capture_config = CaptureConfig {
        silence_threshold: 0.0,
        ..config.audio.capture_config()
    };
    let wire_rate = capture_config.wire_rate;
    let mut pipeline = CapturePipeline::new(CpalInput::new(), capture_config, tx);
    pipeline.start(config.audio.input_device.as_deref(), &SessionId::from("test-mic"))?;

    let mut recorded = Vec::new();
    for i in 0..seconds {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut second = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            second.extend(decode_pcm16(frame.data()));
        }

        let level = peak(&second);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        println!("[{:2}s] Peak: {level:.4} | [{meter}]", i + 1);

        recorded.extend(second);
    }
    pipeline.stop();

    write_wav(out, &recorded, wire_rate)?;
    println!("\n---");
    println!("Wrote {} samples to {}", recorded.len(), out.display());
    println!("If the meter stayed near 0, check that the right input device is selected.");
    Ok(())
}

/// Play a 440 Hz tone through the scheduler in 100 ms buffers
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let output = DeviceOutput::open_default()?;
    let scheduler = PlaybackScheduler::new(Arc::new(output), config.audio.scheduler_config());
    let rate = scheduler.sample_rate();
    let session = SessionId::from("test-speaker");

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..rate * 2)
        .map(|i| {
            let t = i as f32 / rate as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3
        })
        .collect();

    let chunk = (rate / 10).max(1) as usize;
    for buffer in samples.chunks(chunk) {
        scheduler.enqueue(&session, buffer.to_vec());
    }
    println!("Scheduled {} samples at {rate} Hz", samples.len());

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::sleep(scheduler.remaining(&session) + Duration::from_millis(200)).await;

    println!("\n---");
    println!("If you heard the tone without clicks, playback scheduling works.");
    Ok(())
}
