use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use beacon_voice::Config;
use beacon_voice::api::ApiServer;
use beacon_voice::audio::{ChannelFrameSource, read_wav_frames};
use beacon_voice::generation::GenerationRouter;
use beacon_voice::recognition::RecognitionRouter;
use beacon_voice::session::{SessionCoordinator, SessionManager, SessionParts};
use beacon_voice::transport::ChannelTransport;
use beacon_voice::vad::{EnergyClassifier, SegmentEvent, SegmenterConfig, VoiceActivityDetector};

/// Frame size used when replaying recorded audio
const SIMULATED_FRAME_MS: u32 = 20;

/// Beacon Voice - real-time voice front-end for AI assistant gateways
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Config file (defaults to the standard config path)
    #[arg(short, long, env = "BEACON_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Accept device connections (default)
    Serve,
    /// Validate configuration and backend options, then print them
    CheckConfig,
    /// Segment a WAV file and print the segmentation events
    Simulate {
        /// 16-bit PCM WAV file
        wav: PathBuf,
        /// Run a full session against the configured backends and print
        /// what the device would receive
        #[arg(long)]
        session: bool,
        /// Feed frames at their real duration instead of as fast as possible
        #[arg(long, requires = "session")]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
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
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::CheckConfig => check_config(&config),
        Command::Simulate {
            wav,
            session: false,
            ..
        } => segment(&config, &wav),
        Command::Simulate { wav, realtime, .. } => simulate(config, &wav, realtime).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Fail on bad backend options now rather than at the first connection
    RecognitionRouter::build(&config.recognition)?;
    GenerationRouter::build(&config.generation)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        recognition = %config.recognition.provider,
        generation = %config.generation.provider,
        auth = %config.auth.mode,
        "starting beacon voice"
    );

    let server = ApiServer::new(Arc::new(SessionManager::new(config)));
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    let recognizer = RecognitionRouter::build(&config.recognition)?;
    let generator = GenerationRouter::build(&config.generation)?;

    println!("{}", serde_json::to_string_pretty(&config.redacted())?);
    println!("---");
    println!("recognition backend: {}", recognizer.name());
    println!("generation backend:  {}", generator.name());
    Ok(())
}

fn segment(config: &Config, wav: &Path) -> anyhow::Result<()> {
    let frames = read_wav_frames(wav, SIMULATED_FRAME_MS)?;
    let classifier = Arc::new(EnergyClassifier::new(config.vad.energy_threshold));
    let mut vad = VoiceActivityDetector::new(classifier, SegmenterConfig::from(&config.vad));

    let mut utterances = 0usize;
    let mut last_seq = 0;
    for frame in &frames {
        last_seq = frame.seq();
        if let (_, Some(event)) = vad.process(frame)
            && event != SegmentEvent::Continue
        {
            utterances += usize::from(matches!(event, SegmentEvent::Start));
            print_segment(frame.seq(), &event)?;
        }
    }
    if let Some(event) = vad.flush() {
        print_segment(last_seq, &event)?;
    }

    tracing::info!(frames = frames.len(), utterances, "segmentation finished");
    Ok(())
}

fn print_segment(seq: u64, event: &SegmentEvent) -> anyhow::Result<()> {
    let line = serde_json::json!({ "seq": seq, "event": event });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn simulate(config: Config, wav: &Path, realtime: bool) -> anyhow::Result<()> {
    let frames = read_wav_frames(wav, SIMULATED_FRAME_MS)?;
    tracing::info!(path = %wav.display(), frames = frames.len(), "replaying recording");

    let publish_timeout = Duration::from_millis(config.server.publish_timeout_ms);
    let (transport, mut payloads) = ChannelTransport::channel(64, publish_timeout);
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let coordinator = SessionCoordinator::new(
        "simulator",
        &config,
        SessionParts {
            recognizer: RecognitionRouter::build(&config.recognition)?,
            generator: GenerationRouter::build(&config.generation)?,
            transport: Arc::new(transport),
            classifier: Arc::new(EnergyClassifier::new(config.vad.energy_threshold)),
        },
    )
    .with_events(events_tx);

    let (frame_tx, source) = ChannelFrameSource::channel(64);
    let session = tokio::spawn(coordinator.run(source));

    tokio::spawn(async move {
        for frame in frames {
            let pace = frame.duration();
            if frame_tx.send(frame).await.is_err() {
                break;
            }
            if realtime {
                tokio::time::sleep(pace).await;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "session event");
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(payload) = payloads.recv().await {
            match serde_json::to_string(&payload) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to encode payload"),
            }
        }
    });

    let report = session.await??;
    printer.await?;
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
