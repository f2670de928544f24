//! DebateArena CLI
//!
//! Hosts real-time debate sessions over WebSockets, or runs an all-AI
//! debate in the terminal.

mod console;
mod server;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use debatearena_core::config::{SynthesisProvider, TransportKind};
use debatearena_core::debate_format;
use debatearena_core::{
    ApiConfig, AudioPipeline, BufferedSynthesizer, Config, DebateError, DiscardSink,
    HttpSynthesizer, JsonFileSink, KokoroSynthesizer, OpenAiGenerator, SessionContext,
    Team, TranscriptSink, WebSocketConnector, default_config,
};
use debatearena_core::stream_client::StreamConnector;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "debatearena",
    version,
    about = "DebateArena - live, timed debates between humans and AIs",
    long_about = "Hosts real-time debate sessions with AI speakers, streamed speech audio and a phase clock."
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the event protocol over WebSockets
    Serve {
        /// Address to listen on, overriding the config
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Run an all-AI debate and print it to the terminal
    Simulate {
        /// The topic to debate
        #[arg(value_name = "TOPIC")]
        topic: String,

        /// Model names for participants, in speaking order (PRO 1, CON 1, PRO 2, CON 2)
        #[arg(short, long, action = ArgAction::Append, value_name = "MODEL")]
        model: Vec<String>,

        /// Names for the participants (optional, same order as models)
        #[arg(long, action = ArgAction::Append, value_name = "NAME")]
        name: Vec<String>,

        /// Multiplier for built-in phase durations
        #[arg(long, value_name = "SCALE")]
        time_scale: Option<f32>,

        /// Synthesize speech audio as well
        #[arg(long)]
        audio: bool,
    },
    /// List available debate formats
    Formats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => default_config(),
    };

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let ctx = build_context(config).await?;
            server::serve(ctx).await?;
        }
        Command::Simulate {
            topic,
            model,
            name,
            time_scale,
            audio,
        } => {
            if let Some(scale) = time_scale {
                config.timing.time_scale = scale;
            }
            if !audio {
                config.synthesis.provider = SynthesisProvider::None;
            }
            config.server.transport = TransportKind::Channel;
            console::check_roster_size(&config, model.len())?;
            let ctx = build_context(config).await?;
            console::simulate(ctx, topic, model, name).await?;
        }
        Command::Formats => print_formats(&config)?,
    }

    Ok(())
}

/// Assemble the process-wide collaborators from config and environment.
async fn build_context(mut config: Config) -> Result<SessionContext, DebateError> {
    // Verify the format resolves before anything is started.
    config.format()?;

    let api_base = env::var("OPENAI_API_BASE")
        .or_else(|_| env::var("OPENAI_BASE_URL"))
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

    let api_key = env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
        String::new()
    });

    let generator = Arc::new(OpenAiGenerator::new(
        ApiConfig::new(api_base, api_key),
        config.clone(),
    )?);

    let audio = build_audio(&mut config).await?;

    let sink: Arc<dyn TranscriptSink> = match &config.server.transcript_dir {
        Some(dir) => Arc::new(JsonFileSink::new(dir.clone())),
        None => Arc::new(DiscardSink),
    };

    let transport = debatearena_core::transport::from_config(&config.server);

    Ok(SessionContext {
        config: Arc::new(config),
        transport,
        generator,
        audio,
        sink,
    })
}

async fn build_audio(config: &mut Config) -> Result<Option<Arc<AudioPipeline>>, DebateError> {
    let tts_key = || {
        env::var("TTS_API_KEY").unwrap_or_else(|_| {
            eprintln!(
                "{}",
                "Warning: TTS_API_KEY not set. Speech synthesis may fail.".yellow()
            );
            String::new()
        })
    };
    if let Ok(base) = env::var("TTS_API_BASE") {
        config.synthesis.api_base = base;
    }

    let (connector, buffered): (
        Option<Arc<dyn StreamConnector>>,
        Option<Arc<dyn BufferedSynthesizer>>,
    ) = match config.synthesis.provider {
        SynthesisProvider::None => return Ok(None),
        SynthesisProvider::Http => {
            let key = tts_key();
            (
                Some(Arc::new(WebSocketConnector::new(&config.synthesis, key.clone()))),
                Some(Arc::new(HttpSynthesizer::new(&config.synthesis, key)?)),
            )
        }
        SynthesisProvider::Kokoro => {
            println!("{}", "Initializing TTS engine...".dimmed());
            let kokoro = KokoroSynthesizer::new().await?;
            kokoro.validate_voice(config.get_voice(Team::Pro))?;
            kokoro.validate_voice(config.get_voice(Team::Con))?;
            (None, Some(Arc::new(kokoro)))
        }
    };

    Ok(Some(Arc::new(AudioPipeline::new(
        connector,
        buffered,
        &config.streaming,
    ))))
}

fn print_formats(config: &Config) -> Result<(), DebateError> {
    println!();
    println!("{}", "Available formats:".bold());
    let names = debate_format::available_formats()
        .into_iter()
        .map(str::to_string)
        .chain(config.formats.iter().map(|f| f.name.clone()));
    for name in names {
        let mut candidate = config.clone();
        candidate.timing.format = name.clone();
        let format = candidate.format()?;
        let total: u32 = format.phases().iter().map(|p| p.duration_secs).sum();
        println!(
            "  {} - {} ({} phases, {} participants, {}s)",
            name.bright_cyan(),
            format.display_name(),
            format.phases().len(),
            format.participant_count(),
            total
        );
        for phase in format.phases() {
            println!(
                "      {:<24} {:>4}s  {}",
                phase.name,
                phase.duration_secs,
                phase.description.dimmed()
            );
        }
    }
    println!();
    Ok(())
}
