use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vox_bridge::cache::PhraseLabel;
use vox_bridge::chat::StreamChat;
use vox_bridge::session::{default_check_ins, default_greetings};
use vox_bridge::tts::Synthesize;
use vox_bridge::{ChatClient, Config, Metrics, TtsCache, TtsClient};

/// Vox Bridge - voice-conversation bridge for OpenClaw agents
#[derive(Parser)]
#[command(name = "voxbridge", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VOXBRIDGE_CONFIG", default_value = "voxbridge.toml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pre-synthesise the baked phrase store for the configured voice
    Bake,
    /// Synthesise a line of text and write the audio to a file
    Say {
        /// Text to speak
        text: String,
        /// Output file
        #[arg(short, long, default_value = "out.mp3")]
        output: PathBuf,
    },
    /// Send one prompt through the chat gateway and print the reply
    /// sentence by sentence
    Ask {
        /// Prompt text
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,vox_bridge=info",
        1 => "info,vox_bridge=debug",
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
    let config = Config::load(&cli.config)?;
    let http = reqwest::Client::new();

    match cli.command {
        Command::Bake => bake(&config, &http).await,
        Command::Say { text, output } => say(&config, &http, &text, &output).await,
        Command::Ask { prompt } => ask(&config, &http, &prompt).await,
    }
}

/// Pre-warm the baked phrase store so a fresh session can greet without
/// a synthesis round-trip
async fn bake(config: &Config, http: &reqwest::Client) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let cache = TtsCache::new(metrics);
    let tts = TtsClient::new(http.clone(), config.tts.clone());

    for (phrases, label) in [
        (default_greetings(), PhraseLabel::Greetings),
        (default_check_ins(), PhraseLabel::CheckIns),
    ] {
        println!("Baking {} {} phrases...", phrases.len(), label.as_str());
        cache
            .pre_warm(&phrases, label, &tts, &config.tts, &config.cache)
            .await?;
    }

    println!(
        "Baked store ready at {}",
        config.cache.baked_phrases_dir.display()
    );
    Ok(())
}

/// Synthesise one line and write it to disk
async fn say(
    config: &Config,
    http: &reqwest::Client,
    text: &str,
    output: &std::path::Path,
) -> anyhow::Result<()> {
    let tts = TtsClient::new(http.clone(), config.tts.clone());

    println!("Synthesising: \"{text}\"");
    let audio = tts.synthesize(text).await?;
    std::fs::write(output, &audio)?;
    println!("Wrote {} bytes to {}", audio.len(), output.display());

    Ok(())
}

/// Stream one reply from the gateway, printing sentences as they
/// complete
async fn ask(config: &Config, http: &reqwest::Client, prompt: &str) -> anyhow::Result<()> {
    let chat = ChatClient::new(http.clone(), config.gateway.clone());
    let cancel = tokio_util::sync::CancellationToken::new();

    let mut on_sentence = |sentence: String| -> vox_bridge::chat::SentenceFuture {
        Box::pin(async move {
            println!("> {sentence}");
        })
    };

    let full = chat.stream_reply(prompt, &cancel, &mut on_sentence).await?;
    println!("---\n{} chars total", full.len());

    Ok(())
}
