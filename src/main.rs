//! pocketchat - chat with a local GGUF model from the terminal
//!
//! Usage:
//!   pocketchat -m model.gguf
//!   pocketchat -m model.gguf --no-history -t 0.2
//!   pocketchat --list
//!   pocketchat -m model.gguf --resume <id>

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocketchat::inference::{LlamaEngine, StreamToken};
use pocketchat::session::ResponseSummary;
use pocketchat::storage::settings::{load_settings, load_settings_from};
use pocketchat::storage::{Conversation, ConversationStore, SessionSettings};
use pocketchat::types::Turn;

/// Interactive chat with a local GGUF model
///
/// Settings are read from settings.json in the data directory (or --config)
/// and overridden by the flags below.
#[derive(Parser)]
#[command(name = "pocketchat", version)]
struct Cli {
    /// Path to a .gguf model file
    #[arg(short, long, env = "POCKETCHAT_MODEL")]
    model: Option<PathBuf>,

    /// Settings file to use instead of the default one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chat template (default: the template embedded in the model)
    #[arg(long)]
    chat_template: Option<String>,

    /// Context window size in tokens (default: the model's context length)
    #[arg(short = 'c', long)]
    context_size: Option<u32>,

    /// Sampling temperature
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Min-p sampling threshold
    #[arg(long)]
    min_p: Option<f32>,

    /// RNG seed for sampling (0 = random)
    #[arg(short, long)]
    seed: Option<u32>,

    /// Decoding threads
    #[arg(long)]
    threads: Option<u32>,

    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Forget each exchange once it is answered
    #[arg(long)]
    no_history: bool,

    /// System prompt for a new conversation
    #[arg(long)]
    system_prompt: Option<String>,

    /// Continue a saved conversation
    #[arg(long, value_name = "ID")]
    resume: Option<String>,

    /// List saved conversations and exit
    #[arg(long)]
    list: bool,

    /// Do not save the transcript
    #[arg(long)]
    no_save: bool,
}

impl Cli {
    fn apply(&self, settings: &mut SessionSettings) {
        if let Some(model) = &self.model {
            settings.model_path = Some(model.clone());
        }
        if let Some(template) = &self.chat_template {
            settings.chat_template = Some(template.clone());
        }
        if let Some(n) = self.context_size {
            settings.context_size = n;
        }
        if let Some(t) = self.temperature {
            settings.temperature = t;
        }
        if let Some(p) = self.min_p {
            settings.min_p = p;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if let Some(n) = self.threads {
            settings.n_threads = n;
        }
        if let Some(n) = self.gpu_layers {
            settings.gpu_layers = n;
        }
        if let Some(prompt) = &self.system_prompt {
            settings.system_prompt = prompt.clone();
        }
        if self.no_history {
            settings.store_history = false;
        }
        settings.validate();
    }
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only the conversation
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pocketchat=info")))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    cli.apply(&mut settings);

    let store = ConversationStore::open_default()?;
    if cli.list {
        for conv in store.list()? {
            println!(
                "{}  {}  {} ({} turns)",
                conv.id,
                conv.updated_at.format("%Y-%m-%d %H:%M"),
                conv.title,
                conv.exchange_len()
            );
        }
        return Ok(());
    }

    let model_path = settings
        .model_path
        .clone()
        .ok_or("no model given; pass --model or set model_path in the settings file")?;

    let mut conversation = match &cli.resume {
        Some(id) => store.load(id)?,
        None => Conversation::new(Some(&settings.system_prompt)),
    };

    info!("Starting pocketchat v{}", env!("CARGO_PKG_VERSION"));
    let mut engine = LlamaEngine::create(settings.to_session_params(model_path))?;
    for turn in &conversation.turns {
        engine.add_turn(turn.role(), turn.content())?;
    }

    let info = engine.model_info();
    eprintln!(
        "Loaded {} ({} ctx). Type /exit to quit.",
        info.path, info.context_size
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "/exit" {
            break;
        }

        let (tokens, _stop) = engine.generate_stream(query)?;
        let mut summary = None;
        for token in tokens {
            match token {
                StreamToken::Token(text) => {
                    print!("{text}");
                    stdout.flush()?;
                }
                StreamToken::Done(done) => summary = Some(done),
                StreamToken::Error(e) => eprintln!("\n[generation failed: {e}]"),
            }
        }
        println!();

        conversation.record(Turn::user(query));
        if let Some(summary) = summary {
            print_stats(&summary);
            if !summary.response.is_empty() {
                conversation.record(Turn::assistant(summary.response));
            }
        }
        if !cli.no_save {
            store.save(&conversation)?;
        }
    }

    engine.close()?;
    if !cli.no_save && conversation.exchange_len() > 0 {
        eprintln!("Saved conversation {}", conversation.id);
    }
    Ok(())
}

fn print_stats(summary: &ResponseSummary) {
    eprintln!(
        "[{:.1} tok/s, {} context cells, {:.1}s{}]",
        summary.tokens_per_second,
        summary.context_used,
        summary.elapsed.as_secs_f32(),
        if summary.completed { "" } else { ", stopped" }
    );
}
