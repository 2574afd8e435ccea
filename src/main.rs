use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skald::assistant::{ChatClient, PipelineParts, VoiceAssistant, WhisperClient};
use skald::audio::{Arbiter, CpalSource, NullPlayback, SourceFactory};
use skald::script::{Capabilities, ScriptEngine};
use skald::storage::WebDataStore;
use skald::{
    CommandRegistry, Config, ConversationBuffer, FileStore, RequestManager,
    RequestManagerConfig, RequestStatus, Settings,
};

/// Skald - asynchronous voice-command pipeline
#[derive(Parser)]
#[command(name = "skald", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SKALD_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a text request and wait for the answer
    Ask {
        /// The request text
        text: String,
    },
    /// Run a Lua script in the command sandbox
    Script {
        /// Path to the script file
        path: PathBuf,
    },
    /// Record from the microphone and process the recording
    Record {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// List models the chat endpoint offers
    Models,
    /// Show the stored conversation history
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,skald=info",
        1 => "info,skald=debug",
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
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Ask { text }) => cmd_ask(&config, &text).await,
        Some(Command::Script { path }) => cmd_script(&config, &path),
        Some(Command::Record { duration }) => cmd_record(&config, duration).await,
        Some(Command::Models) => cmd_models(&config).await,
        Some(Command::History) => cmd_history(&config),
        None => run_service(&config).await,
    }
}

/// Assembled application state
struct App {
    assistant: Arc<VoiceAssistant>,
    manager: Arc<RequestManager>,
}

fn build_app(config: &Config) -> anyhow::Result<App> {
    let settings = Settings::new(config);
    let registry = Arc::new(CommandRegistry::new());

    let data_dir = &config.storage.data_dir;
    let webdata = Arc::new(WebDataStore::new(data_dir.join("webdata"))?);
    let memory = Arc::new(FileStore::new(data_dir.join("memory"))?);
    let conversation = Arc::new(ConversationBuffer::open(
        data_dir.join("conversation.json"),
        config.conversation_limit,
    ));

    let engine = Arc::new(ScriptEngine::new(build_capabilities(
        &registry, &webdata, &memory,
    )));

    let transcriber = Arc::new(WhisperClient::new(&config.stt)?);
    let model = Arc::new(ChatClient::new(&config.llm)?);
    let arbiter = Arbiter::new(Arc::new(NullPlayback));
    let source_factory: SourceFactory = Arc::new(CpalSource::new);

    let assistant = VoiceAssistant::new(
        config,
        PipelineParts {
            settings: Arc::clone(&settings),
            transcriber,
            model,
            registry,
            engine,
            conversation,
            arbiter,
            source_factory,
        },
    );

    let manager = RequestManager::new(
        RequestManagerConfig::default(),
        Arc::clone(&assistant),
        settings,
    );

    Ok(App { assistant, manager })
}

/// Wire the sandbox capabilities to real storage; GPIO is stubbed on
/// hosts without pins
fn build_capabilities(
    registry: &Arc<CommandRegistry>,
    webdata: &Arc<WebDataStore>,
    memory: &Arc<FileStore>,
) -> Capabilities {
    let mut caps = Capabilities::noop();

    let dispatch = Arc::clone(registry);
    caps.dispatch = Arc::new(move |name, args| dispatch.execute(name, args));

    caps.gpio_write = Arc::new(|pin, value| {
        tracing::warn!(pin, value, "gpio_write: no GPIO on this host");
        false
    });

    caps.delay = Arc::new(|ms| {
        // Cap so a script cannot stall the executor for minutes
        std::thread::sleep(Duration::from_millis(ms.min(10_000)));
    });

    let fetch = Arc::clone(webdata);
    caps.web_fetch = Arc::new(move |url, filename| match fetch.fetch_once(url, filename) {
        Ok(()) => skald::CommandResult::ok(format!("fetched {filename}")),
        Err(e) => skald::CommandResult::failed(e.to_string()),
    });

    let scheduled = Arc::clone(webdata);
    caps.web_fetch_scheduled = Arc::new(move |url, filename, minutes| {
        let minutes = u32::try_from(minutes).unwrap_or(u32::MAX);
        match scheduled.fetch_scheduled(url, filename, minutes) {
            Ok(()) => skald::CommandResult::ok(format!("scheduled {filename}")),
            Err(e) => skald::CommandResult::failed(e.to_string()),
        }
    });

    let read = Arc::clone(webdata);
    caps.web_read = Arc::new(move |filename| read.read(filename).ok());

    let list = Arc::clone(webdata);
    caps.web_list = Arc::new(move || list.list().unwrap_or_default());

    let mem_read = Arc::clone(memory);
    caps.memory_read = Arc::new(move |key| mem_read.read(key).ok());

    let mem_write = Arc::clone(memory);
    caps.memory_write = Arc::new(move |key, value| mem_write.write(key, value).is_ok());

    let mem_list = Arc::clone(memory);
    caps.memory_list = Arc::new(move || mem_list.list().unwrap_or_default());

    let mem_delete = Arc::clone(memory);
    caps.memory_delete = Arc::new(move |key| mem_delete.delete(key).is_ok());

    caps
}

/// Run the assistant until interrupted
async fn run_service(config: &Config) -> anyhow::Result<()> {
    let app = build_app(config)?;

    app.manager.begin();
    app.assistant.begin().await?;
    tracing::info!("skald ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    app.manager.end().await;
    app.assistant.end().await;
    Ok(())
}

/// Submit text and poll until the request finishes
async fn cmd_ask(config: &Config, text: &str) -> anyhow::Result<()> {
    let app = build_app(config)?;
    app.manager.begin();

    let id = app.manager.submit(text)?;
    println!("request {id}");

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let Some(record) = app.manager.status(&id) else {
            anyhow::bail!("request disappeared");
        };
        if record.status.is_terminal() {
            match record.status {
                RequestStatus::Completed => println!("{}", record.response),
                _ => anyhow::bail!("{:?}: {}", record.status, record.error),
            }
            break;
        }
    }

    app.manager.end().await;
    app.assistant.end().await;
    Ok(())
}

/// Run a script file through the sandbox
fn cmd_script(config: &Config, path: &PathBuf) -> anyhow::Result<()> {
    let script = std::fs::read_to_string(path)?;

    let registry = Arc::new(CommandRegistry::new());
    let data_dir = &config.storage.data_dir;
    let webdata = Arc::new(WebDataStore::new(data_dir.join("webdata"))?);
    let memory = Arc::new(FileStore::new(data_dir.join("memory"))?);
    let engine = ScriptEngine::new(build_capabilities(&registry, &webdata, &memory));

    let result = engine.execute(&script);
    println!("{}", result.message);
    if result.success {
        Ok(())
    } else {
        anyhow::bail!("script failed")
    }
}

/// Record for a fixed duration, then run the recording through the
/// pipeline
async fn cmd_record(config: &Config, duration: u64) -> anyhow::Result<()> {
    let app = build_app(config)?;

    println!("Recording for {duration} seconds...");
    app.assistant.start_recording()?;
    tokio::time::sleep(Duration::from_secs(duration)).await;
    app.assistant.stop_recording_and_process().await?;

    println!("Waiting for response...");
    match app
        .assistant
        .last_response(Duration::from_secs(180))
        .await
    {
        Some(response) => println!("{}", response.text),
        None => println!("no response"),
    }

    app.assistant.end().await;
    Ok(())
}

/// List models the chat endpoint offers
async fn cmd_models(config: &Config) -> anyhow::Result<()> {
    let client = ChatClient::new(&config.llm)?;
    let models = client.fetch_models().await?;
    if models.is_empty() {
        println!("no models reported");
    }
    for model in models {
        println!("{model}");
    }
    Ok(())
}

/// Print the stored conversation history
fn cmd_history(config: &Config) -> anyhow::Result<()> {
    let conversation = ConversationBuffer::open(
        config.storage.data_dir.join("conversation.json"),
        config.conversation_limit,
    );

    for entry in conversation.entries() {
        if entry.command.is_empty() {
            println!("[{}] {}", entry.role, entry.text);
        } else {
            println!("[{}] ({}) {}", entry.role, entry.command, entry.text);
        }
    }
    Ok(())
}
