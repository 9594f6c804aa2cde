use clap::{Parser, Subcommand};
use lib::context::CompactionPolicy;
use lib::controller::{ChatController, ChatError, ChatEvent, ChatSettings, TurnPhase};
use lib::llm::InferenceClient;
use lib::persona::Persona;
use lib::store::{ChatLibrary, Conversation};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "Palaver: chat with an OpenAI-compatible inference server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the data directory and default files (config, chats, bots, state log, bundled bots).
    Init {
        /// Config file path (default: PALAVER_CONFIG_PATH or ~/.palaver/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat interactively. Opens the given chat, else the last one, else creates a new one.
    Chat {
        /// Config file path (default: PALAVER_CONFIG_PATH or ~/.palaver/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Chat identifier (file name without .json).
        #[arg(long, value_name = "NAME")]
        chat: Option<String>,

        /// Inference server root, overriding config and PALAVER_SERVER_URL.
        #[arg(long, value_name = "URL")]
        server: Option<String>,
    },

    /// Create a new chat file.
    New {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Chat name (default "New Chat"; made unique on disk).
        #[arg(long, default_value = "")]
        name: String,

        /// Bot directory name under bots/.
        #[arg(long, value_name = "BOT")]
        bot: Option<String>,

        /// Model id as served by the inference server.
        #[arg(long, default_value = "")]
        model: String,

        /// Sampling temperature (default from config).
        #[arg(long)]
        temperature: Option<f64>,
    },

    /// Rename a chat (moves its file).
    Rename {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Chat identifier to rename.
        #[arg(long, value_name = "NAME")]
        chat: String,

        /// New name.
        #[arg(long)]
        name: String,
    },

    /// List saved chats, most recently used first.
    List {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List models served by the inference server.
    Models {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Ask the server to load another model and wait until it is back.
    SwitchModel {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Model id to load.
        model: String,
    },

    /// Manage bots (system instruction presets).
    Bot {
        #[command(subcommand)]
        command: BotCommands,
    },
}

#[derive(Subcommand)]
enum BotCommands {
    /// Create a bot.
    New {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        name: String,

        /// System instruction sent with every request.
        #[arg(long)]
        description: String,

        /// Optional workflow file path.
        #[arg(long, default_value = "")]
        workflow: String,

        /// Portrait image to copy into the bot directory.
        #[arg(long, value_name = "IMAGE")]
        portrait: Option<PathBuf>,
    },

    /// List bots.
    List {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("palaver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Chat {
            config,
            chat,
            server,
        }) => match tokio::task::spawn_blocking(move || run_chat(config, chat, server)).await {
            Ok(r) => r,
            Err(e) => Err(anyhow::anyhow!("chat task failed: {}", e)),
        },
        Some(Commands::New {
            config,
            name,
            bot,
            model,
            temperature,
        }) => run_new(config, name, bot, model, temperature),
        Some(Commands::Rename { config, chat, name }) => run_rename(config, chat, name),
        Some(Commands::List { config }) => run_list(config),
        Some(Commands::Models { config }) => run_models(config).await,
        Some(Commands::SwitchModel { config, model }) => run_switch_model(config, model).await,
        Some(Commands::Bot { command }) => run_bot(command),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let root = lib::init::init_data_dir(&path)?;
    println!("initialized data directory at {}", root.display());
    Ok(())
}

/// Loaded config plus the initialized chat library.
fn open_library(
    config_path: Option<PathBuf>,
) -> anyhow::Result<(lib::config::Config, ChatLibrary)> {
    let (config, path) = lib::config::load_config(config_path)?;
    let library = lib::init::require_initialized(&path, &config)?;
    Ok((config, library))
}

fn bot_path(library: &ChatLibrary, bot: Option<&str>) -> anyhow::Result<Option<String>> {
    let Some(bot) = bot.map(str::trim).filter(|b| !b.is_empty()) else {
        return Ok(None);
    };
    let dir = library.bots_dir().join(bot);
    lib::persona::load_persona(&dir)?;
    Ok(Some(dir.to_string_lossy().into_owned()))
}

fn run_new(
    config_path: Option<PathBuf>,
    name: String,
    bot: Option<String>,
    model: String,
    temperature: Option<f64>,
) -> anyhow::Result<()> {
    let (config, library) = open_library(config_path)?;
    let bot_path = bot_path(&library, bot.as_deref())?;
    let mut conversation = Conversation::new(
        name,
        bot_path,
        model.trim(),
        temperature.unwrap_or(config.default_temperature),
    );
    if let Some(dir) = conversation.bot_path.as_deref() {
        let persona = lib::persona::load_persona(Path::new(dir))?;
        conversation.payload = lib::context::export_payload(&persona.preset(), &[]);
    }
    let path = library.save_settings(&mut conversation, None)?;
    println!("created chat {} at {}", conversation.name, path.display());
    Ok(())
}

fn run_rename(config_path: Option<PathBuf>, chat: String, name: String) -> anyhow::Result<()> {
    let (config, library) = open_library(config_path)?;
    let (controller, _events) = new_controller(&config, library, None);
    controller.open_chat(&chat)?;
    let current = controller.snapshot();
    let path = controller.apply_settings(ChatSettings {
        name,
        bot_path: current.bot_path,
        model: current.model,
        temperature: current.temperature,
    })?;
    println!("chat is now {}", path.display());
    Ok(())
}

fn run_list(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (_, library) = open_library(config_path)?;
    let log = library.app_log()?;
    let mut chats: Vec<String> = library
        .list_chats()
        .iter()
        .map(|p| lib::store::chat_id(p))
        .collect();
    // Most recently used first; chats missing from the log keep name order at the end.
    chats.sort_by_key(|id| {
        log.chat_list
            .iter()
            .position(|c| c == id)
            .map(|i| log.chat_list.len() - i)
            .unwrap_or(usize::MAX)
    });
    let last = Path::new(&log.last_chat)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    for id in chats {
        let marker = if last.as_deref() == Some(id.as_str()) { "*" } else { " " };
        println!("{} {}", marker, id);
    }
    Ok(())
}

async fn run_models(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = InferenceClient::from_config(&config);
    let models = client.list_models().await?;
    if models.is_empty() {
        println!("no models served at {}", client.base_url());
    }
    for m in models {
        println!("{}", m.id);
    }
    Ok(())
}

async fn run_switch_model(config_path: Option<PathBuf>, model: String) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = InferenceClient::from_config(&config);
    println!("switching to {}...", model);
    client.switch_model(&model).await?;
    println!("server now serves {}", model);
    Ok(())
}

fn run_bot(command: BotCommands) -> anyhow::Result<()> {
    match command {
        BotCommands::New {
            config,
            name,
            description,
            workflow,
            portrait,
        } => {
            let (_, library) = open_library(config)?;
            let mut persona = Persona {
                name,
                description,
                workflow_path: workflow,
            };
            let dir = lib::persona::save_persona(
                &library.bots_dir(),
                &mut persona,
                None,
                portrait.as_deref(),
            )?;
            println!("created bot {} at {}", persona.name, dir.display());
        }
        BotCommands::List { config } => {
            let (_, library) = open_library(config)?;
            for (dir, persona) in lib::persona::list_personas(&library.bots_dir()) {
                let dir_name = dir
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                println!("{}: {}", dir_name, persona.preset());
                if persona.has_workflow() {
                    println!("    workflow: {}", persona.workflow_path);
                }
                if let Some(portrait) = lib::persona::portrait_path(&dir) {
                    println!("    portrait: {}", portrait.display());
                }
            }
        }
    }
    Ok(())
}

fn new_controller(
    config: &lib::config::Config,
    library: ChatLibrary,
    server: Option<&str>,
) -> (ChatController, mpsc::Receiver<ChatEvent>) {
    let client = match server {
        Some(url) => InferenceClient::new(
            url,
            &lib::config::resolve_admin_url(config),
            config.server.clone(),
        ),
        None => InferenceClient::from_config(config),
    };
    ChatController::new(
        client,
        library,
        CompactionPolicy::from(&config.context),
        config.default_temperature,
    )
}

fn run_chat(
    config_path: Option<PathBuf>,
    chat: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let (config, library) = open_library(config_path)?;
    let path = match chat {
        Some(id) => library.chat_path(&id),
        None => match library.startup_chat() {
            Some(p) => p,
            None => {
                let default_bot = library.bots_dir().join("Assistant");
                let bot = lib::persona::load_persona(&default_bot)
                    .ok()
                    .map(|_| default_bot.to_string_lossy().into_owned());
                let mut conversation =
                    Conversation::new("", bot, "", config.default_temperature);
                library.save_settings(&mut conversation, None)?
            }
        },
    };

    let (controller, events) = new_controller(&config, library, server.as_deref());
    controller.load_chat(&path)?;

    let snapshot = controller.snapshot();
    println!(
        "chat: {}  bot: {}  model: {}",
        snapshot.name,
        display_or(&controller.bot_name(), "(none)"),
        display_or(&snapshot.model, "(none, use /model <name>)"),
    );
    println!("commands: /edit <text>  /delete  /regen  /stop  /model <name>  /history  /exit");
    for m in &snapshot.chat {
        print_message(m);
    }
    match controller.sync_model_with_server() {
        Ok(()) => {}
        Err(ChatError::NoModelSelected) => {}
        Err(e) => eprintln!("model check failed: {}", e),
    }

    repl(&controller, &events)?;

    controller.abort();
    controller.save()?;
    Ok(())
}

fn display_or<'a>(s: &'a str, fallback: &'a str) -> &'a str {
    if s.trim().is_empty() {
        fallback
    } else {
        s
    }
}

fn print_message(m: &lib::session::Message) {
    match m.response_time {
        Some(t) => println!("[{}] {} ({:.2}s)", m.role.as_str(), m.content, t),
        None => println!("[{}] {}", m.role.as_str(), m.content),
    }
}

/// Stdin lines on a channel, so the loop can keep draining controller events while the user types.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

fn render(event: ChatEvent) -> io::Result<bool> {
    let mut stdout = io::stdout();
    match event {
        ChatEvent::Token(t) => {
            write!(stdout, "{}", t)?;
            stdout.flush()?;
            Ok(false)
        }
        ChatEvent::Done { response_time, .. } => {
            writeln!(stdout, "\n({:.2}s)", response_time)?;
            Ok(true)
        }
        ChatEvent::Error(e) => {
            eprintln!("\nerror: {}", e);
            Ok(true)
        }
        ChatEvent::ModelChanged(m) => {
            writeln!(stdout, "model: {}", m)?;
            Ok(true)
        }
    }
}

fn repl(controller: &ChatController, events: &mpsc::Receiver<ChatEvent>) -> anyhow::Result<()> {
    let input = spawn_stdin_reader();
    prompt()?;
    loop {
        while let Ok(event) = events.try_recv() {
            if render(event)? && controller.phase() == TurnPhase::Idle {
                prompt()?;
            }
        }
        let line = match input.recv_timeout(Duration::from_millis(30)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            if controller.phase() == TurnPhase::Idle {
                prompt()?;
            }
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };
        let result = match command {
            "/exit" | "/quit" => break,
            "/stop" => {
                if controller.abort() {
                    println!("\n(stopped)");
                }
                Ok(())
            }
            "/history" => {
                for m in controller.transcript() {
                    print_message(&m);
                }
                Ok(())
            }
            "/delete" => {
                if !controller.delete_last_exchange() {
                    println!("nothing to delete");
                }
                Ok(())
            }
            "/edit" => controller.edit_last_user_message(arg),
            "/regen" => controller.regenerate(),
            "/model" => controller.switch_model(arg),
            _ if command.starts_with('/') => {
                println!("unknown command {}", command);
                Ok(())
            }
            _ => {
                if controller.phase() != TurnPhase::Idle {
                    println!("(busy; /stop to abort)");
                    Ok(())
                } else if controller.model().is_none() {
                    println!("no model selected; use /model <name>");
                    Ok(())
                } else if controller.add_user_message(line) {
                    controller.generate()
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
        if controller.phase() == TurnPhase::Idle {
            prompt()?;
        }
    }
    Ok(())
}
