// ABOUTME: roost CLI entry point - a thin front-end over the session coordinator
// ABOUTME: Creates, lists, chats with and manages sessions stored in the local database

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use roost_core::{Config, RelayEvent, Role, SessionCoordinator};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "roost")]
#[command(about = "Drive assistant engine sessions from the terminal")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/roost/config.toml)
    #[arg(long, global = true, env = "ROOST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init,

    /// Create a session
    New {
        /// Display title (defaults to a timestamped name)
        #[arg(long, short = 't')]
        title: Option<String>,
    },

    /// List sessions, most recently active first
    List,

    /// Print a session's messages
    History {
        session_id: String,
    },

    /// Send one message and stream the response
    Send {
        session_id: String,

        /// Message text
        text: String,
    },

    /// Interactive chat; /switch <id>, /new, /stop and /quit are commands
    Chat {
        /// Session to start in (defaults to a new one)
        session_id: Option<String>,
    },

    /// Show the extension catalog or configure a session's extensions
    Extensions {
        session_id: Option<String>,

        /// Comma-separated names to enable (replaces the current set)
        #[arg(long, value_delimiter = ',')]
        enable: Option<Vec<String>>,
    },

    /// Delete a session and its messages
    Delete {
        session_id: String,
    },

    /// Stop a session's engine and release it for other processes
    Close {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Interactive chat owns the terminal, so its logs go to a file
    match cli.command {
        Commands::Chat { .. } => roost_log::init_file("roost-chat"),
        _ => roost_log::init_for("roost_core"),
    }

    if let Commands::Init = cli.command {
        let path = Config::init()?;
        println!("Config written to {}", path.display());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(db = %config.db_path().display(), "Opening session store");
    let coordinator = SessionCoordinator::open(&config)
        .await
        .context("Failed to open session store")?;

    let result = run(&coordinator, cli.command).await;
    coordinator.shutdown().await;
    result
}

async fn run(coordinator: &SessionCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Init => bail!("init runs before the session store is opened"),
        Commands::New { title } => {
            let session = coordinator.open_session(title.as_deref()).await?;
            println!("{}\t{}", session.id, session.title);
        }
        Commands::List => {
            for summary in coordinator.list_sessions().await? {
                println!(
                    "{}\t{}\t{} messages\t{}",
                    summary.id,
                    summary.title,
                    summary.message_count,
                    summary.last_active.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::History { session_id } => {
            for msg in coordinator.history(&session_id).await? {
                print_message(msg.role, &msg.body, msg.interrupted || !msg.completed);
            }
        }
        Commands::Send { session_id, text } => {
            stream_turn(coordinator, &session_id, &text).await?;
        }
        Commands::Chat { session_id } => chat(coordinator, session_id).await?,
        Commands::Extensions {
            session_id: None,
            enable,
        } => {
            if enable.is_some() {
                bail!("--enable needs a session id");
            }
            for ext in coordinator.available_extensions() {
                println!("{:<12}{}", ext.name, ext.description);
            }
        }
        Commands::Extensions {
            session_id: Some(session_id),
            enable,
        } => {
            let enabled = match enable {
                Some(names) => coordinator.configure_extensions(&session_id, names).await?,
                None => coordinator.store().require(&session_id).await?.extensions,
            };
            let names: Vec<String> = enabled.into_iter().collect();
            println!("{}", names.join(","));
        }
        Commands::Delete { session_id } => {
            coordinator.delete_session(&session_id).await?;
            println!("Deleted {session_id}");
        }
        Commands::Close { session_id } => {
            coordinator.close_session(&session_id).await?;
        }
    }
    Ok(())
}

fn print_message(role: Role, body: &str, incomplete: bool) {
    let marker = if incomplete { " (incomplete)" } else { "" };
    println!("[{role}{marker}]");
    println!("{}", body.trim_end());
    println!();
}

/// Send one turn and print the response as it streams. Ctrl-C cancels it.
async fn stream_turn(coordinator: &SessionCoordinator, session_id: &str, text: &str) -> Result<()> {
    let mut events = coordinator.subscribe(session_id).await?;
    let receipt = match coordinator.send_message(session_id, text).await {
        Ok(receipt) => receipt,
        Err(e) => bail!("{e} ({})", e.user_hint()),
    };

    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                coordinator.stop_response(session_id).await?;
                println!("\n[stopped]");
                return Ok(());
            }
        };
        let Some(event) = event else {
            bail!("lost the response stream; `roost history {session_id}` shows what was saved");
        };

        match event {
            RelayEvent::Token(token) if token.seq == receipt.response_seq => {
                write!(stdout, "{}", token.delta)?;
                stdout.flush()?;
                if token.is_final {
                    println!();
                    return Ok(());
                }
            }
            RelayEvent::EngineError { message, .. } => eprintln!("engine: {message}"),
            RelayEvent::EngineCrashed { detail, .. } => {
                bail!("engine crashed: {detail}; resend the message to retry")
            }
            RelayEvent::Interrupted { .. } | RelayEvent::SessionClosed { .. } => {
                println!("\n[interrupted]");
                return Ok(());
            }
            _ => {}
        }
    }
}

async fn chat(coordinator: &SessionCoordinator, session_id: Option<String>) -> Result<()> {
    let mut current = match session_id {
        Some(id) => id,
        None => coordinator.open_session(None).await?.id,
    };
    let view = coordinator.resume_session(&current).await?;
    println!("Session {} ({})", view.session.title, view.session.id);
    for msg in &view.messages {
        print_message(msg.role, &msg.body, msg.interrupted || !msg.completed);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => continue,
            ("/quit", _) => break,
            ("/new", title) => {
                let title = (!title.is_empty()).then_some(title);
                let session = coordinator.open_session(title).await?;
                let view = coordinator
                    .switch_active_session(Some(&current), &session.id)
                    .await?;
                current = view.session.id;
                println!("Session {} ({})", view.session.title, current);
            }
            ("/switch", target) if !target.is_empty() => {
                match coordinator.switch_active_session(Some(&current), target).await {
                    Ok(view) => {
                        current = view.session.id;
                        println!("Session {} ({})", view.session.title, current);
                        for msg in &view.messages {
                            print_message(msg.role, &msg.body, msg.interrupted || !msg.completed);
                        }
                    }
                    Err(e) => eprintln!("{e} ({})", e.user_hint()),
                }
            }
            ("/stop", _) => coordinator.stop_response(&current).await?,
            _ => {
                if let Err(e) = stream_turn(coordinator, &current, line).await {
                    eprintln!("{e:#}");
                }
            }
        }
    }
    Ok(())
}
