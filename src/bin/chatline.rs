//! Interactive chat client with token-refreshing sessions.
//!
//! # Usage
//!
//! ```bash
//! # Talk to the backend named by $CHATLINE_BASE_URL
//! chatline
//!
//! # Point at a specific backend and keep credentials elsewhere
//! chatline --base-url https://chat.example.com/api/ --storage ~/.chatline.json
//!
//! # Disable colors (useful for piping output)
//! chatline --no-color
//! ```
//!
//! # Commands
//!
//! - `/login <user>` - Sign in; the password is prompted for
//! - `/logout` - End the session
//! - `/whoami` - Show the current session
//! - `/help` - Show available commands
//! - `/quit` - Exit the application
//!
//! Log verbosity follows `RUST_LOG` (default `warn`); logs go to stderr.

use std::sync::{Arc, Mutex, PoisonError};

use arrrg::CommandLine;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chatline::chat::{help_text, parse_command, ChatCommand, ChatCore, ChatOutcome};
use chatline::{CoreArgs, CoreConfig, LoginCredentials, Phase, PlainTextObserver};

/// Environment variable consulted before prompting for a password.
const PASSWORD_ENV: &str = "CHATLINE_PASSWORD";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = CoreArgs::from_command_line_relaxed("chatline [OPTIONS]");
    let config = CoreConfig::load(args)?;
    let core = ChatCore::from_config(&config)?;
    let observer = Arc::new(PlainTextObserver::with_color(config.use_color));
    let mut rl = DefaultEditor::new()?;

    // The message in flight, if any; Ctrl+C cancels it.
    let in_flight: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let in_flight_handler = in_flight.clone();
    ctrlc::set_handler(move || {
        let current = in_flight_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = current.as_ref() {
            cancel.cancel();
        }
    })?;

    let mut proactive = ProactiveRefresh::start(&core);

    println!("chatline ({})", config.base_url);
    match core.session() {
        Ok(Some(bundle)) => println!("Resuming session {}.", bundle.session_id),
        Ok(None) => println!("Not signed in. Use /login <username>."),
        Err(err) => eprintln!("Could not read stored credentials: {err}"),
    }
    println!("Type /help for commands, /quit to exit\n");

    loop {
        let line = match rl.readline("You: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line);

        let Some(command) = parse_command(line) else {
            let cancel = CancellationToken::new();
            *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
            let outcome = core
                .send_message(json!({ "message": line }), &cancel, observer.clone())
                .await;
            *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            match outcome {
                Ok(ChatOutcome::Settled(Phase::Cancelled { notice })) => println!("{notice}"),
                Ok(_) => {}
                Err(err) => eprintln!("Error: {err}"),
            }
            println!();
            continue;
        };

        match command {
            ChatCommand::Quit => {
                println!("Goodbye!");
                break;
            }
            ChatCommand::Help => {
                for line in help_text().lines() {
                    println!("    {line}");
                }
            }
            ChatCommand::Login(username) => {
                let password = match std::env::var(PASSWORD_ENV) {
                    Ok(password) => password,
                    Err(_) => match rl.readline("Password (input is visible): ") {
                        Ok(password) => password,
                        Err(_) => continue,
                    },
                };
                match core
                    .login(&LoginCredentials::new(username.clone(), password))
                    .await
                {
                    Ok(()) => {
                        proactive.stop().await;
                        proactive = ProactiveRefresh::start(&core);
                        println!("Signed in as {username}.");
                    }
                    Err(err) => eprintln!("Sign-in failed: {err}"),
                }
            }
            ChatCommand::Logout => {
                proactive.stop().await;
                match core.logout().await {
                    Ok(()) => println!("Signed out."),
                    Err(err) => eprintln!("Could not clear credentials: {err}"),
                }
                // Idles until the next sign-in restarts it.
                proactive = ProactiveRefresh::start(&core);
            }
            ChatCommand::Whoami => match core.session() {
                Ok(Some(bundle)) => {
                    println!("Session {}", bundle.session_id);
                    println!("  access token expires  {}", bundle.expires_at);
                    println!("  refresh token expires {}", bundle.refresh_expires_at);
                }
                Ok(None) => println!("Not signed in."),
                Err(err) => eprintln!("Could not read credentials: {err}"),
            },
            ChatCommand::Invalid(message) => eprintln!("{message}"),
        }
    }

    proactive.stop().await;
    Ok(())
}

/// The background task keeping the stored session fresh.
struct ProactiveRefresh {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProactiveRefresh {
    fn start(core: &ChatCore) -> Self {
        let cancel = CancellationToken::new();
        let task = core.start_proactive_refresh(cancel.clone());
        Self { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
