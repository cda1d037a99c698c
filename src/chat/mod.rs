//! The chat front end's building blocks.
//!
//! - [`session`]: [`ChatCore`], which signs in, signs out, and sends messages
//! - [`commands`]: slash command parsing for the REPL

mod commands;
mod session;

pub use crate::observer::{PlainTextObserver, SessionObserver};
pub use commands::{help_text, parse_command, ChatCommand};
pub use session::{ChatCore, ChatOutcome, DEFAULT_CHAT_PATH};
