//! Slash command parsing for the chatline REPL.
//!
//! Input that starts with `/` controls the session; anything else is sent to the backend as a
//! chat message.

/// A parsed REPL command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Sign in as the given user.  The password is prompted for separately.
    Login(String),

    /// End the backend session and forget the stored credentials.
    Logout,

    /// Show whether a session exists and when its tokens expire.
    Whoami,

    /// Display help information.
    Help,

    /// Exit the REPL.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `None` if the input should be sent as a chat message.
///
/// # Examples
///
/// ```
/// # use chatline::chat::{parse_command, ChatCommand};
/// assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
/// assert_eq!(parse_command("/login alice"), Some(ChatCommand::Login("alice".into())));
/// assert!(parse_command("What's the weather?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "login" => match argument {
            Some(user) if user.contains(char::is_whitespace) => {
                ChatCommand::Invalid("/login takes a single username".to_string())
            }
            Some(user) => ChatCommand::Login(user.to_string()),
            None => ChatCommand::Invalid("/login requires a username".to_string()),
        },
        "logout" => ChatCommand::Logout,
        "whoami" | "session" => ChatCommand::Whoami,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        other => ChatCommand::Invalid(format!("unknown command: /{other}")),
    };

    Some(result)
}

/// Returns help text describing the available commands.
pub fn help_text() -> &'static str {
    r#"Commands:
  /login <user>   Sign in (the password is prompted for)
  /logout         End the session and forget stored credentials
  /whoami         Show the current session and token expiry
  /help           Show this help message
  /quit           Exit chatline

Anything else is sent as a chat message. Press Ctrl+C to cancel a reply in progress."#
}
