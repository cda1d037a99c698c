//! Presentation hooks for session progress.
//!
//! The session core never draws anything itself.  It reports placeholder text, banner contents,
//! phase changes, and forced sign-outs to a [`SessionObserver`]; [`PlainTextObserver`] prints them
//! to stdout with optional ANSI styling.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::status::Phase;
use crate::{Banner, BannerKind};

/// ANSI escape code for dim text (used for the placeholder).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for info steps).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for escalation steps).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Receives every externally visible change of a chat request.
///
/// All methods default to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// The transient label standing in for the reply changed.
    fn on_placeholder(&self, text: &str) {
        _ = text;
    }

    /// The banner changed.  An empty banner means it should be hidden.
    fn on_banner(&self, banner: &Banner) {
        _ = banner;
    }

    /// The session entered `phase`.
    fn on_phase(&self, phase: &Phase) {
        _ = phase;
    }

    /// The credentials are gone for good; the user must sign in again.
    fn on_reauthentication_required(&self) {}
}

/// An observer that ignores everything.
impl SessionObserver for () {}

/// Prints session progress as plain lines of text.
pub struct PlainTextObserver {
    use_color: bool,
    shown_steps: Mutex<usize>,
}

impl PlainTextObserver {
    /// Creates an observer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates an observer with the specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            use_color,
            shown_steps: Mutex::new(0),
        }
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.use_color {
            format!("{color}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }

    fn print_line(&self, line: &str) {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl Default for PlainTextObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for PlainTextObserver {
    fn on_placeholder(&self, text: &str) {
        self.print_line(&self.paint(ANSI_DIM, &format!("… {text}")));
    }

    fn on_banner(&self, banner: &Banner) {
        let mut shown = self.shown_steps.lock().unwrap_or_else(PoisonError::into_inner);
        if banner.is_empty() {
            *shown = 0;
            return;
        }
        for step in banner.steps.iter().skip(*shown) {
            let (color, tag) = match step.kind {
                BannerKind::Info => (ANSI_CYAN, "step"),
                BannerKind::Escalation => (ANSI_YELLOW, "escalation"),
            };
            let label = match &step.model_tag {
                Some(model) => format!("[{tag}: {model}] {}", step.message),
                None => format!("[{tag}] {}", step.message),
            };
            self.print_line(&self.paint(color, &label));
        }
        *shown = banner.steps.len();
    }

    fn on_phase(&self, phase: &Phase) {
        match phase {
            Phase::Complete { result, .. } => self.print_line(&render_result(result)),
            Phase::Errored { cause } => {
                self.print_line(&self.paint(ANSI_RED, &format!("Error: {cause}")));
            }
            Phase::Pending | Phase::Active { .. } | Phase::Cancelled { .. } => {}
        }
    }

    fn on_reauthentication_required(&self) {
        self.print_line(&self.paint(
            ANSI_RED,
            "Your session has ended. Sign in again with /login <username>.",
        ));
    }
}

/// Extracts the reply text from a completed result document.
///
/// Falls back to pretty-printed JSON when no text field is present.
pub fn render_result(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Object(map) => ["response", "text", "content", "message", "answer"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(String::from)
            .unwrap_or_else(|| {
                serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
            }),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
