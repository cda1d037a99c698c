//! Configuration for the session core and the `chatline` binary.
//!
//! [`CoreArgs`] parses the command line via `arrrg`; [`CoreConfig`] holds resolved settings.
//! Settings come from, in increasing precedence: built-in defaults, the `CHATLINE_BASE_URL`
//! environment variable, a YAML file, and the command line.

use std::env;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};

use crate::refresher::DEFAULT_REFRESH_MARGIN;
use crate::status::{SessionTimings, DEFAULT_CLEAR_DELAY, DEFAULT_LONG_WAIT};
use crate::token_store::DEFAULT_LEGACY_LIFETIME;
use crate::{Error, Result};

/// Backend used when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/";

/// Environment variable naming the backend.
pub const BASE_URL_ENV: &str = "CHATLINE_BASE_URL";

/// Timeout applied to requests that do not stream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Command-line arguments for the chatline tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct CoreArgs {
    /// Backend base URL.
    #[arrrg(optional, "Backend base URL (default: $CHATLINE_BASE_URL)", "URL")]
    pub base_url: Option<String>,

    /// Credential file.
    #[arrrg(optional, "Credential file (default: ~/.config/chatline/credentials.json)", "PATH")]
    pub storage: Option<String>,

    /// Timeout for non-streaming requests.
    #[arrrg(optional, "Timeout for non-streaming requests in seconds (default: 60)", "SECS")]
    pub timeout_secs: Option<u64>,

    /// YAML configuration file.
    #[arrrg(optional, "YAML configuration file", "PATH")]
    pub config: Option<String>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Backend endpoint paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    /// Username/password login.
    pub login: String,
    /// Token refresh.
    pub refresh: String,
    /// Session logout.
    pub logout: String,
    /// Chat message submission.
    pub chat: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            login: "auth/login".to_string(),
            refresh: "auth/refresh".to_string(),
            logout: "auth/logout".to_string(),
            chat: "chat".to_string(),
        }
    }
}

/// Settings as they appear in a YAML configuration file.  Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    base_url: Option<String>,
    storage: Option<String>,
    timeout_secs: Option<u64>,
    refresh_margin_secs: Option<u64>,
    long_wait_secs: Option<u64>,
    clear_delay_millis: Option<u64>,
    legacy_lifetime_secs: Option<u64>,
    endpoints: Option<EndpointPaths>,
    color: Option<bool>,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Backend base URL.  Endpoint paths are joined onto it.
    pub base_url: String,

    /// Timeout for requests that do not stream.
    pub timeout: Duration,

    /// How long before access token expiry a refresh is due.
    pub refresh_margin: Duration,

    /// Delay after activation before the placeholder is relabelled.
    pub long_wait: Duration,

    /// How long a completed banner stays visible.
    pub clear_delay: Duration,

    /// Lifetime given to upgraded legacy tokens.
    pub legacy_lifetime: Duration,

    /// Credential file; `None` keeps credentials in memory only.
    pub storage_path: Option<String>,

    /// Backend endpoint paths.
    pub endpoints: EndpointPaths,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl CoreConfig {
    /// Creates a configuration with default values.
    ///
    /// Defaults:
    /// - Base URL: `$CHATLINE_BASE_URL`, else `http://localhost:8000/api/`
    /// - Timeout: 60 seconds
    /// - Refresh margin: 5 minutes
    /// - Long-wait relabel: 20 seconds
    /// - Banner clear delay: 2 seconds
    /// - Storage: `~/.config/chatline/credentials.json`
    pub fn new() -> Self {
        Self {
            base_url: resolve_base_url(None, env::var(BASE_URL_ENV).ok()),
            timeout: DEFAULT_TIMEOUT,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            long_wait: DEFAULT_LONG_WAIT,
            clear_delay: DEFAULT_CLEAR_DELAY,
            legacy_lifetime: DEFAULT_LEGACY_LIFETIME,
            storage_path: default_storage_path(),
            endpoints: EndpointPaths::default(),
            use_color: true,
        }
    }

    /// Loads a YAML file over the defaults.
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("could not read config {path}: {e}"), e))?;
        Self::from_yaml_str(&data)
    }

    /// Parses YAML over the defaults.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(data).map_err(|e| {
            Error::serialization(format!("invalid config: {e}"), Some(Box::new(e)))
        })?;
        Ok(Self::new().apply_file(file))
    }

    /// Resolves the full configuration from command-line arguments.
    pub fn load(args: CoreArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::new(),
        };
        base.apply_args(args).validated()
    }

    fn apply_file(mut self, file: ConfigFile) -> Self {
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(storage) = file.storage {
            self.storage_path = Some(storage);
        }
        if let Some(secs) = file.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.refresh_margin_secs {
            self.refresh_margin = Duration::from_secs(secs);
        }
        if let Some(secs) = file.long_wait_secs {
            self.long_wait = Duration::from_secs(secs);
        }
        if let Some(millis) = file.clear_delay_millis {
            self.clear_delay = Duration::from_millis(millis);
        }
        if let Some(secs) = file.legacy_lifetime_secs {
            self.legacy_lifetime = Duration::from_secs(secs);
        }
        if let Some(endpoints) = file.endpoints {
            self.endpoints = endpoints;
        }
        if let Some(color) = file.color {
            self.use_color = color;
        }
        self
    }

    fn apply_args(mut self, args: CoreArgs) -> Self {
        if let Some(base_url) = args.base_url {
            self.base_url = base_url;
        }
        if let Some(storage) = args.storage {
            self.storage_path = Some(storage);
        }
        if let Some(secs) = args.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        if args.no_color {
            self.use_color = false;
        }
        self
    }

    /// Checks that the configuration is usable.
    pub fn validated(self) -> Result<Self> {
        url::Url::parse(&self.base_url)?;
        if self.timeout.is_zero() {
            return Err(Error::validation(
                "timeout must be positive",
                Some("timeout_secs".to_string()),
            ));
        }
        Ok(self)
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the timeout for non-streaming requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the refresh margin.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the session timers.
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.long_wait = timings.long_wait;
        self.clear_delay = timings.clear_delay;
        self
    }

    /// Sets the credential file, or `None` for memory-only credentials.
    pub fn with_storage_path(mut self, path: Option<String>) -> Self {
        self.storage_path = path;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Returns the session timers.
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            long_wait: self.long_wait,
            clear_delay: self.clear_delay,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<CoreArgs> for CoreConfig {
    fn from(args: CoreArgs) -> Self {
        CoreConfig::new().apply_args(args)
    }
}

fn resolve_base_url(explicit: Option<String>, from_env: Option<String>) -> String {
    explicit
        .or(from_env.filter(|url| !url.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn default_storage_path() -> Option<String> {
    let home = env::var("HOME").ok().filter(|home| !home.is_empty())?;
    Some(format!("{home}/.config/chatline/credentials.json"))
}
