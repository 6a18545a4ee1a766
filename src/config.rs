use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Confirm, Input, Password};
use std::io::Write;
use std::path::PathBuf;

use crate::auth::DEFAULT_TOKEN_URL;

/// Nimbus Session - keeps the device-cloud login alive
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Nimbus account username (email)
    #[arg(short = 'u', long, env = "NIMBUS_USERNAME")]
    pub username: Option<String>,

    /// Nimbus account password
    #[arg(short = 'p', long, env = "NIMBUS_PASSWORD")]
    pub password: Option<String>,

    /// One-time code from the verification email (single use)
    #[arg(long, env = "NIMBUS_OTP")]
    pub otp: Option<String>,

    /// Path of the durable session record (.json, or .sqlite3/.db for SQLite)
    #[arg(short = 's', long, env = "NIMBUS_STATE_FILE")]
    pub state_file: Option<String>,

    /// Identity token endpoint
    #[arg(long, env = "NIMBUS_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log chatty session-lifecycle events at info level
    #[arg(short = 'v', long, env = "NIMBUS_VERBOSE")]
    pub verbose: bool,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub request_timeout: u64,

    /// Clear the stored session and exit
    #[arg(long)]
    pub logout: bool,

    /// Print session state without performing any network I/O
    #[arg(long)]
    pub status: bool,

    /// Stay resident and keep the refresh chain alive until interrupted
    #[arg(long)]
    pub keep_alive: bool,
}

/// What the binary should do after initialization
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunMode {
    /// Obtain and print a valid access token (default)
    Token,
    Status,
    Logout,
    KeepAlive,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
    pub token_url: String,
    pub state_file: PathBuf,
    pub log_level: String,
    pub verbose: bool,
    pub connect_timeout: u64,
    pub request_timeout: u64,
    pub mode: RunMode,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    fn from_args(args: CliArgs) -> Result<Self> {
        let username = args
            .username
            .context("NIMBUS_USERNAME is required (use -u or set NIMBUS_USERNAME env var)")?;
        let password = args
            .password
            .context("NIMBUS_PASSWORD is required (use -p or set NIMBUS_PASSWORD env var)")?;

        let state_file = args
            .state_file
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(default_state_file);

        Ok(Config {
            username,
            password,
            otp: args.otp.filter(|code| !code.is_empty()),
            token_url: args.token_url,
            state_file,
            log_level: args.log_level,
            verbose: args.verbose,
            connect_timeout: args.connect_timeout,
            request_timeout: args.request_timeout,
            mode: run_mode(args.logout, args.status, args.keep_alive),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            anyhow::bail!("NIMBUS_USERNAME must not be empty");
        }
        if self.password.is_empty() {
            anyhow::bail!("NIMBUS_PASSWORD must not be empty");
        }
        if !self.token_url.starts_with("http") {
            anyhow::bail!("NIMBUS_TOKEN_URL is not a valid URL: {}", self.token_url);
        }
        Ok(())
    }
}

/// Pick the run mode from the mutually exclusive action flags
fn run_mode(logout: bool, status: bool, keep_alive: bool) -> RunMode {
    if logout {
        RunMode::Logout
    } else if status {
        RunMode::Status
    } else if keep_alive {
        RunMode::KeepAlive
    } else {
        RunMode::Token
    }
}

/// Default location of the durable session record
fn default_state_file() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(".nimbus/session.json");
    }
    PathBuf::from(".nimbus/session.json")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing credentials)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();

    let has_username = std::env::var("NIMBUS_USERNAME").is_ok();
    let has_password = std::env::var("NIMBUS_PASSWORD").is_ok();

    !env_file_exists && (!has_username || !has_password)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub username: String,
    pub password: String,
    pub otp: Option<String>,
    pub state_file: String,
}

/// Run interactive setup to collect the account credentials
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Nimbus Session - first time setup");
    println!();
    println!("No configuration found. Enter the Nimbus account this machine should use.");
    println!();

    let username: String = Input::new()
        .with_prompt("Nimbus username (email)")
        .interact_text()
        .context("Failed to read NIMBUS_USERNAME")?;

    if username.is_empty() {
        anyhow::bail!("NIMBUS_USERNAME cannot be empty");
    }

    let password: String = Password::new()
        .with_prompt("Nimbus password")
        .interact()
        .context("Failed to read NIMBUS_PASSWORD")?;

    if password.is_empty() {
        anyhow::bail!("NIMBUS_PASSWORD cannot be empty");
    }

    println!();
    println!("If Nimbus emailed you a one-time code, enter it now; leave empty otherwise.");
    let otp: String = Input::new()
        .with_prompt("One-time code")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read NIMBUS_OTP")?;

    println!();
    let state_file: String = Input::new()
        .with_prompt("Session state file")
        .default("~/.nimbus/session.json".to_string())
        .interact_text()
        .context("Failed to read NIMBUS_STATE_FILE")?;

    let config = InteractiveConfig {
        username,
        password,
        otp: if otp.is_empty() { None } else { Some(otp) },
        state_file,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    Ok(config)
}

/// Save configuration to .env file.
/// The one-time code is single-use and deliberately not written out.
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Nimbus Session Configuration
# Generated by interactive setup

# Nimbus account (required)
NIMBUS_USERNAME={}
NIMBUS_PASSWORD={}

# Durable session record (.json, or .sqlite3/.db for SQLite)
NIMBUS_STATE_FILE={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.username, config.password, config.state_file,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
