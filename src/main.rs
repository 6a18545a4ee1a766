use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use nimbus_session::auth::{IdentityClient, SessionConfig, SessionManager};
use nimbus_session::config::{self, RunMode};
use nimbus_session::store::{JsonFileStore, SessionStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing credentials)
    if config::needs_interactive_setup() {
        let interactive = config::run_interactive_setup()?;

        // Seed environment variables so Config::load() picks them up
        std::env::set_var("NIMBUS_USERNAME", &interactive.username);
        std::env::set_var("NIMBUS_PASSWORD", &interactive.password);
        std::env::set_var("NIMBUS_STATE_FILE", &interactive.state_file);
        if let Some(ref otp) = interactive.otp {
            std::env::set_var("NIMBUS_OTP", otp);
        }
    }

    // Load configuration first (for log level)
    let config = config::Config::load()?;
    config.validate()?;

    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::info!("Nimbus Session starting...");
    tracing::debug!(state_file = %config.state_file.display(), token_url = %config.token_url, "Configuration loaded");

    let store = store_for_path(&config.state_file);

    let identity = IdentityClient::new(
        config.token_url.clone(),
        config.connect_timeout,
        config.request_timeout,
    )?;

    let session_config = SessionConfig::new(config.username.clone(), config.password.clone())
        .with_otp(config.otp.clone())
        .with_verbose(config.verbose);

    let manager = SessionManager::new(identity, store, session_config);

    match config.mode {
        RunMode::Logout => {
            manager.logout().await;
            println!("Stored session cleared for {}", manager.username());
        }

        RunMode::Status => match manager.token_expiries() {
            Some((access_expiry, refresh_expiry)) => {
                println!("Account:         {}", manager.username());
                println!(
                    "Access token:    {} (expires {})",
                    if manager.has_valid_token() { "valid" } else { "expired" },
                    access_expiry.to_rfc3339()
                );
                println!("Refresh token:   expires {}", refresh_expiry.to_rfc3339());
            }
            None => {
                println!("Account:         {}", manager.username());
                println!("No stored session; next token request will log in with credentials");
            }
        },

        RunMode::Token => {
            let token = manager.get_token().await?;
            tracing::info!(
                "Authentication successful (token: {}...)",
                &token[..8.min(token.len())]
            );
            println!("{token}");
            // One-shot process: don't rely on the debounce window elapsing
            manager.flush();
        }

        RunMode::KeepAlive => {
            match manager.get_token().await {
                Ok(token) => {
                    tracing::info!(
                        "Authentication successful (token: {}...); keeping session alive",
                        &token[..8.min(token.len())]
                    );
                }
                Err(err) => {
                    tracing::error!("Authentication failed: {err}");
                    tracing::warn!("Staying resident; the next token request may recover");
                }
            }

            shutdown_signal().await;
            manager.flush();
            tracing::info!("Shutdown complete");
        }
    }

    Ok(())
}

/// Pick the store backend from the state-file extension.
/// `.sqlite3`, `.sqlite` and `.db` select SQLite; anything else is JSON.
fn store_for_path(path: &Path) -> Arc<dyn SessionStore> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("sqlite3") | Some("sqlite") | Some("db") => Arc::new(SqliteStore::new(path)),
        _ => Arc::new(JsonFileStore::new(path)),
    }
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_selection() {
        fn is_sqlite(path: &str) -> bool {
            matches!(
                Path::new(path).extension().and_then(|ext| ext.to_str()),
                Some("sqlite3") | Some("sqlite") | Some("db")
            )
        }

        assert!(is_sqlite("/tmp/session.sqlite3"));
        assert!(is_sqlite("/tmp/session.db"));
        assert!(!is_sqlite("/tmp/session.json"));
        assert!(!is_sqlite("/tmp/session"));
    }
}
