//! sessionguard - log in to an API, inspect the session and make authenticated calls.
//!
//! The session is kept in the configured store between runs, so `login` once
//! and every later command reuses (and silently refreshes) the same tokens.

use std::io::{self, Write};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionguard_core::{LoginCredentials, LoginOutcome, SessionConfig, SessionManager};

/// Environment variable for the default login identifier
const IDENTIFIER_ENV: &str = "SESSIONGUARD_IDENTIFIER";

const USAGE: &str = "\
Usage: sessionguard <command>

Commands:
  login [identifier]   Log in (prompts for the secret)
  logout               End the current session
  status               Show who is logged in and when the access token expires
  token                Print a valid access token, refreshing it if needed
  get <path>           GET <api_base_url>/<path> with the session and print the JSON
  config [save]        Print the effective configuration, or save it as the config file";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = SessionConfig::load().context("Failed to load configuration")?;
    config.apply_env()?;

    if command == "config" {
        return show_config(&config, args.get(1).map(String::as_str));
    }

    let manager = SessionManager::from_config(&config)?;

    match command.as_str() {
        "login" => login(&manager, args.get(1).cloned()).await,
        "logout" => {
            manager.logout()?;
            println!("Logged out");
            Ok(())
        }
        "status" => status(&manager),
        "token" => {
            let token = manager.access_token().await?;
            println!("{}", token);
            Ok(())
        }
        "get" => {
            let path = args.get(1).ok_or_else(|| anyhow!("get needs a path\n\n{}", USAGE))?;
            let body: Value = manager.api().get(path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(manager: &SessionManager, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier.or_else(|| std::env::var(IDENTIFIER_ENV).ok()) {
        Some(identifier) => identifier,
        None => {
            print!("Identifier: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if identifier.is_empty() {
        bail!("Identifier required");
    }

    let secret = rpassword::prompt_password("Secret: ").context("Failed to read secret")?;

    match manager.login(&LoginCredentials::new(identifier, secret)).await {
        LoginOutcome::Authenticated(user) => {
            info!(subject = %user.subject, "Login complete");
            match user.role {
                Some(role) => println!("Logged in as {} ({})", user.subject, role),
                None => println!("Logged in as {}", user.subject),
            }
            Ok(())
        }
        LoginOutcome::Rejected(e) => Err(anyhow!("Login failed: {}", e)),
    }
}

fn show_config(config: &SessionConfig, action: Option<&str>) -> Result<()> {
    match action {
        None => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
        Some("save") => {
            let path = config.save().context("Failed to save configuration")?;
            println!("Configuration saved to {}", path.display());
            Ok(())
        }
        Some(other) => bail!("Unknown config action: {}\n\n{}", other, USAGE),
    }
}

fn status(manager: &SessionManager) -> Result<()> {
    let Some(user) = manager.user() else {
        println!("Not logged in");
        return Ok(());
    };

    println!("Subject:       {}", user.subject);
    println!("Role:          {}", user.role.as_deref().unwrap_or("-"));
    println!(
        "Authenticated: {}",
        if manager.is_authenticated() { "yes" } else { "no (refresh token expired)" }
    );

    if let Some(claims) = manager.access_claims() {
        let remaining = claims.seconds_until_expiry();
        let at = claims
            .expires_at_utc()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if remaining > 0 {
            println!("Access token:  expires {} ({}m left)", at, remaining / 60);
        } else {
            println!(
                "Access token:  expired {} ({}m ago, will refresh on next use)",
                at,
                -remaining / 60
            );
        }
    }
    Ok(())
}
