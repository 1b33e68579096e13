//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments and routes each subcommand,
//! defaulting to the interactive chat loop.

use std::error::Error;
use std::io::{self, Write as _};

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::auth::AuthClient;
use crate::core::config::Config;
use crate::ui::chat_loop::run_chat;

#[derive(Parser)]
#[command(name = "charla")]
#[command(about = "A terminal chat client for a self-hosted bot API")]
#[command(
    long_about = "Charla is a terminal chat client that connects to a self-hosted bot API \
for real-time conversations. Replies stream in incrementally as the bot \
produces them.\n\n\
Authentication:\n\
  Use 'charla auth' to sign in (or 'charla sign-up' to create an account,\n\
  then 'charla verify <code>' with the emailed code to activate it).\n\
  The bearer token is stored securely in your system keyring.\n\n\
Commands in chat:\n\
  /system <text>    Set the system prompt for this session\n\
  /help             Show in-chat commands\n\
  /quit             Leave the chat"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the backend base URL for this invocation
    #[arg(short = 'u', long, global = true, value_name = "URL")]
    pub base_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the bearer token
    Auth,
    /// Create an account
    SignUp,
    /// Submit the emailed verification code that completes a sign-up
    Verify {
        /// The verification code from the email
        code: String,
    },
    /// Forget the stored bearer token
    Deauth,
    /// Start the chat interface (default)
    Chat,
    /// Ask a single question without streaming (legacy endpoint shape)
    Ask {
        /// The question to send
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Set configuration values (base-url, system-prompt)
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set for the key
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Option<Vec<String>>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn prompt(label: &str) -> Result<String, Box<dyn Error>> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn load_config(base_url_override: Option<String>) -> Result<Config, Box<dyn Error>> {
    let mut config = Config::load()?;
    if let Some(url) = base_url_override {
        config.base_url = Some(url);
    }
    Ok(config)
}

async fn sign_in_flow(auth: &AuthClient) -> Result<(), Box<dyn Error>> {
    let email = prompt("Email")?;
    let password = prompt("Password")?;

    let response = auth.sign_in(&email, &password).await?;
    let token = response.token.ok_or("sign-in succeeded but returned no token")?;
    auth.store_token(&token)?;

    let name = response
        .user
        .and_then(|u| u.name)
        .unwrap_or_else(|| email.clone());
    println!("✅ Signed in as {name}");
    Ok(())
}

async fn sign_up_flow(auth: &AuthClient) -> Result<(), Box<dyn Error>> {
    let email = prompt("Email")?;
    let name = prompt("Name")?;
    let password = prompt("Password")?;

    let response = auth.sign_up(&email, &name, &password).await?;
    if let Some(token) = response.token {
        auth.store_token(&token)?;
    }
    println!("✅ Account created. Check your email for verification instructions,");
    println!("   then run 'charla verify <code>' to activate the account.");
    Ok(())
}

async fn verify_flow(auth: &AuthClient, code: &str) -> Result<(), Box<dyn Error>> {
    let response = auth.verify_email(code).await?;
    if let Some(token) = response.token {
        auth.store_token(&token)?;
    }
    println!("✅ Email verified. You can sign in with 'charla auth'.");
    Ok(())
}

/// Validate the stored token against the backend, falling back to the
/// anonymous flow when it is missing or rejected.
async fn resolve_token(auth: &AuthClient) -> Option<String> {
    let token = auth.stored_token()?;
    match auth.check_auth(&token).await {
        Ok(user) => {
            let name = user.name.unwrap_or_else(|| "you".to_string());
            println!("Signed in as {name}.");
            Some(token)
        }
        Err(e) => {
            warn!(error = %e, "stored token rejected");
            println!("Stored sign-in is no longer valid; continuing anonymously.");
            None
        }
    }
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = load_config(args.base_url)?;
    let client = reqwest::Client::new();
    let auth = AuthClient::new(client.clone(), config.base_url());

    match args.command.unwrap_or(Commands::Chat) {
        Commands::Auth => {
            if let Err(e) = sign_in_flow(&auth).await {
                eprintln!("❌ Sign-in failed: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::SignUp => {
            if let Err(e) = sign_up_flow(&auth).await {
                eprintln!("❌ Sign-up failed: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Verify { code } => {
            if let Err(e) = verify_flow(&auth, &code).await {
                eprintln!("❌ Email verification failed: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Deauth => {
            auth.clear_token()?;
            println!("✅ Stored token removed");
            Ok(())
        }
        Commands::Ask { query } => {
            let query = query.join(" ");
            match auth.bot_query(config.system_prompt(), &query).await {
                Ok(reply) => {
                    println!("{reply}");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            let value = value.map(|v| v.join(" ")).filter(|v| !v.is_empty());
            match (key.as_str(), value) {
                ("base-url", Some(url)) => {
                    config.base_url = Some(url.clone());
                    config.save()?;
                    println!("✅ Set base-url to: {url}");
                }
                ("system-prompt", Some(prompt)) => {
                    config.system_prompt = Some(prompt.clone());
                    config.save()?;
                    println!("✅ Set system-prompt to: {prompt}");
                }
                (_, None) => config.print_all(),
                (other, _) => {
                    eprintln!("❌ Unknown configuration key: {other}");
                    eprintln!("   Valid keys: base-url, system-prompt");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Chat => {
            let token = resolve_token(&auth).await;
            run_chat(&config, token).await
        }
    }
}
