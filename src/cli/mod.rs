//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod coach_list;
pub mod say;

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cli::chat::run_chat;
use crate::cli::coach_list::list_coaches;
use crate::cli::say::run_say;
use crate::core::app::{App, QuotaStatus};
use crate::core::backend::OpenAiBackend;
use crate::core::clock::SystemClock;
use crate::core::config::data::CONFIG_KEYS;
use crate::core::config::Config;
use crate::core::constants::FREE_LIMIT;
use crate::core::conversation::ConversationProtocol;
use crate::core::entitlement::{Offer, SandboxEntitlements};
use crate::core::keyring::{resolve_api_key, store_api_key, API_KEY_ENV};
use crate::core::persona::CustomPersonaDraft;
use crate::core::store::{FileStore, KeyValueStore, MemoryStore};
use crate::logging::{init_tracing, TranscriptLog};

#[derive(Parser)]
#[command(name = "coachai")]
#[command(about = "Chat with AI coaches from the terminal")]
#[command(
    long_about = "CoachAI connects you with AI coaches for productivity, careers, health, \
creativity and finance. Free accounts can send 10 messages per rolling 24 hours and \
talk to the free coaches. Premium unlocks every coach, custom coaches and unlimited \
messages.\n\n\
Authentication:\n\
  Use 'coachai auth' to store an API key in your system keyring.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Your OpenAI API key (takes precedence over the keyring)\n\
  RUST_LOG          Diagnostic log filter (default: warn)\n\n\
Chat commands:\n\
  /status           Show remaining messages\n\
  /quit             Leave the conversation"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Append the conversation transcript to the specified file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<PathBuf>,

    /// Keep all state in memory for this run only
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available coaches (default)
    Coaches,
    /// Start an interactive conversation with a coach
    Chat {
        /// Coach id, as shown by `coachai coaches`
        #[arg(short = 'c', long)]
        coach: String,
        /// Print the reply as it is generated
        #[arg(short = 's', long)]
        stream: bool,
        /// Background about you; overrides the configured user-context
        #[arg(long)]
        context: Option<String>,
    },
    /// Send a single message and print the reply
    Say {
        /// Coach id, as shown by `coachai coaches`
        #[arg(short = 'c', long)]
        coach: String,
        /// Print the reply as it is generated
        #[arg(short = 's', long)]
        stream: bool,
        /// Background about you; overrides the configured user-context
        #[arg(long)]
        context: Option<String>,
        /// Message to send
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Show plan and remaining messages
    Status,
    /// Purchase Premium
    Upgrade {
        /// Choose the annual plan instead of monthly
        #[arg(long)]
        annual: bool,
    },
    /// Restore a previous Premium purchase
    Restore,
    /// Create a custom coach (Premium)
    CreateCoach {
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        specialty: Option<String>,
        #[arg(long)]
        personality: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Store the API key in the system keyring
    Auth,
    /// Set configuration values
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set for the key (can be multiple words)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Option<Vec<String>>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = Args::parse();
    let ephemeral = args.ephemeral;

    match args.command.unwrap_or(Commands::Coaches) {
        Commands::Coaches => {
            let app = bootstrap(Config::load()?, ephemeral).await?;
            list_coaches(&app);
            Ok(())
        }
        Commands::Chat {
            coach,
            stream,
            context,
        } => {
            let config = Config::load()?;
            let protocol = build_protocol(&config);
            let mut app = bootstrap(config, ephemeral).await?;
            let transcript = TranscriptLog::new(args.log)?;
            run_chat(&mut app, &protocol, &coach, context, stream, &transcript).await
        }
        Commands::Say {
            coach,
            stream,
            context,
            prompt,
        } => {
            let config = Config::load()?;
            let protocol = build_protocol(&config);
            let mut app = bootstrap(config, ephemeral).await?;
            let transcript = TranscriptLog::new(args.log)?;
            run_say(
                &mut app,
                &protocol,
                &coach,
                context,
                &prompt.join(" "),
                stream,
                &transcript,
            )
            .await
        }
        Commands::Status => {
            let app = bootstrap(Config::load()?, ephemeral).await?;
            print_status(&app.quota_status().await);
            Ok(())
        }
        Commands::Upgrade { annual } => {
            let mut app = bootstrap(Config::load()?, ephemeral).await?;
            let offer = if annual { Offer::Annual } else { Offer::Monthly };
            match app.upgrade(offer).await {
                Ok(true) => {
                    println!("✅ Premium activated ({}, {})", offer.label(), offer.price());
                }
                Ok(false) => println!("⚠️  Purchase did not activate Premium"),
                Err(e) => {
                    eprintln!("❌ Purchase failed: {e}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Restore => {
            let mut app = bootstrap(Config::load()?, ephemeral).await?;
            match app.restore().await {
                Ok(true) => println!("✅ Premium restored"),
                Ok(false) => println!("No previous purchase found"),
                Err(e) => {
                    eprintln!("❌ Restore failed: {e}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::CreateCoach {
            name,
            role,
            specialty,
            personality,
            avatar,
        } => {
            let mut app = bootstrap(Config::load()?, ephemeral).await?;
            let draft = CustomPersonaDraft {
                name,
                role,
                specialty,
                personality,
                avatar,
            };
            match app.create_custom_persona(draft) {
                Ok(persona) => {
                    println!("✅ Created {} ({})", persona.name, persona.id);
                    println!("\n💡 Start chatting with:");
                    println!("   coachai chat -c {}", persona.id);
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Auth => {
            print!("Enter your OpenAI API key: ");
            io::stdout().flush()?;
            let mut key = String::new();
            io::stdin().read_line(&mut key)?;
            if key.trim().is_empty() {
                eprintln!("❌ No key entered");
                std::process::exit(1);
            }
            if let Err(e) = store_api_key(&key) {
                eprintln!("❌ Authentication failed: {e}");
                std::process::exit(1);
            }
            println!("✅ API key stored in the system keyring");
            Ok(())
        }
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            match value.map(|parts| parts.join(" ")) {
                Some(value) if !value.trim().is_empty() => {
                    if let Err(e) = config.set_value(&key, &value) {
                        eprintln!("❌ {e}");
                        std::process::exit(1);
                    }
                    config.save()?;
                    println!("✅ Set {key} to: {}", value.trim());
                }
                _ => config.print_all(),
            }
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            if let Err(e) = config.unset_value(&key) {
                eprintln!("❌ {e}");
                eprintln!("Valid keys: {}", CONFIG_KEYS.join(", "));
                std::process::exit(1);
            }
            config.save()?;
            println!("✅ Unset {key}");
            Ok(())
        }
    }
}

fn open_store(ephemeral: bool) -> Result<Arc<dyn KeyValueStore>, Box<dyn Error>> {
    if ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = FileStore::default_path().ok_or("Failed to determine data directory")?;
    Ok(Arc::new(FileStore::new(path)))
}

async fn bootstrap(config: Config, ephemeral: bool) -> Result<App, Box<dyn Error>> {
    let store = open_store(ephemeral)?;
    let entitlements = Arc::new(SandboxEntitlements::new(store.clone()));
    let app = App::bootstrap(config, store, entitlements, Arc::new(SystemClock)).await?;
    Ok(app)
}

/// Build the protocol from config and the resolved API key. Exits when no key
/// is available.
fn build_protocol(config: &Config) -> ConversationProtocol {
    let api_key = match resolve_api_key() {
        Ok(Some(key)) => key,
        Ok(None) => exit_missing_key(),
        Err(e) if e.is_recoverable() => {
            warn!(error = %e, "Keyring unavailable");
            exit_missing_key()
        }
        Err(e) => {
            eprintln!("❌ Failed to read the API key from the keyring: {e}");
            std::process::exit(1);
        }
    };

    match OpenAiBackend::new(config.base_url(), api_key, config.request_timeout()) {
        Ok(backend) => ConversationProtocol::new(Arc::new(backend), config.sampling()),
        Err(e) => {
            eprintln!("❌ Failed to create HTTP client: {e}");
            std::process::exit(1);
        }
    }
}

fn exit_missing_key() -> ! {
    eprintln!("❌ No API key found");
    eprintln!();
    eprintln!("💡 Quick fixes:");
    eprintln!("  • export {API_KEY_ENV}=sk-...");
    eprintln!("  • coachai auth");
    std::process::exit(2);
}

pub(crate) fn print_status(status: &QuotaStatus) {
    if status.is_premium {
        println!("Plan: Premium");
        println!("Messages: unlimited");
    } else {
        println!("Plan: Free");
        println!(
            "Messages: {} of {FREE_LIMIT} remaining today",
            status.remaining.unwrap_or(0)
        );
    }
}
