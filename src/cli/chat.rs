//! Line-based conversation loop

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::cli::print_status;
use crate::core::app::App;
use crate::core::chat::{ChatSession, SubmitError};
use crate::core::constants::{FREE_LIMIT, QUOTA_EXCEEDED_BANNER};
use crate::core::conversation::ConversationProtocol;
use crate::core::quota::remaining;
use crate::logging::TranscriptLog;

// Show a "messages left" hint at or below this many.
const LOW_QUOTA_HINT: u32 = 3;

pub async fn run_chat(
    app: &mut App,
    protocol: &ConversationProtocol,
    coach: &str,
    context: Option<String>,
    stream: bool,
    transcript: &TranscriptLog,
) -> Result<(), Box<dyn Error>> {
    let mut session = open_session(app, coach, context)?;

    let persona = session.persona();
    println!("{} {} - {}", persona.avatar, persona.name, persona.role);
    println!("{}\n", persona.specialty);
    if !session.sample_prompts().is_empty() {
        println!("Try asking:");
        for prompt in session.sample_prompts() {
            println!("  • {prompt}");
        }
        println!();
    }
    println!("Type /status for remaining messages, /quit to leave.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/status" => print_status(&app.quota_status().await),
            text => exchange(app, &mut session, protocol, text, stream, transcript).await?,
        }
    }

    Ok(())
}

/// Start a conversation, showing the welcome text on first use. Exits on an
/// unknown or locked coach.
pub(crate) fn open_session(
    app: &mut App,
    coach: &str,
    context: Option<String>,
) -> Result<ChatSession, Box<dyn Error>> {
    if !app.onboarding_completed() {
        println!("👋 Welcome to CoachAI!");
        println!("Your personal AI coaches are ready to help you grow.");
        println!("Free plan: {FREE_LIMIT} messages per day with the free coaches.\n");
        app.complete_onboarding()?;
    }

    match app.start_conversation(coach, context) {
        Ok(session) => Ok(session),
        Err(e) => {
            eprintln!("❌ {e}");
            eprintln!("\n💡 See available coaches with: coachai coaches");
            std::process::exit(1);
        }
    }
}

/// Send one message and print the reply.
pub(crate) async fn exchange(
    app: &App,
    session: &mut ChatSession,
    protocol: &ConversationProtocol,
    text: &str,
    stream: bool,
    transcript: &TranscriptLog,
) -> Result<(), Box<dyn Error>> {
    let is_premium = app.is_premium();
    let speaker = session.persona().name.clone();

    let result = if stream {
        print!("{speaker}: ");
        io::stdout().flush()?;
        session
            .submit_streaming(text, app.quota(), is_premium, protocol, |chunk| {
                print!("{chunk}");
                let _ = io::stdout().flush();
            })
            .await
    } else {
        session.submit(text, app.quota(), is_premium, protocol).await
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(SubmitError::QuotaExceeded(_)) => {
            println!("🔒 {QUOTA_EXCEEDED_BANNER}");
            println!("   coachai upgrade\n");
            return Ok(());
        }
        Err(SubmitError::EmptyInput) => return Ok(()),
        Err(e @ SubmitError::Busy) => {
            eprintln!("⚠️  {e}");
            return Ok(());
        }
    };

    if stream {
        println!();
        if outcome.failed {
            println!("{speaker}: {}", outcome.reply.content);
        }
        println!();
    } else {
        println!("{speaker}: {}\n", outcome.reply.content);
    }

    if transcript.is_active() {
        let logged = session
            .turns()
            .iter()
            .rev()
            .nth(1)
            .map_or(Ok(()), |turn| transcript.log_turn("You", turn))
            .and_then(|_| transcript.log_turn(&speaker, &outcome.reply));
        if let Err(e) = logged {
            warn!(error = %e, "Failed to write transcript");
        }
    }

    if let Some(left) = remaining(&outcome.quota, is_premium) {
        if left <= LOW_QUOTA_HINT {
            println!("({left} messages left today)\n");
        }
    }

    Ok(())
}
