//! One-shot "say" command

use std::error::Error;

use crate::cli::chat::{exchange, open_session};
use crate::core::app::App;
use crate::core::conversation::ConversationProtocol;
use crate::logging::TranscriptLog;

pub async fn run_say(
    app: &mut App,
    protocol: &ConversationProtocol,
    coach: &str,
    context: Option<String>,
    prompt: &str,
    stream: bool,
    transcript: &TranscriptLog,
) -> Result<(), Box<dyn Error>> {
    if prompt.trim().is_empty() {
        eprintln!("Usage: coachai say -c <coach_id> <prompt>");
        std::process::exit(1);
    }

    let mut session = open_session(app, coach, context)?;
    exchange(app, &mut session, protocol, prompt, stream, transcript).await
}
