//! The input-request protocol: the session publishes on `input_request`
//! and awaits the first message on the per-id response channel. A
//! literal `q` ends the session.

use serde_json::Value;

use crate::session::commands;
use crate::session::stream::{Channel, MessageSource, StreamMessage};
use crate::session::{Session, SessionError};

/// Ask the client for one line of input.
pub async fn collect_user_input(session: &Session) -> Result<StreamMessage, SessionError> {
    let (_, mut responses) = session.bus.request(
        Value::Null,
        Channel::InputRequest,
        MessageSource::Server,
        Channel::InputResponse,
    );

    let response = responses
        .recv()
        .await
        .ok_or_else(|| SessionError::Internal(anyhow::anyhow!("bus closed during input")))?;

    tracing::debug!(input = %response.text(), "user input");
    if response.text().trim() == "q" {
        return Err(SessionError::Exit);
    }
    Ok(response)
}

/// Yes/no prompt; empty input takes the default.
pub async fn ask_yes_no(session: &Session, default_yes: bool) -> Result<bool, SessionError> {
    loop {
        session
            .bus
            .print(if default_yes { "(Y/n)" } else { "(y/N)" });
        let response = collect_user_input(session).await?;
        let content = response.text().trim().to_lowercase();
        if content == "y" || content == "n" || content.is_empty() {
            return Ok(content == "y" || (content != "n" && default_yes));
        }
    }
}

/// Collect input, interpreting `/commands` until a plain message
/// arrives. Command failures report softly and keep collecting.
pub async fn collect_input_with_commands(session: &Session) -> Result<StreamMessage, SessionError> {
    loop {
        let response = collect_user_input(session).await?;
        let text = response.text();
        if !text.trim_start().starts_with('/') {
            return Ok(response);
        }
        commands::dispatch(session, text.trim()).await;
    }
}
