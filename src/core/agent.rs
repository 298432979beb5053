//! Agent mode: after an edit round, ask the model which shell commands
//! would validate its changes, confirm with the user, run them, and
//! feed the output back into the conversation.

use anyhow::{Context, Result};

use crate::llm::ChatMessage;
use crate::session::input::{ask_yes_no, collect_user_input};
use crate::session::{Session, SessionError};

const FILE_SELECTION_PROMPT: &str = "\
You are deciding how to verify changes to a codebase. From the file \
names that follow, list the files that describe how this project is \
tested and built (test configs, CI files, task runners, manifests). \
Respond with one path per line and nothing else.";

const COMMAND_SELECTION_PROMPT: &str = "\
You decide which shell commands should run to test the changes you just \
made. Using the project files provided and the conversation, respond \
with a newline-separated list of shell commands and nothing else. \
Prefer fast, targeted checks. An empty response means no checks are \
needed.";

const AUTONOMOUS_NOTE: &str = "\
You are currently being run autonomously. The following commands are \
being run to test your previous changes. If the commands show any \
errors with your changes, fix them. In order to return control to the \
user, make no more changes to the files. If you don't know how to fix \
a problem, do not waste time trying to solve it! The user would much \
prefer to regain control if you can't solve a problem.";

/// Agent-mode state held by the session.
#[derive(Default)]
pub struct AgentState {
    pub enabled: bool,

    /// Contents of the files the model picked as its testing guide
    pub file_message: String,
}

/// Phase 1, run once on enable: ask which files describe how to test
/// the project (file names only), then persist their contents as the
/// agent memo.
pub async fn enable_agent_mode(session: &Session) -> Result<()> {
    session
        .bus
        .print_colored("Finding files to determine how to test changes...", "cyan");

    let root = session.context.borrow().root().to_path_buf();
    let tracked = crate::core::git::tracked_files(&root).unwrap_or_default();
    let untracked = crate::core::git::untracked_text_files(&root).unwrap_or_default();
    let mut names: Vec<String> = tracked
        .iter()
        .chain(untracked.iter())
        .map(|p| {
            p.strip_prefix(&root)
                .unwrap_or(p)
                .display()
                .to_string()
        })
        .collect();
    names.sort();
    names.dedup();

    let messages = vec![
        ChatMessage::system(FILE_SELECTION_PROMPT),
        ChatMessage::system(names.join("\n")),
    ];
    let response = session.llm.chat(&messages).await?;

    let mut memo = String::new();
    let mut chosen = Vec::new();
    for line in response.lines() {
        let rel = line.trim();
        if rel.is_empty() {
            continue;
        }
        let path = root.join(rel);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            memo.push_str(&format!("{rel}\n\n{contents}\n"));
            chosen.push(rel.to_string());
        }
    }

    session.bus.print_colored(
        "The model chose these files to determine how to test its changes:",
        "cyan",
    );
    session.bus.print(chosen.join("\n"));

    let mut agent = session.agent.borrow_mut();
    agent.file_message = memo;
    agent.enabled = true;
    session
        .bus
        .print_colored("Agent mode on. /undo reverts a whole agent round.", "green");
    Ok(())
}

/// Phase 2, after each edit round: pick commands, confirm, run, inject
/// output. Returns whether control should return to the user.
pub async fn add_agent_context(session: &Session) -> Result<bool, SessionError> {
    let commands = determine_commands(session).await?;
    if commands.is_empty() {
        return Ok(true);
    }

    session
        .bus
        .print_colored("The model chose these commands to test its changes:", "cyan");
    for command in &commands {
        session.bus.print_colored(format!("* {command}"), "yellow");
    }

    session.bus.print_colored("Run these commands?", "cyan");
    let mut commands = commands;
    if !ask_yes_no(session, true).await? {
        session.bus.print_colored(
            "Enter a newline-separated list of commands to run, or nothing to take back control:",
            "cyan",
        );
        let reply = collect_user_input(session).await?;
        commands = reply
            .text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Ok(true);
        }
    }

    session.conversation.borrow_mut().add_system(AUTONOMOUS_NOTE);
    for command in &commands {
        let output = run_command(session, command).await.map_err(SessionError::Internal)?;
        session.conversation.borrow_mut().add_system(format!(
            "Command `{command}` output:\n{output}"
        ));
    }
    Ok(false)
}

/// Ask the model for a newline-separated command list, with the agent
/// memo and the live conversation as context.
async fn determine_commands(session: &Session) -> Result<Vec<String>, SessionError> {
    let file_message = session.agent.borrow().file_message.clone();

    let mut messages = vec![
        ChatMessage::system(COMMAND_SELECTION_PROMPT),
        ChatMessage::system(file_message),
    ];
    messages.extend(session.conversation.borrow().get_messages(false));

    let used: usize = messages
        .iter()
        .map(|m| session.budgeter.count_message(&m.content))
        .sum();
    let budget = session
        .settings
        .prompt_tokens
        .saturating_sub(used)
        .saturating_sub(session.settings.response_buffer);

    let prompt = session
        .conversation
        .borrow()
        .messages()
        .iter()
        .rev()
        .find(|m| m.origin == crate::core::conversation::MessageOrigin::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let code_message = {
        let context = session.context.borrow();
        context
            .get_code_message(&prompt, budget, None, &session.engine_deps())
            .await
            .map_err(SessionError::Internal)?
    };
    messages.insert(1, ChatMessage::system(code_message));

    let response = match session.llm.chat(&messages).await {
        Ok(response) => response,
        Err(e) => {
            session
                .bus
                .print_colored(format!("Error selecting agent commands: {e}"), "red");
            return Ok(Vec::new());
        }
    };

    session
        .conversation
        .borrow_mut()
        .add_assistant(response.clone(), messages);

    Ok(response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Run one shell command, streaming its combined output to the client.
async fn run_command(session: &Session, command: &str) -> Result<String> {
    let root = session.files.borrow().root().to_path_buf();
    session
        .bus
        .print_colored(format!("$ {command}"), "yellow");

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&root)
        .output()
        .await
        .with_context(|| format!("Failed to run `{command}`"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    if !output.status.success() {
        combined.push_str(&format!(
            "\n(exit code: {})",
            output.status.code().unwrap_or(-1)
        ));
    }

    session.bus.print(combined.clone());
    Ok(combined)
}
