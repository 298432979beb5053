//! Slash commands: a small closed set registered by name, dispatched
//! when user input begins with `/`. Unknown commands fail softly with a
//! stream error.

use anyhow::Result;

use crate::core::{agent, git};
use crate::session::Session;

/// Argument metadata for help and completion.
pub struct ArgSpec {
    pub name: &'static str,
    pub required: bool,
}

/// The command set. Each variant knows its name, help text, argument
/// shape, and application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Include,
    Exclude,
    Clear,
    Undo,
    UndoAll,
    Context,
    Agent,
    Commit,
    Diff,
    Help,
}

impl Command {
    pub fn all() -> &'static [Command] {
        &[
            Command::Include,
            Command::Exclude,
            Command::Clear,
            Command::Undo,
            Command::UndoAll,
            Command::Context,
            Command::Agent,
            Command::Commit,
            Command::Diff,
            Command::Help,
        ]
    }

    pub fn from_name(name: &str) -> Option<Command> {
        Command::all().iter().copied().find(|c| c.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Include => "include",
            Command::Exclude => "exclude",
            Command::Clear => "clear",
            Command::Undo => "undo",
            Command::UndoAll => "undo-all",
            Command::Context => "context",
            Command::Agent => "agent",
            Command::Commit => "commit",
            Command::Diff => "diff",
            Command::Help => "help",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Command::Include => "Add files, directories, or globs to context (path[:ranges])",
            Command::Exclude => "Remove files or directories from context",
            Command::Clear => "Clear the conversation and auto-context state",
            Command::Undo => "Undo the last applied edit set",
            Command::UndoAll => "Undo all edits since your last message",
            Command::Context => "Show the files currently in context",
            Command::Agent => "Toggle agent mode (post-edit command runs)",
            Command::Commit => "Commit all changes (optional message)",
            Command::Diff => "Show the diff versus the diff target",
            Command::Help => "Show this help",
        }
    }

    pub fn arguments(&self) -> &'static [ArgSpec] {
        match self {
            Command::Include => &[ArgSpec {
                name: "path[:ranges]",
                required: true,
            }],
            Command::Exclude => &[ArgSpec {
                name: "path",
                required: true,
            }],
            Command::Commit => &[ArgSpec {
                name: "message",
                required: false,
            }],
            _ => &[],
        }
    }

    /// Complete a partially typed argument. Path-taking commands offer
    /// currently included files; everything else has nothing to offer.
    pub fn autocomplete(&self, session: &Session, partial: &str) -> Vec<String> {
        match self {
            Command::Exclude | Command::Include => {
                let context = session.context.borrow();
                let root = context.root().to_path_buf();
                context
                    .include_files()
                    .keys()
                    .map(|p| {
                        p.strip_prefix(&root)
                            .unwrap_or(p)
                            .display()
                            .to_string()
                    })
                    .filter(|p| p.starts_with(partial))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub async fn apply(&self, session: &Session, args: &[String]) -> Result<()> {
        match self {
            Command::Include => {
                if args.is_empty() {
                    anyhow::bail!("usage: /include path[:ranges] ...");
                }
                for arg in args {
                    let messages = session
                        .context
                        .borrow_mut()
                        .include(arg, &session.exclude_patterns)?;
                    for message in messages {
                        session.bus.print_colored(message, "green");
                    }
                }
            }
            Command::Exclude => {
                if args.is_empty() {
                    anyhow::bail!("usage: /exclude path ...");
                }
                for arg in args {
                    let messages = session.context.borrow_mut().exclude(arg)?;
                    for message in messages {
                        session.bus.print_colored(message, "green");
                    }
                }
            }
            Command::Clear => {
                session.conversation.borrow_mut().clear();
                session.context.borrow_mut().clear();
                session
                    .bus
                    .print_colored("Conversation and context cleared.", "green");
            }
            Command::Undo => {
                let undone = session.files.borrow_mut().undo()?;
                session.bus.print_colored(
                    if undone {
                        "Last edit set undone."
                    } else {
                        "Nothing to undo."
                    },
                    "green",
                );
            }
            Command::UndoAll => {
                let reverted = session.files.borrow_mut().undo_all()?;
                session
                    .bus
                    .print_colored(format!("Undid {reverted} edit set(s)."), "green");
            }
            Command::Context => {
                let display = session.context.borrow().display_context();
                session.bus.print(display);
            }
            Command::Agent => {
                let enabled = session.agent.borrow().enabled;
                if enabled {
                    session.agent.borrow_mut().enabled = false;
                    session.bus.print_colored("Agent mode off.", "green");
                } else {
                    agent::enable_agent_mode(session).await?;
                }
            }
            Command::Commit => {
                let message = if args.is_empty() {
                    "patchup commit".to_string()
                } else {
                    args.join(" ")
                };
                let root = session.files.borrow().root().to_path_buf();
                git::commit_all(&root, &message)?;
                session.bus.print_colored("Changes committed.", "green");
            }
            Command::Diff => {
                let root = session.files.borrow().root().to_path_buf();
                let target = session
                    .context
                    .borrow()
                    .diff()
                    .map(|d| d.target.clone())
                    .unwrap_or_else(|| "HEAD".to_string());
                let diff = git::diff(&root, &target, None)?;
                if diff.is_empty() {
                    session.bus.print_colored("No active changes.", "green");
                } else {
                    session.bus.print(diff);
                }
            }
            Command::Help => {
                let mut out = String::new();
                for command in Command::all() {
                    let args: Vec<&str> = command.arguments().iter().map(|a| a.name).collect();
                    let usage = if args.is_empty() {
                        format!("/{}", command.name())
                    } else {
                        format!("/{} {}", command.name(), args.join(" "))
                    };
                    out.push_str(&format!("{usage:<28} {}\n", command.help()));
                }
                session.bus.print(out);
            }
        }
        Ok(())
    }
}

/// Suggestions for a partially typed `/command` line: command names
/// first, then the active command's own argument completions.
pub fn complete(session: &Session, partial: &str) -> Vec<String> {
    let Some(stripped) = partial.strip_prefix('/') else {
        return Vec::new();
    };

    match stripped.split_once(char::is_whitespace) {
        None => Command::all()
            .iter()
            .filter(|c| c.name().starts_with(stripped))
            .map(|c| format!("/{}", c.name()))
            .collect(),
        Some((name, rest)) => Command::from_name(name)
            .map(|c| c.autocomplete(session, rest.trim_start()))
            .unwrap_or_default(),
    }
}

/// Dispatch a `/command` line. Errors are reported on the stream and
/// never abort the input loop.
pub async fn dispatch(session: &Session, input: &str) {
    let stripped = input.trim_start_matches('/');
    let mut parts = stripped.split_whitespace();
    let Some(name) = parts.next() else {
        session
            .bus
            .print_colored("Empty command. Try /help.", "red");
        return;
    };
    let args: Vec<String> = parts.map(str::to_string).collect();

    let Some(command) = Command::from_name(name) else {
        session
            .bus
            .print_colored(format!("Unknown command: /{name}. Try /help."), "red");
        return;
    };

    if let Err(e) = command.apply(session, &args).await {
        session
            .bus
            .print_colored(format!("Error running /{name}: {e:#}"), "red");
    }
}
