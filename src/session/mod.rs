//! The session kernel: owns the long-lived singletons, drives the turn
//! loop, and keeps running across everything except `SessionExit` and
//! cancellation of the whole process.

/// The broadcast bus
pub mod stream;

/// Input-request protocol helpers
pub mod input;

/// Slash-command registry and dispatch
pub mod commands;

/// The thin line-oriented terminal client
pub mod client;

use std::cell::RefCell;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::core::agent::{self, AgentState};
use crate::core::apply::FileManager;
use crate::core::budget::Budgeter;
use crate::core::context::{ContextConfig, ContextEngine, DiffContext, EngineDeps};
use crate::core::conversation::Conversation;
use crate::core::edits::FileEdit;
use crate::core::filters::EmbeddingCache;
use crate::core::git;
use crate::infra::config::Settings;
use crate::llm::{ChatMessage, LlmClient, ProviderError};
use crate::parsers::{self, ParsedResponse, StreamParser};
use self::stream::{Channel, MessageSource, SessionBus};

/// Turn-level failures, sorted by how the kernel reacts to them.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Bad paths, invalid arguments; reported, turn continues
    #[error("{0}")]
    User(String),

    /// Provider trouble; turn aborted, user prompted again
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The fixed parts of the prompt alone exceed the budget
    #[error("Context size insufficient: {0}")]
    ContextSizeInsufficient(String),

    /// Normal termination
    #[error("session exit")]
    Exit,

    /// Everything else; logged with a red banner, loop continues
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Startup parameters distilled from the CLI.
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub paths: Vec<String>,
    pub exclude: Vec<String>,
    pub ignore: Vec<String>,
    pub diff: Option<String>,
    pub pr_diff: Option<String>,
    pub agent: bool,
}

/// The session: every long-lived singleton, accessed from the single
/// task loop (interior mutability, no locks).
pub struct Session {
    pub bus: SessionBus,
    pub settings: Settings,
    pub budgeter: Budgeter,
    pub llm: LlmClient,
    pub embeddings: EmbeddingCache,

    pub context: RefCell<ContextEngine>,
    pub conversation: RefCell<Conversation>,
    pub files: RefCell<FileManager>,
    pub agent: RefCell<AgentState>,

    pub exclude_patterns: Vec<String>,

    start_agent: bool,
}

impl Session {
    /// Build a session rooted at the repository containing `cwd`.
    pub fn new(
        options: SessionOptions,
        settings: Settings,
        llm: LlmClient,
        bus: SessionBus,
    ) -> Result<Self> {
        let root = git::resolve_root(&options.cwd)
            .with_context(|| format!("{} is not inside a git repository", options.cwd.display()))?;

        let budgeter = Budgeter::new(&settings.model)?;

        let diff = DiffContext::resolve(&root, options.diff.as_deref(), options.pr_diff.as_deref())?;

        let mut ignore_patterns = settings.ignore_patterns.clone();
        ignore_patterns.extend(options.ignore.clone());

        let config = ContextConfig {
            auto_context: settings.auto_context,
            auto_tokens: settings.auto_tokens,
            use_embeddings: settings.use_embeddings,
            use_llm_selector: settings.use_llm_selector,
            max_file_chars: settings.max_file_chars,
            ignore_patterns,
        };
        let mut context = ContextEngine::new(root.clone(), config, diff);

        for path in &options.paths {
            for message in context.include(path, &options.exclude)? {
                tracing::info!("{message}");
            }
        }

        let format = parsers::format_by_name(&settings.format)
            .with_context(|| format!("Unknown edit format: {}", settings.format))?;
        // Transcripts are best-effort: a missing state dir never blocks
        // the session
        let mut conversation = Conversation::new(format.system_prompt());
        if let Ok(state) = crate::infra::config::state_dir() {
            let transcript = state.join("transcripts").join(format!(
                "session_{}.jsonl",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ));
            conversation = conversation.with_transcript(transcript);
        }

        let files = FileManager::new(root, settings.backups);

        Ok(Self {
            bus,
            budgeter,
            llm,
            embeddings: EmbeddingCache::new(),
            context: RefCell::new(context),
            conversation: RefCell::new(conversation),
            files: RefCell::new(files),
            agent: RefCell::new(AgentState::default()),
            exclude_patterns: options.exclude,
            start_agent: options.agent,
            settings,
        })
    }

    pub fn engine_deps(&self) -> EngineDeps<'_> {
        EngineDeps {
            budgeter: &self.budgeter,
            llm: &self.llm,
            embeddings: &self.embeddings,
        }
    }

    /// Run the kernel until exit: the main turn loop plus the
    /// session-exit and completion-request listeners. Emits
    /// `client_exit` when done.
    pub async fn run(&self) -> i32 {
        let mut exit_listener = self.bus.listen(Channel::SessionExit);
        let mut completion_listener = self.bus.listen(Channel::CompletionRequest);

        let completions = async {
            while let Some(request) = completion_listener.recv().await {
                let suggestions = commands::complete(self, &request.text());
                self.bus.send(
                    Value::from(suggestions),
                    Channel::CompletionResponse(request.id),
                    MessageSource::Server,
                );
            }
        };

        let code = tokio::select! {
            code = self.main_loop() => code,
            _ = exit_listener.recv() => 0,
            _ = completions => 0,
        };

        // Drain: let the client render the goodbye before exit
        self.bus
            .send(Value::Null, Channel::ClientExit, MessageSource::Server);
        tokio::task::yield_now().await;
        code
    }

    async fn main_loop(&self) -> i32 {
        self.bus
            .print_colored("Type 'q' or use Ctrl-C to quit at any time.", "cyan");
        {
            let display = self.context.borrow().display_context();
            self.bus.print(display);
        }

        if self.start_agent {
            if let Err(e) = agent::enable_agent_mode(self).await {
                self.bus
                    .print_colored(format!("Could not enable agent mode: {e:#}"), "red");
            }
        }

        let mut need_user_request = true;
        loop {
            match self.one_turn(need_user_request).await {
                Ok(next) => need_user_request = next,
                Err(SessionError::Exit) => return 0,
                Err(SessionError::Provider(e)) => {
                    self.bus
                        .print_colored(format!("Error from provider: {e}"), "red");
                    need_user_request = true;
                }
                Err(SessionError::ContextSizeInsufficient(msg)) => {
                    self.bus.print_colored(
                        format!(
                            "{msg}\nExclude files or lower the auto-context budget to make room."
                        ),
                        "red",
                    );
                    need_user_request = true;
                }
                Err(SessionError::User(msg)) => {
                    self.bus.print_colored(msg, "red");
                    need_user_request = true;
                }
                Err(SessionError::Internal(e)) => {
                    tracing::error!(error = ?e, "unhandled error in turn");
                    self.bus
                        .print_colored(format!("Internal error: {e:#}"), "red");
                    need_user_request = true;
                }
            }
        }
    }

    /// One full turn: collect input, stream the model, apply edits,
    /// optionally run the agent round.
    async fn one_turn(&self, need_user_request: bool) -> Result<bool, SessionError> {
        if need_user_request {
            if self.agent.borrow().enabled {
                self.files.borrow_mut().push_boundary();
                self.bus.print_colored(
                    "Use /undo-all to undo all changes from agent mode since last input.",
                    "green",
                );
            }
            self.bus.print_colored("\nWhat can I do for you?", "blue");
            let message = input::collect_input_with_commands(self).await?;
            if message.text().trim().is_empty() {
                return Ok(true);
            }
            self.conversation.borrow_mut().add_user(message.text());
        }

        let parsed = self.model_turn().await?;

        let mut edits: Vec<FileEdit> = parsed
            .edits
            .into_iter()
            .filter(FileEdit::is_useful)
            .collect();
        let had_edits = !edits.is_empty();

        let mut next_need_user = true;
        if had_edits {
            let agent_enabled = self.agent.borrow().enabled;
            if !agent_enabled {
                let (kept, need_user) = self.get_user_feedback_on_edits(edits).await?;
                edits = kept;
                next_need_user = need_user;
            }

            let (applied, notes) = self
                .files
                .borrow_mut()
                .write_changes(&edits)
                .map_err(SessionError::Internal)?;
            for note in notes {
                self.bus.print_colored(note, "yellow");
            }
            self.bus.print_colored(
                if applied {
                    "Changes applied."
                } else {
                    "No changes applied."
                },
                "blue",
            );

            if agent_enabled {
                next_need_user = if parsed.interrupted {
                    true
                } else {
                    agent::add_agent_context(self).await?
                };
            }
        }

        self.bus.send(
            Value::Bool(had_edits),
            Channel::EditsComplete,
            MessageSource::Server,
        );
        Ok(next_need_user)
    }

    /// Build the prompt, stream the response through the parser, and
    /// archive the assistant message. Interrupts commit partial edits.
    async fn model_turn(&self) -> Result<ParsedResponse, SessionError> {
        let prompt = self
            .conversation
            .borrow()
            .messages()
            .iter()
            .rev()
            .find(|m| m.origin == crate::core::conversation::MessageOrigin::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let conversation_tokens = self.conversation.borrow().count_tokens(&self.budgeter);
        let budget = self
            .settings
            .prompt_tokens
            .saturating_sub(conversation_tokens)
            .saturating_sub(self.settings.response_buffer);
        if budget == 0 {
            return Err(SessionError::ContextSizeInsufficient(format!(
                "The conversation alone uses {conversation_tokens} tokens of the \
                 {}-token budget.",
                self.settings.prompt_tokens
            )));
        }

        let code_message = {
            let context = self.context.borrow();
            context
                .get_code_message(&prompt, budget, None, &self.engine_deps())
                .await
                .map_err(SessionError::Internal)?
        };

        let mut messages = self.conversation.borrow().get_messages(true);
        messages.insert(1, ChatMessage::system(code_message));

        // Subscribe before the request so an early Ctrl-C is not missed
        let mut interrupts = self.bus.listen(Channel::Interrupt);

        self.bus
            .send("start", Channel::Loading, MessageSource::Server);
        let stream_result = self.llm.chat_stream(&messages).await;
        let mut token_stream = match stream_result {
            Ok(s) => s,
            Err(e) => {
                self.bus
                    .send("stop", Channel::Loading, MessageSource::Server);
                return Err(e.into());
            }
        };

        let root = self.files.borrow().root().to_path_buf();
        let format = parsers::format_by_name(&self.settings.format)
            .expect("format validated at startup");
        let files = self.files.borrow();
        let mut parser = StreamParser::new(format, root, &*files);

        let mut interrupted = false;
        let mut first_chunk = true;

        loop {
            tokio::select! {
                chunk = token_stream.next() => {
                    let Some(chunk) = chunk else { break };
                    if first_chunk {
                        // Stop the spinner once tokens start flowing
                        self.bus.send("stop", Channel::Loading, MessageSource::Server);
                        first_chunk = false;
                    }
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            drop(parser);
                            drop(files);
                            return Err(e.into());
                        }
                    };
                    for event in parser.feed(&chunk) {
                        self.bus.print(event);
                    }
                }
                Some(_) = interrupts.recv() => {
                    interrupted = true;
                    self.bus.print_colored(
                        "\n\nInterrupted by user. Using the response up to this point.",
                        "red",
                    );
                    break;
                }
            }
        }
        if first_chunk {
            self.bus
                .send("stop", Channel::Loading, MessageSource::Server);
        }

        let (events, parsed) = parser.finish(interrupted);
        for event in events {
            self.bus.print(event);
        }
        drop(files);

        self.conversation
            .borrow_mut()
            .add_assistant(parsed.message.clone(), messages);

        Ok(parsed)
    }

    /// Preview the edit set and ask for approval: `y`/empty applies all,
    /// `n` none, `i` iterates per edit, anything else is feedback sent
    /// back to the model.
    async fn get_user_feedback_on_edits(
        &self,
        edits: Vec<FileEdit>,
    ) -> Result<(Vec<FileEdit>, bool), SessionError> {
        {
            let files = self.files.borrow();
            for edit in &edits {
                self.bus.print(files.preview(edit));
            }
        }

        self.bus.print_colored(
            "Apply these changes? 'Y/n/i' or provide feedback.",
            "blue",
        );
        let response = input::collect_user_input(self).await?;
        let text = response.text().trim().to_lowercase();

        match text.as_str() {
            "y" | "" => {
                self.conversation
                    .borrow_mut()
                    .add_user("User chose to apply all of your changes.");
                Ok((edits, true))
            }
            "n" => {
                self.conversation
                    .borrow_mut()
                    .add_user("User chose not to apply any of your changes.");
                Ok((Vec::new(), true))
            }
            "i" => {
                let mut kept = Vec::new();
                let mut indices = Vec::new();
                let total = edits.len();
                for (i, edit) in edits.into_iter().enumerate() {
                    let preview = self.files.borrow().preview(&edit);
                    self.bus.print(preview);
                    self.bus.print_colored("Keep this change?", "blue");
                    if input::ask_yes_no(self, true).await? {
                        indices.push((i + 1).to_string());
                        kept.push(edit);
                    }
                }
                self.conversation.borrow_mut().add_user(format!(
                    "User chose to apply {}/{} of your suggested changes. The changes they \
                     applied were: {}",
                    kept.len(),
                    total,
                    indices.join(", ")
                ));
                Ok((kept, true))
            }
            _ => {
                self.conversation.borrow_mut().add_user(format!(
                    "User chose not to apply any of your changes. User response: {}\n\n\
                     Please adjust your previous plan and changes to reflect this. Respond \
                     with a full new set of changes.",
                    response.text()
                ));
                Ok((Vec::new(), false))
            }
        }
    }
}
