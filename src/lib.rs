//! **patchup** - An interactive terminal pair-programmer: packs repository
//! context into a bounded-token prompt, streams LLM responses as a live
//! diff, and applies the parsed edits to your git working tree with undo.

/// Command-line interface with clap integration
pub mod cli;

/// Core engines - context assembly, edits, git, agent
pub mod core {
    /// Read-only git queries via the local git binary
    pub mod git;

    /// Token accounting with tiktoken and content-hash caching
    pub mod budget;

    /// Tree-sitter symbol outlines (Rust + Python locked)
    pub mod outline;

    /// Code features: scoped file views packaged for the prompt
    pub mod features;

    /// Context engine: include set, diff context, budgeted assembly
    pub mod context;

    /// Composable feature filters (truncate, embeddings, LLM selector)
    pub mod filters;

    /// Conversation log with token accounting and transcripts
    pub mod conversation;

    /// Structured file edits with merge and conflict resolution
    pub mod edits;

    /// Edit application, undo history, and backups
    pub mod apply;

    /// Post-edit autonomous command runs
    pub mod agent;
}

/// Streaming response parsing - formats behind one line machine
pub mod parsers;

/// LLM provider access (chat, streaming, embeddings)
pub mod llm;

/// Session kernel - bus, input protocol, commands, terminal client
pub mod session;

/// Infrastructure - configuration, I/O, walking, logging
pub mod infra {
    /// Layered settings with TOML support and env overrides
    pub mod config;

    /// Memory-mapped file I/O and atomic writes
    pub mod io;

    /// CRLF/LF-robust line indexing for O(1) line→byte mapping
    pub mod line_index;

    /// Gitignore-aware directory walking
    pub mod walk;

    /// Rotating session logs with a latest.log symlink
    pub mod logging;
}

// Strategic re-exports for the binary and tests
pub use cli::Cli;
pub use core::budget::Budgeter;
pub use core::context::{ContextEngine, DiffContext};
pub use core::edits::FileEdit;
pub use llm::{LlmClient, ScriptedClient};
pub use session::{Session, SessionOptions};
