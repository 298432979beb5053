//! Streaming parse of LLM responses into render events and file edits.
//!
//! All formats share one three-class line machine (conversation, special,
//! code) implemented in [`stream`]; a format contributes line
//! classification and block parsing through the [`EditFormat`] seam.

/// Colored rendering of change headers, removed lines, and code lines
pub mod display;

/// The shared incremental state machine
pub mod stream;

/// `@@start` / JSON header / `@@code` / `@@end` block format
pub mod block;

/// Unified git-diff format
pub mod git_diff;

use std::path::Path;

use crate::core::edits::FileEdit;
use display::DisplayInfo;

pub use stream::{ParsedResponse, StreamParser};

/// A malformed special block; reported inline, prior edits are kept.
#[derive(Debug, thiserror::Error)]
#[error("The model produced a malformed edit block: {0}")]
pub struct ModelError(pub String);

/// Access to current file contents for display and validation. The file
/// manager implements this over its line snapshots.
pub trait FileLines {
    fn lines_of(&self, path: &Path) -> Option<Vec<String>>;
}

/// Context handed to format callbacks while parsing.
pub struct ParseContext<'a> {
    pub root: &'a Path,
    pub files: &'a dyn FileLines,
}

/// Result of parsing one special block.
pub struct SpecialParse {
    pub info: DisplayInfo,
    pub edit: FileEdit,
    pub code_follows: bool,
}

/// Classification of a line seen while inside a code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeEnd {
    /// Part of the code block; block continues
    Continue,

    /// Part of the code block and completes it
    LastLine,

    /// Terminates the block and is consumed (a closing marker)
    Terminator,

    /// Not code at all; the block closes and the line is handled as a
    /// fresh conversation/special line
    Outside,
}

/// The format seam: line classification plus block parsing. Formats may
/// carry internal state (the git format tracks hunk counters), so
/// classification methods take `&mut self`.
pub trait EditFormat {
    /// Registry name and the id models are told about
    fn name(&self) -> &'static str;

    /// Opening system prompt teaching the model this format
    fn system_prompt(&self) -> &'static str;

    /// Whether a partial line could still turn out to be special; such
    /// lines are buffered instead of rendered
    fn could_be_special(&self, partial: &str, in_code: bool) -> bool;

    /// Does this complete line begin a special block?
    fn starts_special(&mut self, line: &str) -> bool;

    /// Does this line end the special block accumulated in `block`?
    fn ends_special(&mut self, line: &str, block: &str) -> bool;

    /// Parse a finished special block into display info and an edit.
    fn parse_special(
        &mut self,
        block: &str,
        ctx: &ParseContext<'_>,
    ) -> Result<SpecialParse, ModelError>;

    /// Classify a complete line while inside a code block.
    fn classify_code_line(&mut self, line: &str) -> CodeEnd;

    /// Prefix rendered before each code line ("+" unless lines already
    /// carry diff markers)
    fn code_line_prefix(&self) -> &'static str {
        "+"
    }

    /// Fold a finished code block into the edit, using the special block
    /// that introduced it.
    fn add_code_block(
        &mut self,
        special_block: &str,
        code_block: &str,
        info: &DisplayInfo,
        edit: &mut FileEdit,
    );
}

/// Resolve a format implementation by registry name.
pub fn format_by_name(name: &str) -> Option<Box<dyn EditFormat>> {
    match name {
        "block" => Some(Box::new(block::BlockFormat::new())),
        "git-diff" => Some(Box::new(git_diff::GitDiffFormat::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_formats() {
        assert_eq!(format_by_name("block").unwrap().name(), "block");
        assert_eq!(format_by_name("git-diff").unwrap().name(), "git-diff");
        assert!(format_by_name("yaml").is_none());
    }
}
