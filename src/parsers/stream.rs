//! The incremental three-class parser: conversation lines stream through
//! verbatim, special blocks accumulate silently and become edits, code
//! lines render green with a `+` prefix while building replacements.
//!
//! The machine is fed arbitrary chunk boundaries and produces identical
//! edits for any segmentation of the same underlying text: a line is
//! buffered until it can no longer be a special opener, and all
//! transitions happen on complete lines.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use owo_colors::OwoColorize;

use crate::core::edits::FileEdit;
use crate::parsers::display::{
    self, change_delimiter, code_line_beginning, code_line_content, file_name_header, DisplayInfo,
    FileAction,
};
use crate::parsers::{CodeEnd, EditFormat, FileLines, ParseContext};

/// Everything a finished (or interrupted) parse hands back to the turn.
pub struct ParsedResponse {
    /// The model's full raw output
    pub message: String,

    /// Merged edits in first-mention order
    pub edits: Vec<FileEdit>,

    /// True when the stream was cut off by an interrupt
    pub interrupted: bool,
}

enum Mode {
    Conversation,
    Special,
    Code,
}

/// Incremental parser over one model response.
pub struct StreamParser<'a> {
    format: Box<dyn EditFormat>,
    root: PathBuf,
    files: &'a dyn FileLines,

    mode: Mode,
    cur_line: String,
    cur_block: String,
    prev_block: String,

    line_printed: bool,
    conversation: bool,
    printed_delimiter: bool,

    display_info: Option<DisplayInfo>,
    current_key: Option<PathBuf>,

    edits: IndexMap<PathBuf, FileEdit>,

    /// new name -> original name, so later references to either resolve
    /// to one edit
    rename_map: HashMap<PathBuf, PathBuf>,

    message: String,
    errored: bool,
}

impl<'a> StreamParser<'a> {
    pub fn new(format: Box<dyn EditFormat>, root: PathBuf, files: &'a dyn FileLines) -> Self {
        Self {
            format,
            root,
            files,
            mode: Mode::Conversation,
            cur_line: String::new(),
            cur_block: String::new(),
            prev_block: String::new(),
            line_printed: false,
            conversation: true,
            printed_delimiter: false,
            display_info: None,
            current_key: None,
            edits: IndexMap::new(),
            rename_map: HashMap::new(),
            message: String::new(),
            errored: false,
        }
    }

    /// Feed one stream chunk; returns render events in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut events = Vec::new();
        if self.errored {
            return events;
        }

        // Split into pieces that end at newlines, mirroring how the
        // model's chunks are re-lined before classification.
        for piece in split_keep_newlines(chunk) {
            if self.errored {
                break;
            }
            self.message.push_str(&piece);
            self.cur_line.push_str(&piece);

            self.render_incremental(&piece, &mut events);

            if matches!(self.mode, Mode::Conversation) && self.line_printed {
                // Once plain conversation resumes, the next change block
                // reprints its file header even for the same file.
                self.conversation = true;
            }

            if self.cur_line.contains('\n') {
                let line = std::mem::take(&mut self.cur_line);
                let was_printed = self.line_printed;
                self.line_printed = false;
                self.handle_complete_line(line, was_printed, &mut events);
            }
        }

        events
    }

    /// Close any open block and return the final result along with any
    /// trailing render events.
    pub fn finish(mut self, interrupted: bool) -> (Vec<String>, ParsedResponse) {
        let mut events = Vec::new();
        if matches!(self.mode, Mode::Code) {
            // Finish the pending line, then close the block the model
            // never closed.
            if !self.cur_line.is_empty() {
                let line = std::mem::take(&mut self.cur_line);
                self.cur_block.push_str(&line);
                if !line.ends_with('\n') {
                    self.cur_block.push('\n');
                }
            }
            self.close_code_block(&mut events);
        }

        let response = ParsedResponse {
            message: self.message,
            edits: self.edits.into_values().filter(FileEdit::is_useful).collect(),
            interrupted,
        };
        (events, response)
    }

    /// Stream-print the current partial line once it is provably not a
    /// special line; afterwards print content as it arrives.
    fn render_incremental(&mut self, piece: &str, events: &mut Vec<String>) {
        if matches!(self.mode, Mode::Special) {
            return;
        }
        let in_code = matches!(self.mode, Mode::Code);

        if !self.line_printed {
            if !self
                .format
                .could_be_special(self.cur_line.trim(), in_code)
            {
                self.line_printed = true;
                let text = if in_code {
                    format!(
                        "{}{}",
                        code_line_beginning(self.format.code_line_prefix()),
                        code_line_content(&self.cur_line)
                    )
                } else {
                    self.cur_line.clone()
                };
                events.push(text);
            }
        } else {
            let text = if in_code {
                code_line_content(piece)
            } else {
                piece.to_string()
            };
            events.push(text);
        }
    }

    fn handle_complete_line(&mut self, line: String, was_printed: bool, events: &mut Vec<String>) {
        let trimmed = line.trim().to_string();

        match self.mode {
            Mode::Conversation => {
                self.enter_or_print(line, &trimmed, was_printed, events);
            }
            Mode::Special => {
                self.cur_block.push_str(&line);
                if self.format.ends_special(&trimmed, &self.cur_block) {
                    self.finish_special_block(events);
                }
            }
            Mode::Code => {
                let raw = line.trim_end_matches(['\n', '\r']).to_string();
                let class = self.format.classify_code_line(&raw);
                match class {
                    CodeEnd::Continue | CodeEnd::LastLine => {
                        if !was_printed {
                            // Buffered to the end but still a code line
                            events.push(format!(
                                "{}{}",
                                code_line_beginning(self.format.code_line_prefix()),
                                code_line_content(&line)
                            ));
                        }
                        self.cur_block.push_str(&line);
                        if class == CodeEnd::LastLine {
                            self.close_code_block(events);
                        }
                    }
                    CodeEnd::Terminator => self.close_code_block(events),
                    CodeEnd::Outside => {
                        self.close_code_block(events);
                        // Re-examine the line as a fresh conversation line
                        self.enter_or_print(line, &trimmed, was_printed, events);
                    }
                }
            }
        }
    }

    /// In conversation position: either open a special block or make sure
    /// the line reached the renderer.
    fn enter_or_print(
        &mut self,
        line: String,
        trimmed: &str,
        was_printed: bool,
        events: &mut Vec<String>,
    ) {
        if self.format.starts_special(trimmed) {
            self.mode = Mode::Special;
            self.cur_block.push_str(&line);
            if self.format.ends_special(trimmed, &self.cur_block) {
                self.finish_special_block(events);
            }
            return;
        }
        if !was_printed {
            // Held back as a possible special opener, but it never became
            // one; release it verbatim.
            events.push(line);
            self.conversation = true;
        }
    }

    fn finish_special_block(&mut self, events: &mut Vec<String>) {
        let block = std::mem::take(&mut self.cur_block);
        let ctx = ParseContext {
            root: &self.root,
            files: self.files,
        };

        let parsed = match self.format.parse_special(&block, &ctx) {
            Ok(parsed) => parsed,
            Err(e) => {
                events.push(format!("{}\n", e.to_string().red()));
                events.push("Using the changes received so far.\n".to_string());
                self.errored = true;
                return;
            }
        };

        self.prev_block = block;
        let mut edit = parsed.edit;
        let info = parsed.info;

        // Track renames so both names resolve to the original file
        if let Some(new_name) = &info.new_name {
            self.rename_map
                .insert(new_name.clone(), info.file_name.clone());
        }
        if let Some(original) = self.rename_map.get(&info.file_name) {
            edit.path = self.root.join(original);
        }

        let previous_key = self.current_key.clone();
        let key = edit.path.clone();
        match self.edits.entry(key.clone()) {
            indexmap::map::Entry::Occupied(mut existing) => existing.get_mut().merge(edit),
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(edit);
            }
        }
        self.current_key = Some(key.clone());
        self.mode = if parsed.code_follows {
            Mode::Code
        } else {
            Mode::Conversation
        };

        // Header: print on conversation resumption, renames, or a file
        // switch; keep a delimiter between back-to-back changes.
        let has_removed = !info.removed_lines.is_empty();
        if self.conversation
            || info.action == FileAction::RenameFile
            || previous_key.as_ref() != Some(&key)
        {
            self.conversation = false;
            events.push(file_name_header(&info));
            if parsed.code_follows || has_removed {
                self.printed_delimiter = true;
                events.push(change_delimiter());
            } else {
                self.printed_delimiter = false;
            }
        } else if !self.printed_delimiter {
            events.push(change_delimiter());
            self.printed_delimiter = true;
        }

        if parsed.code_follows || has_removed {
            if has_removed {
                events.push(display::removed_lines(&info));
            }
            if parsed.code_follows {
                self.printed_delimiter = false;
            } else {
                events.push(change_delimiter());
                self.printed_delimiter = true;
            }
        }

        self.display_info = Some(info);
    }

    fn close_code_block(&mut self, events: &mut Vec<String>) {
        let code_block = std::mem::take(&mut self.cur_block);
        if let (Some(info), Some(key)) = (&self.display_info, &self.current_key) {
            if let Some(edit) = self.edits.get_mut(key) {
                self.format
                    .add_code_block(&self.prev_block, &code_block, info, edit);
            }
        }
        events.push(change_delimiter());
        self.printed_delimiter = true;
        self.prev_block = code_block;
        self.mode = Mode::Conversation;
    }
}

/// Split a chunk into pieces each ending at a newline (except possibly
/// the last). `"a\nb"` becomes `["a\n", "b"]`.
fn split_keep_newlines(chunk: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in chunk.bytes().enumerate() {
        if b == b'\n' {
            out.push(chunk[start..=i].to_string());
            start = i + 1;
        }
    }
    if start < chunk.len() {
        out.push(chunk[start..].to_string());
    }
    out
}
