//! Rendering helpers for the live diff view: file headers, change
//! delimiters, removed lines, and the green `+` code lines.

use std::path::PathBuf;

use owo_colors::OwoColorize;

pub const CHANGE_DELIMITER: &str = "=======================================================";

/// What kind of change a special block declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Insert,
    Replace,
    Delete,
    CreateFile,
    DeleteFile,
    RenameFile,
}

/// Everything the renderer needs to display one change block.
#[derive(Debug, Clone)]
pub struct DisplayInfo {
    /// Path as the model referred to it (repo-relative)
    pub file_name: PathBuf,

    /// Rename target when `action` is `RenameFile`
    pub new_name: Option<PathBuf>,

    pub action: FileAction,

    /// Lines the change removes, shown in red before the added lines
    pub removed_lines: Vec<String>,
}

impl DisplayInfo {
    pub fn new(file_name: PathBuf, action: FileAction) -> Self {
        Self {
            file_name,
            new_name: None,
            action,
            removed_lines: Vec::new(),
        }
    }
}

/// Header line announcing which file the following change touches.
pub fn file_name_header(info: &DisplayInfo) -> String {
    let name = info.file_name.display();
    let text = match info.action {
        FileAction::CreateFile => format!("{name}*"),
        FileAction::DeleteFile => format!("{name} (deleted)"),
        FileAction::RenameFile => match &info.new_name {
            Some(new) => format!("{name} (renamed to {})", new.display()),
            None => format!("{name} (renamed)"),
        },
        _ => format!("{name}"),
    };
    format!("\n{}\n", text.bright_blue())
}

pub fn change_delimiter() -> String {
    format!("{}\n", CHANGE_DELIMITER.bright_blue())
}

/// The red block of lines a change removes.
pub fn removed_lines(info: &DisplayInfo) -> String {
    let mut out = String::new();
    for line in &info.removed_lines {
        out.push_str(&format!("{}\n", format!("-{line}").red()));
    }
    out
}

/// Green prefix opening a streamed code line.
pub fn code_line_beginning(prefix: &str) -> String {
    format!("{}", prefix.green())
}

/// Green body of a streamed code line.
pub fn code_line_content(content: &str) -> String {
    format!("{}", content.green())
}

/// Strip ANSI escape sequences; used by tests to compare rendered output
/// against the raw transform.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequence: ESC [ ... final byte in @..~
            if chars.peek() == Some(&'[') {
                chars.next();
                for f in chars.by_ref() {
                    if ('@'..='~').contains(&f) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
