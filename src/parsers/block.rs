//! The block edit format: `@@start`, a JSON header, `@@code`, streamed
//! code lines, `@@end`. Actions without code (delete, rename-file) close
//! the header block with `@@end` directly.

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::edits::{FileEdit, Replacement};
use crate::parsers::display::{DisplayInfo, FileAction};
use crate::parsers::{CodeEnd, EditFormat, ModelError, ParseContext, SpecialParse};

const BLOCK_SYSTEM_PROMPT: &str = "\
You are an expert coding assistant working inside the user's repository. \
Answer the user's request in prose, and express every file change as an \
edit block with this exact shape:\n\
@@start\n\
{\"file\": \"path/to/file\", \"action\": \"...\", ...}\n\
@@code\n\
<the new lines>\n\
@@end\n\
Actions: \"insert\" (with \"insert-after-line\" and \"insert-before-line\"), \
\"replace\" (with \"start-line\" and \"end-line\", 1-indexed inclusive), \
\"delete\" (with \"start-line\" and \"end-line\", no @@code section), \
\"create-file\" (code section holds the whole file), and \"rename-file\" \
(with \"name\" holding the new path, no @@code section). Blocks for \
actions without code close with @@end immediately after the header. \
Never edit line numbers you have not seen.";

const START_MARKER: &str = "@@start";
const CODE_MARKER: &str = "@@code";
const END_MARKER: &str = "@@end";

#[derive(Debug, Deserialize)]
struct BlockHeader {
    file: PathBuf,

    action: String,

    #[serde(rename = "insert-after-line")]
    insert_after_line: Option<usize>,

    #[serde(rename = "insert-before-line")]
    insert_before_line: Option<usize>,

    #[serde(rename = "start-line")]
    start_line: Option<usize>,

    #[serde(rename = "end-line")]
    end_line: Option<usize>,

    /// Rename target
    name: Option<PathBuf>,
}

pub struct BlockFormat;

impl BlockFormat {
    pub fn new() -> Self {
        Self
    }

    fn parse_header(block: &str) -> Result<BlockHeader, ModelError> {
        let json: String = block
            .lines()
            .filter(|l| {
                let t = l.trim();
                t != START_MARKER && t != CODE_MARKER && t != END_MARKER
            })
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&json)
            .map_err(|e| ModelError(format!("invalid JSON header: {e}")))
    }

    fn removed_for(
        header: &BlockHeader,
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<String>, ModelError> {
        let (Some(start), Some(end)) = (header.start_line, header.end_line) else {
            return Err(ModelError(format!(
                "action {:?} requires start-line and end-line",
                header.action
            )));
        };
        if start == 0 || end < start {
            return Err(ModelError(format!("invalid line range {start}-{end}")));
        }
        let path = ctx.root.join(&header.file);
        let lines = ctx.files.lines_of(&path).unwrap_or_default();
        if end > lines.len() {
            return Err(ModelError(format!(
                "line range {start}-{end} exceeds {} ({} lines)",
                header.file.display(),
                lines.len()
            )));
        }
        Ok(lines[start - 1..end].to_vec())
    }
}

impl Default for BlockFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl EditFormat for BlockFormat {
    fn name(&self) -> &'static str {
        "block"
    }

    fn system_prompt(&self) -> &'static str {
        BLOCK_SYSTEM_PROMPT
    }

    fn could_be_special(&self, partial: &str, _in_code: bool) -> bool {
        START_MARKER.starts_with(partial)
            || CODE_MARKER.starts_with(partial)
            || END_MARKER.starts_with(partial)
    }

    fn starts_special(&mut self, line: &str) -> bool {
        line == START_MARKER
    }

    fn ends_special(&mut self, line: &str, _block: &str) -> bool {
        line == CODE_MARKER || line == END_MARKER
    }

    fn parse_special(
        &mut self,
        block: &str,
        ctx: &ParseContext<'_>,
    ) -> Result<SpecialParse, ModelError> {
        let header = Self::parse_header(block)?;
        let code_follows = block
            .lines()
            .last()
            .map(|l| l.trim() == CODE_MARKER)
            .unwrap_or(false);

        let path = ctx.root.join(&header.file);
        let mut edit = FileEdit::new(path);
        let mut info;

        match header.action.as_str() {
            "insert" => {
                let after = header.insert_after_line.ok_or_else(|| {
                    ModelError("insert requires insert-after-line".to_string())
                })?;
                if let Some(before) = header.insert_before_line {
                    if before != after + 1 {
                        return Err(ModelError(format!(
                            "insert-before-line {before} does not follow insert-after-line {after}"
                        )));
                    }
                }
                if !code_follows {
                    return Err(ModelError("insert requires a code section".to_string()));
                }
                info = DisplayInfo::new(header.file.clone(), FileAction::Insert);
            }
            "replace" => {
                if !code_follows {
                    return Err(ModelError("replace requires a code section".to_string()));
                }
                info = DisplayInfo::new(header.file.clone(), FileAction::Replace);
                info.removed_lines = Self::removed_for(&header, ctx)?;
            }
            "delete" => {
                if code_follows {
                    return Err(ModelError("delete takes no code section".to_string()));
                }
                info = DisplayInfo::new(header.file.clone(), FileAction::Delete);
                info.removed_lines = Self::removed_for(&header, ctx)?;
                // removed_for guarantees both bounds are present
                let (Some(start), Some(end)) = (header.start_line, header.end_line) else {
                    return Err(ModelError("delete requires start-line and end-line".to_string()));
                };
                edit.replacements.push(Replacement::new(start, end, vec![]));
            }
            "create-file" => {
                if !code_follows {
                    return Err(ModelError("create-file requires a code section".to_string()));
                }
                edit.is_creation = true;
                info = DisplayInfo::new(header.file.clone(), FileAction::CreateFile);
            }
            "rename-file" => {
                if code_follows {
                    return Err(ModelError("rename-file takes no code section".to_string()));
                }
                let name = header
                    .name
                    .clone()
                    .ok_or_else(|| ModelError("rename-file requires name".to_string()))?;
                edit.rename_to = Some(ctx.root.join(&name));
                info = DisplayInfo::new(header.file.clone(), FileAction::RenameFile);
                info.new_name = Some(name);
            }
            other => {
                return Err(ModelError(format!("unknown action {other:?}")));
            }
        }

        Ok(SpecialParse {
            info,
            edit,
            code_follows,
        })
    }

    fn classify_code_line(&mut self, line: &str) -> CodeEnd {
        if line.trim() == END_MARKER {
            CodeEnd::Terminator
        } else {
            CodeEnd::Continue
        }
    }

    fn add_code_block(
        &mut self,
        special_block: &str,
        code_block: &str,
        _info: &DisplayInfo,
        edit: &mut FileEdit,
    ) {
        let Ok(header) = Self::parse_header(special_block) else {
            return;
        };
        let code_lines: Vec<String> = code_block.lines().map(str::to_string).collect();

        match header.action.as_str() {
            "insert" => {
                if let Some(after) = header.insert_after_line {
                    edit.replacements
                        .push(Replacement::insertion(after + 1, code_lines));
                }
            }
            "replace" => {
                if let (Some(start), Some(end)) = (header.start_line, header.end_line) {
                    edit.replacements
                        .push(Replacement::new(start, end, code_lines));
                }
            }
            "create-file" => {
                let len = code_lines.len();
                edit.replacements = vec![Replacement::new(1, len.max(1), code_lines)];
            }
            _ => {}
        }
    }
}
