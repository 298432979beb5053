//! Streaming parser properties: identical edits for any chunk
//! segmentation, faithful rendering of conversation and code lines,
//! and partial-edit commits on interrupt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use proptest::prelude::*;

use patchup::core::edits::{FileEdit, Replacement};
use patchup::parsers::display::strip_ansi;
use patchup::parsers::{format_by_name, FileLines, StreamParser};

struct MapFiles(HashMap<PathBuf, Vec<String>>);

impl FileLines for MapFiles {
    fn lines_of(&self, path: &Path) -> Option<Vec<String>> {
        self.0.get(path).cloned()
    }
}

fn files_with(path: &str, lines: &[&str]) -> MapFiles {
    let mut map = HashMap::new();
    map.insert(
        PathBuf::from("/repo").join(path),
        lines.iter().map(|s| s.to_string()).collect(),
    );
    MapFiles(map)
}

fn parse_all(format: &str, files: &MapFiles, chunks: &[&str]) -> (String, Vec<FileEdit>) {
    let mut parser = StreamParser::new(
        format_by_name(format).unwrap(),
        PathBuf::from("/repo"),
        files,
    );
    let mut rendered = String::new();
    for chunk in chunks {
        for event in parser.feed(chunk) {
            rendered.push_str(&event);
        }
    }
    let (events, parsed) = parser.finish(false);
    for event in events {
        rendered.push_str(&event);
    }
    (rendered, parsed.edits)
}

const BLOCK_RESPONSE: &str = "I'll insert a comment.\n\n\
@@start\n\
{\"file\": \"calc.py\", \"action\": \"insert\", \"insert-after-line\": 0, \"insert-before-line\": 1}\n\
@@code\n\
# greet\n\
@@end\n\
Done!\n";

const GIT_RESPONSE: &str = "Updating the file.\n\n\
diff --git a/calc.py b/calc.py\n\
index 123..456 100644\n\
--- a/calc.py\n\
+++ b/calc.py\n\
@@ -1,1 +1,2 @@\n\
+# greet\n\
 def add(a,b): return a+b\n\
That's it.\n";

fn expected_insert_edit() -> Vec<FileEdit> {
    let mut edit = FileEdit::new(PathBuf::from("/repo/calc.py"));
    edit.replacements
        .push(Replacement::insertion(1, vec!["# greet".to_string()]));
    vec![edit]
}

#[test]
fn block_response_parses_whole() {
    let files = files_with("calc.py", &["def add(a,b): return a+b"]);
    let (rendered, edits) = parse_all("block", &files, &[BLOCK_RESPONSE]);

    assert_eq!(edits, expected_insert_edit());

    let plain = strip_ansi(&rendered);
    assert!(plain.contains("I'll insert a comment."));
    assert!(plain.contains("+# greet"));
    assert!(plain.contains("Done!"));
    // The special markers never reach the renderer
    assert!(!plain.contains("@@start"));
    assert!(!plain.contains("@@end"));
}

#[test]
fn git_response_parses_whole() {
    let files = files_with("calc.py", &["def add(a,b): return a+b"]);
    let (rendered, edits) = parse_all("git-diff", &files, &[GIT_RESPONSE]);

    assert_eq!(edits.len(), 1);
    let edit = &edits[0];
    assert_eq!(edit.path, PathBuf::from("/repo/calc.py"));
    assert_eq!(
        edit.replacements,
        vec![Replacement::new(
            1,
            1,
            vec!["# greet".to_string(), "def add(a,b): return a+b".to_string()]
        )]
    );

    let plain = strip_ansi(&rendered);
    assert!(plain.contains("Updating the file."));
    assert!(plain.contains("That's it."));
    assert!(!plain.contains("diff --git"));
}

#[test]
fn conversation_only_response_renders_verbatim() {
    let files = MapFiles(HashMap::new());
    let text = "Nothing to edit here.\nJust explaining things.\n";
    let (rendered, edits) = parse_all("block", &files, &[text]);

    assert!(edits.is_empty());
    assert_eq!(strip_ansi(&rendered), text);
}

#[test]
fn interrupt_mid_code_commits_complete_replacements() {
    let files = files_with("a.py", &["original line"]);
    let mut parser = StreamParser::new(
        format_by_name("block").unwrap(),
        PathBuf::from("/repo"),
        &files,
    );

    // Stream ends inside the @@code block: one full code line arrived
    parser.feed(
        "@@start\n{\"file\": \"a.py\", \"action\": \"insert\", \"insert-after-line\": 1, \
         \"insert-before-line\": 2}\n@@code\nnew line\npartial",
    );
    let (_, parsed) = parser.finish(true);

    assert!(parsed.interrupted);
    assert_eq!(parsed.edits.len(), 1);
    // The block was closed for the model; both complete-enough lines land
    assert_eq!(
        parsed.edits[0].replacements,
        vec![Replacement::insertion(
            2,
            vec!["new line".to_string(), "partial".to_string()]
        )]
    );
}

fn cut_into_chunks(text: &str, cuts: &[usize]) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut boundaries: Vec<usize> = cuts
        .iter()
        .map(|c| c % (bytes.len() + 1))
        .filter(|&c| text.is_char_boundary(c))
        .collect();
    boundaries.push(0);
    boundaries.push(bytes.len());
    boundaries.sort_unstable();
    boundaries.dedup();

    boundaries
        .windows(2)
        .map(|w| text[w[0]..w[1]].to_string())
        .collect()
}

proptest! {
    /// Any segmentation of the same response bytes produces identical
    /// edit sets (block format).
    #[test]
    fn block_segmentation_invariance(cuts in proptest::collection::vec(0usize..400, 0..12)) {
        let files = files_with("calc.py", &["def add(a,b): return a+b"]);
        let chunks = cut_into_chunks(BLOCK_RESPONSE, &cuts);
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let (_, edits) = parse_all("block", &files, &chunk_refs);
        prop_assert_eq!(edits, expected_insert_edit());
    }

    /// Same for the git-diff format.
    #[test]
    fn git_segmentation_invariance(cuts in proptest::collection::vec(0usize..400, 0..12)) {
        let files = files_with("calc.py", &["def add(a,b): return a+b"]);
        let chunks = cut_into_chunks(GIT_RESPONSE, &cuts);
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let (_, edits) = parse_all("git-diff", &files, &chunk_refs);

        prop_assert_eq!(edits.len(), 1);
        prop_assert_eq!(
            edits[0].replacements.clone(),
            vec![Replacement::new(
                1,
                1,
                vec!["# greet".to_string(), "def add(a,b): return a+b".to_string()]
            )]
        );
    }

    /// Conversation-only responses render byte-identically under any
    /// segmentation once color codes are stripped.
    #[test]
    fn conversation_render_invariance(cuts in proptest::collection::vec(0usize..200, 0..8)) {
        let files = MapFiles(HashMap::new());
        let text = "Some explanation.\nA second line with detail.\nAnd a third.\n";
        let chunks = cut_into_chunks(text, &cuts);
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let (rendered, edits) = parse_all("block", &files, &chunk_refs);
        prop_assert!(edits.is_empty());
        prop_assert_eq!(strip_ansi(&rendered), text);
    }
}
