//! Context engine behavior over a real repository: auto-context level
//! degradation under a tight budget, and diff-target annotation flow.

mod util;

use patchup::core::context::{ContextConfig, ContextEngine, DiffContext, EngineDeps};
use patchup::core::filters::EmbeddingCache;
use patchup::llm::{LlmClient, ScriptedClient};
use patchup::Budgeter;
use util::TestRepo;

fn config(auto: bool, auto_tokens: usize) -> ContextConfig {
    ContextConfig {
        auto_context: auto,
        auto_tokens,
        use_embeddings: false,
        use_llm_selector: false,
        max_file_chars: 100_000,
        ignore_patterns: vec![],
    }
}

struct Deps {
    budgeter: Budgeter,
    llm: LlmClient,
    embeddings: EmbeddingCache,
}

impl Deps {
    fn new() -> Self {
        Self {
            budgeter: Budgeter::new("cl100k_base").unwrap(),
            llm: LlmClient::Scripted(ScriptedClient::new()),
            embeddings: EmbeddingCache::new(),
        }
    }

    fn engine(&self) -> EngineDeps<'_> {
        EngineDeps {
            budgeter: &self.budgeter,
            llm: &self.llm,
            embeddings: &self.embeddings,
        }
    }
}

/// One big top-level function per file, so each file is a single
/// feature whose degradation behavior is predictable.
fn python_filler(name: &str, lines: usize) -> String {
    let mut out = format!("def {name}_main(value):\n");
    for i in 0..lines {
        out.push_str(&format!("    value = value + {i}\n"));
    }
    out.push_str("    return value\n");
    out
}

#[tokio::test]
async fn tight_auto_budget_degrades_but_names_every_file() {
    let repo = TestRepo::new();
    repo.write("alpha.py", &python_filler("alpha", 50));
    repo.write("beta.py", &python_filler("beta", 50));
    repo.write("gamma.py", &python_filler("gamma", 50));

    let deps = Deps::new();
    let budget = 500;
    let engine = ContextEngine::new(repo.root.clone(), config(true, budget), None);

    let message = engine
        .get_code_message("", 10_000, None, &deps.engine())
        .await
        .unwrap();

    // Every file shows up at least by name, and the assembly respects
    // the auto budget (metadata rides on top).
    for name in ["alpha.py", "beta.py", "gamma.py"] {
        assert!(message.contains(name), "missing {name}:\n{message}");
    }
    let tokens = deps.budgeter.count(&message);
    let metadata = deps.budgeter.count("Code Files:");
    assert!(
        tokens <= budget + metadata,
        "code message used {tokens} tokens"
    );

    // Earlier files (path order) keep their verbose slices; later ones
    // degrade to outlines once the budget tightens
    assert!(message.contains("def alpha_main(value):"));
    assert!(!message.contains("def gamma_main(value):"));
    assert!(message.contains("gamma_main"));
}

#[tokio::test]
async fn diff_target_annotates_every_feature() {
    let repo = TestRepo::new();
    repo.write("one.txt", "first version\n");
    repo.write("two.txt", "stable\n");
    repo.commit_all("first");
    repo.write("one.txt", "second version\n");
    repo.commit_all("second");
    repo.write("one.txt", "working change\n");

    let diff = DiffContext::resolve(&repo.root, Some("HEAD~1"), None)
        .unwrap()
        .expect("diff context resolves");
    assert_eq!(diff.target, "HEAD~1");
    assert!(diff.files.iter().any(|p| p.ends_with("one.txt")));

    let deps = Deps::new();
    // No paths passed: the diff's file list becomes the include set
    let engine = ContextEngine::new(repo.root.clone(), config(false, 500), Some(diff));

    let message = engine
        .get_code_message("", 10_000, None, &deps.engine())
        .await
        .unwrap();

    assert!(
        message.contains("one.txt (diff vs HEAD~1"),
        "missing annotation:\n{message}"
    );
    assert!(message.contains("working change"));
    // Unchanged files stay out of the diff-derived include set
    assert!(!message.contains("two.txt"));
}

#[tokio::test]
async fn repeat_assembly_is_byte_identical() {
    let repo = TestRepo::new();
    repo.write("lib.py", "def f():\n    return 42\n");

    let deps = Deps::new();
    let engine = ContextEngine::new(repo.root.clone(), config(true, 500), None);

    let first = engine
        .get_code_message("make f return 43", 10_000, None, &deps.engine())
        .await
        .unwrap();
    let second = engine
        .get_code_message("make f return 43", 10_000, None, &deps.engine())
        .await
        .unwrap();

    assert_eq!(first, second);
}
