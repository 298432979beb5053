//! End-to-end session turns over a scripted provider: include + edit +
//! undo, rename merging, feedback declines, and slash commands.

mod util;

use patchup::llm::ScriptedClient;
use util::{build_session, drive, test_settings, TestRepo};

const CALC: &str = "def add(a,b): return a+b\n";

fn insert_block(file: &str, after: usize, code: &str) -> String {
    format!(
        "I'll add that.\n\n@@start\n{{\"file\": \"{file}\", \"action\": \"insert\", \
         \"insert-after-line\": {after}, \"insert-before-line\": {}}}\n@@code\n{code}\n@@end\n",
        after + 1
    )
}

#[tokio::test]
async fn manual_include_small_edit_and_undo() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    scripted.push_response(&insert_block("calc.py", 0, "# greet"));

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), false);
    let output = drive(&session, &["add a greeting comment", "y", "q"]).await;

    assert!(output.contains("Changes applied."), "output:\n{output}");
    assert_eq!(repo.read("calc.py"), format!("# greet\n{CALC}"));
    assert_eq!(session.files.borrow().history().len(), 1);

    // A follow-up session turn undoes it exactly
    let output = drive(&session, &["/undo", "q"]).await;
    assert!(output.contains("undone"), "output:\n{output}");
    assert_eq!(repo.read("calc.py"), CALC);
}

#[tokio::test]
async fn declined_edits_touch_nothing() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    scripted.push_response(&insert_block("calc.py", 0, "# unwanted"));

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), false);
    let output = drive(&session, &["change it", "n", "q"]).await;

    assert!(output.contains("No changes applied."), "output:\n{output}");
    assert_eq!(repo.read("calc.py"), CALC);
    assert!(session.files.borrow().history().is_empty());
}

#[tokio::test]
async fn freeform_feedback_reprompts_the_model() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    scripted.push_response(&insert_block("calc.py", 0, "# v1"));
    // The model's second attempt after feedback
    scripted.push_response(&insert_block("calc.py", 0, "# v2"));

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), false);
    let output = drive(
        &session,
        &["add a comment", "please use v2 wording", "y", "q"],
    )
    .await;

    assert!(output.contains("Changes applied."), "output:\n{output}");
    assert_eq!(repo.read("calc.py"), format!("# v2\n{CALC}"));
}

#[tokio::test]
async fn rename_then_edit_merges_and_undoes() {
    let repo = TestRepo::new();
    repo.write("old.py", "x = 1\n");
    repo.commit_all("base");

    let response = "Renaming and annotating.\n\n\
        @@start\n\
        {\"file\": \"old.py\", \"action\": \"rename-file\", \"name\": \"new.py\"}\n\
        @@end\n\
        @@start\n\
        {\"file\": \"new.py\", \"action\": \"insert\", \"insert-after-line\": 0, \"insert-before-line\": 1}\n\
        @@code\n\
        # renamed module\n\
        @@end\n";

    let scripted = ScriptedClient::new();
    scripted.push_response(response);

    let session = build_session(&repo, vec!["old.py"], scripted, test_settings(), false);
    let output = drive(&session, &["rename old to new", "y", "q"]).await;

    assert!(output.contains("Changes applied."), "output:\n{output}");
    assert!(!repo.root.join("old.py").exists());
    assert_eq!(repo.read("new.py"), "# renamed module\nx = 1\n");
    // One merged edit, one undo frame
    assert_eq!(session.files.borrow().history().len(), 1);

    let output = drive(&session, &["/undo", "q"]).await;
    assert!(output.contains("undone"), "output:\n{output}");
    assert!(!repo.root.join("new.py").exists());
    assert_eq!(repo.read("old.py"), "x = 1\n");
}

#[tokio::test]
async fn clear_command_resets_conversation() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    scripted.push_response("Just a chat answer, no edits.\n");

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), false);
    drive(&session, &["hello there", "/clear", "q"]).await;

    // Only the re-emitted system prompt remains
    assert!(session.conversation.borrow().get_messages(false).is_empty());
    assert_eq!(session.conversation.borrow().get_messages(true).len(), 1);
}

#[tokio::test]
async fn unknown_command_fails_softly() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    let session = build_session(
        &repo,
        vec!["calc.py"],
        ScriptedClient::new(),
        test_settings(),
        false,
    );
    let output = drive(&session, &["/frobnicate", "q"]).await;

    assert!(output.contains("Unknown command"), "output:\n{output}");
}

#[tokio::test]
async fn model_error_keeps_prior_edits() {
    let repo = TestRepo::new();
    repo.write("calc.py", CALC);
    repo.commit_all("base");

    // First block is fine; second header is broken JSON
    let response = format!(
        "{}\n@@start\nthis is not a json header\n@@code\n",
        insert_block("calc.py", 0, "# kept")
    );
    let scripted = ScriptedClient::new();
    scripted.push_response(&response);

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), false);
    let output = drive(&session, &["do two things", "y", "q"]).await;

    assert!(output.contains("malformed edit block"), "output:\n{output}");
    // The edit before the error still applied
    assert_eq!(repo.read("calc.py"), format!("# kept\n{CALC}"));
}
