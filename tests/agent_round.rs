//! The agent round-trip: after an edit round, the model picks a
//! validation command, the user confirms, the output lands in the
//! conversation, and the next model call sees it.

mod util;

use patchup::llm::{Role, ScriptedClient};
use util::{build_session, drive, test_settings, TestRepo};

#[tokio::test]
async fn agent_runs_commands_and_feeds_output_back() {
    let repo = TestRepo::new();
    repo.write("calc.py", "def add(a,b): return a+b\n");
    repo.write("README.md", "Run tests with make test.\n");
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    // Phase 1 on enable: which files describe testing?
    scripted.push_response("README.md\n");
    // Turn 1: an edit that (supposedly) breaks something
    scripted.push_response(
        "Editing.\n\n@@start\n{\"file\": \"calc.py\", \"action\": \"replace\", \
         \"start-line\": 1, \"end-line\": 1}\n@@code\ndef add(a,b) return a+b\n@@end\n",
    );
    // Phase 2: the validation command list
    scripted.push_response("echo FAILED: tests exploded && exit 1\n");
    // Turn 2 (autonomous follow-up after seeing the failure): no edits
    scripted.push_response("I could not fix it; returning control.\n");

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), true);
    let output = drive(&session, &["break the calculator", "y", "q"]).await;

    assert!(output.contains("FAILED: tests exploded"), "output:\n{output}");
    assert!(output.contains("Changes applied."), "output:\n{output}");

    // The command output was injected as a system message...
    let conversation = session.conversation.borrow();
    let injected = conversation
        .get_messages(false)
        .iter()
        .any(|m| m.role == Role::System && m.content.contains("FAILED: tests exploded"));
    assert!(injected);
    drop(conversation);

    // ...and the next turn's prompt included it
    let requests = match &session.llm {
        patchup::llm::LlmClient::Scripted(s) => s.seen_requests(),
        _ => unreachable!(),
    };
    let final_request = requests.last().unwrap();
    assert!(final_request
        .iter()
        .any(|m| m.content.contains("FAILED: tests exploded")));
}

#[tokio::test]
async fn agent_empty_command_list_returns_control() {
    let repo = TestRepo::new();
    repo.write("calc.py", "def add(a,b): return a+b\n");
    repo.commit_all("base");

    let scripted = ScriptedClient::new();
    scripted.push_response("README.md\n");
    scripted.push_response(
        "Editing.\n\n@@start\n{\"file\": \"calc.py\", \"action\": \"insert\", \
         \"insert-after-line\": 0, \"insert-before-line\": 1}\n@@code\n# note\n@@end\n",
    );
    // Phase 2 returns nothing: no validation needed, user regains control
    scripted.push_response("");

    let session = build_session(&repo, vec!["calc.py"], scripted, test_settings(), true);
    let output = drive(&session, &["annotate", "q"]).await;

    assert!(output.contains("Changes applied."), "output:\n{output}");
    assert_eq!(
        repo.read("calc.py"),
        "# note\ndef add(a,b): return a+b\n"
    );
}
