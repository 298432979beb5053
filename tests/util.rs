//! Shared fixtures: a throwaway git repository and a scripted session
//! driver that answers input requests and collects rendered output.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

use patchup::infra::config::Settings;
use patchup::llm::{LlmClient, ScriptedClient};
use patchup::session::stream::{Channel, MessageSource, SessionBus};
use patchup::session::{Session, SessionOptions};

pub struct TestRepo {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "tester@example.com"],
            vec!["config", "user.name", "Tester"],
        ] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        let root = dunce::canonicalize(dir.path()).unwrap();
        Self { _dir: dir, root }
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn commit_all(&self, message: &str) {
        for args in [vec!["add", "."], vec!["commit", "-m", message]] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(&self.root)
                .output()
                .unwrap();
        }
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).unwrap()
    }
}

/// Settings tuned for offline tests: no embeddings, no backups, the
/// block format, and a roomy budget.
pub fn test_settings() -> Settings {
    Settings {
        use_embeddings: false,
        use_llm_selector: false,
        backups: false,
        auto_context: false,
        prompt_tokens: 32_000,
        ..Settings::default()
    }
}

pub fn build_session(
    repo: &TestRepo,
    paths: Vec<&str>,
    scripted: ScriptedClient,
    settings: Settings,
    agent: bool,
) -> Session {
    let options = SessionOptions {
        cwd: repo.root.clone(),
        paths: paths.into_iter().map(str::to_string).collect(),
        exclude: vec![],
        ignore: vec![],
        diff: None,
        pr_diff: None,
        agent,
    };
    Session::new(options, settings, LlmClient::Scripted(scripted), SessionBus::new())
        .expect("session builds")
}

/// Run the session against a fixed input script; returns everything the
/// client would have printed (ANSI stripped). Unanswered input requests
/// quit the session.
pub async fn drive(session: &Session, inputs: &[&str]) -> String {
    let local = tokio::task::LocalSet::new();
    let bus = session.bus.clone();
    let inputs: VecDeque<String> = inputs.iter().map(|s| s.to_string()).collect();
    let output = Rc::new(RefCell::new(String::new()));

    local
        .run_until(async {
            let collector_out = output.clone();
            let mut default_rx = bus.listen(Channel::Default);
            let collector = tokio::task::spawn_local(async move {
                while let Some(message) = default_rx.recv().await {
                    collector_out.borrow_mut().push_str(&message.text());
                    collector_out.borrow_mut().push('\n');
                }
            });

            let responder_bus = bus.clone();
            let mut input_rx = bus.listen(Channel::InputRequest);
            let mut queue = inputs;
            let responder = tokio::task::spawn_local(async move {
                while let Some(request) = input_rx.recv().await {
                    let reply = queue.pop_front().unwrap_or_else(|| "q".to_string());
                    responder_bus.send(
                        reply,
                        Channel::InputResponse(request.id),
                        MessageSource::Client,
                    );
                }
            });

            session.run().await;

            // Let stragglers drain before reading the buffer
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            collector.abort();
            responder.abort();
        })
        .await;

    let collected = output.borrow().clone();
    patchup::parsers::display::strip_ansi(&collected)
}
