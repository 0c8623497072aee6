#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

struct Fixture {
    context_db: PathBuf,
    conversation_db: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let run = Ulid::new();
        let dir = std::env::temp_dir();
        Self {
            context_db: dir.join(format!("ctxcache-context-{run}.sqlite3")),
            conversation_db: dir.join(format!("ctxcache-conversation-{run}.sqlite3")),
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        self.run_with_config(None, args)
    }

    fn run_with_config(&self, config: Option<&Path>, args: &[&str]) -> Output {
        let mut command = Command::new(env!("CARGO_BIN_EXE_ctxcache"));
        command
            .arg("--context-db")
            .arg(&self.context_db)
            .arg("--conversation-db")
            .arg(&self.conversation_db);
        if let Some(config) = config {
            command.arg("--config").arg(config);
        }
        command.args(args);

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run ctxcache {args:?}: {err}"),
        }
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "ctxcache {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        stdout_json(&output)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        for db in [&self.context_db, &self.conversation_db] {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = db.as_os_str().to_owned();
                path.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(path));
            }
        }
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn text<'a>(value: &'a Value, field: &str) -> &'a str {
    match value[field].as_str() {
        Some(raw) => raw,
        None => panic!("expected string field {field} in {value}"),
    }
}

#[test]
fn help_lists_command_groups() {
    let output = match Command::new(env!("CARGO_BIN_EXE_ctxcache"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["context", "conversation", "cache", "config"] {
        assert!(stdout.contains(required), "help is missing {required}");
    }
}

#[test]
fn context_store_is_idempotent_and_searchable() {
    let fixture = Fixture::new();
    let content = r#"{"workspace_objects":{"df":{}},"notes":"histogram of ages"}"#;
    let reordered = r#"{"notes":"histogram of ages","workspace_objects":{"df":{}}}"#;

    let first = fixture.json(&["context", "store", "--owner", "alice", "--content-json", content, "--tag", "plots"]);
    let second = fixture.json(&["context", "store", "--owner", "alice", "--content-json", reordered, "--tag", "plots"]);
    assert_eq!(first["id"], second["id"]);

    let results = fixture.json(&["context", "retrieve", "--owner", "alice", "--query", "histogram"]);
    let Some(results) = results.as_array() else {
        panic!("retrieve output must be an array");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["tag"], "plots");
    assert_eq!(results[0]["metadata"]["summary_type"], "full_context");

    let search = fixture.json(&["context", "search", "--owner", "alice", "--term", "histogram", "--tag", "drafts"]);
    assert_eq!(search.as_array().map(Vec::len), Some(0));

    let summary = fixture.json(&["context", "summary", "--owner", "alice"]);
    assert_eq!(summary["total"], 1);
    assert_eq!(summary["by_tag"]["plots"], 1);

    let stats = fixture.json(&["context", "stats"]);
    assert_eq!(stats["total_contexts"], 1);
    assert_eq!(stats["limits"]["max_total_contexts"], 200);

    let cleared = fixture.json(&["context", "clear", "--owner", "alice"]);
    assert_eq!(cleared["deleted"], 1);

    let swept = fixture.json(&["context", "sweep"]);
    assert_eq!(swept["deleted"], 0);
}

#[test]
fn context_store_rejects_invalid_json() {
    let fixture = Fixture::new();
    let output = fixture.run(&["context", "store", "--owner", "alice", "--content-json", "{nope"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn conversation_lifecycle_round_trip() {
    let fixture = Fixture::new();
    let started = fixture.json(&["conversation", "start", "--owner", "alice", "--title", "Plots"]);
    let id = text(&started, "conversation_id").to_string();

    fixture.json(&["conversation", "add", "--conversation-id", &id, "--role", "user", "--content", "how to plot"]);
    fixture.json(&[
        "conversation",
        "add",
        "--conversation-id",
        &id,
        "--role",
        "assistant",
        "--content",
        "use ggplot",
        "--metadata-json",
        r#"{"code":"ggplot(df)"}"#,
    ]);

    let history = fixture.json(&["conversation", "history", "--conversation-id", &id]);
    let Some(history) = history.as_array() else {
        panic!("history output must be an array");
    };
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[1]["role"], "assistant");

    let formatted = fixture.json(&["conversation", "format", "--conversation-id", &id]);
    let context = text(&formatted, "context");
    assert!(context.contains("=== CONVERSATION HISTORY ==="));
    assert!(context.contains("User (Message 1):"));
    assert!(context.contains("Assistant (Message 2):"));

    let shown = fixture.json(&["conversation", "show", "--conversation-id", &id]);
    assert_eq!(shown["message_count"], 2);
    assert_eq!(shown["title"], "Plots");

    let listed = fixture.json(&["conversation", "list", "--owner", "alice"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let cleared = fixture.json(&["conversation", "clear", "--conversation-id", &id]);
    assert_eq!(cleared["cleared"], true);
    let shown = fixture.json(&["conversation", "show", "--conversation-id", &id]);
    assert_eq!(shown["message_count"], 0);
    assert_eq!(shown["title"], "Plots");

    let stats = fixture.json(&["conversation", "stats"]);
    assert_eq!(stats["active_conversations"], 1);

    let deleted = fixture.json(&["conversation", "delete", "--conversation-id", &id]);
    assert_eq!(deleted["deleted"], true);
    let missing = fixture.run(&["conversation", "show", "--conversation-id", &id]);
    assert!(!missing.status.success());
}

#[test]
fn conversation_add_fails_for_unknown_id() {
    let fixture = Fixture::new();
    let unknown = Ulid::new().to_string();
    let output = fixture.run(&["conversation", "add", "--conversation-id", &unknown, "--role", "user", "--content", "hi"]);
    assert!(!output.status.success());

    let output = fixture.run(&["conversation", "history", "--conversation-id", "not-a-ulid"]);
    assert!(!output.status.success());
}

#[test]
fn cache_classifier_follows_deny_then_allow() {
    let fixture = Fixture::new();
    let cases = [
        ("how to plot a histogram", true),
        ("why is this error happening", false),
        ("how to fix this error", false),
        ("good morning", false),
    ];
    for (prompt, expected) in cases {
        let result = fixture.json(&["cache", "classify", "--prompt", prompt]);
        assert_eq!(result["cacheable"], expected, "prompt: {prompt}");
    }
}

#[test]
fn cache_normalize_uses_configured_or_requested_mode() {
    let fixture = Fixture::new();
    let default = fixture.json(&["cache", "normalize", "--prompt", "  How To PLOT?  "]);
    assert_eq!(default["mode"], "trim_lowercase");
    assert_eq!(default["normalized"], "how to plot?");

    let collapsed = fixture.json(&["cache", "normalize", "--prompt", "How, to   plot?", "--mode", "collapsed"]);
    assert_eq!(collapsed["mode"], "collapsed");
    assert_eq!(collapsed["normalized"], "how to plot");

    let output = fixture.run(&["cache", "normalize", "--prompt", "x", "--mode", "fuzzy"]);
    assert!(!output.status.success());
}

#[test]
fn cache_fingerprint_and_similarity_contract() {
    let fixture = Fixture::new();
    let snapshot = r#"{"workspace_objects":{"b":1,"a":2},"console_history":["x","y"]}"#;

    let fp = fixture.json(&["cache", "fingerprint", "--snapshot-json", snapshot]);
    assert_eq!(fp["workspace_keys"], serde_json::json!(["a", "b"]));
    assert_eq!(fp["recent_commands"], serde_json::json!(["x", "y"]));

    let same = fixture.json(&["cache", "similarity", "--left-json", snapshot, "--right-json", snapshot]);
    assert_eq!(same["similarity"], 1.0);

    let disjoint = fixture.json(&[
        "cache",
        "similarity",
        "--left-json",
        r#"{"workspace_objects":{"a":1}}"#,
        "--right-json",
        r#"{"workspace_objects":{"b":1}}"#,
    ]);
    assert_eq!(disjoint["similarity"], 0.0);
}

#[test]
fn config_show_applies_file_overrides() {
    let fixture = Fixture::new();
    let defaults = fixture.json(&["config", "show"]);
    assert_eq!(defaults["context"]["max_contexts_per_owner"], 20);
    assert_eq!(defaults["conversation"]["max_conversations_per_owner"], 10);
    assert_eq!(defaults["response_cache"]["normalization"], "trim_lowercase");

    let config = std::env::temp_dir().join(format!("ctxcache-config-{}.toml", Ulid::new()));
    if let Err(err) = std::fs::write(&config, "[context]\nmax_contexts_per_owner = 3\n") {
        panic!("failed to write config: {err}");
    }
    let output = fixture.run_with_config(Some(&config), &["config", "show"]);
    assert!(output.status.success());
    let overridden = stdout_json(&output);
    assert_eq!(overridden["context"]["max_contexts_per_owner"], 3);
    assert_eq!(overridden["context"]["max_total_contexts"], 200);

    if let Err(err) = std::fs::write(&config, "[response_cache]\nsimilarity_threshold = 2.0\n") {
        panic!("failed to write config: {err}");
    }
    let output = fixture.run_with_config(Some(&config), &["config", "show"]);
    assert!(!output.status.success());
    let _ = std::fs::remove_file(&config);
}
