//! CLI command integration tests.
//! Each test uses a temp directory via WM_DATA_DIR for full isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wm_core::NodeStore;
use wm_store::Store;

fn wm_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("wm").unwrap();
    cmd.env("WM_DATA_DIR", data_dir.path());
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn extract_stat_value(output: &str, prefix: &str) -> String {
    output
        .lines()
        .find(|l| l.starts_with(prefix))
        .map(|l| l[prefix.len()..].trim().to_string())
        .unwrap_or_default()
}

#[test]
fn stats_fresh_db() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodes:      0"))
        .stdout(predicate::str::contains("branches:   0"));
}

#[test]
fn add_then_query() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["add", "city", "the user lives in Lisbon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("added node"));

    wm_cmd(&dir)
        .args(["query", "where does the user live"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[FACTS]"))
        .stdout(predicate::str::contains("- city: the user lives in Lisbon"))
        .stdout(predicate::str::contains("[/FACTS]"));
}

#[test]
fn query_empty_store_prints_empty_block() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["query", "anything"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[FACTS]\n[/FACTS]"));
}

#[test]
fn query_budget_flag_limits_admission() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["add", "note", "a fact that needs more than two tokens"])
        .assert()
        .success();

    wm_cmd(&dir)
        .args(["query", "note", "--budget", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[FACTS]\n[/FACTS]"));
}

#[test]
fn config_file_sets_budget() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("wm.toml"), "[allocator]\ntoken_budget = 1\n").unwrap();
    wm_cmd(&dir)
        .args(["add", "note", "a fact that needs more than one token"])
        .assert()
        .success();

    let stdout = stdout_of(wm_cmd(&dir).args(["query", "note", "--json"]));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["budget"], 1);
    assert_eq!(json["admitted"].as_array().unwrap().len(), 0);
}

#[test]
fn ingest_file_then_stats() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("notes.txt");
    std::fs::write(
        &input,
        "The deploy runs every Tuesday.\n\nThe test suite must pass first.\nRollbacks are manual.\n",
    )
    .unwrap();

    wm_cmd(&dir)
        .arg("ingest")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 facts"))
        .stdout(predicate::str::contains("done. added=3"));

    let stdout = stdout_of(wm_cmd(&dir).arg("stats"));
    assert_eq!(extract_stat_value(&stdout, "nodes:"), "3");
    assert_eq!(extract_stat_value(&stdout, "edges:"), "2");
}

#[test]
fn link_unknown_node_fails() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["add", "city", "the user lives in Lisbon"])
        .assert()
        .success();
    wm_cmd(&dir)
        .args(["link", "1", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("node not found"));
}

#[test]
fn query_refreshes_served_access_time() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["add", "city", "the user lives in Lisbon"])
        .assert()
        .success();
    {
        let store = Store::open(&dir.path().join("wm.db")).unwrap();
        store
            .conn()
            .execute("UPDATE nodes SET last_accessed = 1000, salience = 0.5", [])
            .unwrap();
    }

    wm_cmd(&dir)
        .args(["query", "where does the user live"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- city: the user lives in Lisbon"));

    let store = Store::open(&dir.path().join("wm.db")).unwrap();
    let graph = store.load_node_store().unwrap();
    let node = &graph.nodes()[0];
    assert!(node.last_accessed > 1000);
    assert!((node.salience - 0.4).abs() < 1e-6);
}

#[test]
fn query_json_reports_admissions() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["add", "pet", "a cat named Miso"])
        .assert()
        .success();

    let stdout = stdout_of(wm_cmd(&dir).args(["query", "tell me about the cat", "--json"]));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let admitted = json["admitted"].as_array().unwrap();
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0]["label"], "pet");
    assert!(json["total_tokens"].as_i64().unwrap() > 0);
    assert!(json["prefetch"].is_null());
}

#[test]
fn query_with_output_runs_prefetch() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("bread.txt");
    std::fs::write(
        &input,
        "A sourdough starter needs daily feeding with flour and water.\n\
         A long cold proof develops sourdough flavor.\n\
         Bake the bread in a preheated dutch oven.\n\
         Steam gives bread a crisp crust.\n",
    )
    .unwrap();
    wm_cmd(&dir).arg("ingest").arg(&input).assert().success();

    let stdout = stdout_of(wm_cmd(&dir).args([
        "query",
        "how do I keep a starter alive",
        "--momentum",
        "0.95",
        "--output",
        "Feed the sourdough starter with flour and water every day, then let the dough proof.",
        "--json",
    ]));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(json["prefetch"]["walks"].as_u64().unwrap() >= 1);
}

#[test]
fn trm_push_log_context() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["trm", "push", "user asked about the outage"])
        .assert()
        .success();
    wm_cmd(&dir)
        .args(["trm", "push", "checked the deploy log", "--source", "self"])
        .assert()
        .success();

    wm_cmd(&dir)
        .args(["trm", "log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("branch: main"))
        .stdout(predicate::str::contains("checked the deploy log"));

    wm_cmd(&dir)
        .args(["trm", "context"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "[STATE]\nuser asked about the outage\nchecked the deploy log\n[/STATE]",
        ));
}

#[test]
fn trm_loop_guard_drops_fourth_push() {
    let dir = TempDir::new().unwrap();
    for _ in 0..3 {
        wm_cmd(&dir).args(["trm", "push", "loop"]).assert().success();
    }
    wm_cmd(&dir)
        .args(["trm", "push", "loop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dropped"));

    let stdout = stdout_of(wm_cmd(&dir).args(["trm", "log"]));
    assert_eq!(stdout.lines().filter(|l| l.ends_with(" loop")).count(), 3);
}

#[test]
fn trm_branch_merge_and_cherry_pick() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir).args(["trm", "push", "root state"]).assert().success();
    wm_cmd(&dir)
        .args(["trm", "branch", "side"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created branch side"));
    wm_cmd(&dir).args(["trm", "checkout", "side"]).assert().success();

    let commit = stdout_of(wm_cmd(&dir).args(["trm", "push", "an idea worth keeping"]));
    let commit = commit.trim().to_string();

    wm_cmd(&dir).args(["trm", "checkout", "main"]).assert().success();
    wm_cmd(&dir)
        .args(["trm", "branch"])
        .assert()
        .success()
        .stdout(predicate::str::contains("* main"))
        .stdout(predicate::str::contains("  side"));

    wm_cmd(&dir)
        .args(["trm", "merge", "side"])
        .assert()
        .success()
        .stdout(predicate::str::contains("merge side into main: 1 merged, 0 conflicts"));

    wm_cmd(&dir)
        .args(["trm", "cherry-pick", "side", &commit])
        .assert()
        .success();

    wm_cmd(&dir)
        .args(["trm", "context"])
        .assert()
        .success()
        .stdout(predicate::str::contains("an idea worth keeping"))
        .stdout(predicate::str::contains(format!("[cherry-pick side@{commit}]")));
}

#[test]
fn trm_unknown_branch_fails() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["trm", "checkout", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown branch 'nowhere'"));
}

#[test]
fn trm_lambda_rejects_negative() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir)
        .args(["trm", "lambda", "--", "-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("positive"));
}

#[test]
fn missing_required_args() {
    let dir = TempDir::new().unwrap();
    wm_cmd(&dir).arg("add").assert().failure();
    wm_cmd(&dir).arg("ingest").assert().failure();
    wm_cmd(&dir).args(["trm", "cherry-pick", "side"]).assert().failure();
}
