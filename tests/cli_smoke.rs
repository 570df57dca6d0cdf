use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

const ENV_OVERRIDES: &[&str] = &[
    "QUORUM_CONFIG",
    "QUORUM_CACHE_PATH",
    "QUORUM_STORE_PATH",
    "QUORUM_RUN_DEADLINE_SECS",
    "OPENROUTER_API_KEY",
    "OPENROUTER_BASE_URL",
    "OPENROUTER_TIMEOUT_SECONDS",
];

fn quorum(args: &[&str], config: Option<&Path>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_quorum"));
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    if let Some(path) = config {
        cmd.arg("--config").arg(path);
    }
    cmd.args(args).output().unwrap()
}

#[test]
fn help_lists_subcommands() {
    let out = quorum(&["--help"], None);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for sub in ["run", "show", "ledger", "lanes", "cache-prune", "cache-export"] {
        assert!(text.contains(sub), "missing {sub} in help:\n{text}");
    }
}

#[test]
fn lanes_reads_configured_lanes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("quorum.toml");
    std::fs::write(
        &path,
        r#"
[[lanes]]
id = "deep"
max_solver_parallelism = 5
"#,
    )
    .unwrap();

    let out = quorum(&["lanes"], Some(&path));
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.lines().any(|l| l.starts_with("deep ")), "{text}");
    assert!(text.contains("solvers=5"), "{text}");
}

#[test]
fn unparseable_config_exits_nonzero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[gateway\ncall_timeout_secs = = 3").unwrap();

    let out = quorum(&["lanes"], Some(&path));
    assert!(!out.status.success());
    assert!(!out.stderr.is_empty());
}

#[test]
fn invalid_lane_config_exits_nonzero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lanes.toml");
    std::fs::write(
        &path,
        r#"
[[lanes]]
id = "overconfident"
verification_threshold = 1.5
"#,
    )
    .unwrap();

    let out = quorum(&["lanes"], Some(&path));
    assert!(!out.status.success());
    assert!(!out.stderr.is_empty());
}

#[test]
fn missing_config_file_exits_nonzero() {
    let dir = tempdir().unwrap();
    let out = quorum(&["lanes"], Some(&dir.path().join("absent.toml")));
    assert!(!out.status.success());
}
