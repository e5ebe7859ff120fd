//! Command-line behaviour of `kiln-variants`.

use assert_cmd::Command;

fn kiln_variants() -> Command {
    let mut cmd = Command::cargo_bin("kiln-variants").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("RUSTFLAGS")
        .env_remove("KILN_CONFIG")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn list_json_reports_the_builtin_matrix() {
    let output = kiln_variants().args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["variant"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["cpu", "cpu-avx", "cpu-avx2", "cuda", "rocm"]);
}

#[test]
fn manifest_flag_replaces_the_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("variants.toml");
    std::fs::write(
        &manifest,
        "[[variant]]\nid = \"portable\"\nbaseline = true\n",
    )
    .unwrap();

    let output = kiln_variants()
        .arg("--manifest")
        .arg(&manifest)
        .args(["list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["variant"]["id"], "portable");
    assert_eq!(rows[0]["built"], false);
}

#[test]
fn dry_run_prints_the_cargo_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let output = kiln_variants()
        .args(["build", "cuda", "--dry-run", "--out"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--features cuda,avx"));
    assert!(stdout.contains("RUSTFLAGS=\"-C target-feature=+avx\""));
    assert!(!dir.path().join("cuda").exists());
}

#[test]
fn unknown_variant_fails() {
    let output = kiln_variants()
        .args(["build", "tpu", "--dry-run"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown variant: tpu"));
}
