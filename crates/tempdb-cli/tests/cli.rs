use std::path::Path;
use std::process::Command;

fn tempdb() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tempdb"))
}

fn tempdb_with_home(tmp: &Path) -> Command {
    let mut cmd = tempdb();
    cmd.env("TEMPDB_HOME", tmp.join(".tempdb"));
    cmd.env_remove("TEMPDB_BASE_PATH");
    cmd
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[cfg(unix)]
fn fake_mysqld(dir: &Path, version: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let path = bin.join("mysqld");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho \"mysqld  Ver {version} for Linux on x86_64 (fake)\"\n"),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    let output = tempdb().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["up", "template", "locate", "port", "config"] {
        assert!(text.contains(command), "missing {command} in:\n{text}");
    }
}

#[test]
fn version_flag_prints_version() {
    let output = tempdb().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn port_prints_port_in_range() {
    let output = tempdb()
        .args(["port", "--min", "41000", "--max", "41999"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let port: u16 = stdout(&output).trim().parse().unwrap();
    assert!((41000..=41999).contains(&port));
}

#[test]
fn port_with_hint_starts_at_hint() {
    let output = tempdb()
        .args(["port", "--hint", "42000", "--min", "42000", "--max", "42100"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let port: u16 = stdout(&output).trim().parse().unwrap();
    assert!((42000..=42100).contains(&port));
}

#[test]
fn port_rejects_inverted_range() {
    let output = tempdb()
        .args(["port", "--min", "5000", "--max", "4000"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("must not exceed"));
}

#[test]
fn config_prints_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let output = tempdb_with_home(tmp.path()).arg("config").output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("[mysqld]\n"));
    assert!(text.contains("character-set-server=utf8mb4"));
    assert!(text.contains("NO_AUTO_CREATE_USER"));
    assert!(!tmp.path().join(".tempdb/instances").exists());
}

#[test]
fn config_for_mysql8_drops_deprecated_modes() {
    let output = tempdb().args(["config", "--mysql8"]).output().unwrap();
    assert!(output.status.success());
    assert!(!stdout(&output).contains("NO_AUTO_CREATE_USER"));
}

#[test]
fn config_reads_settings_file() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = tmp.path().join("settings.toml");
    std::fs::write(
        &settings,
        "[mysqld]\ncharacter_set_server = \"latin1\"\nmax_connections = 10\n",
    )
    .unwrap();

    let output = tempdb()
        .args(["config", "--settings"])
        .arg(&settings)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("character-set-server=latin1"));
    assert!(text.contains("max_connections=10"));
}

#[test]
fn config_uses_home_settings_by_default() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join(".tempdb");
    std::fs::create_dir_all(&home).unwrap();
    std::fs::write(
        home.join("settings.toml"),
        "[mysqld]\nmax_connections = 77\n",
    )
    .unwrap();

    let output = tempdb_with_home(tmp.path()).arg("config").output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("max_connections=77"));
}

#[test]
fn config_rejects_unknown_settings() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = tmp.path().join("settings.toml");
    std::fs::write(&settings, "port_hnit = 3306\n").unwrap();

    let output = tempdb()
        .args(["config", "--settings"])
        .arg(&settings)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("✗"));
    assert!(err.contains("port_hnit"));
}

#[cfg(unix)]
#[test]
fn locate_reports_explicit_binary() {
    let tmp = tempfile::tempdir().unwrap();
    let mysqld = fake_mysqld(tmp.path(), "8.0.36");

    let output = tempdb()
        .args(["locate", "--mysqld"])
        .arg(&mysqld)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains(&mysqld.display().to_string()));
    assert!(text.contains("8.0.36"));
    assert!(text.contains("data/ subfolder"));
}

#[cfg(unix)]
#[test]
fn locate_reports_legacy_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let mysqld = fake_mysqld(tmp.path(), "5.7.44");

    let output = tempdb()
        .args(["locate", "--mysqld"])
        .arg(&mysqld)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("instance folder"));
}

#[test]
fn locate_fails_for_missing_binary() {
    let tmp = tempfile::tempdir().unwrap();
    let output = tempdb()
        .args(["locate", "--mysqld"])
        .arg(tmp.path().join("no-such-mysqld"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("--mysqld <PATH>"));
}

#[test]
fn up_fails_cleanly_without_mysqld() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = tmp.path().join("settings.toml");
    std::fs::write(
        &settings,
        format!(
            "path_to_mysqld = {:?}\n",
            tmp.path().join("no-such-mysqld").display().to_string()
        ),
    )
    .unwrap();

    let output = tempdb_with_home(tmp.path())
        .args(["up", "--settings"])
        .arg(&settings)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("✗"));
    assert!(err.contains("Failed to start mysqld"));
}

#[test]
fn up_rejects_missing_template() {
    let tmp = tempfile::tempdir().unwrap();
    let output = tempdb_with_home(tmp.path())
        .args(["up", "--template"])
        .arg(tmp.path().join("no-such-template"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("is not a directory"));
}

#[test]
fn up_rejects_unreadable_script() {
    let tmp = tempfile::tempdir().unwrap();
    let output = tempdb_with_home(tmp.path())
        .args(["up", "--script"])
        .arg(tmp.path().join("missing.sql"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Failed to read script"));
}

#[test]
fn template_refuses_existing_output() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("existing");
    std::fs::create_dir_all(&out).unwrap();

    let output = tempdb_with_home(tmp.path())
        .args(["template", "--out"])
        .arg(&out)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("already exists"));
}
