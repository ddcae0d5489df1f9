use std::fs;

use clap::Parser;
use pagecache::cache::Layout;
use pagecache::config::{self, CliArgs, Command};
use serial_test::serial;
use tempfile::TempDir;

const TTL_VAR: &str = "PAGECACHE__CACHE__TTL_SECONDS";
const HISTORY_VAR: &str = "PAGECACHE__CACHE__HISTORICAL_VERSIONS";

fn clear_env() {
    // SAFETY: env-mutating tests are serialized.
    unsafe {
        std::env::remove_var(TTL_VAR);
        std::env::remove_var(HISTORY_VAR);
    }
}

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("pagecache.toml");
    fs::write(
        &path,
        r#"
[server]
port = 8080

[cache]
ttl_seconds = 60
layout = "sidecar"
"#,
    )
    .expect("config file");
    path
}

#[test]
#[serial]
fn file_then_env_then_cli() {
    clear_env();
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir);

    let from_file = config::load(&CliArgs {
        config_file: Some(path.clone()),
        command: None,
    })
    .expect("file settings");
    assert_eq!(from_file.cache.ttl_seconds, 60);
    assert_eq!(from_file.cache.layout, Layout::Sidecar);
    assert_eq!(from_file.server.addr.port(), 8080);

    // SAFETY: env-mutating tests are serialized.
    unsafe {
        std::env::set_var(TTL_VAR, "120");
        std::env::set_var(HISTORY_VAR, "0.9.0,0.8.0");
    }
    let from_env = config::load(&CliArgs {
        config_file: Some(path.clone()),
        command: None,
    })
    .expect("env settings");
    assert_eq!(from_env.cache.ttl_seconds, 120);
    assert_eq!(
        from_env.cache.historical_versions,
        vec!["0.9.0".to_string(), "0.8.0".to_string()]
    );

    let cli = CliArgs::parse_from([
        "pagecache",
        "--config-file",
        path.to_str().expect("utf-8 path"),
        "serve",
        "--cache-ttl-seconds",
        "5",
        "--cache-layout",
        "bundled",
    ]);
    assert!(matches!(cli.command, Some(Command::Serve(_))));
    let from_cli = config::load(&cli).expect("cli settings");
    assert_eq!(from_cli.cache.ttl_seconds, 5);
    assert_eq!(from_cli.cache.layout, Layout::Bundled);

    clear_env();
}

#[test]
#[serial]
fn invalid_env_values_are_rejected() {
    clear_env();
    // SAFETY: env-mutating tests are serialized.
    unsafe {
        std::env::set_var(TTL_VAR, "soon");
    }
    let result = config::load(&CliArgs {
        config_file: None,
        command: None,
    });
    clear_env();
    assert!(result.is_err());
}

#[test]
fn maintenance_commands_parse() {
    let sweep = CliArgs::parse_from(["pagecache", "sweep", "--store-namespace", "views", "default"]);
    match sweep.command {
        Some(Command::Sweep(args)) => {
            assert_eq!(args.storage_name, "default");
            assert_eq!(args.store.store_namespace.as_deref(), Some("views"));
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let clear = CliArgs::parse_from([
        "pagecache",
        "clear",
        "--target-version",
        "1.0.0",
        "--key",
        "home",
    ]);
    match clear.command {
        Some(Command::Clear(args)) => {
            assert_eq!(args.target_version.as_deref(), Some("1.0.0"));
            assert_eq!(args.key.as_deref(), Some("home"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}
