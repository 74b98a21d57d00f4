//! Shared helpers for end-to-end CLI tests: run the compiled binary against
//! config and fleet files written into a temp directory.

use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use tempfile::TempDir;

/// Outcome of one binary invocation.
pub struct CliOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run the fleetmon binary with `args`, capturing both streams.
pub fn run_fleetmon(args: &[&str]) -> CliOutput {
    let out = Command::new(env!("CARGO_BIN_EXE_fleetmon"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("fleetmon binary should run");
    CliOutput {
        status: out.status,
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    }
}

/// A temp directory holding a config/fleet file pair.
pub struct Fixture {
    // Held for its Drop; the paths below point into it.
    _dir: TempDir,
    pub config: PathBuf,
    pub fleet: PathBuf,
}

/// Write `config_toml` and `fleet_toml` into a fresh temp directory.
pub fn write_fixture(config_toml: &str, fleet_toml: &str) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("engine.toml");
    let fleet = dir.path().join("fleet.toml");
    std::fs::write(&config, config_toml).expect("write config");
    std::fs::write(&fleet, fleet_toml).expect("write fleet");
    Fixture {
        _dir: dir,
        config,
        fleet,
    }
}
