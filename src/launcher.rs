//! Detached process spawning for the local pruner server.
//! The spawned process outlives `pcat`; nothing here waits on or kills it.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const MODEL_PATH_ENV: &str = "SWEPRUNER_MODEL_PATH";

/// Everything needed to start one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub log_path: PathBuf,
}

impl LaunchSpec {
    /// Shell-ish rendering for hints and logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '"') {
        arg.to_string()
    } else {
        format!("\"{}\"", arg.replace('"', "\\\""))
    }
}

/// Program and leading arguments of the server command. `pcat` appends
/// `--host`, `--port` and `--model-path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ServerCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "-m".to_string(),
                "swe_pruner.online_serving".to_string(),
                "serve".to_string(),
            ],
        }
    }
}

impl ServerCommand {
    pub fn launch_spec(
        &self,
        host: &str,
        port: u16,
        model_path: &Path,
        log_path: &Path,
    ) -> LaunchSpec {
        let mut args = self.args.clone();
        args.extend([
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--model-path".to_string(),
            model_path.display().to_string(),
        ]);
        LaunchSpec {
            program: self.program.clone(),
            args,
            envs: vec![(
                MODEL_PATH_ENV.to_string(),
                model_path.display().to_string(),
            )],
            log_path: log_path.to_path_buf(),
        }
    }
}

/// Capability to start a background process that survives the caller.
pub trait Launcher {
    /// Start the process and return its pid.
    fn spawn_detached(&self, spec: &LaunchSpec) -> io::Result<u32>;
}

/// Real process spawning: stdin closed, stdout+stderr appended to the log
/// file, own session (Unix) or detached console (Windows).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn_detached(&self, spec: &LaunchSpec) -> io::Result<u32> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        detach(&mut cmd);

        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

/// New session: no controlling terminal, so closing pcat's terminal or
/// killing its process group leaves the server running.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_command_targets_online_serving() {
        let spec = ServerCommand::default().launch_spec(
            "127.0.0.1",
            8123,
            Path::new("/models/pruner"),
            Path::new("/tmp/server.log"),
        );
        assert_eq!(spec.program, "python3");
        assert_eq!(
            spec.args,
            vec![
                "-m",
                "swe_pruner.online_serving",
                "serve",
                "--host",
                "127.0.0.1",
                "--port",
                "8123",
                "--model-path",
                "/models/pruner"
            ]
        );
        assert_eq!(
            spec.envs,
            vec![(MODEL_PATH_ENV.to_string(), "/models/pruner".to_string())]
        );
    }

    #[test]
    fn command_line_quotes_spaces() {
        let spec = ServerCommand::default().launch_spec(
            "127.0.0.1",
            8000,
            Path::new("/my models/pruner"),
            Path::new("/tmp/server.log"),
        );
        assert!(spec
            .command_line()
            .ends_with("--port 8000 --model-path \"/my models/pruner\""));
    }

    #[cfg(unix)]
    #[test]
    fn spawn_writes_to_log_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("server.log");
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo \"$SWEPRUNER_MODEL_PATH\"".to_string()],
            envs: vec![(MODEL_PATH_ENV.to_string(), "/m".to_string())],
            log_path: log.clone(),
        };
        let pid = ProcessLauncher.spawn_detached(&spec).unwrap();
        assert!(pid > 0);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let content = fs::read_to_string(&log).unwrap_or_default();
            if content.contains("/m") {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "log never written");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn spawned_server_leads_its_own_session() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("server.log");
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "read -r pid comm state ppid pgrp sid rest < /proc/$$/stat; echo \"ids $pid $sid\""
                    .to_string(),
            ],
            envs: Vec::new(),
            log_path: log.clone(),
        };
        let pid = ProcessLauncher.spawn_detached(&spec).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let line = loop {
            let content = fs::read_to_string(&log).unwrap_or_default();
            if let Some(line) = content.lines().find(|l| l.starts_with("ids ")) {
                break line.to_string();
            }
            assert!(std::time::Instant::now() < deadline, "log never written");
            std::thread::sleep(std::time::Duration::from_millis(20));
        };
        assert_eq!(line, format!("ids {pid} {pid}"));
    }

    #[test]
    fn spawn_missing_program_is_error() {
        let dir = TempDir::new().unwrap();
        let spec = LaunchSpec {
            program: "pcat-definitely-missing-binary".to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            log_path: dir.path().join("server.log"),
        };
        assert!(ProcessLauncher.spawn_detached(&spec).is_err());
    }
}
