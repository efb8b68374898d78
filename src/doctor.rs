//! `pcat doctor`: is this machine ready to prune?
//! Server modules and weights are required; a server that is down is only a
//! warning because `pcat read` can start it.

use crate::config::Settings;
use crate::pcat::download_command;
use crate::server::{self, BIND_HOST, DEFAULT_PORT, HEALTH_TIMEOUT, WEIGHTS_FILE};
use colored::Colorize;
use std::process::{Command, Stdio};
use url::Url;

/// Modules the server program must import, with their pip package names.
const SERVER_MODULES: [(&str, &str); 3] = [
    ("huggingface_hub", "huggingface-hub"),
    ("torch", "torch"),
    ("swe_pruner", "swe-pruner"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub status: Status,
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    pub fn ready(&self) -> bool {
        self.checks.iter().all(|c| c.status != Status::Fail)
    }
}

pub fn diagnose(settings: &Settings) -> Report {
    let program = &settings.server_command.program;
    let mut checks: Vec<Check> = SERVER_MODULES
        .iter()
        .map(|(module, package)| check_module(program, module, package))
        .collect();

    let weights = settings.model_path.join(WEIGHTS_FILE);
    if weights.is_file() {
        checks.push(Check {
            status: Status::Ok,
            message: format!("weights: {}", weights.display()),
            hint: None,
        });
    } else {
        checks.push(Check {
            status: Status::Fail,
            message: format!("weights missing: {}", weights.display()),
            hint: Some(format!("Download with:\n{}", download_command(settings))),
        });
    }

    let url = server::normalize_url(&settings.url);
    let health = server::health_url(&url);
    match server::probe_health(&health, HEALTH_TIMEOUT) {
        Ok(status) if (200..300).contains(&status) => checks.push(Check {
            status: Status::Ok,
            message: format!("server health: {health} (HTTP {status})"),
            hint: None,
        }),
        probed => {
            let detail = match probed {
                Ok(status) => format!("HTTP {status}"),
                Err(err) => err,
            };
            let port = Url::parse(&url)
                .ok()
                .and_then(|u| u.port())
                .unwrap_or(DEFAULT_PORT);
            let start = settings
                .server_command
                .launch_spec(BIND_HOST, port, &settings.model_path, &settings.server_log)
                .command_line();
            checks.push(Check {
                status: Status::Warn,
                message: format!("server health: {health} ({detail})"),
                hint: Some(format!(
                    "If you want the server running, start it with:\n{start}"
                )),
            });
        }
    }

    Report { checks }
}

/// Run `<program> -c "import <module>"`.
fn check_module(program: &str, module: &str, package: &str) -> Check {
    let hint = Some(format!("Install: {program} -m pip install -U {package}"));
    let output = Command::new(program)
        .args(["-c", &format!("import {module}")])
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => Check {
            status: Status::Ok,
            message: format!("import {module}"),
            hint: None,
        },
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| out.status.to_string());
            Check {
                status: Status::Fail,
                message: format!("import {module}: {detail}"),
                hint,
            }
        }
        Err(err) => Check {
            status: Status::Fail,
            message: format!("import {module}: cannot run {program}: {err}"),
            hint,
        },
    }
}

/// Print the report and return the process exit code.
pub fn run(settings: &Settings) -> i32 {
    println!("=== pcat doctor ===");
    println!("pcat: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("Server program: {}", settings.server_command.program);
    println!("PRUNER_URL: {}", settings.url);
    println!("Model path: {}", settings.model_path.display());
    println!();

    let report = diagnose(settings);
    for check in &report.checks {
        let tag = match check.status {
            Status::Ok => "[OK]".green(),
            Status::Warn => "[WARN]".yellow(),
            Status::Fail => "[FAIL]".red(),
        };
        println!("{tag} {}", check.message);
        if let Some(hint) = &check.hint {
            for line in hint.lines() {
                println!("       {line}");
            }
        }
    }

    println!();
    if report.ready() {
        println!("Result: {}", "OK".green().bold());
        0
    } else {
        println!("Result: {} (fix failures above)", "NOT READY".red().bold());
        2
    }
}
