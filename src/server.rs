//! Best-effort lifecycle of the local pruner server: URL normalization,
//! health probing and conditional auto-start.
//!
//! Nothing in here is fatal. `ensure_ready` reports what happened and the
//! caller decides whether to log it; if the server never comes up the prune
//! request fails with a connection error on its own.

use crate::launcher::{Launcher, ServerCommand};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::{Host, Url};

pub const DEFAULT_PORT: u16 = 8000;
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// The auto-started server never binds to anything but loopback.
pub const BIND_HOST: &str = "127.0.0.1";

// ── URL helpers ─────────────────────────────────────────────

/// Rewrite a bind-all host (`0.0.0.0`) to loopback for outbound requests.
/// Non-HTTP schemes and unparsable input pass through unchanged.
pub fn normalize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if !is_http(&parsed) {
        return url.to_string();
    }
    match parsed.host() {
        Some(Host::Ipv4(ip)) if ip.is_unspecified() => {}
        _ => return url.to_string(),
    }
    if parsed.set_host(Some(BIND_HOST)).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

/// `.../prune` -> `.../health`; any other path gets `/health` appended.
pub fn health_url(prune_url: &str) -> String {
    match Url::parse(prune_url) {
        Ok(mut parsed) => {
            let path = health_path(parsed.path());
            parsed.set_path(&path);
            parsed.to_string()
        }
        Err(_) => health_path(prune_url),
    }
}

fn health_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.strip_suffix("/prune") {
        Some(base) => format!("{base}/health"),
        None => format!("{trimmed}/health"),
    }
}

/// Loopback and bind-all aliases: `127.0.0.1`, `localhost`, `::1`, `0.0.0.0`.
pub fn is_local_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(name) => name.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => *ip == Ipv4Addr::LOCALHOST || *ip == Ipv4Addr::UNSPECIFIED,
        Host::Ipv6(ip) => *ip == Ipv6Addr::LOCALHOST,
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

// ── Health ──────────────────────────────────────────────────

/// GET the health URL; `Ok(status)` for any HTTP answer, `Err` with the
/// transport error otherwise.
pub fn probe_health(url: &str, timeout: Duration) -> Result<u16, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| err.to_string())?;
    let response = client.get(url).send().map_err(|err| err.to_string())?;
    Ok(response.status().as_u16())
}

pub fn check_health(url: &str, timeout: Duration) -> bool {
    matches!(probe_health(url, timeout), Ok(status) if (200..300).contains(&status))
}

// ── Lifecycle ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LifecycleOptions<'a> {
    /// Normalized prune URL.
    pub url: &'a str,
    pub auto_start: bool,
    pub model_path: &'a Path,
    pub log_path: &'a Path,
    pub start_timeout: Duration,
    pub command: &'a ServerCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    AlreadyHealthy,
    Started { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AutoStartDisabled,
    InvalidUrl,
    UnsupportedScheme(String),
    RemoteHost(String),
    MissingWeights(PathBuf),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AutoStartDisabled => write!(f, "auto-start disabled"),
            SkipReason::InvalidUrl => write!(f, "server URL is not parseable"),
            SkipReason::UnsupportedScheme(s) => write!(f, "unsupported scheme '{s}'"),
            SkipReason::RemoteHost(h) => write!(f, "host '{h}' is not local"),
            SkipReason::MissingWeights(p) => write!(f, "model weights missing: {}", p.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("server not started: {0}")]
    NotAttempted(SkipReason),
    #[error("failed to spawn pruner server: {0}")]
    SpawnFailed(#[source] io::Error),
    #[error("pruner server (pid {pid}) not healthy after {}s", .waited.as_secs_f64())]
    Timeout { pid: u32, waited: Duration },
}

/// Make sure a server answers at `opts.url`, starting a local one if allowed.
pub fn ensure_ready(
    opts: &LifecycleOptions<'_>,
    launcher: &dyn Launcher,
) -> Result<Readiness, LifecycleError> {
    ensure_ready_with(opts, launcher, POLL_INTERVAL, |url| {
        check_health(url, HEALTH_TIMEOUT)
    })
}

fn ensure_ready_with(
    opts: &LifecycleOptions<'_>,
    launcher: &dyn Launcher,
    poll_interval: Duration,
    healthy: impl Fn(&str) -> bool,
) -> Result<Readiness, LifecycleError> {
    let connect_url = normalize_url(opts.url);
    let health = health_url(&connect_url);
    if healthy(&health) {
        tracing::debug!(%health, "pruner server already healthy");
        return Ok(Readiness::AlreadyHealthy);
    }

    if !opts.auto_start {
        return Err(LifecycleError::NotAttempted(SkipReason::AutoStartDisabled));
    }

    let parsed = Url::parse(&connect_url)
        .map_err(|_| LifecycleError::NotAttempted(SkipReason::InvalidUrl))?;
    if !is_http(&parsed) {
        return Err(LifecycleError::NotAttempted(SkipReason::UnsupportedScheme(
            parsed.scheme().to_string(),
        )));
    }
    match parsed.host() {
        Some(host) if is_local_host(&host) => {}
        other => {
            let name = other.map(|h| h.to_string()).unwrap_or_default();
            return Err(LifecycleError::NotAttempted(SkipReason::RemoteHost(name)));
        }
    }

    let weights = opts.model_path.join(WEIGHTS_FILE);
    if !weights.exists() {
        return Err(LifecycleError::NotAttempted(SkipReason::MissingWeights(
            weights,
        )));
    }

    let port = parsed.port().unwrap_or(DEFAULT_PORT);
    let spec = opts
        .command
        .launch_spec(BIND_HOST, port, opts.model_path, opts.log_path);
    tracing::info!(
        command = %spec.command_line(),
        log = %opts.log_path.display(),
        "starting pruner server"
    );
    let pid = launcher
        .spawn_detached(&spec)
        .map_err(LifecycleError::SpawnFailed)?;

    let started = Instant::now();
    let deadline = started + opts.start_timeout;
    while Instant::now() < deadline {
        std::thread::sleep(poll_interval);
        if healthy(&health) {
            tracing::info!(
                pid,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pruner server is up"
            );
            return Ok(Readiness::Started { pid });
        }
    }
    Err(LifecycleError::Timeout {
        pid,
        waited: opts.start_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LaunchSpec;
    use crate::test_support::StubServer;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingLauncher {
        spawned: RefCell<Vec<LaunchSpec>>,
        fail: bool,
    }

    impl Launcher for RecordingLauncher {
        fn spawn_detached(&self, spec: &LaunchSpec) -> io::Result<u32> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no python"));
            }
            self.spawned.borrow_mut().push(spec.clone());
            Ok(4242)
        }
    }

    struct Fixture {
        _dir: TempDir,
        model: PathBuf,
        log: PathBuf,
        command: ServerCommand,
    }

    impl Fixture {
        fn new(with_weights: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let model = dir.path().join("model");
            fs::create_dir_all(&model).unwrap();
            if with_weights {
                fs::write(model.join(WEIGHTS_FILE), b"weights").unwrap();
            }
            let log = dir.path().join("server.log");
            Self {
                _dir: dir,
                model,
                log,
                command: ServerCommand::default(),
            }
        }

        fn opts<'a>(&'a self, url: &'a str, auto_start: bool) -> LifecycleOptions<'a> {
            LifecycleOptions {
                url,
                auto_start,
                model_path: &self.model,
                log_path: &self.log,
                start_timeout: Duration::from_millis(200),
                command: &self.command,
            }
        }
    }

    const FAST_POLL: Duration = Duration::from_millis(10);

    fn ready(
        opts: &LifecycleOptions<'_>,
        launcher: &RecordingLauncher,
        healthy: impl Fn(&str) -> bool,
    ) -> Result<Readiness, LifecycleError> {
        ensure_ready_with(opts, launcher, FAST_POLL, healthy)
    }

    #[test]
    fn normalize_rewrites_bind_all() {
        assert_eq!(
            normalize_url("http://0.0.0.0:9000/prune"),
            "http://127.0.0.1:9000/prune"
        );
        assert_eq!(
            normalize_url("https://0.0.0.0:9000/v1/prune?x=1"),
            "https://127.0.0.1:9000/v1/prune?x=1"
        );
    }

    #[test]
    fn normalize_leaves_other_urls_alone() {
        assert_eq!(normalize_url("http://10.0.0.5:8000"), "http://10.0.0.5:8000");
        assert_eq!(normalize_url("ftp://0.0.0.0/prune"), "ftp://0.0.0.0/prune");
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    #[test]
    fn health_url_replaces_prune_suffix() {
        assert_eq!(health_url("http://h:8000/prune"), "http://h:8000/health");
        assert_eq!(health_url("http://h:8000/prune/"), "http://h:8000/health");
        assert_eq!(health_url("http://h:8000/v1/prune"), "http://h:8000/v1/health");
    }

    #[test]
    fn health_url_appends_otherwise() {
        assert_eq!(health_url("http://h:8000/api"), "http://h:8000/api/health");
        assert_eq!(health_url("http://h:8000"), "http://h:8000/health");
        assert_eq!(
            health_url("http://h:8000/api?token=t"),
            "http://h:8000/api/health?token=t"
        );
    }

    #[test]
    fn local_host_aliases() {
        for url in [
            "http://127.0.0.1/",
            "http://localhost/",
            "http://[::1]/",
            "http://0.0.0.0/",
        ] {
            let parsed = Url::parse(url).unwrap();
            assert!(is_local_host(&parsed.host().unwrap()), "{url}");
        }
        for url in ["http://10.0.0.1/", "http://pruner.internal/", "http://[::2]/"] {
            let parsed = Url::parse(url).unwrap();
            assert!(!is_local_host(&parsed.host().unwrap()), "{url}");
        }
    }

    #[test]
    fn healthy_server_is_not_spawned() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let opts = fx.opts("http://127.0.0.1:8000/prune", true);
        let result = ready(&opts, &launcher, |_| true);
        assert_eq!(result.unwrap(), Readiness::AlreadyHealthy);
        assert!(launcher.spawned.borrow().is_empty());
    }

    #[test]
    fn checks_health_endpoint_of_normalized_url() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let probed = RefCell::new(Vec::new());
        let _ = ready(&fx.opts("http://0.0.0.0:9001/prune", false), &launcher, |url| {
            probed.borrow_mut().push(url.to_string());
            false
        });
        assert_eq!(probed.into_inner(), vec!["http://127.0.0.1:9001/health"]);
    }

    #[test]
    fn auto_start_disabled_never_spawns() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let opts = fx.opts("http://127.0.0.1:8000/prune", false);
        let err = ready(&opts, &launcher, |_| false).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NotAttempted(SkipReason::AutoStartDisabled)
        ));
        assert!(launcher.spawned.borrow().is_empty());
    }

    #[test]
    fn remote_host_never_spawns() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let opts = fx.opts("http://pruner.example.com:8000/prune", true);
        let err = ready(&opts, &launcher, |_| false).unwrap_err();
        match err {
            LifecycleError::NotAttempted(SkipReason::RemoteHost(host)) => {
                assert_eq!(host, "pruner.example.com")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(launcher.spawned.borrow().is_empty());
    }

    #[test]
    fn missing_weights_skip_spawn() {
        let fx = Fixture::new(false);
        let launcher = RecordingLauncher::default();
        let opts = fx.opts("http://localhost:8000/prune", true);
        let err = ready(&opts, &launcher, |_| false).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NotAttempted(SkipReason::MissingWeights(_))
        ));
        assert!(launcher.spawned.borrow().is_empty());
    }

    #[test]
    fn spawn_binds_loopback_and_default_port() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let probes = Cell::new(0);
        let opts = fx.opts("http://0.0.0.0/prune", true);
        let result = ready(&opts, &launcher, |_| {
            probes.set(probes.get() + 1);
            probes.get() > 2
        });
        assert_eq!(result.unwrap(), Readiness::Started { pid: 4242 });

        let spawned = launcher.spawned.borrow();
        assert_eq!(spawned.len(), 1);
        let args = &spawned[0].args;
        let host_at = args.iter().position(|a| a == "--host").unwrap();
        assert_eq!(args[host_at + 1], BIND_HOST);
        let port_at = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port_at + 1], "8000");
        assert_eq!(spawned[0].log_path, fx.log);
    }

    #[test]
    fn explicit_port_is_forwarded() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let probes = Cell::new(0);
        let opts = fx.opts("http://localhost:8765/prune", true);
        let _ = ready(&opts, &launcher, |_| {
            probes.set(probes.get() + 1);
            probes.get() > 1
        });
        let spawned = launcher.spawned.borrow();
        assert!(spawned[0].args.windows(2).any(|w| w == ["--port", "8765"]));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher {
            fail: true,
            ..Default::default()
        };
        let opts = fx.opts("http://127.0.0.1:8000/prune", true);
        let err = ready(&opts, &launcher, |_| false).unwrap_err();
        assert!(matches!(err, LifecycleError::SpawnFailed(_)));
    }

    #[test]
    fn never_healthy_times_out() {
        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let started = Instant::now();
        let opts = fx.opts("http://127.0.0.1:8000/prune", true);
        let err = ready(&opts, &launcher, |_| false).unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { pid: 4242, .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(launcher.spawned.borrow().len(), 1);
    }

    #[test]
    fn check_health_against_stub() {
        let up = StubServer::spawn(|req| match req.path.as_str() {
            "/health" => (200, r#"{"status":"ok"}"#.to_string()),
            _ => (404, "{}".to_string()),
        });
        assert!(check_health(&up.url("/health"), HEALTH_TIMEOUT));
        assert!(!check_health(&up.url("/missing"), HEALTH_TIMEOUT));

        let fx = Fixture::new(true);
        let launcher = RecordingLauncher::default();
        let url = up.url("/prune");
        let result = ensure_ready(&fx.opts(&url, true), &launcher);
        assert_eq!(result.unwrap(), Readiness::AlreadyHealthy);
    }

    #[test]
    fn check_health_unreachable_is_false() {
        let url = crate::test_support::dead_url("/health");
        assert!(!check_health(&url, Duration::from_millis(500)));
        assert!(probe_health(&url, Duration::from_millis(500)).is_err());
    }
}
