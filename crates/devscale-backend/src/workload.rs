//! Workload execution: the built-in sleep, spawned binaries, device-file
//! glob resolution and `FILENAME` argument substitution.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use devscale_core::proto::Reply;

/// Literal replaced with the resolved device file path in workload args.
pub const FILENAME_TOKEN: &str = "FILENAME";

/// Startup-time workload configuration errors; all of these terminate
/// the process.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("no files matching glob pattern '{0}'")]
    NoMatch(String),

    #[error("{FILENAME_TOKEN} in args, but no file name to map to it")]
    NoFileForToken,

    #[error("invalid workload, either give its absolute path or use 'sleep', not: {0:?}")]
    InvalidWorkload(Vec<String>),
}

/// How workload stdio is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioPolicy {
    /// Map stdin to /dev/null instead of inheriting it.
    pub null_in: bool,
    /// Map stdout/stderr to /dev/null instead of inheriting them.
    pub null_out: bool,
}

/// A validated workload invocation: the base argument vector plus the
/// execution environment it runs in.
#[derive(Debug, Clone)]
pub struct Workload {
    args: Vec<String>,
    dir: Option<String>,
    stdio: StdioPolicy,
    /// Backend run-time cap in seconds; 0 = none.
    limit: f64,
}

/// Outcome of one execution before identity fields are attached.
#[derive(Debug, Default, PartialEq)]
struct RunOutcome {
    retcode: i32,
    timeout: f64,
    error: String,
}

/// First match for the glob pattern. Matches are sorted so device
/// selection is deterministic; extra matches are logged.
pub fn resolve_device(pattern: &str) -> Result<Option<String>, SetupError> {
    if pattern.is_empty() {
        return Ok(None);
    }

    let entries = glob::glob(pattern).map_err(|source| SetupError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut paths: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    if paths.is_empty() {
        return Err(SetupError::NoMatch(pattern.to_string()));
    }

    paths.sort_unstable();
    if paths.len() > 1 {
        warn!(
            matches = paths.len(),
            pattern, "multiple matches for glob pattern"
        );
    }

    info!(pattern, file = %base_name(&paths[0]), "device file resolved");
    Ok(Some(paths.swap_remove(0)))
}

/// Base name of a path, for the `Device` reply field.
pub fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace the `FILENAME` literal in arguments with the resolved device
/// path.
pub fn map_args(args: &[String], file: Option<&str>) -> Result<Vec<String>, SetupError> {
    let mut mapped = Vec::with_capacity(args.len());
    for arg in args {
        if arg.contains(FILENAME_TOKEN) {
            let Some(file) = file else {
                return Err(SetupError::NoFileForToken);
            };
            mapped.push(arg.replace(FILENAME_TOKEN, file));
        } else {
            mapped.push(arg.clone());
        }
    }
    Ok(mapped)
}

/// The limit a single invocation runs under: the client-requested limit
/// clamped by the backend cap; no client limit means the cap itself.
fn effective_limit(backend: f64, client: f64) -> f64 {
    if client <= 0.0 || (backend > 0.0 && client > backend) {
        backend
    } else {
        client
    }
}

/// Sleep for the seconds given in the first argument, truncated to the
/// limit. The first argument is parsed (rather than the last) so the
/// backend invocation can override client-supplied values.
async fn run_sleep(args: &[String], limit: f64) -> RunOutcome {
    debug!(?args, limit, "run: sleep");

    let Some(first) = args.first() else {
        return RunOutcome {
            retcode: 1,
            error: "Sleep time (seconds) argument missing".to_string(),
            ..RunOutcome::default()
        };
    };
    let mut secs: f64 = match first.parse() {
        Ok(secs) => secs,
        Err(e) => {
            return RunOutcome {
                retcode: 1,
                error: format!("invalid sleep time value '{first}': {e}"),
                ..RunOutcome::default()
            };
        }
    };

    let mut outcome = RunOutcome::default();
    if limit > 0.0 && secs > limit {
        outcome.error = "Sleep timeout".to_string();
        outcome.timeout = limit;
        secs = limit;
    }

    tokio::time::sleep(Duration::from_millis((1000.0 * secs) as u64)).await;
    outcome
}

impl Workload {
    /// Validate the base argument vector: the workload is either the
    /// built-in `sleep` or an absolute path to spawn.
    pub fn new(
        args: Vec<String>,
        dir: Option<String>,
        stdio: StdioPolicy,
        limit: f64,
    ) -> Result<Self, SetupError> {
        let valid = match args.first().map(String::as_str) {
            Some("sleep") => true,
            Some(first) => first.starts_with('/'),
            None => false,
        };
        if !valid {
            return Err(SetupError::InvalidWorkload(args));
        }
        Ok(Self {
            args,
            dir,
            stdio,
            limit,
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Run the workload with `extra` arguments appended, measuring the
    /// wall-clock runtime.
    pub async fn execute(&self, extra: &[String], client_limit: f64) -> Reply {
        let mut args = self.args.clone();
        args.extend_from_slice(extra);

        let limit = effective_limit(self.limit, client_limit);
        let start = Instant::now();
        let outcome = if args[0] == "sleep" {
            run_sleep(&args[1..], limit).await
        } else {
            self.run_command(&args).await
        };
        let runtime = start.elapsed().as_secs_f64();

        info!(?args, retcode = outcome.retcode, runtime, "workload finished");

        Reply {
            retcode: outcome.retcode,
            timeout: outcome.timeout,
            runtime,
            error: outcome.error,
            ..Reply::default()
        }
    }

    /// Spawn the binary and wait for it. A workload that cannot even be
    /// started is a fatal configuration error.
    async fn run_command(&self, args: &[String]) -> RunOutcome {
        debug!(?args, limit = self.limit, "run: command");

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        if let Some(dir) = self.dir.as_deref().filter(|dir| !dir.is_empty()) {
            cmd.current_dir(dir);
        }
        if self.stdio.null_in {
            cmd.stdin(Stdio::null());
        }
        if self.stdio.null_out {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let status = match cmd.status().await {
            Ok(status) => status,
            Err(e) => {
                error!(path = %args[0], error = %e, "starting workload failed");
                std::process::exit(1);
            }
        };

        // TODO: enforce the runtime limit on spawned workloads the way
        // run_sleep does, instead of relying on the binary to behave
        let retcode = status.code().unwrap_or(-1);
        let error = if retcode != 0 {
            format!("{} returned error code {}", args[0], retcode)
        } else {
            String::new()
        };
        RunOutcome {
            retcode,
            timeout: 0.0,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn workload_must_be_sleep_or_absolute_path() {
        assert!(Workload::new(strings(&["sleep", "1"]), None, StdioPolicy::default(), 0.0).is_ok());
        assert!(Workload::new(strings(&["/bin/true"]), None, StdioPolicy::default(), 0.0).is_ok());

        for bad in [vec![], strings(&["relative/path"]), strings(&["true"])] {
            assert!(matches!(
                Workload::new(bad, None, StdioPolicy::default(), 0.0),
                Err(SetupError::InvalidWorkload(_))
            ));
        }
    }

    #[test]
    fn map_args_substitutes_the_token() {
        let args = strings(&["--device", "FILENAME", "--mode", "fast"]);
        let mapped = map_args(&args, Some("/dev/card0")).unwrap();
        assert_eq!(
            mapped,
            strings(&["--device", "/dev/card0", "--mode", "fast"])
        );
    }

    #[test]
    fn map_args_substitutes_inside_larger_arguments() {
        let args = strings(&["path=FILENAME:ro"]);
        let mapped = map_args(&args, Some("/dev/card0")).unwrap();
        assert_eq!(mapped, strings(&["path=/dev/card0:ro"]));
    }

    #[test]
    fn map_args_without_file_fails_on_token() {
        let args = strings(&["FILENAME"]);
        assert!(matches!(
            map_args(&args, None),
            Err(SetupError::NoFileForToken)
        ));
        // no token, no problem
        assert!(map_args(&strings(&["1"]), None).is_ok());
    }

    #[test]
    fn effective_limit_prefers_the_tighter_bound() {
        // no client limit: the backend cap applies
        assert_eq!(effective_limit(5.0, 0.0), 5.0);
        // client within the cap: client wins
        assert_eq!(effective_limit(5.0, 2.0), 2.0);
        // client beyond the cap: clamped
        assert_eq!(effective_limit(5.0, 9.0), 5.0);
        // no cap at all: client value passes through
        assert_eq!(effective_limit(0.0, 3.0), 3.0);
        assert_eq!(effective_limit(0.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn sleep_without_argument_fails() {
        let outcome = run_sleep(&[], 0.0).await;
        assert_eq!(outcome.retcode, 1);
        assert!(outcome.error.contains("argument missing"));
    }

    #[tokio::test]
    async fn sleep_with_bad_argument_fails() {
        let outcome = run_sleep(&strings(&["soon"]), 0.0).await;
        assert_eq!(outcome.retcode, 1);
        assert!(outcome.error.contains("invalid sleep time value 'soon'"));
    }

    #[tokio::test]
    async fn sleep_is_truncated_to_the_limit() {
        let start = Instant::now();
        let outcome = run_sleep(&strings(&["30"]), 0.05).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.retcode, 0);
        assert_eq!(outcome.timeout, 0.05);
        assert_eq!(outcome.error, "Sleep timeout");
    }

    #[tokio::test]
    async fn sleep_workload_reports_runtime() {
        let workload =
            Workload::new(strings(&["sleep"]), None, StdioPolicy::default(), 0.0).unwrap();
        let reply = workload.execute(&strings(&["0.05"]), 0.0).await;
        assert_eq!(reply.retcode, 0);
        assert!(reply.error.is_empty());
        assert!(reply.runtime >= 0.05);
    }

    #[tokio::test]
    async fn spawned_workload_exit_code_becomes_retcode() {
        let workload =
            Workload::new(strings(&["/bin/false"]), None, StdioPolicy::default(), 0.0).unwrap();
        let reply = workload.execute(&[], 0.0).await;
        assert_ne!(reply.retcode, 0);
        assert!(reply.error.contains("returned error code"));

        let workload =
            Workload::new(strings(&["/bin/true"]), None, StdioPolicy::default(), 0.0).unwrap();
        let reply = workload.execute(&[], 0.0).await;
        assert_eq!(reply.retcode, 0);
        assert!(reply.error.is_empty());
    }

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("/dev/dri/card0"), "card0");
        assert_eq!(base_name("card0"), "card0");
        assert_eq!(base_name(""), "");
    }

    #[test]
    fn resolve_device_empty_pattern_is_no_device() {
        assert_eq!(resolve_device("").unwrap(), None);
    }

    #[test]
    fn resolve_device_without_match_fails() {
        assert!(matches!(
            resolve_device("/nonexistent-path-devscale/*"),
            Err(SetupError::NoMatch(_))
        ));
    }

    #[test]
    fn resolve_device_picks_first_sorted_match() {
        let dir = std::env::temp_dir().join(format!("devscale-glob-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("card1"), b"").unwrap();
        std::fs::write(dir.join("card0"), b"").unwrap();

        let pattern = format!("{}/card*", dir.display());
        let resolved = resolve_device(&pattern).unwrap().unwrap();
        assert!(resolved.ends_with("card0"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
