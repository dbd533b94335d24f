use super::policy::Profile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

// Applied by the harness before the program runs.
const CPU_LIMIT_SECS: u64 = 120;
const MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Runs a program in a fresh namespace that only sees the enumerated builtins
/// and a guarded importer, then answers with one JSON envelope on stdout.
const HARNESS: &str = r#"
import builtins
import json
import sys


def _limit(limits):
    try:
        import resource
    except ImportError:
        return
    for name, key in (("RLIMIT_CPU", "cpu_seconds"), ("RLIMIT_AS", "memory_bytes")):
        value = limits.get(key)
        if value:
            try:
                resource.setrlimit(getattr(resource, name), (value, value))
            except (ValueError, OSError):
                pass


def _reply(out, payload):
    out.write(json.dumps(payload, default=str))
    out.write("\n")
    out.flush()


def main():
    out = sys.stdout
    request = json.loads(sys.stdin.read())
    _limit(request.get("limits") or {})

    allowed = set(request["allowed_imports"])
    real_import = builtins.__import__

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0 or name.split(".")[0] not in allowed:
            raise ImportError("import of '%s' is not allowed" % name)
        return real_import(name, globals, locals, fromlist, level)

    def to_stderr(*args, **kwargs):
        kwargs["file"] = sys.stderr
        print(*args, **kwargs)

    def silent(*args, **kwargs):
        return None

    safe = {}
    for name in request["builtins"]:
        if name == "print":
            continue
        if hasattr(builtins, name):
            safe[name] = getattr(builtins, name)
    safe["print"] = to_stderr if request["mode"] == "extraction" else silent
    safe["__import__"] = guarded_import

    namespace = {"__builtins__": safe, "__name__": "__sandbox__"}
    for module, alias in (("pandas", "pd"), ("io", "io"), ("json", "json"), ("re", "re"), ("math", "math"), ("csv", "csv")):
        if module in allowed:
            try:
                namespace[alias] = real_import(module)
            except ImportError:
                pass
    inputs = request.get("inputs") or {}

    sys.stdout = sys.stderr
    try:
        if request["mode"] == "extraction":
            namespace.update(inputs)
            namespace["result_json"] = None
            exec(compile(request["program"], "<program>", "exec"), namespace)
            raw = namespace.get("result_json")
            if raw is None:
                sys.stdout = out
                return _reply(out, {"status": "missing"})
            if isinstance(raw, (str, bytes)):
                try:
                    result = json.loads(raw)
                except ValueError as exc:
                    sys.stdout = out
                    return _reply(out, {"status": "invalid", "error": str(exc)})
            else:
                result = json.loads(json.dumps(raw, default=str))
        else:
            exec(compile(request["program"], "<program>", "exec"), namespace)
            fn = namespace.get("validate_listing")
            if not callable(fn):
                sys.stdout = out
                return _reply(out, {"status": "missing"})
            result = fn(inputs.get("listing"), inputs.get("style_profile"))
            result = json.loads(json.dumps(result, default=str))
    except BaseException as exc:
        sys.stdout = out
        return _reply(out, {"status": "error", "error": "%s: %s" % (type(exc).__name__, exc)})
    sys.stdout = out
    _reply(out, {"status": "ok", "result": result})


main()
"#;

#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest {
    pub program: String,
    pub mode: Profile,
    pub inputs: Map<String, Value>,
    pub allowed_imports: Vec<&'static str>,
    pub builtins: Vec<&'static str>,
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Limits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_seconds: CPU_LIMIT_SECS,
            memory_bytes: MEMORY_LIMIT_BYTES,
        }
    }
}

impl ScriptRequest {
    pub fn new(program: &str, mode: Profile, inputs: Map<String, Value>) -> Self {
        Self {
            program: program.to_string(),
            mode,
            inputs,
            allowed_imports: mode.allowed_imports().to_vec(),
            builtins: mode.builtins(),
            limits: Limits::default(),
        }
    }
}

/// The harness envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptReply {
    Ok { result: Value },
    /// The program never filled its output slot.
    Missing,
    /// The output slot held text that is not JSON.
    Invalid { error: String },
    /// The program raised.
    Error { error: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start interpreter: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("program exceeded {0:?} and was killed")]
    Timeout(Duration),
    #[error("interpreter io failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("interpreter exited without a reply ({status}): {stderr}")]
    NoReply { status: String, stderr: String },
}

#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(&self, request: &ScriptRequest) -> Result<ScriptReply, RuntimeError>;
}

/// Short-lived `python3 -I` child per program: empty environment, private
/// temp working directory, hard wall-clock timeout.
pub struct PythonRuntime {
    python: String,
    timeout: Duration,
}

impl PythonRuntime {
    pub fn new(python: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScriptRuntime for PythonRuntime {
    async fn run(&self, request: &ScriptRequest) -> Result<ScriptReply, RuntimeError> {
        let workdir = tempfile::tempdir().map_err(RuntimeError::Io)?;
        let harness = workdir.path().join("harness.py");
        tokio::fs::write(&harness, HARNESS)
            .await
            .map_err(RuntimeError::Io)?;
        let payload = serde_json::to_vec(request)
            .map_err(|err| RuntimeError::Io(std::io::Error::other(err)))?;

        let mut child = Command::new(&self.python)
            .arg("-I")
            .arg(&harness)
            .current_dir(workdir.path())
            .env_clear()
            .env("OPENBLAS_NUM_THREADS", "1")
            .env("OMP_NUM_THREADS", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RuntimeError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(RuntimeError::Io)?;
            stdin.shutdown().await.map_err(RuntimeError::Io)?;
        }

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RuntimeError::Timeout(self.timeout))?
            .map_err(RuntimeError::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(
                target = "listing.sandbox",
                mode = request.mode.as_str(),
                stderr = %tail(&stderr, 2000),
                "program_output"
            );
        }

        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<ScriptReply>(line).ok())
            .ok_or_else(|| RuntimeError::NoReply {
                status: output.status.to_string(),
                stderr: tail(&stderr, 500),
            })
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}
