//! Sandboxed transform step.
//!
//! Scripts are minijinja expressions or templates evaluated in an
//! environment with no loader and no host functions: nothing can reach the
//! filesystem or the network. The extracted value is bound to `value`.
//!
//! - Expression form: `value.rates | map(attribute="rate") | list`
//! - Template form (source contains `{{` or `{%`): rendered text is parsed
//!   as JSON, or kept as a string if it is not JSON.
//!
//! Every evaluation has a wall-clock budget, an instruction budget (fuel) and
//! an output cap. With [`Isolation::Process`] it also runs in a
//! `feedsync-transform` worker whose address space is capped, so a script
//! that builds huge intermediate values fails with
//! [`TransformError::ResourceExceeded`] instead of exhausting host memory.
//! [`Isolation::Thread`] evaluates on a thread of this process and relies on
//! fuel and the output cap alone.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use minijinja::{Environment, ErrorKind as JinjaErrorKind, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;

/// File name of the worker binary, looked up next to the running executable.
pub const WORKER_BIN: &str = "feedsync-transform";

/// Max characters of worker stderr kept on an error.
const STDERR_SNIPPET_CHARS: usize = 512;

/// Errors from compiling or evaluating a transform script.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransformError {
    #[error("transform syntax error: {0}")]
    Syntax(String),

    #[error("transform runtime error: {0}")]
    Runtime(String),

    #[error("transform timed out after {0:?}")]
    Timeout(Duration),

    #[error("transform resource limit exceeded: {0}")]
    ResourceExceeded(String),
}

/// Where evaluations run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// A dedicated thread of this process.
    Thread,
    /// A worker process limited to `max_memory_bytes` of address space.
    Process {
        program: PathBuf,
        max_memory_bytes: u64,
    },
}

impl Isolation {
    /// Use the configured worker, else `feedsync-transform` next to the
    /// running binary. Without either, fall back to [`Isolation::Thread`].
    pub fn from_config(config: &feedsync_core::config::TransformConfig) -> Self {
        let program = match &config.worker_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.is_file() {
                    tracing::warn!(
                        path = %path.display(),
                        "TRANSFORM_WORKER does not exist; transforms will fail until it does"
                    );
                }
                Some(path)
            }
            None => sibling_worker(),
        };
        match program {
            Some(program) => {
                tracing::info!(
                    worker = %program.display(),
                    max_memory_bytes = config.max_memory_bytes,
                    "transforms run in a memory-limited worker process"
                );
                Isolation::Process {
                    program,
                    max_memory_bytes: config.max_memory_bytes,
                }
            }
            None => {
                tracing::warn!(
                    "{WORKER_BIN} not found next to this binary; transforms run in-process \
                     without a memory ceiling"
                );
                Isolation::Thread
            }
        }
    }
}

fn sibling_worker() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe
        .parent()?
        .join(format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}

/// Sandbox quotas.
#[derive(Debug, Clone)]
pub struct TransformLimits {
    pub timeout: Duration,
    /// Instruction budget; `None` disables fuel tracking.
    pub fuel: Option<u64>,
    pub max_output_bytes: usize,
    pub isolation: Isolation,
}

impl TransformLimits {
    pub fn from_config(config: &feedsync_core::config::TransformConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            fuel: Some(config.fuel),
            max_output_bytes: config.max_output_bytes,
            isolation: Isolation::from_config(config),
        }
    }
}

impl Default for TransformLimits {
    fn default() -> Self {
        let config = feedsync_core::config::TransformConfig::default();
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            fuel: Some(config.fuel),
            max_output_bytes: config.max_output_bytes,
            isolation: Isolation::Thread,
        }
    }
}

/// Runs transform scripts inside the sandbox.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    limits: TransformLimits,
}

impl Transformer {
    pub fn new(limits: TransformLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TransformLimits {
        &self.limits
    }

    /// Compile a script without evaluating it.
    pub fn validate(&self, script: &str) -> Result<(), TransformError> {
        let env = build_env(self.limits.fuel);
        let result = if is_template(script) {
            env.template_from_str(script).map(|_| ())
        } else {
            env.compile_expression(script).map(|_| ())
        };
        result.map_err(|e| TransformError::Syntax(e.to_string()))
    }

    /// Apply `script` to `input`. A missing or blank script is the identity.
    pub async fn transform(&self, input: Value, script: Option<&str>) -> Result<Value, TransformError> {
        let script = match script.map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Ok(input),
        };

        match &self.limits.isolation {
            Isolation::Thread => self.run_on_thread(script, input).await,
            Isolation::Process {
                program,
                max_memory_bytes,
            } => {
                self.run_in_worker(program, *max_memory_bytes, script, input)
                    .await
            }
        }
    }

    async fn run_on_thread(&self, script: String, input: Value) -> Result<Value, TransformError> {
        let limits = self.limits.clone();
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("feedsync-transform".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| evaluate(&script, &input, &limits)));
                // Receiver may be gone after a timeout.
                let _ = tx.send(result);
            })
            .map_err(|e| TransformError::Runtime(format!("failed to start transform: {e}")))?;

        match tokio::time::timeout(self.limits.timeout, rx).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(_)) => Err(TransformError::Runtime("transform worker exited".to_string())),
            Ok(Ok(Err(panic))) => Err(TransformError::Runtime(format!(
                "transform panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(Ok(result))) => result,
        }
    }

    async fn run_in_worker(
        &self,
        program: &Path,
        max_memory_bytes: u64,
        script: String,
        input: Value,
    ) -> Result<Value, TransformError> {
        let request = serde_json::to_vec(&WorkerRequest {
            script,
            input,
            fuel: self.limits.fuel,
            max_output_bytes: self.limits.max_output_bytes,
        })
        .map_err(|e| TransformError::Runtime(format!("failed to encode transform request: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        limit_address_space(&mut cmd, max_memory_bytes);

        let mut child = cmd.spawn().map_err(|e| {
            TransformError::Runtime(format!(
                "failed to start transform worker {}: {e}",
                program.display()
            ))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransformError::Runtime("transform worker has no stdin".to_string()))?;

        // Dropping this future on timeout kills the worker.
        let exchange = async move {
            // A worker that dies early is reported by its exit status.
            let _ = stdin.write_all(&request).await;
            drop(stdin);
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.limits.timeout, exchange).await {
            Err(_) => Err(self.timed_out()),
            Ok(Err(e)) => Err(TransformError::Runtime(format!("transform worker i/o failed: {e}"))),
            Ok(Ok(output)) => decode_worker_output(&output, max_memory_bytes),
        }
    }

    fn timed_out(&self) -> TransformError {
        tracing::warn!(
            budget_ms = self.limits.timeout.as_millis() as u64,
            "transform exceeded time budget"
        );
        TransformError::Timeout(self.limits.timeout)
    }
}

#[cfg(unix)]
fn limit_address_space(cmd: &mut Command, bytes: u64) {
    // SAFETY: pre_exec runs in the forked child before exec; setrlimit is
    // async-signal-safe and touches no shared state.
    unsafe {
        cmd.pre_exec(move || {
            let limit = libc::rlimit {
                rlim_cur: bytes as libc::rlim_t,
                rlim_max: bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn limit_address_space(_cmd: &mut Command, _bytes: u64) {}

#[cfg(unix)]
fn killed_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}

fn decode_worker_output(output: &Output, max_memory_bytes: u64) -> Result<Value, TransformError> {
    if output.status.success() {
        return match serde_json::from_slice::<WorkerReply>(&output.stdout) {
            Ok(WorkerReply::Ok(value)) => Ok(value),
            Ok(WorkerReply::Err(e)) => Err(e),
            Err(e) => Err(TransformError::Runtime(format!("unreadable worker reply: {e}"))),
        };
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    // Allocation failure aborts the worker.
    if stderr.contains("memory allocation") || killed_by_signal(&output.status) {
        return Err(TransformError::ResourceExceeded(format!(
            "memory limit of {max_memory_bytes} bytes exceeded"
        )));
    }
    let snippet: String = stderr.trim().chars().take(STDERR_SNIPPET_CHARS).collect();
    Err(TransformError::Runtime(format!(
        "transform worker failed ({}): {snippet}",
        output.status
    )))
}

// ── Worker protocol ─────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRequest {
    script: String,
    input: Value,
    fuel: Option<u64>,
    max_output_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WorkerReply {
    Ok(Value),
    Err(TransformError),
}

/// Worker side: read one request from `input`, evaluate it, and write the
/// reply to `output`. Used by the `feedsync-transform` binary.
pub fn serve_worker(mut input: impl Read, mut output: impl Write) -> std::io::Result<()> {
    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;

    let reply = match serde_json::from_slice::<WorkerRequest>(&raw) {
        Ok(request) => {
            let limits = TransformLimits {
                fuel: request.fuel,
                max_output_bytes: request.max_output_bytes,
                ..TransformLimits::default()
            };
            let result = catch_unwind(AssertUnwindSafe(|| {
                evaluate(&request.script, &request.input, &limits)
            }))
            .unwrap_or_else(|panic| {
                Err(TransformError::Runtime(format!(
                    "transform panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
            match result {
                Ok(value) => WorkerReply::Ok(value),
                Err(e) => WorkerReply::Err(e),
            }
        }
        Err(e) => WorkerReply::Err(TransformError::Runtime(format!("bad worker request: {e}"))),
    };

    serde_json::to_writer(&mut output, &reply)?;
    output.flush()
}

fn is_template(script: &str) -> bool {
    script.contains("{{") || script.contains("{%")
}

/// Build a configured minijinja environment with no loader.
fn build_env<'source>(fuel: Option<u64>) -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_fuel(fuel);
    env.add_filter("round_to", round_to_filter);
    env
}

fn evaluate(script: &str, input: &Value, limits: &TransformLimits) -> Result<Value, TransformError> {
    let env = build_env(limits.fuel);
    let ctx = minijinja::context! { value => minijinja::Value::from_serialize(input) };

    if is_template(script) {
        let template = env
            .template_from_str(script)
            .map_err(|e| TransformError::Syntax(e.to_string()))?;
        let mut out = CappedBuffer::new(limits.max_output_bytes);
        if let Err(e) = template.render_to_write(ctx, &mut out) {
            return Err(if out.overflowed {
                output_too_large(limits.max_output_bytes)
            } else {
                map_eval_error(e)
            });
        }
        let rendered = String::from_utf8(out.buf)
            .map_err(|e| TransformError::Runtime(format!("rendered output is not UTF-8: {e}")))?;
        let trimmed = rendered.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    } else {
        let expr = env
            .compile_expression(script)
            .map_err(|e| TransformError::Syntax(e.to_string()))?;
        let result = expr.eval(ctx).map_err(map_eval_error)?;
        if result.is_undefined() {
            return Err(TransformError::Runtime("expression evaluated to undefined".to_string()));
        }
        let json = serde_json::to_value(&result)
            .map_err(|e| TransformError::Runtime(format!("result is not JSON: {e}")))?;
        let size = serde_json::to_vec(&json).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > limits.max_output_bytes {
            return Err(output_too_large(limits.max_output_bytes));
        }
        Ok(json)
    }
}

fn map_eval_error(e: minijinja::Error) -> TransformError {
    match e.kind() {
        JinjaErrorKind::OutOfFuel => {
            TransformError::ResourceExceeded("instruction budget exhausted".to_string())
        }
        JinjaErrorKind::SyntaxError => TransformError::Syntax(e.to_string()),
        _ => TransformError::Runtime(e.to_string()),
    }
}

/// Render sink that refuses writes past `limit` bytes.
struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl CappedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            overflowed: false,
        }
    }
}

impl Write for CappedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return Err(std::io::Error::other("output cap reached"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn output_too_large(limit: usize) -> TransformError {
    TransformError::ResourceExceeded(format!("output larger than {limit} bytes"))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `{{ x | round_to(2) }}`: round a number to `digits` decimal places.
fn round_to_filter(value: f64, digits: Option<i32>) -> f64 {
    let factor = 10f64.powi(digits.unwrap_or(0));
    (value * factor).round() / factor
}

// ── Tests ────────────────────────────────────────────────────────────
