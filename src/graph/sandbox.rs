//! Sandboxed execution of generated chart code.
//!
//! Generated code is untrusted. It is screened first, then run by an
//! isolated interpreter subprocess (`python3 -I`) with a cleared
//! environment, a scratch working directory, restricted builtins, an audit
//! hook, an address-space ceiling and a hard timeout. Once the plotting stack
//! is loaded the hook denies network and process access, every write, and
//! any read or directory listing outside the interpreter's own library
//! directories and the scratch directory. The child only sees `table_data`, `img_buf`
//! and the preloaded plotting modules; PNG bytes come back on stdout.

use crate::config::SandboxConfig;
use crate::error::WorkflowError;
use crate::graph::ChartRenderer;
use crate::models::Row;
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

const ALLOWED_MODULES: &[&str] = &["pandas", "matplotlib", "numpy"];

const BANNED_NAMES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "importlib",
    "builtins",
    "ctypes",
    "open",
    "eval",
    "exec",
    "compile",
    "__import__",
    "__builtins__",
    "__subclasses__",
    "__globals__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "input",
    "breakpoint",
];

/// Screen generated code before it reaches the interpreter.
///
/// Interactive `plt.show()` calls are dropped; anything importing outside
/// the plotting stack, touching process/file/network names, or rebinding the
/// two handles is rejected.
pub fn screen_code(code: &str) -> Result<String, WorkflowError> {
    let unfenced = strip_fence(code);
    let mut kept = Vec::new();

    for line in unfenced.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("plt.show(") {
            continue;
        }

        if let Some(module) = imported_module(trimmed) {
            let root = module.split('.').next().unwrap_or_default();
            if !ALLOWED_MODULES.contains(&root) {
                return Err(rejected(format!("import of '{}' is not allowed", module)));
            }
        }

        for handle in ["table_data", "img_buf"] {
            let rebinding = trimmed
                .strip_prefix(handle)
                .map(|rest| rest.trim_start())
                .is_some_and(|rest| rest.starts_with('=') && !rest.starts_with("=="));
            if rebinding {
                return Err(rejected(format!("code must not rebind {}", handle)));
            }
        }

        kept.push(line);
    }

    let screened = kept.join("\n");
    let blanked = blank_strings(&screened);
    let body: String = blanked
        .lines()
        .filter(|l| imported_module(l.trim()).is_none())
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(name) = identifiers(&body).find(|id| BANNED_NAMES.contains(id)) {
        return Err(rejected(format!("use of '{}' is not allowed", name)));
    }
    if !identifiers(&body).any(|id| id == "img_buf") {
        return Err(rejected("code never writes to img_buf".to_string()));
    }

    Ok(screened)
}

fn rejected(message: String) -> WorkflowError {
    WorkflowError::SandboxExecution(format!("rejected chart code: {}", message))
}

fn strip_fence(code: &str) -> &str {
    let trimmed = code.trim();
    trimmed
        .strip_prefix("```python")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
}

/// Every module named by an `import` or `from ... import` line.
fn imported_module(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("from ") {
        return rest.split_whitespace().next().map(str::to_string);
    }
    let rest = line.strip_prefix("import ")?;

    // `import a as b, c` is screened by its first disallowed entry.
    let modules: Vec<&str> = rest
        .split(',')
        .filter_map(|part| part.split_whitespace().next())
        .collect();
    modules
        .iter()
        .find(|m| {
            let root = m.split('.').next().unwrap_or_default();
            !ALLOWED_MODULES.contains(&root)
        })
        .or_else(|| modules.first())
        .map(|m| m.to_string())
}

/// Replace string literal contents and comments with spaces so name checks
/// only see code. f-string contents are kept: their braces hold expressions.
fn blank_strings(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }
        if c != '\'' && c != '"' {
            out.push(c);
            i += 1;
            continue;
        }

        let formatted = is_format_prefix(&chars[..i]);
        let triple = chars[i..].starts_with(&[c, c, c]);
        let quote_len = if triple { 3 } else { 1 };
        out.extend(std::iter::repeat(c).take(quote_len));
        i += quote_len;

        while i < chars.len() {
            let inner = chars[i];
            if triple && chars[i..].starts_with(&[c, c, c]) {
                out.extend(std::iter::repeat(c).take(3));
                i += 3;
                break;
            }
            if !triple && (inner == c || inner == '\n') {
                out.push(inner);
                i += 1;
                break;
            }

            let width = if inner == '\\' && i + 1 < chars.len() { 2 } else { 1 };
            for &kept in &chars[i..i + width] {
                out.push(if formatted || kept == '\n' { kept } else { ' ' });
            }
            i += width;
        }
    }

    out
}

/// Whether the letters right before a quote form an f-string prefix.
fn is_format_prefix(before: &[char]) -> bool {
    let prefix: Vec<char> = before
        .iter()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .copied()
        .collect();
    prefix.len() <= 2
        && prefix.iter().all(|c| "rRbBfFuU".contains(*c))
        && prefix.iter().any(|c| matches!(c, 'f' | 'F'))
}

fn identifiers(code: &str) -> impl Iterator<Item = &str> {
    code.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
}

/// Interpreter-subprocess renderer.
pub struct PythonSandbox {
    interpreter: String,
    timeout: Duration,
    memory_limit_bytes: u64,
}

impl PythonSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            memory_limit_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
        }
    }

    async fn execute(&self, code: &str, table: &[Row]) -> Result<Vec<u8>, WorkflowError> {
        let scratch = tempfile::TempDir::new().map_err(|e| {
            WorkflowError::SandboxExecution(format!("failed to create scratch directory: {}", e))
        })?;

        let mut command = tokio::process::Command::new(&self.interpreter);
        command
            .arg("-I")
            .arg("-c")
            .arg(HARNESS)
            .arg(self.memory_limit_bytes.to_string())
            .env_clear()
            .env("MPLBACKEND", "Agg")
            .env("HOME", scratch.path())
            .env("MPLCONFIGDIR", scratch.path())
            .env("OPENBLAS_NUM_THREADS", "1")
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn().map_err(|e| {
            WorkflowError::SandboxExecution(format!(
                "failed to start {}: {}",
                self.interpreter, e
            ))
        })?;

        let request = json!({"code": code, "table_data": table}).to_string();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.as_bytes()).await.map_err(|e| {
                WorkflowError::SandboxExecution(format!("failed to send chart code: {}", e))
            })?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                WorkflowError::SandboxExecution(format!(
                    "chart code timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| WorkflowError::SandboxExecution(format!("interpreter failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.trim().lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(WorkflowError::SandboxExecution(format!(
                "chart code exited with {}: {}",
                output.status,
                tail.join(" | ")
            )));
        }

        if output.stdout.is_empty() {
            return Err(WorkflowError::SandboxExecution(
                "chart code produced no image".to_string(),
            ));
        }
        if !output.stdout.starts_with(PNG_SIGNATURE) {
            return Err(WorkflowError::SandboxExecution(
                "chart output is not a PNG image".to_string(),
            ));
        }

        debug!("Sandbox rendered {} bytes", output.stdout.len());
        Ok(output.stdout)
    }
}

#[async_trait]
impl ChartRenderer for PythonSandbox {
    async fn render(&self, code: &str, table: &[Row]) -> Result<Vec<u8>, WorkflowError> {
        let screened = screen_code(code).inspect_err(|e| warn!("{}", e))?;
        self.execute(&screened, table).await
    }
}

/// Runs inside the interpreter. argv[1] is the address-space ceiling.
const HARNESS: &str = r#"
import sys, io, os, json, site, sysconfig, resource, contextlib, traceback

sys.dont_write_bytecode = True
limit = int(sys.argv[1])
if limit > 0:
    resource.setrlimit(resource.RLIMIT_AS, (limit, limit))

request = json.loads(sys.stdin.read())

import numpy as np
import pandas as pd
import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt
from matplotlib import font_manager

warmup = pd.DataFrame({"x": ["a", "b"], "y": [1, 2]})
warmup.plot(kind="bar", x="x", y="y", title="warmup")
plt.savefig(io.BytesIO(), format="png")
plt.close("all")

ALLOWED = ("pandas", "matplotlib", "numpy")
real_import = __import__

def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.split(".")[0] not in ALLOWED:
        raise ImportError("import of %r is not allowed" % name)
    return real_import(name, globals, locals, fromlist, level)

roots = {sysconfig.get_paths()[key] for key in ("stdlib", "platstdlib", "purelib", "platlib")}
roots.update(getattr(site, "getsitepackages", lambda: [])())
roots.update(os.path.dirname(module.__file__) for module in (np, pd, matplotlib))
roots.update(os.path.dirname(font.fname) for font in font_manager.fontManager.ttflist)
roots.add(matplotlib.get_data_path())
roots.add(os.getcwd())
READABLE = tuple(os.path.join(os.path.realpath(root), "") for root in roots if root)

DENIED_PREFIXES = ("socket.", "subprocess.", "os.system", "os.exec", "os.fork",
                   "os.spawn", "os.posix_spawn", "os.kill", "os.remove", "os.rename",
                   "os.rmdir", "os.mkdir", "os.chdir", "os.chmod", "os.chown", "os.link",
                   "os.symlink", "os.truncate", "os.putenv", "os.unsetenv", "glob.",
                   "shutil.", "ctypes.", "urllib.", "http.", "ftplib.", "smtplib.",
                   "webbrowser.")
WRITE_FLAGS = os.O_WRONLY | os.O_RDWR | os.O_APPEND | os.O_CREAT | os.O_TRUNC

def readable(path):
    if path is None:
        path = "."
    if isinstance(path, int):
        return True
    real = os.path.join(os.path.realpath(os.fsdecode(path)), "")
    return real.startswith(READABLE)

def audit(event, args):
    if event.startswith(DENIED_PREFIXES):
        raise PermissionError("sandbox denied " + event)
    if event == "open":
        path, mode, flags = (tuple(args) + (None, None, None))[:3]
        if isinstance(mode, str) and any(c in mode for c in "wax+"):
            raise PermissionError("sandbox denied writing " + str(path))
        if isinstance(flags, int) and flags & WRITE_FLAGS:
            raise PermissionError("sandbox denied writing " + str(path))
        if not readable(path):
            raise PermissionError("sandbox denied reading " + str(path))
    if event in ("os.listdir", "os.scandir"):
        target = args[0] if args else None
        if not readable(target):
            raise PermissionError("sandbox denied listing " + str(target))

SAFE = ("abs", "all", "any", "bool", "dict", "enumerate", "filter", "float", "format",
        "int", "isinstance", "len", "list", "map", "max", "min", "range", "reversed",
        "round", "set", "slice", "sorted", "str", "sum", "tuple", "zip", "print",
        "ValueError", "KeyError", "TypeError", "Exception")
import builtins
safe_builtins = {name: getattr(builtins, name) for name in SAFE}
safe_builtins["__import__"] = guarded_import

img_buf = io.BytesIO()
scope = {
    "__builtins__": safe_builtins,
    "table_data": request["table_data"],
    "img_buf": img_buf,
    "pd": pd,
    "plt": plt,
    "np": np,
}

sys.addaudithook(audit)

try:
    with contextlib.redirect_stdout(sys.stderr):
        exec(request["code"], scope)
except BaseException:
    traceback.print_exc()
    sys.exit(1)

sys.stdout.buffer.write(img_buf.getvalue())
sys.stdout.flush()
"#;
