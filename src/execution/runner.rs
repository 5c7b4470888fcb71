//! Tool runners.
//!
//! Every execution method sits behind `ToolRunner`. Runners must stop
//! promptly once their cancellation token fires; the proxy aborts them
//! after a short grace period otherwise.

use crate::assets::Asset;
use crate::catalog::model::{ExecutionMethod, Tool};
use crate::secrets::ResolvedCredential;
use crate::types::{Error, Result, TraceId};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a runner needs for one call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: Arc<Tool>,
    pub pattern: String,
    pub params: Map<String, Value>,
    pub asset: Option<Asset>,
    pub credential: Option<ResolvedCredential>,
    pub trace_id: TraceId,
}

impl Invocation {
    pub fn host(&self) -> Option<&str> {
        self.asset
            .as_ref()
            .map(|a| a.host.as_str())
            .or_else(|| self.params.get("host").and_then(Value::as_str))
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Result<Value>;
}

pub type SharedRunner = Arc<dyn ToolRunner>;

/// Runners keyed by execution method.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<ExecutionMethod, SharedRunner>,
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("methods", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, method: ExecutionMethod, runner: SharedRunner) -> Self {
        self.runners.insert(method, runner);
        self
    }

    pub fn get(&self, method: ExecutionMethod) -> Result<SharedRunner> {
        self.runners
            .get(&method)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no runner for {} tools", method.as_str())))
    }
}

// =============================================================================
// Builtin
// =============================================================================

/// In-process handlers selected by the tool's entrypoint.
#[derive(Debug, Clone, Default)]
pub struct BuiltinRunner;

#[async_trait]
impl ToolRunner for BuiltinRunner {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Result<Value> {
        match invocation.tool.entrypoint.as_str() {
            "echo" => Ok(echo(&invocation.params)),
            "connection_check" => connection_check(invocation),
            "sleep" => {
                let ms = invocation
                    .params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(1000);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
                    _ = cancel.cancelled() => Err(Error::cancelled("sleep interrupted")),
                }
            }
            other => Err(Error::internal(format!("unknown builtin handler '{}'", other))),
        }
    }
}

fn echo(params: &Map<String, Value>) -> Value {
    match params.get("input") {
        Some(Value::String(s)) if s == "ping" => Value::String("pong".to_string()),
        Some(value) => value.clone(),
        None => Value::Object(params.clone()),
    }
}

/// Reports what connection would be used; never echoes the secret.
fn connection_check(invocation: &Invocation) -> Result<Value> {
    let asset = invocation
        .asset
        .as_ref()
        .ok_or_else(|| Error::validation("connection_check needs a resolved host"))?;
    Ok(json!({
        "host": asset.host,
        "platform": asset.platform,
        "protocol": invocation
            .credential
            .as_ref()
            .map(|c| c.protocol.clone())
            .unwrap_or_else(|| asset.connection.protocol.clone()),
        "port": asset.connection.port,
        "username": invocation.credential.as_ref().map(|c| c.username.clone()),
        "authenticated": invocation.credential.is_some(),
    }))
}

// =============================================================================
// Command
// =============================================================================

/// Local process. Argument templates substitute `{param}`; credentials go
/// through the environment, never the argument list.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn render_args(templates: &[String], params: &Map<String, Value>) -> Vec<String> {
        let mut args = Vec::with_capacity(templates.len());
        for template in templates {
            if let Some(name) = template.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                if !name.contains('{') {
                    // A missing optional parameter drops the whole argument.
                    if let Some(value) = params.get(name) {
                        args.push(param_text(value));
                    }
                    continue;
                }
            }
            let mut rendered = template.clone();
            for (name, value) in params {
                rendered = rendered.replace(&format!("{{{}}}", name), &param_text(value));
            }
            args.push(rendered);
        }
        args
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ToolRunner for CommandRunner {
    async fn run(&self, invocation: &Invocation, cancel: CancellationToken) -> Result<Value> {
        let tool = &invocation.tool;
        let mut command = tokio::process::Command::new(&tool.entrypoint);
        command
            .args(Self::render_args(&tool.args, &invocation.params))
            .env("TOOLHUB_TRACE_ID", invocation.trace_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(host) = invocation.host() {
            command.env("TOOLHUB_HOST", host);
        }
        if let Some(cred) = &invocation.credential {
            command
                .env("TOOLHUB_USERNAME", &cred.username)
                .env("TOOLHUB_SECRET", &cred.secret)
                .env("TOOLHUB_PROTOCOL", &cred.protocol);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::internal(format!("failed to start {}: {}", tool.entrypoint, e)))?;

        // Dropping the child on cancellation kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("{} killed", tool.name))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::upstream(format!(
                "{} exited with {}: {}",
                tool.name, output.status, stderr
            )));
        }
        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}
