//! Execution proxy.
//!
//! One call runs the enrichment pipeline, short-circuiting on the first
//! failure:
//!
//! 1. look up the tool and validate parameters,
//! 2. resolve the target host through the asset directory,
//! 3. fetch credentials from the secrets broker when the tool needs auth,
//! 4. dispatch to the runner under the pattern's deadline,
//! 5. record metrics tagged by tool and outcome.
//!
//! Failures are always reported in-band. Only the enrichment sub-calls retry;
//! the dispatched action never does.

use crate::assets::{Asset, AssetResolver};
use crate::catalog::model::{fill_defaults, validate_params, Tool};
use crate::catalog::registry::CatalogRegistry;
use crate::execution::runner::{Invocation, RunnerRegistry};
use crate::metrics::{Outcome, ServiceMetrics, UNKNOWN_TOOL};
use crate::secrets::{CredentialSource, ResolvedCredential};
use crate::types::{Error, ExecutionConfig, Result, TraceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long a cancelled runner gets to wind down before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Credentials supplied by the caller; used verbatim.
#[derive(Clone, Deserialize)]
pub struct SuppliedCredentials {
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl std::fmt::Debug for SuppliedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuppliedCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// `POST /ai/tools/execute` body. Unknown top-level fields are treated as
/// parameters; explicit `params` win on conflict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Already-resolved asset; skips the directory lookup.
    #[serde(default)]
    pub asset: Option<Asset>,
    #[serde(default)]
    pub credentials: Option<SuppliedCredentials>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecuteRequest {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params: match params {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ..Self::default()
        }
    }

    fn merged_params(&mut self) -> Map<String, Value> {
        let mut params = std::mem::take(&mut self.extra);
        params.extend(std::mem::take(&mut self.params));
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResponse {
    pub success: bool,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error code from the taxonomy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
    pub trace_id: String,
}

impl ExecutionResponse {
    /// In-band failure body.
    pub fn failure(tool: String, err: &Error, elapsed: Duration, trace_id: &TraceId) -> Self {
        Self {
            success: false,
            tool,
            output: None,
            error: Some(err.code().to_string()),
            message: Some(err.to_string()),
            duration_ms: elapsed.as_millis() as u64,
            trace_id: trace_id.to_string(),
        }
    }
}

/// Records exactly one outcome per execution; a drop without `finish`
/// means the caller went away.
struct Recorder {
    metrics: ServiceMetrics,
    tool: String,
    started: Instant,
    done: bool,
}

impl Recorder {
    fn start(metrics: ServiceMetrics, tool: &str) -> Self {
        metrics.executions_in_flight.inc();
        Self {
            metrics,
            tool: tool.to_string(),
            started: Instant::now(),
            done: false,
        }
    }

    fn finish(&mut self, outcome: Outcome, error: Option<&str>) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.done {
            self.done = true;
            self.metrics.executions_in_flight.dec();
            self.metrics.observe_request(&self.tool, outcome, elapsed);
            if let Some(code) = error {
                self.metrics.observe_error(&self.tool, code);
            }
        }
        elapsed
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(tool = %self.tool, "execution abandoned by caller");
            self.finish(Outcome::Cancelled, Some("cancelled"));
        }
    }
}

/// Aborts the runner task if the proxy future is dropped mid-flight.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ExecutionProxy {
    registry: Arc<CatalogRegistry>,
    assets: AssetResolver,
    credentials: Arc<dyn CredentialSource>,
    runners: RunnerRegistry,
    metrics: ServiceMetrics,
    config: ExecutionConfig,
}

impl std::fmt::Debug for ExecutionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionProxy")
            .field("runners", &self.runners)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionProxy {
    pub fn new(
        registry: Arc<CatalogRegistry>,
        assets: AssetResolver,
        credentials: Arc<dyn CredentialSource>,
        runners: RunnerRegistry,
        metrics: ServiceMetrics,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            assets,
            credentials,
            runners,
            metrics,
            config,
        }
    }

    /// Run one tool call. Never fails at the transport level.
    pub async fn execute(&self, request: ExecuteRequest, trace_id: TraceId) -> ExecutionResponse {
        let tool_name = request.name.clone();
        let span = tracing::info_span!("execute", tool = %tool_name, trace_id = %trace_id);
        let label = if self.registry.snapshot().latest_tool(&tool_name).is_some() {
            tool_name.as_str()
        } else {
            UNKNOWN_TOOL
        };
        let mut recorder = Recorder::start(self.metrics.clone(), label);

        let result = self
            .run_pipeline(request, trace_id.clone())
            .instrument(span)
            .await;

        match result {
            Ok(output) => {
                let elapsed = recorder.finish(Outcome::Success, None);
                tracing::info!(
                    tool = %tool_name,
                    trace_id = %trace_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "execution succeeded"
                );
                ExecutionResponse {
                    success: true,
                    tool: tool_name,
                    output: Some(output),
                    error: None,
                    message: None,
                    duration_ms: elapsed.as_millis() as u64,
                    trace_id: trace_id.to_string(),
                }
            }
            Err(err) => {
                let code = err.code();
                let elapsed = recorder.finish(Outcome::from_error(&err), Some(code));
                tracing::warn!(
                    tool = %tool_name,
                    trace_id = %trace_id,
                    error = code,
                    detail = %err,
                    duration_ms = elapsed.as_millis() as u64,
                    "execution failed"
                );
                ExecutionResponse::failure(tool_name, &err, elapsed, &trace_id)
            }
        }
    }

    async fn run_pipeline(&self, mut request: ExecuteRequest, trace_id: TraceId) -> Result<Value> {
        // 1. Tool and parameters.
        let snapshot = self.registry.snapshot();
        let tool = snapshot
            .latest_tool(&request.name)
            .cloned()
            .ok_or_else(|| Error::tool_not_found(request.name.clone()))?;
        drop(snapshot);

        let (pattern_name, deadline, params) = self.prepare_params(&tool, &mut request)?;

        // 2. Asset.
        let host = params
            .get("host")
            .and_then(Value::as_str)
            .map(str::to_string);
        let asset = match (host.as_deref(), request.asset.take()) {
            (Some(h), Some(given)) if given.matches(h) => Some(given),
            (Some(h), _) => Some(self.assets.resolve(h).await?),
            (None, given) => given,
        };

        // 3. Credentials.
        let credential = if !tool.metadata.requires_auth {
            None
        } else if let Some(given) = request.credentials.take() {
            Some(ResolvedCredential {
                protocol: given
                    .protocol
                    .or_else(|| asset.as_ref().map(|a| a.connection.protocol.clone()))
                    .unwrap_or_default(),
                username: given.username,
                secret: given.secret,
            })
        } else {
            let asset = asset.as_ref().ok_or_else(|| {
                Error::validation(format!("{} requires a target host", tool.name))
            })?;
            let purpose = tool
                .metadata
                .credential_purpose
                .clone()
                .unwrap_or_else(|| asset.connection.protocol.clone());
            Some(self.lookup_credential(&asset.host, &purpose).await?)
        };

        // 4. Dispatch.
        let invocation = Invocation {
            tool: tool.clone(),
            pattern: pattern_name,
            params,
            asset,
            credential,
            trace_id,
        };
        self.dispatch(invocation, deadline).await
    }

    fn prepare_params(
        &self,
        tool: &Tool,
        request: &mut ExecuteRequest,
    ) -> Result<(String, Duration, Map<String, Value>)> {
        let (_, pattern) = tool.pattern(request.pattern.as_deref()).ok_or_else(|| {
            Error::validation(format!(
                "{} has no pattern {}",
                tool.name,
                request.pattern.as_deref().unwrap_or("")
            ))
        })?;

        let mut params = request.merged_params();
        fill_defaults(&pattern.required_inputs, &mut params);
        let violations = validate_params(&pattern.required_inputs, &params, pattern.allow_extra_inputs);
        if !violations.is_empty() {
            return Err(Error::validation(violations.join("; ")));
        }

        let deadline = pattern
            .policy
            .max_execution_time
            .unwrap_or(self.config.default_max_execution_time);
        Ok((pattern.name.clone(), deadline, params))
    }

    async fn lookup_credential(&self, host: &str, purpose: &str) -> Result<ResolvedCredential> {
        // Asset then credential read, each retried under the sub-call policy.
        let timeout = self
            .config
            .retry
            .budget(self.config.subcall_timeout)
            .saturating_mul(2);
        tokio::time::timeout(timeout, self.credentials.lookup(host, purpose))
            .await
            .map_err(|_| {
                Error::timeout(format!("credential lookup exceeded {}ms", timeout.as_millis()))
            })?
    }

    async fn dispatch(&self, invocation: Invocation, deadline: Duration) -> Result<Value> {
        let runner = self.runners.get(invocation.tool.execution_method)?;
        let tool = invocation.tool.name.clone();

        let cancel = CancellationToken::new();
        // Cancels the runner if this future is dropped.
        let _cancel_on_drop = cancel.clone().drop_guard();
        let runner_token = cancel.child_token();
        let mut handle =
            tokio::spawn(async move { runner.run(&invocation, runner_token).await });
        let _abort_on_drop = AbortOnDrop(handle.abort_handle());

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::internal(format!("runner for {} failed: {}", tool, join))),
            Err(_) => {
                cancel.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                    tracing::warn!(tool = %tool, "runner ignored cancellation, aborted");
                }
                Err(Error::timeout(format!(
                    "{} exceeded max_execution_time of {}ms",
                    tool,
                    deadline.as_millis()
                )))
            }
        }
    }
}
