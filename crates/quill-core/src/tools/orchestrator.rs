use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Arguments, ToolRegistry};
use crate::error::ToolError;
use crate::types::{ToolInvocation, ToolResult};

/// Error text of a tool result whose execution was cancelled.
pub const CANCELLED: &str = "cancelled";

enum Outcome {
    Joined(Result<Result<Value, ToolError>, JoinError>),
    TimedOut(Duration),
    Cancelled,
}

/// Executes one round of detected tool calls against a [`ToolRegistry`].
#[derive(Debug, Clone)]
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    timeout: Option<Duration>,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Whether every invocation names a registered tool.  A round only runs
    /// when this holds; otherwise the caller executes the tools itself.
    pub fn all_registered(&self, invocations: &[ToolInvocation]) -> bool {
        invocations
            .iter()
            .all(|invocation| self.registry.is_registered(invocation.name()))
    }

    /// Execute every invocation concurrently, each on its own task.
    ///
    /// Results come back in invocation order.  Failures, panics and timeouts
    /// are isolated to their own result; cancellation aborts the tasks still
    /// running and marks them [`CANCELLED`].
    pub async fn run_round(
        &self,
        invocations: &[ToolInvocation],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let executions = invocations
            .iter()
            .map(|invocation| self.execute(invocation.clone(), cancel.clone()));
        let results = join_all(executions).await;
        debug!(
            count = results.len(),
            failed = results.iter().filter(|r| r.is_error()).count(),
            "tool round finished"
        );
        results
    }

    async fn execute(&self, invocation: ToolInvocation, cancel: CancellationToken) -> ToolResult {
        let name = invocation.name().to_owned();
        let id = invocation.id.clone();

        let Some(handler) = self.registry.handler(&name) else {
            warn!(tool = %name, "tool not registered");
            return ToolResult::err(id, format!("Tool '{name}' not registered."));
        };
        let arguments = match parse_arguments(invocation.arguments()) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %name, error = %e, "invalid tool arguments");
                return ToolResult::err(id, format!("Invalid arguments for tool '{name}': {e}"));
            }
        };

        debug!(tool = %name, id = %id, "executing tool");
        let mut task = tokio::spawn(async move { handler.call(arguments).await });
        let timeout = self.timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            outcome = async {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                        Ok(joined) => Outcome::Joined(joined),
                        Err(_) => Outcome::TimedOut(limit),
                    },
                    None => Outcome::Joined((&mut task).await),
                }
            } => outcome,
        };

        match outcome {
            Outcome::Joined(Ok(Ok(value))) => ToolResult::ok(id, value),
            Outcome::Joined(Ok(Err(e))) => {
                warn!(tool = %name, error = %e, "tool failed");
                ToolResult::err(id, format!("Error executing tool '{name}': {e}"))
            }
            Outcome::Joined(Err(e)) => {
                warn!(tool = %name, error = %e, "tool task aborted");
                let reason = if e.is_panic() { "handler panicked" } else { "task aborted" };
                ToolResult::err(id, format!("Error executing tool '{name}': {reason}"))
            }
            Outcome::TimedOut(limit) => {
                task.abort();
                warn!(tool = %name, ?limit, "tool timed out");
                ToolResult::err(
                    id,
                    format!("Error executing tool '{name}': timed out after {}s", limit.as_secs_f32()),
                )
            }
            Outcome::Cancelled => {
                task.abort();
                debug!(tool = %name, "tool cancelled");
                ToolResult::err(id, CANCELLED)
            }
        }
    }
}

/// Absent arguments mean an empty mapping; anything else must be a JSON
/// object.
fn parse_arguments(raw: Option<&str>) -> Result<Arguments, serde_json::Error> {
    match raw {
        None => Ok(Arguments::new()),
        Some(text) => serde_json::from_str(text),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::tool_fn;
    use crate::types::ToolDeclaration;

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry.register(
            ToolDeclaration::new("add"),
            tool_fn(|args| async move {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            }),
        );
        registry.register(
            ToolDeclaration::new("slow"),
            tool_fn(|_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("late"))
            }),
        );
        registry.register(
            ToolDeclaration::new("fail"),
            tool_fn(|_| async move { Err(ToolError::failed("disk full")) }),
        );
        registry.register(
            ToolDeclaration::new("panic"),
            tool_fn(|_| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }),
        );
        Arc::new(registry)
    }

    fn call(id: &str, name: &str, args: Option<&str>) -> ToolInvocation {
        ToolInvocation::new(id, name, args.map(str::to_owned))
    }

    #[tokio::test]
    async fn results_keep_invocation_order_and_isolate_failures() {
        let orchestrator = ToolOrchestrator::new(registry(), None);
        let results = orchestrator
            .run_round(
                &[
                    call("1", "fail", None),
                    call("2", "add", Some(r#"{"a": 2, "b": 3}"#)),
                    call("3", "missing", None),
                    call("4", "add", Some("not json")),
                    call("5", "panic", None),
                    call("6", "add", None),
                ],
                &CancellationToken::new(),
            )
            .await;

        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4", "5", "6"]);
        assert_eq!(
            results[0].error.as_deref(),
            Some("Error executing tool 'fail': disk full")
        );
        assert_eq!(results[1].result, Some(json!(5)));
        assert_eq!(results[2].error.as_deref(), Some("Tool 'missing' not registered."));
        assert!(
            results[3]
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("Invalid arguments for tool 'add':"))
        );
        assert_eq!(
            results[4].error.as_deref(),
            Some("Error executing tool 'panic': handler panicked")
        );
        assert_eq!(results[5].result, Some(json!(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_only_affects_the_slow_tool() {
        let orchestrator = ToolOrchestrator::new(registry(), Some(Duration::from_secs(5)));
        let results = orchestrator
            .run_round(
                &[call("a", "slow", None), call("b", "add", Some(r#"{"a":1}"#))],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            results[0].error.as_deref(),
            Some("Error executing tool 'slow': timed out after 5s")
        );
        assert_eq!(results[1].result, Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_running_tools() {
        let orchestrator = ToolOrchestrator::new(registry(), None);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let results = orchestrator
            .run_round(&[call("a", "slow", None)], &cancel)
            .await;
        assert_eq!(results[0].error.as_deref(), Some(CANCELLED));
    }

    #[test]
    fn all_registered_requires_every_name() {
        let orchestrator = ToolOrchestrator::new(registry(), None);
        assert!(orchestrator.all_registered(&[call("1", "add", None), call("2", "fail", None)]));
        assert!(!orchestrator.all_registered(&[call("1", "add", None), call("2", "nope", None)]));
        assert!(orchestrator.all_registered(&[]));
    }
}
