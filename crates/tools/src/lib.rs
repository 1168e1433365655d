//! The tool capability seam.
//!
//! Concrete tools (chat, analyze, debug, …) live outside this system.  The
//! daemon dispatches through [`ToolRegistry::get`] to an opaque [`Tool`]
//! implementation; workflow behavior is composition over a step state
//! machine inside the tool, not a subclass hierarchy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use exai_domain::error::{Error, Result};
use exai_domain::timeouts::TimeoutSet;
use exai_providers::ProviderKind;
use exai_telemetry::ProgressHeartbeat;

/// Tool arguments: a JSON object validated at the registry boundary.
pub type ToolArgs = serde_json::Map<String, Value>;

/// How a tool executes, and therefore which budgets govern it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Single-shot call.
    Simple,
    /// Multi-step state machine emitting progress; handles its own retries.
    Workflow,
    /// Secondary LLM review of intermediate findings; deduplicated.
    Expert,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Workflow => "workflow",
            Self::Expert => "expert",
        }
    }
}

/// Static description of a tool: inventory entry plus execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    pub kind: ToolKind,
    /// The backend this tool calls into, if any.
    pub provider: Option<ProviderKind>,
}

impl ToolDescriptor {
    /// The governing deadline for one invocation.
    pub fn timeout(&self, timeouts: &TimeoutSet) -> Duration {
        match self.kind {
            ToolKind::Simple => timeouts.simple_tool,
            ToolKind::Workflow | ToolKind::Expert => timeouts.workflow_tool,
        }
    }

    /// Provider-backed calls are retried.  Workflow tools handle retries in
    /// their own step logic; expert calls are deduplicated, so re-running an
    /// identical key would only replay the cached result.
    pub fn max_retries(&self) -> u32 {
        match self.kind {
            ToolKind::Workflow | ToolKind::Expert => 0,
            _ if self.provider.is_some() => 2,
            _ => 0,
        }
    }
}

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub request_id: String,
    pub session_id: String,
    /// Cancelled when the governing deadline fires or the daemon drains.
    pub cancel: CancellationToken,
    /// The deadline the invocation runs under (informational; enforcement
    /// happens in the degrader).
    pub deadline: Duration,
}

/// The single tool capability interface.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn describe(&self) -> ToolDescriptor;

    async fn invoke(
        &self,
        ctx: ToolContext,
        args: ToolArgs,
        progress: Arc<ProgressHeartbeat>,
    ) -> Result<Value>;
}

/// Tool inventory, built once at daemon startup and immutable after.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.describe().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, replacing");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors for `list_tools`, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut items: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.describe()).collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check `args` against the descriptor's JSON schema: every `required`
    /// property must be present, and typed properties must match.  Runs
    /// before invocation; violations never reach the tool.
    pub fn validate_args(descriptor: &ToolDescriptor, args: &ToolArgs) -> Result<()> {
        let schema = &descriptor.input_schema;

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(name) {
                    return Err(Error::Tool(format!(
                        "{}: missing required argument {name:?}",
                        descriptor.name
                    )));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, value) in args {
                let Some(expected) = properties
                    .get(name)
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(Error::Tool(format!(
                        "{}: argument {name:?} must be of type {expected}",
                        descriptor.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn describe(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".into(),
                description: "Echo arguments back".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "repeat": { "type": "integer" }
                    },
                    "required": ["text"]
                }),
                kind: ToolKind::Simple,
                provider: None,
            }
        }

        async fn invoke(
            &self,
            _ctx: ToolContext,
            args: ToolArgs,
            _progress: Arc<ProgressHeartbeat>,
        ) -> Result<Value> {
            Ok(json!({ "echoed": Value::Object(args) }))
        }
    }

    fn descriptor() -> ToolDescriptor {
        EchoTool.describe()
    }

    fn args(v: Value) -> ToolArgs {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn registry_lists_sorted_descriptors() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());

        let listed = reg.list();
        assert_eq!(listed[0].name, "echo");
    }

    #[test]
    fn required_arguments_enforced() {
        let err = ToolRegistry::validate_args(&descriptor(), &args(json!({}))).unwrap_err();
        assert!(matches!(err, Error::Tool(msg) if msg.contains("text")));

        ToolRegistry::validate_args(&descriptor(), &args(json!({"text": "hi"}))).unwrap();
    }

    #[test]
    fn typed_arguments_enforced() {
        let err = ToolRegistry::validate_args(
            &descriptor(),
            &args(json!({"text": "hi", "repeat": "three"})),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Tool(msg) if msg.contains("repeat")));

        ToolRegistry::validate_args(
            &descriptor(),
            &args(json!({"text": "hi", "repeat": 3})),
        )
        .unwrap();
    }

    #[test]
    fn undeclared_arguments_pass_through() {
        // Extra args are the tool's business; only declared types are checked.
        ToolRegistry::validate_args(
            &descriptor(),
            &args(json!({"text": "hi", "extra": [1, 2]})),
        )
        .unwrap();
    }

    #[test]
    fn timeouts_and_retries_follow_kind_and_provider() {
        let timeouts = TimeoutSet::default();

        let simple = descriptor();
        assert_eq!(simple.timeout(&timeouts), Duration::from_secs(60));
        assert_eq!(simple.max_retries(), 0);

        let provider_backed = ToolDescriptor {
            provider: Some(ProviderKind::Glm),
            ..descriptor()
        };
        assert_eq!(provider_backed.max_retries(), 2);

        let workflow = ToolDescriptor {
            kind: ToolKind::Workflow,
            provider: Some(ProviderKind::Kimi),
            ..descriptor()
        };
        assert_eq!(workflow.timeout(&timeouts), Duration::from_secs(120));
        assert_eq!(workflow.max_retries(), 0);

        let expert = ToolDescriptor {
            kind: ToolKind::Expert,
            provider: Some(ProviderKind::Glm),
            ..descriptor()
        };
        assert_eq!(expert.max_retries(), 0);
    }
}
