//! Tool trait and registry.
//!
//! Tools export an OpenAI-style function descriptor and receive parsed
//! JSON arguments. The registry's `execute` never raises toward the
//! model: unknown tools, invalid arguments, and tool failures all come
//! back as `Error: ...` strings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The arguments provided to the tool are invalid.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The tool execution failed at runtime.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A file or resource the tool needs was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A filesystem path traverses outside allowed boundaries.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The tool exceeded its time limit.
    #[error("timeout after {0}s")]
    Timeout(u64),
}

/// A tool the agent can invoke.
///
/// # Implementing a tool
///
/// ```rust,ignore
/// struct EchoTool;
///
/// #[async_trait]
/// impl Tool for EchoTool {
///     fn name(&self) -> &str { "echo" }
///     fn description(&self) -> &str { "Echo back the input" }
///     fn parameters(&self) -> serde_json::Value {
///         serde_json::json!({
///             "type": "object",
///             "properties": {"text": {"type": "string"}},
///             "required": ["text"]
///         })
///     }
///     async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
///         Ok(args["text"].as_str().unwrap_or_default().to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in LLM function calling.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Execute with parsed arguments, returning the result string the
    /// model sees.
    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError>;
}

/// Registry of available tools, indexed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a same-named tool is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "registering tool");
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    /// Remove a tool by name.
    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
        self.order.retain(|n| n != name);
        debug!(tool = name, "unregistered tool");
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Tool descriptors in OpenAI function-calling shape.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Execute a tool by name.
    ///
    /// Always returns a string for the model: results on success,
    /// `Error: ...` on any failure.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> String {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return format!("Error: Tool '{name}' not found");
        };

        let errors = validate_args(&tool.parameters(), &args);
        if !errors.is_empty() {
            warn!(tool = name, errors = %errors.join("; "), "tool argument validation failed");
            return format!(
                "Error: Invalid parameters for tool '{name}': {}",
                errors.join("; ")
            );
        }

        match tool.execute(args).await {
            Ok(result) => {
                debug!(tool = name, result_chars = result.len(), "tool completed");
                result
            }
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                format!("Error executing {name}: {e}")
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Validate arguments against a JSON schema: required fields present,
/// primitive types match. Deliberately shallow; the tool itself owns
/// deeper validation.
fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(args_obj) = args.as_object() else {
        return vec!["arguments must be a JSON object".into()];
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required {
            if let Some(field) = field.as_str() {
                if !args_obj.contains_key(field) {
                    errors.push(format!("missing required parameter '{field}'"));
                }
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, value) in args_obj {
            let Some(prop) = properties.get(key) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                errors.push(format!("parameter '{key}' should be of type {expected}"));
            }
        }
    }

    errors
}
