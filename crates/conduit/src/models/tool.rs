use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

/// A tool that can be used by a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of the parameters the tool accepts
    pub parameters: Value,
}

impl Tool {
    /// Create a new tool with the given name and description
    pub fn new<N, D>(name: N, description: D, parameters: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Read a JSON-Schema function-calling definition:
    /// `{"type": "function", "function": {"name", "description", "parameters"}}`.
    ///
    /// The bare inner `{"name", ...}` object is accepted as well.
    pub fn from_function_spec(spec: &Value) -> Option<Self> {
        let function = spec.get("function").unwrap_or(spec);
        let name = function.get("name")?.as_str()?;
        let description = function
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default();
        let parameters = function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
        Some(Tool::new(name, description, parameters))
    }

    /// Write the tool back into the common function-calling shape.
    pub fn to_function_spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Drop tools whose name was already seen, keeping the first definition.
pub fn dedup_tools(tools: &[Tool]) -> Vec<&Tool> {
    let mut seen = HashSet::new();
    tools
        .iter()
        .filter(|tool| {
            let fresh = seen.insert(tool.name.as_str());
            if !fresh {
                tracing::warn!(tool = %tool.name, "dropping duplicate tool definition");
            }
            fresh
        })
        .collect()
}

/// A tool call requested by the model, with its arguments already parsed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// The name of the tool to execute
    pub name: String,
    /// The arguments for the execution
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<S: Into<String>>(name: S, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}
