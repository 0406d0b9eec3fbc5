use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::accumulator::ReconstructedToolCall;
use crate::types::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallErrorCode {
    ToolNotFound,
    SchemaInvalid,
    /// The streamed argument fragments do not form JSON at all.
    ToolArgumentsMalformed,
    ToolArgumentsInvalid,
}

/// Rejection of a model-proposed tool call, raised on the consumer side
/// once the call has been reconstructed from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallError {
    pub code: ToolCallErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolCallError {
    fn new(code: ToolCallErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl Display for ToolCallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ToolCallError {}

/// Checks reconstructed calls against the tools offered in the request.
/// Schemas are compiled once, when the validator is built; a schema that
/// fails to compile only rejects calls to that tool.
pub struct ToolCallValidator {
    tool_names: Vec<String>,
    schemas: HashMap<String, Result<JSONSchema, String>>,
}

impl ToolCallValidator {
    pub fn new(tools: &[Tool]) -> Self {
        let schemas = tools
            .iter()
            .map(|tool| {
                let compiled =
                    JSONSchema::compile(&tool.parameters).map_err(|error| error.to_string());
                (tool.name.clone(), compiled)
            })
            .collect();
        Self {
            tool_names: tools.iter().map(|tool| tool.name.clone()).collect(),
            schemas,
        }
    }

    /// Returns the validated arguments of `call`.
    pub fn validate(&self, call: &ReconstructedToolCall) -> Result<Value, ToolCallError> {
        let Some(schema) = self.schemas.get(&call.name) else {
            return Err(ToolCallError::new(
                ToolCallErrorCode::ToolNotFound,
                format!("Tool '{}' not found", call.name),
            )
            .with_details(json!({
                "toolName": call.name,
                "availableTools": self.tool_names,
            })));
        };

        let schema = schema.as_ref().map_err(|error| {
            ToolCallError::new(
                ToolCallErrorCode::SchemaInvalid,
                format!("Invalid JSON schema for tool '{}': {error}", call.name),
            )
            .with_details(json!({ "toolName": call.name }))
        })?;

        let arguments = parse_raw_arguments(call)?;
        if let Err(errors) = schema.validate(&arguments) {
            let validation_errors = errors
                .map(|error| {
                    json!({
                        "path": error.instance_path.to_string(),
                        "message": error.to_string(),
                    })
                })
                .collect::<Vec<_>>();

            return Err(ToolCallError::new(
                ToolCallErrorCode::ToolArgumentsInvalid,
                format!("Arguments for tool '{}' do not match its schema", call.name),
            )
            .with_details(json!({
                "toolName": call.name,
                "toolCallId": call.id,
                "validationErrors": validation_errors,
            })));
        }

        Ok(arguments)
    }
}

/// One-off check of a single call; build a [`ToolCallValidator`] when
/// several calls are checked against the same tools.
pub fn validate_tool_call(
    tools: &[Tool],
    call: &ReconstructedToolCall,
) -> Result<Value, ToolCallError> {
    ToolCallValidator::new(tools).validate(call)
}

/// Parses from the raw fragments rather than trusting `arguments`, which is
/// `null` both for unparseable input and for a literal `null`.
fn parse_raw_arguments(call: &ReconstructedToolCall) -> Result<Value, ToolCallError> {
    if call.raw_arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&call.raw_arguments).map_err(|error| {
        ToolCallError::new(
            ToolCallErrorCode::ToolArgumentsMalformed,
            format!("Arguments for tool '{}' are not valid JSON: {error}", call.name),
        )
        .with_details(json!({
            "toolName": call.name,
            "toolCallId": call.id,
            "rawArguments": call.raw_arguments,
            "line": error.line(),
            "column": error.column(),
        }))
    })
}
