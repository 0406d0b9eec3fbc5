use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque vendor continuity blob (thought signatures, encrypted reasoning,
/// item ids). Echoed back verbatim, never interpreted.
pub type ProviderMetadata = Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub url: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(
            rename = "providerMetadata",
            skip_serializing_if = "Option::is_none",
            default
        )]
        provider_metadata: Option<ProviderMetadata>,
    },
    #[serde(rename = "image")]
    Image { image: ImageReference },
    #[serde(rename = "toolUse")]
    ToolUse {
        id: String,
        name: String,
        params: Value,
        #[serde(
            rename = "providerMetadata",
            skip_serializing_if = "Option::is_none",
            default
        )]
        provider_metadata: Option<ProviderMetadata>,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        output: String,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        signature: Option<String>,
        #[serde(
            rename = "providerMetadata",
            skip_serializing_if = "Option::is_none",
            default
        )]
        provider_metadata: Option<ProviderMetadata>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            provider_metadata: None,
        }
    }

    pub fn image(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::Image {
            image: ImageReference {
                url: url.into(),
                content_type: content_type.into(),
            },
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, params: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            params,
            provider_metadata: None,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            is_error: false,
        }
    }

    pub fn thinking(text: impl Into<String>, signature: Option<String>) -> Self {
        Self::Thinking {
            text: text.into(),
            id: None,
            signature,
            provider_metadata: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "toolResult")]
    ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: Vec<ContentPart> },
    #[serde(rename = "user")]
    User { content: Vec<ContentPart> },
    #[serde(rename = "assistant")]
    Assistant { content: Vec<ContentPart> },
    #[serde(rename = "toolResult")]
    ToolResult { content: Vec<ContentPart> },
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::ToolResult { .. } => Role::ToolResult,
        }
    }

    pub fn content(&self) -> &[ContentPart] {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content }
            | Self::ToolResult { content } => content,
        }
    }

    /// Concatenated text parts, newline-joined.
    pub fn joined_text(&self) -> String {
        self.content()
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    Named(String),
}

/// Who a request is made for. Handed to the image fetch service so an
/// attachment store can scope lookups per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchContext {
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none", default)]
    pub tenant_id: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
}

/// One inference call's input. Built once, consumed by exactly one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(rename = "systemPrompt", skip_serializing_if = "Option::is_none", default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(rename = "toolChoice", default)]
    pub tool_choice: ToolChoice,
    #[serde(default)]
    pub context: FetchContext,
}

impl ConversionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            context: FetchContext::default(),
        }
    }

    pub fn with_context(mut self, context: FetchContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>, tool_choice: ToolChoice) -> Self {
        self.tools = tools;
        self.tool_choice = tool_choice;
        self
    }

    /// System prompt plus any `System` messages, in order.
    pub fn effective_system_prompt(&self) -> Option<String> {
        let mut sections = Vec::new();
        if let Some(prompt) = self.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            sections.push(prompt.clone());
        }
        for message in &self.messages {
            if let Message::System { .. } = message {
                let text = message.joined_text();
                if !text.trim().is_empty() {
                    sections.push(text);
                }
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role() == Role::User)
            .map(Message::joined_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effective_system_prompt_merges_system_messages() {
        let request = ConversionRequest::new(
            "m",
            vec![
                Message::System {
                    content: vec![ContentPart::text("Be terse.")],
                },
                Message::user_text("hi"),
            ],
        )
        .with_system_prompt("You are helpful.");

        assert_eq!(
            request.effective_system_prompt().as_deref(),
            Some("You are helpful.\n\nBe terse.")
        );
    }

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let request = ConversionRequest::new(
            "m",
            vec![
                Message::user_text("first"),
                Message::assistant_text("reply"),
                Message::user_text("second"),
                Message::assistant_text("again"),
            ],
        );
        assert_eq!(request.last_user_text().as_deref(), Some("second"));
    }

    #[test]
    fn tool_choice_serializes_with_name() {
        assert_eq!(
            serde_json::to_value(ToolChoice::Named("search".to_string())).expect("serialize"),
            json!({ "type": "named", "name": "search" })
        );
        assert_eq!(
            serde_json::to_value(ToolChoice::Required).expect("serialize"),
            json!({ "type": "required" })
        );
    }
}
