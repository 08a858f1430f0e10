//! Typed tool results and the meta-tool envelope decoder.
//!
//! The aggregator routes every harness call through the `call_tool`
//! meta-tool. The outer MCP result carries exactly one text content whose
//! body is a JSON-encoded inner tool result; [`unwrap_meta_result`]
//! reconstructs the inner result so callers and the expectation matcher
//! operate on one well-typed shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// A single content item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Plain text content.
    Text {
        /// The text body.
        text: String,
    },
    /// Base64-encoded image content.
    Image {
        /// Encoded image data.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// An embedded resource reference.
    Resource {
        /// The resource body.
        resource: Value,
    },
}

/// Result of a tool call as seen by scenario steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool reported an error.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    /// Ordered content items.
    #[serde(default)]
    pub content: Vec<Content>,
}

impl ToolResult {
    /// Creates a successful single-text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Creates an errored single-text result.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    /// Joins all text contents with newlines.
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Decodes the first text content as JSON, if it parses.
    #[must_use]
    pub fn first_text_json(&self) -> Option<Value> {
        self.content.iter().find_map(|c| match c {
            Content::Text { text } => serde_json::from_str(text).ok(),
            _ => None,
        })
    }

    /// Extracts the value a `store:` directive captures from this result.
    ///
    /// A single text content that parses as JSON stores the decoded value;
    /// otherwise the joined text is stored; an empty result stores the raw
    /// serialized result.
    #[must_use]
    pub fn storable_value(&self) -> Value {
        if let [Content::Text { text }] = self.content.as_slice()
            && let Ok(decoded) = serde_json::from_str::<Value>(text)
        {
            return decoded;
        }
        let joined = self.joined_text();
        if joined.is_empty() {
            serde_json::to_value(self).unwrap_or(Value::Null)
        } else {
            Value::String(joined)
        }
    }
}

/// Unwraps the aggregator's meta-tool envelope into the inner result.
///
/// The outer result must contain exactly one text content whose body is a
/// JSON-encoded [`ToolResult`].
///
/// # Errors
///
/// Returns [`TransportError::MetaTool`] if the envelope shape does not
/// match or the inner JSON does not decode.
pub fn unwrap_meta_result(outer: &ToolResult) -> Result<ToolResult, TransportError> {
    let texts: Vec<&str> = outer
        .content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    let [body] = texts.as_slice() else {
        return Err(TransportError::MetaTool(format!(
            "expected exactly one text content, got {}",
            texts.len()
        )));
    };

    serde_json::from_str(body)
        .map_err(|e| TransportError::MetaTool(format!("inner result is not valid JSON: {e}")))
}
