//! Declarative mock tool definitions and response-rule matching.
//!
//! A mock tool server serves a fixed set of tools, each with an ordered
//! list of response rules. The first rule whose `condition` deep-matches
//! the request arguments wins; a rule without a condition always matches.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::client::result::ToolResult;
use crate::matching::condition_matches;
use crate::scenario::schema::duration;

/// A single declared mock tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name as exposed to the aggregator (un-namespaced).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Optional JSON schema for the tool arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Ordered response rules; first match wins.
    #[serde(default)]
    pub responses: Vec<ResponseRule>,
}

/// One response rule of a mock tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Argument condition; every key/value must deep-match the request.
    /// Absent means the rule always matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Map<String, Value>>,
    /// Response payload: arbitrary JSON, or a string returned as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// When set, the call fails with this error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sleep before responding (e.g. `"250ms"`).
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
}

/// The full declarative configuration a mock tool server loads.
///
/// This is the side-car YAML the instance manager writes next to the
/// generated MCPServer CRD for stdio-type mock children.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockServerConfig {
    /// Server name; surfaces in `serverInfo` during initialize.
    #[serde(default)]
    pub name: String,
    /// The tools this mock serves.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// A registry of mock tools with rule evaluation.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    server_name: String,
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    /// Builds a registry from a server name and its tool declarations.
    #[must_use]
    pub fn new(server_name: impl Into<String>, tools: Vec<ToolSpec>) -> Self {
        Self {
            server_name: server_name.into(),
            tools,
        }
    }

    /// Returns the server name used in the initialize result.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Renders the `tools/list` result payload.
    #[must_use]
    pub fn list_payload(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema.clone()
                        .unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    /// Evaluates a `tools/call` against the registry.
    ///
    /// Returns the matched rule's delay (to be slept by the transport
    /// layer) and the tool result. Unknown tools and tools whose rules all
    /// miss produce errored results rather than protocol errors, matching
    /// how real child servers report tool failures.
    #[must_use]
    pub fn evaluate(&self, tool_name: &str, args: &Value) -> (Option<Duration>, ToolResult) {
        let Some(tool) = self.tools.iter().find(|t| t.name == tool_name) else {
            return (
                None,
                ToolResult::error(format!("unknown tool: {tool_name}")),
            );
        };

        for (index, rule) in tool.responses.iter().enumerate() {
            let matches = match &rule.condition {
                Some(condition) => condition_matches(condition, args),
                None => true,
            };
            if !matches {
                continue;
            }
            debug!(tool = tool_name, rule = index, "response rule matched");

            if let Some(error) = &rule.error {
                return (rule.delay, ToolResult::error(error.clone()));
            }
            let result = match &rule.response {
                Some(Value::String(text)) => ToolResult::text(text.clone()),
                Some(value) => ToolResult::text(value.to_string()),
                None => ToolResult::text(""),
            };
            return (rule.delay, result);
        }

        (
            None,
            ToolResult::error(format!("no response rule matched for tool: {tool_name}")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greet_tool() -> ToolSpec {
        serde_yaml::from_str(
            r#"
name: greet
description: Greets in the requested language
responses:
  - condition: {lang: fr}
    response: bonjour
  - response: hello
"#,
        )
        .unwrap()
    }

    #[test]
    fn first_matching_rule_wins() {
        let registry = ToolRegistry::new("greeter", vec![greet_tool()]);
        let (_, result) = registry.evaluate("greet", &json!({"lang": "fr"}));
        assert_eq!(result.joined_text(), "bonjour");
        let (_, result) = registry.evaluate("greet", &json!({}));
        assert_eq!(result.joined_text(), "hello");
    }

    #[test]
    fn unconditional_rule_matches_everything() {
        let registry = ToolRegistry::new("greeter", vec![greet_tool()]);
        let (_, result) = registry.evaluate("greet", &json!({"lang": "de", "x": 1}));
        assert_eq!(result.joined_text(), "hello");
        assert!(!result.is_error);
    }

    #[test]
    fn json_response_is_serialized_as_text() {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: echo_text
responses:
  - response: {echo: hi}
"#,
        )
        .unwrap();
        let registry = ToolRegistry::new("echo", vec![tool]);
        let (_, result) = registry.evaluate("echo_text", &json!({}));
        let decoded = result.first_text_json().unwrap();
        assert_eq!(decoded, json!({"echo": "hi"}));
    }

    #[test]
    fn error_rule_fails_the_call() {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: flaky
responses:
  - condition: {mode: broken}
    error: upstream unavailable
  - response: ok
"#,
        )
        .unwrap();
        let registry = ToolRegistry::new("svc", vec![tool]);
        let (_, result) = registry.evaluate("flaky", &json!({"mode": "broken"}));
        assert!(result.is_error);
        assert!(result.joined_text().contains("upstream unavailable"));
    }

    #[test]
    fn unknown_tool_is_an_errored_result() {
        let registry = ToolRegistry::new("empty", vec![]);
        let (_, result) = registry.evaluate("missing", &json!({}));
        assert!(result.is_error);
    }

    #[test]
    fn delay_parses_from_humantime() {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: slow
responses:
  - response: done
    delay: 250ms
"#,
        )
        .unwrap();
        let registry = ToolRegistry::new("svc", vec![tool]);
        let (delay, _) = registry.evaluate("slow", &json!({}));
        assert_eq!(delay, Some(Duration::from_millis(250)));
    }

    #[test]
    fn numeric_condition_widens() {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: calc
responses:
  - condition: {value: 2}
    response: matched
  - error: no match
"#,
        )
        .unwrap();
        let registry = ToolRegistry::new("svc", vec![tool]);
        let (_, result) = registry.evaluate("calc", &json!({"value": 2.0}));
        assert_eq!(result.joined_text(), "matched");
    }
}
