//! Per-scenario variable context and argument template resolution.
//!
//! Steps with a `store:` directive capture their result under a variable
//! name; later steps may reference stored values in string arguments via
//! `{{ .variable.path }}` templates. Only templates whose *root variable*
//! is present in the context are resolved — everything else passes
//! through byte-for-byte so the aggregator's own template engine can
//! handle workflow-internal expressions at execution time.

use std::sync::{LazyLock, RwLock};

use handlebars::Handlebars;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template regex is valid"));

/// Thread-safe mapping of variable name → stored step result.
#[derive(Debug, Default)]
pub struct ScenarioContext {
    vars: RwLock<Map<String, Value>>,
}

impl ScenarioContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics if the context lock is poisoned.
    pub fn store_result(&self, name: &str, value: Value) {
        debug!(name, "storing step result");
        self.vars
            .write()
            .expect("context lock poisoned")
            .insert(name.to_string(), value);
    }

    /// Returns a snapshot copy of all stored results.
    ///
    /// # Panics
    ///
    /// Panics if the context lock is poisoned.
    #[must_use]
    pub fn get_all_stored_results(&self) -> Map<String, Value> {
        self.vars.read().expect("context lock poisoned").clone()
    }
}

/// Resolves `{{ .var.path }}` templates in step arguments.
pub struct TemplateResolver {
    engine: Handlebars<'static>,
}

impl TemplateResolver {
    /// Creates a resolver with escaping disabled (arguments are data, not
    /// HTML).
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        engine.register_escape_fn(handlebars::no_escape);
        Self { engine }
    }

    /// Resolves templates in an argument map against a context snapshot.
    #[must_use]
    pub fn resolve_args(
        &self,
        args: &Map<String, Value>,
        snapshot: &Map<String, Value>,
    ) -> Map<String, Value> {
        args.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v, snapshot)))
            .collect()
    }

    /// Recursively resolves templates in a value. Only strings can contain
    /// templates; maps and arrays recurse; scalars pass through.
    #[must_use]
    pub fn resolve_value(&self, value: &Value, snapshot: &Map<String, Value>) -> Value {
        match value {
            Value::String(text) => Value::String(self.resolve_string(text, snapshot)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, snapshot))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, snapshot)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves one string. If *any* template's root variable is absent
    /// from the snapshot the string is returned untouched; engine errors
    /// also degrade to the original string.
    fn resolve_string(&self, text: &str, snapshot: &Map<String, Value>) -> String {
        let mut saw_template = false;
        for capture in TEMPLATE_RE.captures_iter(text) {
            saw_template = true;
            let expression = capture[1].trim();
            match root_variable(expression) {
                Some(root) if snapshot.contains_key(root) => {}
                _ => return text.to_string(),
            }
        }
        if !saw_template {
            return text.to_string();
        }

        // Strip the leading dot of each expression so the engine sees
        // plain `{{var.path}}` lookups against the snapshot.
        let rewritten = TEMPLATE_RE.replace_all(text, |caps: &regex::Captures<'_>| {
            format!("{{{{{}}}}}", caps[1].trim().trim_start_matches('.'))
        });

        match self
            .engine
            .render_template(&rewritten, &Value::Object(snapshot.clone()))
        {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(error = %e, template = text, "template render failed, keeping original");
                text.to_string()
            }
        }
    }
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the root variable name of a template expression: leading dot
/// stripped, first segment before `.`.
fn root_variable(expression: &str) -> Option<&str> {
    let first_word = expression.split_whitespace().next()?;
    let path = first_word.trim_start_matches('.');
    let root = path.split('.').next()?;
    if root.is_empty() { None } else { Some(root) }
}
