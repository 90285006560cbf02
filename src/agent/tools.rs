//! Tool dispatch: classification, spoken acknowledgements, execution.
//!
//! The tool set is configuration-defined, so dispatch is by name with raw
//! JSON arguments; individual executors deserialize their own typed
//! argument structs at the boundary. Unknown tools classify as queries and
//! execution errors never abort a turn.

use crate::audio::stream::PcmStream;
use crate::config::ToolsConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// How a tool call is handled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Result flows back into the conversation for summarization.
    Query,
    /// Produces a template-based spoken acknowledgement instead.
    Action,
}

/// Name → kind mapping from configuration.
#[derive(Clone)]
pub struct ToolClassifier {
    types: HashMap<String, ToolKind>,
}

impl ToolClassifier {
    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut types = HashMap::new();
        for (name, kind) in &config.types {
            let kind = match kind.as_str() {
                "action" => ToolKind::Action,
                "query" => ToolKind::Query,
                other => {
                    warn!("unknown tool type '{other}' for '{name}', treating as query");
                    ToolKind::Query
                }
            };
            types.insert(name.clone(), kind);
        }
        Self { types }
    }

    /// Unknown names default to [`ToolKind::Query`].
    pub fn get_type(&self, name: &str) -> ToolKind {
        self.types.get(name).copied().unwrap_or(ToolKind::Query)
    }

    /// Names of all configured tools.
    pub fn known_tools(&self) -> Vec<String> {
        let mut names: Vec<_> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Renders spoken acknowledgements for action tools from
/// `{{placeholder}}` templates.
#[derive(Clone)]
pub struct ActionResponseGenerator {
    templates: HashMap<String, String>,
}

impl ActionResponseGenerator {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            templates: config.action_responses.clone(),
        }
    }

    /// Render the acknowledgement for `name`, substituting `{{key}}` with
    /// the matching argument. Returns `None` when no template is configured.
    pub fn generate(&self, name: &str, args: &Value) -> Option<String> {
        let template = self.templates.get(name)?;
        Some(render_template(template, args))
    }
}

fn render_template(template: &str, args: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match args.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {}
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Result of one tool execution.
pub struct ToolOutput {
    /// Textual result (query tools: fed back for summarization).
    pub text: String,
    /// Optional audio payload, played through the resource channel.
    pub audio: Option<Box<dyn PcmStream>>,
}

impl std::fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOutput")
            .field("text", &self.text)
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// One executable tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, args: &Value) -> Result<ToolOutput>;
}

/// Name-keyed tool dispatch table.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn ToolExecutor>) {
        self.tools.insert(name.into(), tool);
    }

    /// Dispatch by name.
    ///
    /// # Errors
    ///
    /// Returns a tool error for unknown names or failing executors; callers
    /// log and continue the turn.
    pub async fn execute(&self, name: &str, args: &Value) -> Result<ToolOutput> {
        let Some(tool) = self.tools.get(name) else {
            return Err(VoiceError::Tool(format!("no executor bound for '{name}'")));
        };
        tool.execute(args).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    fn config() -> ToolsConfig {
        let mut config = ToolsConfig::default();
        config.types.insert("playMusic".into(), "action".into());
        config.types.insert("weather".into(), "query".into());
        config
            .action_responses
            .insert("playMusic".into(), "正在为您播放{{song}}".into());
        config
    }

    #[test]
    fn classifier_reads_config_and_defaults_to_query() {
        let classifier = ToolClassifier::from_config(&config());
        assert_eq!(classifier.get_type("playMusic"), ToolKind::Action);
        assert_eq!(classifier.get_type("weather"), ToolKind::Query);
        assert_eq!(classifier.get_type("nonexistent"), ToolKind::Query);
    }

    #[test]
    fn template_substitutes_arguments() {
        let generator = ActionResponseGenerator::from_config(&config());
        let text = generator
            .generate("playMusic", &json!({"song": "稻香"}))
            .unwrap();
        assert_eq!(text, "正在为您播放稻香");
    }

    #[test]
    fn missing_argument_renders_empty() {
        let generator = ActionResponseGenerator::from_config(&config());
        let text = generator.generate("playMusic", &json!({})).unwrap();
        assert_eq!(text, "正在为您播放");
    }

    #[test]
    fn no_template_returns_none() {
        let generator = ActionResponseGenerator::from_config(&config());
        assert!(generator.generate("weather", &json!({})).is_none());
    }

    #[test]
    fn non_string_arguments_render_as_json() {
        assert_eq!(
            render_template("volume {{level}}", &json!({"level": 7})),
            "volume 7"
        );
    }

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, args: &Value) -> Result<ToolOutput> {
            Ok(ToolOutput {
                text: args.to_string(),
                audio: None,
            })
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register("echo", Arc::new(EchoTool));
        let out = registry.execute("echo", &json!({"a": 1})).await.unwrap();
        assert_eq!(out.text, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, VoiceError::Tool(_)));
    }
}
