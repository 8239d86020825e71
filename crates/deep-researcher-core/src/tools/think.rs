use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolSpec};

pub const THINK_TOOL: &str = "think_tool";
pub const RESEARCH_COMPLETE: &str = "ResearchComplete";
pub const CONDUCT_RESEARCH: &str = "ConductResearch";

/// Strategic reflection between searches. Records the thought and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            THINK_TOOL,
            "Reflect on research progress: what was found, what is missing, and whether to \
             search again or answer.",
            json!({
                "type": "object",
                "properties": {
                    "reflection": {
                        "type": "string",
                        "description": "Your reflection on progress, gaps and next steps."
                    }
                },
                "required": ["reflection"]
            }),
        )
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<String> {
        let reflection = args
            .get("reflection")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing `reflection` argument"))?;
        Ok(format!("Reflection recorded: {reflection}"))
    }
}

/// Signals that research is done. Executing it has no effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResearchCompleteTool;

#[async_trait]
impl Tool for ResearchCompleteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            RESEARCH_COMPLETE,
            "Call this tool to indicate that the research is complete.",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn invoke(&self, _args: Value) -> anyhow::Result<String> {
        Ok("Research marked complete.".to_string())
    }
}

/// Delegation tool bound only by the supervisor; handled there, never executed.
pub fn conduct_research_spec() -> ToolSpec {
    ToolSpec::new(
        CONDUCT_RESEARCH,
        "Delegate one research topic to a specialised sub-agent.",
        json!({
            "type": "object",
            "properties": {
                "research_topic": {
                    "type": "string",
                    "description": "The topic to research. Describe it in full detail, at least a paragraph."
                }
            },
            "required": ["research_topic"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reflection_is_echoed() {
        let out = ThinkTool
            .invoke(json!({"reflection": "two sources agree"}))
            .await
            .expect("records");
        assert_eq!(out, "Reflection recorded: two sources agree");
    }

    #[tokio::test]
    async fn missing_reflection_is_an_error() {
        assert!(ThinkTool.invoke(json!({})).await.is_err());
    }
}
