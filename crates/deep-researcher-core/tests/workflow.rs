mod common;

use std::sync::Arc;

use common::{BrokenTool, SlowEcho, final_report, labels, quiet_config, run, workflow};
use deep_researcher_core::message::{Message, ToolCall};
use deep_researcher_core::model::{ModelPhase, ModelRequest, ModelResponse, StubModel};
use deep_researcher_core::supervisor::{INTERRUPTED_MESSAGE, RESEARCH_COMPLETE_MESSAGE};
use deep_researcher_core::tools::{CONDUCT_RESEARCH, RESEARCH_COMPLETE, ThinkTool, ToolRegistry};
use deep_researcher_core::workflow::{REPORT_MAX_RETRIES, REPORT_READY, REPORT_TOKEN_LIMIT};
use deep_researcher_core::{CheckpointStore, ModelError, ResearchConfig, ThreadStatus, WorkflowEvent};
use serde_json::json;

fn think_only() -> ToolRegistry {
    ToolRegistry::new().with_tool(Arc::new(ThinkTool))
}

fn brief_reply() -> ModelResponse {
    ModelResponse::text(json!({"research_brief": "Study nurse pay"}).to_string())
}

/// Supervisor that delegates `topics` once and then finishes.
fn delegate_then_finish(request: &ModelRequest, topics: &[&str]) -> ModelResponse {
    if request.tool_messages().next().is_none() {
        let calls = topics
            .iter()
            .enumerate()
            .map(|(i, topic)| {
                ToolCall::new(format!("delegate-{i}"), CONDUCT_RESEARCH, json!({"research_topic": topic}))
            })
            .collect();
        ModelResponse::with_tool_calls(calls)
    } else {
        ModelResponse::with_tool_calls(vec![ToolCall::new("finish", RESEARCH_COMPLETE, json!({}))])
    }
}

fn tool_results(request: &ModelRequest) -> Vec<(String, String)> {
    request
        .messages
        .iter()
        .filter_map(|message| match message {
            Message::Tool {
                content,
                tool_call_id,
                ..
            } => Some((tool_call_id.clone(), content.clone())),
            _ => None,
        })
        .collect()
}

const NURSE_REQUEST: &str = "I'm a nurse wanting a higher-paying, AI-resistant career";

#[tokio::test]
async fn nurse_question_runs_end_to_end_without_clarification() {
    let model = StubModel::offline();
    let (workflow, checkpoints) = workflow(model.clone(), think_only());
    let config = ResearchConfig {
        generate_outline: true,
        ..quiet_config()
    };

    let (handle, events) = run(
        &workflow,
        "nurse-thread",
        Some(NURSE_REQUEST),
        config,
    )
    .await;

    assert!(!handle.resumed);
    let names = labels(&events);
    assert_eq!(names.first(), Some(&"clarifyWithUser"));
    assert!(names.contains(&"writeResearchBrief"));
    assert!(names.contains(&"writeResearchOutline"));
    assert!(names.iter().any(|name| name.starts_with("researchSupervisor.")));
    assert_eq!(&names[names.len() - 2..], &["finalReportGeneration", "final"]);
    assert!(model.requests_for(ModelPhase::Clarify).is_empty());
    let brief_requests = model.requests_for(ModelPhase::Brief);
    assert!(brief_requests[0].first_human().is_some_and(|prompt| prompt.contains(NURSE_REQUEST)));

    let report = final_report(&events).expect("report produced");
    assert!(report.contains("[1]"));
    assert!(report.contains("### Sources"));
    assert!(report.contains("https://example.com/offline"));

    let head = checkpoints
        .get("nurse-thread")
        .await
        .expect("lookup")
        .expect("checkpointed");
    assert_eq!(head.status, ThreadStatus::Completed);
    let state = head.channel_values;
    assert!(state.notes.is_empty());
    assert!(
        state
            .research_brief
            .as_deref()
            .is_some_and(|brief| brief.to_lowercase().contains("nurse"))
    );
    assert!(state.research_outline.is_some());
    let contents: Vec<&str> = state.messages.iter().map(Message::content).collect();
    assert!(contents.contains(&RESEARCH_COMPLETE_MESSAGE));
    assert_eq!(contents.last(), Some(&REPORT_READY));
}

#[tokio::test]
async fn delegations_beyond_the_cap_are_answered_but_not_run() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Brief => brief_reply(),
            ModelPhase::Supervisor => delegate_then_finish(request, &["a", "b", "c", "d", "e"]),
            ModelPhase::Researcher => ModelResponse::text("nothing to search"),
            ModelPhase::Compress => ModelResponse::text(format!(
                "findings on {}",
                request.first_human().unwrap_or_default()
            )),
            _ => ModelResponse::text("report"),
        })
    });
    let (workflow, _) = workflow(model.clone(), think_only());
    let config = ResearchConfig {
        max_concurrent_research_units: 2,
        ..quiet_config()
    };

    let (_, events) = run(&workflow, "cap", Some("question"), config).await;
    assert!(matches!(events.last(), Some(WorkflowEvent::Final { .. })));

    assert_eq!(model.requests_for(ModelPhase::Compress).len(), 2);
    let supervisor_calls = model.requests_for(ModelPhase::Supervisor);
    let answers = tool_results(&supervisor_calls[1]);
    assert_eq!(answers.len(), 5);
    let ids: Vec<&str> = answers.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["delegate-0", "delegate-1", "delegate-2", "delegate-3", "delegate-4"]);
    assert_eq!(answers[0].1, "findings on a");
    assert_eq!(answers[1].1, "findings on b");
    for (_, content) in &answers[2..] {
        assert!(
            content.contains("Exceeded maximum concurrent research units (2)"),
            "unexpected answer: {content}"
        );
    }
}

#[tokio::test]
async fn tool_results_keep_call_order_when_completion_order_is_reversed() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Brief => brief_reply(),
            ModelPhase::Supervisor => delegate_then_finish(request, &["pay"]),
            ModelPhase::Researcher if request.tool_messages().next().is_none() => {
                ModelResponse::with_tool_calls(vec![
                    ToolCall::new("slow", "slow_echo", json!({"text": "first", "delay_ms": 80})),
                    ToolCall::new("medium", "slow_echo", json!({"text": "second", "delay_ms": 40})),
                    ToolCall::new("fast", "slow_echo", json!({"text": "third", "delay_ms": 0})),
                ])
            }
            ModelPhase::Researcher => ModelResponse::text("done"),
            ModelPhase::Compress => ModelResponse::text("compressed"),
            _ => ModelResponse::text("report"),
        })
    });
    let (workflow, _) = workflow(model.clone(), ToolRegistry::new().with_tool(Arc::new(SlowEcho)));

    let (_, events) = run(&workflow, "order", Some("question"), quiet_config()).await;
    assert!(final_report(&events).is_some());

    let researcher_calls = model.requests_for(ModelPhase::Researcher);
    assert_eq!(researcher_calls.len(), 2);
    assert_eq!(
        tool_results(&researcher_calls[1]),
        vec![
            ("slow".to_string(), "echo: first".to_string()),
            ("medium".to_string(), "echo: second".to_string()),
            ("fast".to_string(), "echo: third".to_string()),
        ]
    );
}

#[tokio::test]
async fn a_failing_tool_does_not_stop_its_siblings() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Brief => brief_reply(),
            ModelPhase::Supervisor => delegate_then_finish(request, &["pay"]),
            ModelPhase::Researcher if request.tool_messages().next().is_none() => {
                ModelResponse::with_tool_calls(vec![
                    ToolCall::new("bad", "broken", json!({})),
                    ToolCall::new("good", "slow_echo", json!({"text": "still here"})),
                ])
            }
            ModelPhase::Researcher => ModelResponse::text("done"),
            ModelPhase::Compress => ModelResponse::text("compressed"),
            _ => ModelResponse::text("report"),
        })
    });
    let tools = ToolRegistry::new()
        .with_tool(Arc::new(BrokenTool))
        .with_tool(Arc::new(SlowEcho));
    let (workflow, _) = workflow(model.clone(), tools);

    let (_, events) = run(&workflow, "isolation", Some("question"), quiet_config()).await;
    assert_eq!(final_report(&events).as_deref(), Some("report"));

    let results = tool_results(&model.requests_for(ModelPhase::Researcher)[1]);
    assert_eq!(results.len(), 2);
    assert!(results[0].1.starts_with("Error executing tool:"));
    assert!(results[0].1.contains("503"));
    assert_eq!(results[1].1, "echo: still here");
}

#[tokio::test]
async fn report_findings_shrink_on_every_token_limit_retry() {
    const MARK: char = '§';
    let model = StubModel::from_fn(|request| match request.phase {
        ModelPhase::Brief => Ok(brief_reply()),
        ModelPhase::Supervisor => Ok(delegate_then_finish(request, &["pay"])),
        ModelPhase::Researcher => Ok(ModelResponse::text("done")),
        ModelPhase::Compress => Ok(ModelResponse::text(MARK.to_string().repeat(20_000))),
        ModelPhase::FinalReport => Err(ModelError::token_limit(
            "stub:llama2",
            "maximum context length exceeded",
        )),
        _ => Ok(ModelResponse::text("unused")),
    });
    let (workflow, checkpoints) = workflow(model.clone(), think_only());
    let config = ResearchConfig {
        final_report_model: "stub:llama2".into(),
        ..quiet_config()
    };

    let (_, events) = run(&workflow, "shrink", Some("question"), config).await;
    assert_eq!(final_report(&events).as_deref(), Some(REPORT_MAX_RETRIES));

    let lengths: Vec<usize> = model
        .requests_for(ModelPhase::FinalReport)
        .iter()
        .map(|request| {
            request
                .messages
                .iter()
                .map(|message| message.content().matches(MARK).count())
                .sum()
        })
        .collect();
    assert_eq!(lengths, vec![20_000, 16_384, 14_745, 13_270]);

    let state = checkpoints
        .get("shrink")
        .await
        .expect("lookup")
        .expect("checkpointed")
        .channel_values;
    assert!(state.notes.is_empty());
    assert_eq!(
        state.messages.last().map(Message::content),
        Some("Report generation failed after multiple attempts.")
    );
}

#[tokio::test]
async fn unknown_context_window_fails_the_report_at_once() {
    let model = StubModel::from_fn(|request| match request.phase {
        ModelPhase::Brief => Ok(brief_reply()),
        ModelPhase::Supervisor => Ok(delegate_then_finish(request, &["pay"])),
        ModelPhase::Researcher => Ok(ModelResponse::text("done")),
        ModelPhase::Compress => Ok(ModelResponse::text("findings")),
        ModelPhase::FinalReport => Err(ModelError::token_limit("stub:homegrown", "too long")),
        _ => Ok(ModelResponse::text("unused")),
    });
    let (workflow, _) = workflow(model.clone(), think_only());
    let config = ResearchConfig {
        final_report_model: "stub:homegrown".into(),
        ..quiet_config()
    };

    let (_, events) = run(&workflow, "no-window", Some("question"), config).await;
    assert_eq!(final_report(&events).as_deref(), Some(REPORT_TOKEN_LIMIT));
    assert_eq!(model.requests_for(ModelPhase::FinalReport).len(), 1);
}

#[tokio::test]
async fn report_citations_are_renumbered_in_order_of_use() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Brief => brief_reply(),
            ModelPhase::Supervisor => delegate_then_finish(request, &["pay"]),
            ModelPhase::Researcher => ModelResponse::text("done"),
            ModelPhase::Compress => ModelResponse::text("findings"),
            ModelPhase::FinalReport => ModelResponse::text(
                "Wages rose [4]. Staffing fell [2] while wages kept rising [4].\n\n\
                 ### Sources\n\
                 [2] Staffing survey: https://staff.example/survey\n\
                 [4] Wage index: https://wages.example/index\n",
            ),
            _ => ModelResponse::text("unused"),
        })
    });
    let (workflow, _) = workflow(model, think_only());

    let (_, events) = run(&workflow, "citations", Some("question"), quiet_config()).await;
    let report = final_report(&events).expect("report");
    assert!(report.starts_with("Wages rose [1]. Staffing fell [2] while wages kept rising [1]."));
    assert!(report.contains("[1] Wage index: https://wages.example/index"));
    assert!(report.contains("[2] Staffing survey: https://staff.example/survey"));
}

#[tokio::test]
async fn brief_failure_ends_the_thread_without_a_report() {
    let model = StubModel::from_fn(|request| match request.phase {
        ModelPhase::Brief => Ok(ModelResponse::text("not json at all")),
        _ => Ok(ModelResponse::text("unused")),
    });
    let (workflow, checkpoints) = workflow(model.clone(), think_only());

    let (_, events) = run(&workflow, "no-brief", Some("question"), quiet_config()).await;
    assert_eq!(labels(&events), ["clarifyWithUser", "writeResearchBrief", "final"]);
    assert_eq!(final_report(&events), None);
    assert!(model.requests_for(ModelPhase::Supervisor).is_empty());

    let head = checkpoints
        .get("no-brief")
        .await
        .expect("lookup")
        .expect("checkpointed");
    assert_eq!(head.status, ThreadStatus::Completed);
}

#[tokio::test]
async fn missing_research_tools_end_the_research_phase_early() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Brief => brief_reply(),
            ModelPhase::Supervisor => delegate_then_finish(request, &["pay"]),
            _ => ModelResponse::text("thin report"),
        })
    });
    let (workflow, checkpoints) = workflow(model.clone(), ToolRegistry::new());

    let (_, events) = run(&workflow, "no-tools", Some("question"), quiet_config()).await;
    assert_eq!(final_report(&events).as_deref(), Some("thin report"));
    assert!(model.requests_for(ModelPhase::Researcher).is_empty());

    let state = checkpoints
        .get("no-tools")
        .await
        .expect("lookup")
        .expect("checkpointed")
        .channel_values;
    let contents: Vec<&str> = state.messages.iter().map(Message::content).collect();
    assert!(contents.contains(&INTERRUPTED_MESSAGE));
}
