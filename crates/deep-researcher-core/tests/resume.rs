mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{checkpoint_count, final_report, labels, quiet_config, run, workflow};
use deep_researcher_core::message::Message;
use deep_researcher_core::model::{ModelPhase, ModelResponse, RetryPolicy, StubModel};
use deep_researcher_core::tools::{ThinkTool, ToolRegistry};
use deep_researcher_core::{
    AgentState, Checkpoint, CheckpointStore, FileCheckpointStore, ResearchConfig, ThreadStatus,
    Workflow, WorkflowEvent,
};
use deep_researcher_core::graph::WorkflowNode;
use serde_json::json;

fn think_only() -> ToolRegistry {
    ToolRegistry::new().with_tool(Arc::new(ThinkTool))
}

#[tokio::test]
async fn resuming_a_completed_thread_replays_without_new_work() {
    let model = StubModel::offline();
    let (workflow, checkpoints) = workflow(model.clone(), think_only());

    let (_, first) = run(&workflow, "done", Some("Nurse staffing trends"), quiet_config()).await;
    let report = final_report(&first).expect("report");
    let calls = model.calls();
    let stored = checkpoint_count(&checkpoints, "done").await;

    for _ in 0..2 {
        let (handle, replay) = run(&workflow, "done", None, quiet_config()).await;
        assert!(handle.resumed);
        assert_eq!(labels(&replay), ["final"]);
        assert_eq!(final_report(&replay).as_deref(), Some(report.as_str()));
    }
    assert_eq!(model.calls(), calls);
    assert_eq!(checkpoint_count(&checkpoints, "done").await, stored);
}

#[tokio::test]
async fn resume_continues_from_the_recorded_next_node() {
    let model = StubModel::offline();
    let (workflow, checkpoints) = workflow(model.clone(), think_only());
    let state = AgentState {
        messages: vec![Message::human("Nurse pay"), Message::ai("Study nurse pay")],
        research_brief: Some("Study nurse pay".into()),
        notes: vec!["Pay rose 4% [1].\n\n### Sources\n[1] BLS: https://bls.example".into()],
        ..Default::default()
    };
    checkpoints
        .put(Checkpoint::root(
            "crashed",
            ThreadStatus::Running {
                next: WorkflowNode::FinalReportGeneration,
            },
            state,
        ))
        .await
        .expect("seed checkpoint");

    let (handle, events) = run(&workflow, "crashed", Some("  "), quiet_config()).await;
    assert!(handle.resumed);
    assert_eq!(labels(&events), ["finalReportGeneration", "final"]);
    assert_eq!(model.calls(), 1);
    assert_eq!(model.requests_for(ModelPhase::FinalReport).len(), 1);

    let prompt = model.requests_for(ModelPhase::FinalReport)[0].messages[0]
        .content()
        .to_string();
    assert!(prompt.contains("Pay rose 4%"));

    let history = checkpoints.list("crashed").await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].parent_id.as_deref(), Some(history[0].id.as_str()));
    assert_eq!(history[1].step, 1);
}

#[tokio::test]
async fn clarification_pauses_until_the_user_answers() {
    let model = StubModel::from_fn(|request| {
        Ok(match request.phase {
            ModelPhase::Clarify => {
                let prompt = request.first_human().unwrap_or_default();
                if prompt.contains("Berlin") {
                    ModelResponse::text(
                        json!({"need_clarification": false, "verification": "Researching Berlin."})
                            .to_string(),
                    )
                } else {
                    ModelResponse::text(
                        json!({"need_clarification": true, "question": "Which city?"}).to_string(),
                    )
                }
            }
            ModelPhase::Brief => {
                ModelResponse::text(json!({"research_brief": "Nurse pay in Berlin"}).to_string())
            }
            ModelPhase::Supervisor => ModelResponse::with_tool_calls(vec![]),
            _ => ModelResponse::text("Berlin report"),
        })
    });
    let (workflow, checkpoints) = workflow(model.clone(), think_only());
    let config = ResearchConfig {
        allow_clarification: true,
        ..quiet_config()
    };

    let (_, paused) = run(&workflow, "clarify", Some("Nurse pay"), config.clone()).await;
    assert_eq!(labels(&paused), ["clarifyWithUser"]);
    let head = checkpoints.get("clarify").await.expect("lookup").expect("head");
    assert_eq!(head.status, ThreadStatus::AwaitingInput);
    assert_eq!(
        head.channel_values.messages.last().map(Message::content),
        Some("Which city?")
    );

    let (_, idle) = run(&workflow, "clarify", None, config.clone()).await;
    assert!(idle.is_empty());

    let (_, answered) = run(&workflow, "clarify", Some("Berlin, please"), config).await;
    assert_eq!(final_report(&answered).as_deref(), Some("Berlin report"));

    let state = checkpoints
        .get("clarify")
        .await
        .expect("lookup")
        .expect("head")
        .channel_values;
    let contents: Vec<&str> = state.messages.iter().map(Message::content).collect();
    assert_eq!(
        &contents[..4],
        ["Nurse pay", "Which city?", "Berlin, please", "Researching Berlin."]
    );
    assert_eq!(model.requests_for(ModelPhase::Clarify).len(), 2);
}

#[tokio::test]
async fn starting_an_unknown_thread_without_a_message_is_an_error() {
    let (workflow, checkpoints) = workflow(StubModel::offline(), think_only());

    let (_, events) = run(&workflow, "empty", None, quiet_config()).await;
    match events.as_slice() {
        [WorkflowEvent::Error { error, .. }] => assert!(error.contains("invalid input")),
        other => panic!("expected one error event, got {other:?}"),
    }
    assert_eq!(checkpoint_count(&checkpoints, "empty").await, 0);
}

#[tokio::test]
async fn file_store_resumes_across_workflow_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = StubModel::offline();

    let first_store = Arc::new(FileCheckpointStore::open(dir.path()).await.expect("open store"));
    let first = Workflow::new(Arc::new(model.clone()), first_store)
        .with_tools(Arc::new(think_only()))
        .with_retry_policy(RetryPolicy::immediate(1));
    let (_, events) = run(&first, "durable", Some("Nurse retention"), quiet_config()).await;
    let report = final_report(&events).expect("report");
    let calls = model.calls();

    let second_store = Arc::new(FileCheckpointStore::open(dir.path()).await.expect("reopen store"));
    let second = Workflow::new(Arc::new(model.clone()), second_store.clone())
        .with_tools(Arc::new(think_only()));
    let (handle, replay) = run(&second, "durable", None, quiet_config()).await;

    assert!(handle.resumed);
    assert_eq!(final_report(&replay), Some(report));
    assert_eq!(model.calls(), calls);
    let head = second_store.get("durable").await.expect("lookup").expect("head");
    assert!(head.status.is_completed());
}

#[tokio::test]
async fn new_message_on_a_completed_thread_does_not_reuse_the_old_report() {
    let brief_fails = Arc::new(AtomicBool::new(false));
    let flag = brief_fails.clone();
    let model = StubModel::from_fn(move |request| {
        Ok(match request.phase {
            ModelPhase::Brief if flag.load(Ordering::SeqCst) => ModelResponse::text("not json"),
            ModelPhase::Brief => {
                ModelResponse::text(json!({"research_brief": "Study nurse pay"}).to_string())
            }
            ModelPhase::FinalReport => ModelResponse::text("FIRST RUN REPORT"),
            _ => ModelResponse::text("nothing to delegate"),
        })
    });
    let (workflow, checkpoints) = workflow(model, think_only());

    let (_, first) = run(&workflow, "follow-up", Some("Nurse pay"), quiet_config()).await;
    assert_eq!(final_report(&first).as_deref(), Some("FIRST RUN REPORT"));

    brief_fails.store(true, Ordering::SeqCst);
    let (_, second) = run(&workflow, "follow-up", Some("And in Canada?"), quiet_config()).await;
    assert_eq!(labels(&second), ["clarifyWithUser", "writeResearchBrief", "final"]);
    assert_eq!(final_report(&second), None);

    let head = checkpoints
        .get("follow-up")
        .await
        .expect("lookup")
        .expect("head");
    assert_eq!(head.channel_values.final_report, None);
    assert!(head.channel_values.notes.is_empty());
    let humans = head
        .channel_values
        .messages
        .iter()
        .filter(|message| matches!(message, Message::Human { .. }))
        .count();
    assert_eq!(humans, 2);
}
