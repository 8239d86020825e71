use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct ResearchMetrics {
    node_transitions: Counter<u64>,
    tool_calls: Counter<u64>,
    researcher_runs: Counter<u64>,
    model_duration_ms: Histogram<f64>,
    token_limit_retries: Counter<u64>,
}

static METRICS: OnceCell<ResearchMetrics> = OnceCell::new();

fn handles() -> &'static ResearchMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deep_researcher");
        ResearchMetrics {
            node_transitions: meter
                .u64_counter("node_transitions_total")
                .with_description("Graph node transitions by graph and node")
                .init(),
            tool_calls: meter
                .u64_counter("tool_calls_total")
                .with_description("Tool invocations by tool name and outcome")
                .init(),
            researcher_runs: meter
                .u64_counter("researcher_runs_total")
                .with_description("Researcher subgraph executions by outcome")
                .init(),
            model_duration_ms: meter
                .f64_histogram("model_call_duration_ms")
                .with_description("Model invocation latency in milliseconds")
                .init(),
            token_limit_retries: meter
                .u64_counter("token_limit_retries_total")
                .with_description("Input truncations triggered by token-limit errors")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("DEEPRESEARCHER_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPRESEARCHER_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export research metrics."
        );
    }
}

pub fn record_transition(graph: &'static str, node: &'static str) {
    handles().node_transitions.add(
        1,
        &[KeyValue::new("graph", graph), KeyValue::new("node", node)],
    );
}

pub fn record_tool_call(tool: &str, ok: bool) {
    handles().tool_calls.add(
        1,
        &[
            KeyValue::new("tool", tool.to_string()),
            KeyValue::new("outcome", if ok { "ok" } else { "error" }),
        ],
    );
}

pub fn record_researcher_run(outcome: &'static str) {
    handles()
        .researcher_runs
        .add(1, &[KeyValue::new("outcome", outcome)]);
}

pub fn record_model_call(phase: &'static str, duration_ms: u64, ok: bool) {
    handles().model_duration_ms.record(
        duration_ms as f64,
        &[
            KeyValue::new("phase", phase),
            KeyValue::new("outcome", if ok { "ok" } else { "error" }),
        ],
    );
}

pub fn record_token_limit_retry(phase: &'static str) {
    handles()
        .token_limit_retries
        .add(1, &[KeyValue::new("phase", phase)]);
}
