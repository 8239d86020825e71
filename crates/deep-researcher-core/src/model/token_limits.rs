//! Static context-window and output-budget tables.

const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Context window per model family. Matched by substring, first hit wins, so
/// longer names precede their prefixes.
const MODEL_TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4.1-mini", 1_047_576),
    ("gpt-4.1-nano", 1_047_576),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("o4-mini", 200_000),
    ("o3-mini", 200_000),
    ("o3", 200_000),
    ("o3-pro", 200_000),
    ("o1", 200_000),
    ("o1-pro", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-3-7-sonnet", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini-pro", 32_768),
    ("command-r-plus", 128_000),
    ("command-r", 128_000),
    ("command-light", 4_096),
    ("command", 4_096),
    ("mistral-large", 32_768),
    ("mistral-medium", 32_768),
    ("mistral-small", 32_768),
    ("mistral-7b-instruct", 32_768),
    ("codellama", 16_384),
    ("llama2:70b", 4_096),
    ("llama2:13b", 4_096),
    ("llama2", 4_096),
    ("mistral", 32_768),
    ("us.amazon.nova-premier-v1:0", 1_000_000),
    ("us.amazon.nova-pro-v1:0", 300_000),
    ("us.amazon.nova-lite-v1:0", 300_000),
    ("us.amazon.nova-micro-v1:0", 128_000),
    ("us.anthropic.claude-3-7-sonnet-20250219-v1:0", 200_000),
    ("us.anthropic.claude-sonnet-4-20250514-v1:0", 200_000),
    ("us.anthropic.claude-opus-4-20250514-v1:0", 200_000),
    ("claude-opus-4-1-20250805-v1:0", 200_000),
];

/// Default output budget when the caller sets none.
const MODEL_OUTPUT_LIMITS: &[(&str, u32)] = &[
    ("gpt-4.1", 32_768),
    ("gpt-4o", 16_384),
    ("claude-opus-4", 32_000),
    ("claude-sonnet-4", 64_000),
    ("claude-3-5-haiku", 8_192),
    ("gemini", 8_192),
];

pub fn model_token_limit(model: &str) -> Option<usize> {
    MODEL_TOKEN_LIMITS
        .iter()
        .find(|(key, _)| model.contains(key))
        .map(|(_, limit)| *limit)
}

/// Explicit budget, else the output table, else 2048.
pub fn resolve_max_tokens(model: &str, explicit: Option<u32>) -> u32 {
    explicit
        .or_else(|| {
            MODEL_OUTPUT_LIMITS
                .iter()
                .find(|(key, _)| model.contains(key))
                .map(|(_, limit)| *limit)
        })
        .unwrap_or(DEFAULT_MAX_TOKENS)
}

/// Inspect free-form provider error text for context-window overflow.
///
/// The provider prefix of `model` narrows which markers apply; an unknown
/// prefix checks all of them.
pub fn is_token_limit_exceeded(error_text: &str, model: &str) -> bool {
    let text = error_text.to_ascii_lowercase();
    let model = model.to_ascii_lowercase();

    if model.starts_with("openai:") {
        openai_marker(&text)
    } else if model.starts_with("anthropic:") {
        anthropic_marker(&text)
    } else if model.starts_with("google:") || model.starts_with("gemini:") {
        google_marker(&text)
    } else {
        openai_marker(&text) || anthropic_marker(&text) || google_marker(&text)
    }
}

pub(crate) fn openai_marker(text: &str) -> bool {
    text.contains("context_length_exceeded")
        || text.contains("maximum context length")
        || (text.contains("token") && (text.contains("reduce") || text.contains("too many")))
}

pub(crate) fn anthropic_marker(text: &str) -> bool {
    text.contains("prompt is too long")
}

pub(crate) fn google_marker(text: &str) -> bool {
    text.contains("resource_exhausted") || text.contains("resourceexhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_names_win_over_prefixes() {
        assert_eq!(model_token_limit("openai:gpt-4o-mini"), Some(128_000));
        assert_eq!(model_token_limit("openai:gpt-4.1"), Some(1_047_576));
        assert_eq!(model_token_limit("ollama:llama2"), Some(4_096));
        assert_eq!(model_token_limit("someone:unknown-model"), None);
    }

    #[test]
    fn explicit_budget_wins() {
        assert_eq!(resolve_max_tokens("openai:gpt-4.1", Some(10_000)), 10_000);
        assert_eq!(resolve_max_tokens("openai:gpt-4.1", None), 32_768);
        assert_eq!(resolve_max_tokens("local:tiny", None), 2048);
    }

    #[test]
    fn provider_markers() {
        assert!(is_token_limit_exceeded(
            "This model's maximum context length is 128000 tokens (context_length_exceeded)",
            "openai:gpt-4o"
        ));
        assert!(is_token_limit_exceeded(
            "prompt is too long: 210000 tokens > 200000 maximum",
            "anthropic:claude-sonnet-4"
        ));
        assert!(is_token_limit_exceeded("429 RESOURCE_EXHAUSTED", "google:gemini-1.5-pro"));
        assert!(!is_token_limit_exceeded("prompt is too long", "openai:gpt-4o"));
        assert!(!is_token_limit_exceeded("connection reset by peer", "mystery"));
    }
}
