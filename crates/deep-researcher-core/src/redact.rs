//! Secret scrubbing for text that leaves the process (tool results, error events).

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("api_key", r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("secret", r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)"),
        ("bearer", r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)"),
        ("sk_token", r"(sk-[A-Za-z0-9\-_]{16,})"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("invalid redaction regex")))
    .collect()
});

/// Replace credential-looking fragments with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    redact_with_report(input).0
}

/// Same as [`redact_secrets`] but also reports which patterns fired.
pub fn redact_with_report(input: &str) -> (String, BTreeSet<&'static str>) {
    let mut output = input.to_string();
    let mut fired = BTreeSet::new();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        if !regex.is_match(&output) {
            continue;
        }
        fired.insert(*name);
        output = regex
            .replace_all(&output, |caps: &Captures| {
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
    }
    (output, fired)
}
