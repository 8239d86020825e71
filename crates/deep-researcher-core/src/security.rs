use std::{collections::HashMap, env};

use serde::Deserialize;

use crate::DeepResearchError;

/// Environment flag that switches key lookup from process env to call-site keys.
pub const KEYS_FROM_CONFIG_ENV: &str = "GET_API_KEYS_FROM_CONFIG";

/// Wrapper around sensitive values to reduce accidental logging.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, DeepResearchError> {
    optional_env(var).ok_or_else(|| DeepResearchError::MissingSecret(var.to_string()))
}

pub fn optional_env(var: &str) -> Option<SecretValue> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(SecretValue(value)),
        _ => None,
    }
}

/// Provider credentials for one invocation.
///
/// Keys come from the process environment unless `GET_API_KEYS_FROM_CONFIG`
/// is enabled, in which case only the call-site map is consulted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeys {
    #[serde(flatten)]
    keys: HashMap<String, SecretValue>,
    #[serde(skip)]
    from_config: Option<bool>,
}

impl ApiKeys {
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            keys: entries
                .into_iter()
                .map(|(k, v)| (k.into(), SecretValue::new(v)))
                .collect(),
            from_config: None,
        }
    }

    /// Pin the lookup source instead of reading `GET_API_KEYS_FROM_CONFIG`.
    pub fn with_source_from_config(mut self, from_config: bool) -> Self {
        self.from_config = Some(from_config);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Merge `other` over `self`; keys in `other` win.
    pub fn merged(&self, other: &ApiKeys) -> ApiKeys {
        let mut keys = self.keys.clone();
        keys.extend(other.keys.iter().map(|(k, v)| (k.clone(), v.clone())));
        ApiKeys {
            keys,
            from_config: other.from_config.or(self.from_config),
        }
    }

    pub fn lookup(&self, var: &str) -> Option<SecretValue> {
        self.lookup_with(var, |name| env::var(name).ok())
    }

    pub fn lookup_with<F>(&self, var: &str, env_lookup: F) -> Option<SecretValue>
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_config = self.from_config.unwrap_or_else(|| {
            env_lookup(KEYS_FROM_CONFIG_ENV)
                .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        });

        if from_config {
            return self
                .keys
                .get(var)
                .filter(|value| !value.expose().trim().is_empty())
                .cloned();
        }

        env_lookup(var)
            .filter(|value| !value.trim().is_empty())
            .map(SecretValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn require_env_success() {
        unsafe { std::env::set_var("DEEP_RESEARCHER_TEST_SECRET", "value") };
        let secret = require_env("DEEP_RESEARCHER_TEST_SECRET").expect("secret should load");
        assert_eq!(secret.expose(), "value");
        unsafe { std::env::remove_var("DEEP_RESEARCHER_TEST_SECRET") };
    }

    #[test]
    #[serial]
    fn require_env_missing() {
        unsafe { std::env::remove_var("DEEP_RESEARCHER_TEST_SECRET_MISSING") };
        let err = require_env("DEEP_RESEARCHER_TEST_SECRET_MISSING").unwrap_err();
        assert!(matches!(err, DeepResearchError::MissingSecret(_)));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretValue::new("sk-live");
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }

    #[test]
    fn keys_come_from_env_by_default() {
        let keys = ApiKeys::from_map([("OPENAI_API_KEY", "from-config")]);
        let found = keys
            .lookup_with("OPENAI_API_KEY", |name| {
                (name == "OPENAI_API_KEY").then(|| "from-env".to_string())
            })
            .expect("key present");
        assert_eq!(found.expose(), "from-env");
    }

    #[test]
    fn keys_come_from_config_when_flagged() {
        let keys = ApiKeys::from_map([("OPENAI_API_KEY", "from-config")]);
        let found = keys
            .lookup_with("OPENAI_API_KEY", |name| match name {
                KEYS_FROM_CONFIG_ENV => Some("true".into()),
                _ => Some("from-env".into()),
            })
            .expect("key present");
        assert_eq!(found.expose(), "from-config");
        assert!(
            keys.lookup_with("ANTHROPIC_API_KEY", |name| {
                (name == KEYS_FROM_CONFIG_ENV).then(|| "1".into())
            })
            .is_none()
        );
    }
}
