//! Layered research configuration.
//!
//! Each invocation resolves one [`ResearchConfig`] by applying, in order and
//! exactly once: built-in defaults, the optional TOML file, call-site
//! overrides, then environment variables. Later layers win.

use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{ApiKeys, DeepResearchError};

const DEFAULT_CONFIG_PATH: &str = "deep-researcher.toml";
const CONFIG_PATH_ENV: &str = "DEEPRESEARCHER_CONFIG";

/// Which web search capability researchers get.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchApi {
    #[default]
    Tavily,
    Openai,
    Anthropic,
    None,
}

impl SearchApi {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchApi::Tavily => "tavily",
            SearchApi::Openai => "openai",
            SearchApi::Anthropic => "anthropic",
            SearchApi::None => "none",
        }
    }
}

impl FromStr for SearchApi {
    type Err = DeepResearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tavily" => Ok(SearchApi::Tavily),
            "openai" | "openai-native" => Ok(SearchApi::Openai),
            "anthropic" | "anthropic-native" => Ok(SearchApi::Anthropic),
            "none" | "" => Ok(SearchApi::None),
            other => Err(DeepResearchError::InvalidConfiguration(format!(
                "unknown search_api `{other}` (expected tavily, openai, anthropic or none)"
            ))),
        }
    }
}

/// External tool server settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, alias = "authRequired")]
    pub auth_required: bool,
}

/// A model id plus its output token budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub model: String,
    pub max_tokens: Option<u32>,
}

/// Fully resolved settings for one research invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_structured_output_retries: u32,
    pub allow_clarification: bool,
    pub max_concurrent_research_units: usize,
    pub search_api: SearchApi,
    pub max_researcher_iterations: u32,
    pub max_react_tool_calls: u32,
    pub summarization_model: String,
    pub summarization_model_max_tokens: Option<u32>,
    pub max_content_length: usize,
    pub research_model: String,
    pub research_model_max_tokens: Option<u32>,
    pub compression_model: String,
    pub compression_model_max_tokens: Option<u32>,
    pub final_report_model: String,
    pub final_report_model_max_tokens: Option<u32>,
    pub mcp_config: Option<McpConfig>,
    pub mcp_prompt: Option<String>,
    pub generate_outline: bool,
    pub webpage_summary_timeout_secs: u64,
    #[serde(skip)]
    pub api_keys: ApiKeys,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_structured_output_retries: 3,
            allow_clarification: true,
            max_concurrent_research_units: 5,
            search_api: SearchApi::Tavily,
            max_researcher_iterations: 6,
            max_react_tool_calls: 10,
            summarization_model: "openai:gpt-4.1-mini".into(),
            summarization_model_max_tokens: Some(8192),
            max_content_length: 50_000,
            research_model: "openai:gpt-4.1".into(),
            research_model_max_tokens: Some(10_000),
            compression_model: "openai:gpt-4.1".into(),
            compression_model_max_tokens: Some(8192),
            final_report_model: "openai:gpt-4.1".into(),
            final_report_model_max_tokens: Some(10_000),
            mcp_config: None,
            mcp_prompt: None,
            generate_outline: true,
            webpage_summary_timeout_secs: 60,
            api_keys: ApiKeys::default(),
        }
    }
}

impl ResearchConfig {
    pub fn research(&self) -> ModelSettings {
        ModelSettings {
            model: self.research_model.clone(),
            max_tokens: self.research_model_max_tokens,
        }
    }

    pub fn compression(&self) -> ModelSettings {
        ModelSettings {
            model: self.compression_model.clone(),
            max_tokens: self.compression_model_max_tokens,
        }
    }

    pub fn summarization(&self) -> ModelSettings {
        ModelSettings {
            model: self.summarization_model.clone(),
            max_tokens: self.summarization_model_max_tokens,
        }
    }

    pub fn final_report(&self) -> ModelSettings {
        ModelSettings {
            model: self.final_report_model.clone(),
            max_tokens: self.final_report_model_max_tokens,
        }
    }

    pub fn webpage_summary_timeout(&self) -> Duration {
        Duration::from_secs(self.webpage_summary_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), DeepResearchError> {
        let caps = [
            ("max_concurrent_research_units", self.max_concurrent_research_units as u64),
            ("max_researcher_iterations", self.max_researcher_iterations as u64),
            ("max_react_tool_calls", self.max_react_tool_calls as u64),
            ("max_structured_output_retries", self.max_structured_output_retries as u64),
            ("max_content_length", self.max_content_length as u64),
            ("webpage_summary_timeout_secs", self.webpage_summary_timeout_secs),
        ];
        if let Some((name, _)) = caps.iter().find(|(_, value)| *value == 0) {
            return Err(DeepResearchError::InvalidConfiguration(format!(
                "{name} must be at least 1"
            )));
        }

        let models = [
            ("summarization_model", &self.summarization_model),
            ("research_model", &self.research_model),
            ("compression_model", &self.compression_model),
            ("final_report_model", &self.final_report_model),
        ];
        if let Some((name, _)) = models.iter().find(|(_, model)| model.trim().is_empty()) {
            return Err(DeepResearchError::InvalidConfiguration(format!(
                "{name} must not be empty"
            )));
        }

        if let Some(mcp) = &self.mcp_config
            && mcp.url.as_deref().is_some_and(|url| url.trim().is_empty())
        {
            return Err(DeepResearchError::InvalidConfiguration(
                "mcp_config.url must not be empty when set".into(),
            ));
        }

        Ok(())
    }
}

/// One configuration layer. Unset fields leave lower layers untouched.
///
/// Field names are snake_case; camelCase aliases let HTTP clients send the
/// shape web front ends use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, alias = "maxStructuredOutputRetries", skip_serializing_if = "Option::is_none")]
    pub max_structured_output_retries: Option<u32>,
    #[serde(default, alias = "allowClarification", skip_serializing_if = "Option::is_none")]
    pub allow_clarification: Option<bool>,
    #[serde(default, alias = "maxConcurrentResearchUnits", skip_serializing_if = "Option::is_none")]
    pub max_concurrent_research_units: Option<usize>,
    #[serde(default, alias = "searchApi", skip_serializing_if = "Option::is_none")]
    pub search_api: Option<SearchApi>,
    #[serde(default, alias = "maxResearcherIterations", skip_serializing_if = "Option::is_none")]
    pub max_researcher_iterations: Option<u32>,
    #[serde(default, alias = "maxReactToolCalls", skip_serializing_if = "Option::is_none")]
    pub max_react_tool_calls: Option<u32>,
    #[serde(default, alias = "summarizationModel", skip_serializing_if = "Option::is_none")]
    pub summarization_model: Option<String>,
    #[serde(default, alias = "summarizationModelMaxTokens", skip_serializing_if = "Option::is_none")]
    pub summarization_model_max_tokens: Option<u32>,
    #[serde(default, alias = "maxContentLength", skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<usize>,
    #[serde(default, alias = "researchModel", skip_serializing_if = "Option::is_none")]
    pub research_model: Option<String>,
    #[serde(default, alias = "researchModelMaxTokens", skip_serializing_if = "Option::is_none")]
    pub research_model_max_tokens: Option<u32>,
    #[serde(default, alias = "compressionModel", skip_serializing_if = "Option::is_none")]
    pub compression_model: Option<String>,
    #[serde(default, alias = "compressionModelMaxTokens", skip_serializing_if = "Option::is_none")]
    pub compression_model_max_tokens: Option<u32>,
    #[serde(default, alias = "finalReportModel", skip_serializing_if = "Option::is_none")]
    pub final_report_model: Option<String>,
    #[serde(default, alias = "finalReportModelMaxTokens", skip_serializing_if = "Option::is_none")]
    pub final_report_model_max_tokens: Option<u32>,
    #[serde(default, alias = "mcpConfig", skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<McpConfig>,
    #[serde(default, alias = "mcpPrompt", skip_serializing_if = "Option::is_none")]
    pub mcp_prompt: Option<String>,
    #[serde(default, alias = "generateOutline", skip_serializing_if = "Option::is_none")]
    pub generate_outline: Option<bool>,
    #[serde(default, alias = "webpageSummaryTimeoutSecs", skip_serializing_if = "Option::is_none")]
    pub webpage_summary_timeout_secs: Option<u64>,
    #[serde(default, alias = "apiKeys", skip_serializing)]
    pub api_keys: Option<ApiKeys>,
}

macro_rules! overlay {
    ($target:expr, $layer:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = $layer.$field.clone() {
                $target.$field = value;
            }
        )*
    };
}

macro_rules! overlay_optional {
    ($target:expr, $layer:expr, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = $layer.$field.clone() {
                $target.$field = Some(value);
            }
        )*
    };
}

impl ConfigOverrides {
    /// Apply this layer on top of `config`.
    pub fn apply_to(&self, config: &mut ResearchConfig) {
        overlay!(
            config,
            self,
            [
                max_structured_output_retries,
                allow_clarification,
                max_concurrent_research_units,
                search_api,
                max_researcher_iterations,
                max_react_tool_calls,
                summarization_model,
                max_content_length,
                research_model,
                compression_model,
                final_report_model,
                generate_outline,
                webpage_summary_timeout_secs,
            ]
        );
        overlay_optional!(
            config,
            self,
            [
                summarization_model_max_tokens,
                research_model_max_tokens,
                compression_model_max_tokens,
                final_report_model_max_tokens,
                mcp_config,
                mcp_prompt,
            ]
        );
        if let Some(keys) = &self.api_keys {
            config.api_keys = config.api_keys.merged(keys);
        }
    }

    /// Merge `other` over `self`, producing a single layer.
    pub fn merged(&self, other: &ConfigOverrides) -> ConfigOverrides {
        let mut merged = self.clone();
        overlay_optional!(
            merged,
            other,
            [
                max_structured_output_retries,
                allow_clarification,
                max_concurrent_research_units,
                search_api,
                max_researcher_iterations,
                max_react_tool_calls,
                summarization_model,
                summarization_model_max_tokens,
                max_content_length,
                research_model,
                research_model_max_tokens,
                compression_model,
                compression_model_max_tokens,
                final_report_model,
                final_report_model_max_tokens,
                mcp_config,
                mcp_prompt,
                generate_outline,
                webpage_summary_timeout_secs,
                api_keys,
            ]
        );
        merged
    }

    /// Copy safe to persist: credentials are dropped.
    pub fn snapshot(&self) -> ConfigOverrides {
        ConfigOverrides {
            api_keys: None,
            ..self.clone()
        }
    }

    /// Read the environment layer from the process environment.
    pub fn from_env() -> Result<Self, DeepResearchError> {
        Self::from_env_with(|name| env::var(name).ok())
    }

    /// Read the environment layer through `lookup` (UPPER_SNAKE variable names).
    pub fn from_env_with<F>(lookup: F) -> Result<Self, DeepResearchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut layer = ConfigOverrides {
            max_structured_output_retries: parse_env(&get, "MAX_STRUCTURED_OUTPUT_RETRIES")?,
            allow_clarification: parse_bool_env(&get, "ALLOW_CLARIFICATION")?,
            max_concurrent_research_units: parse_env(&get, "MAX_CONCURRENT_RESEARCH_UNITS")?,
            search_api: get("SEARCH_API")
                .map(|value| value.parse::<SearchApi>())
                .transpose()?,
            max_researcher_iterations: parse_env(&get, "MAX_RESEARCHER_ITERATIONS")?,
            max_react_tool_calls: parse_env(&get, "MAX_REACT_TOOL_CALLS")?,
            summarization_model: get("SUMMARIZATION_MODEL"),
            summarization_model_max_tokens: parse_env(&get, "SUMMARIZATION_MODEL_MAX_TOKENS")?,
            max_content_length: parse_env(&get, "MAX_CONTENT_LENGTH")?,
            research_model: get("RESEARCH_MODEL"),
            research_model_max_tokens: parse_env(&get, "RESEARCH_MODEL_MAX_TOKENS")?,
            compression_model: get("COMPRESSION_MODEL"),
            compression_model_max_tokens: parse_env(&get, "COMPRESSION_MODEL_MAX_TOKENS")?,
            final_report_model: get("FINAL_REPORT_MODEL"),
            final_report_model_max_tokens: parse_env(&get, "FINAL_REPORT_MODEL_MAX_TOKENS")?,
            mcp_config: None,
            mcp_prompt: get("MCP_PROMPT"),
            generate_outline: parse_bool_env(&get, "GENERATE_OUTLINE")?,
            webpage_summary_timeout_secs: parse_env(&get, "WEBPAGE_SUMMARY_TIMEOUT_SECS")?,
            api_keys: None,
        };

        if let Some(raw) = get("MCP_CONFIG") {
            let parsed: McpConfig = serde_json::from_str(&raw).map_err(|err| {
                DeepResearchError::InvalidConfiguration(format!("MCP_CONFIG is not valid JSON: {err}"))
            })?;
            layer.mcp_config = Some(parsed);
        } else if let Some(url) = get("MCP_URL") {
            layer.mcp_config = Some(McpConfig {
                url: Some(url),
                tools: get("MCP_TOOLS")
                    .map(|value| {
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                auth_required: parse_bool_env(&get, "MCP_AUTH_REQUIRED")?.unwrap_or(false),
            });
        }

        Ok(layer)
    }
}

fn parse_env<T, F>(get: &F, name: &str) -> Result<Option<T>, DeepResearchError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                DeepResearchError::InvalidConfiguration(format!("{name} has invalid value `{raw}`"))
            })
        })
        .transpose()
}

fn parse_bool_env<F>(get: &F, name: &str) -> Result<Option<bool>, DeepResearchError>
where
    F: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(DeepResearchError::InvalidConfiguration(format!(
                "{name} must be true or false, got `{raw}`"
            ))),
        })
        .transpose()
}

/// Loads the optional TOML layer.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the file layer from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPRESEARCHER_CONFIG` environment variable.
    /// 3. `deep-researcher.toml` in the current working directory.
    ///
    /// A missing default file yields an empty layer; a missing explicit file is an error.
    pub fn load(path: Option<PathBuf>) -> Result<ConfigOverrides, DeepResearchError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            return Ok(ConfigOverrides::default());
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DeepResearchError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<ConfigOverrides, DeepResearchError> {
        let layer: ConfigOverrides = toml::from_str(raw)
            .map_err(|err| DeepResearchError::InvalidConfiguration(err.to_string()))?;
        if layer.api_keys.is_some() {
            return Err(DeepResearchError::InvalidConfiguration(
                "api keys must come from the environment, not the config file".into(),
            ));
        }
        Ok(layer)
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV)
        && !from_env.trim().is_empty()
    {
        return (PathBuf::from(from_env), true);
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

/// Resolves one [`ResearchConfig`] per invocation.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    file_layer: ConfigOverrides,
}

impl ConfigResolver {
    pub fn new(file_layer: ConfigOverrides) -> Self {
        Self { file_layer }
    }

    pub fn from_file(path: Option<PathBuf>) -> Result<Self, DeepResearchError> {
        Ok(Self::new(ConfigLoader::load(path)?))
    }

    /// defaults < file < call-site < process environment.
    pub fn resolve(&self, call_site: &ConfigOverrides) -> Result<ResearchConfig, DeepResearchError> {
        let env_layer = ConfigOverrides::from_env()?;
        self.resolve_with_env(call_site, &env_layer)
    }

    pub fn resolve_with_env(
        &self,
        call_site: &ConfigOverrides,
        env_layer: &ConfigOverrides,
    ) -> Result<ResearchConfig, DeepResearchError> {
        let mut config = ResearchConfig::default();
        for layer in [&self.file_layer, call_site, env_layer] {
            layer.apply_to(&mut config);
        }
        config.validate()?;
        Ok(config)
    }
}
