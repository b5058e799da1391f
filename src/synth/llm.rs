//! Synthesizer backed by an external generation service.
//!
//! Speaks the Anthropic messages API (the default) or any OpenAI-compatible
//! chat completions endpoint. The service is told the schema, the rule table
//! and the mode constraints, and must answer with
//! `{"sql": ..., "param_order": [...], "cursor_column": ...}`. Its output is
//! untrusted: the pipeline shape-checks and gates it like any other plan.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{SqlPlan, SynthesisMode, SynthesisRequest, Synthesizer, CURSOR_KEY};
use crate::config::SynthesizerSettings;
use crate::error::SynthesisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub api_url: String,
    pub max_tokens: u32,
    pub provider: LlmProvider,
}

impl LlmConfig {
    pub fn new(settings: &SynthesizerSettings, api_key: String) -> Self {
        let (default_model, default_url) = match settings.provider {
            LlmProvider::OpenAI => ("gpt-4o", "https://api.openai.com/v1/chat/completions"),
            LlmProvider::Anthropic => (
                "claude-sonnet-4-20250514",
                "https://api.anthropic.com/v1/messages",
            ),
        };
        Self {
            api_key,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            api_url: settings
                .api_url
                .clone()
                .unwrap_or_else(|| default_url.to_string()),
            max_tokens: settings.max_tokens,
            provider: settings.provider,
        }
    }

    /// Read the API key from the environment variable named in the settings.
    /// Returns None if it is unset or empty.
    pub fn from_settings(settings: &SynthesizerSettings) -> Option<Self> {
        let key = std::env::var(&settings.api_key_env).ok()?;
        if key.is_empty() {
            return None;
        }
        Some(Self::new(settings, key))
    }
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One request body serves both providers: Anthropic takes the system
/// prompt at the top level, OpenAI-compatible servers as the first turn.
#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Turn<'a>>,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'a str,
    content: &'a str,
}

/// Union of both answer shapes; whichever the provider filled is read.
#[derive(Debug, Deserialize)]
struct Completion {
    /// Anthropic: `content[].text`
    #[serde(default)]
    content: Vec<TextPart>,
    /// OpenAI: `choices[].message.content`
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: TextPart,
}

impl Completion {
    fn into_text(self) -> String {
        self.content
            .into_iter()
            .chain(self.choices.into_iter().map(|c| c.message))
            .filter_map(|part| part.text.or(part.content))
            .collect()
    }
}

impl<'a> CompletionBody<'a> {
    fn new(config: &'a LlmConfig, system: &'a str, user: &'a str) -> Self {
        let (system, messages) = match config.provider {
            LlmProvider::Anthropic => (Some(system), vec![Turn { role: "user", content: user }]),
            LlmProvider::OpenAI => (
                None,
                vec![
                    Turn {
                        role: "system",
                        content: system,
                    },
                    Turn { role: "user", content: user },
                ],
            ),
        };
        Self {
            model: &config.model,
            max_tokens: config.max_tokens,
            system,
            messages,
        }
    }
}

/// What the generation service must answer with.
#[derive(Debug, Deserialize)]
struct GeneratedPlan {
    sql: String,
    #[serde(default)]
    param_order: Vec<String>,
    #[serde(default)]
    cursor_column: Option<String>,
}

pub struct LlmSynthesizer {
    client: Client,
    config: LlmConfig,
}

impl LlmSynthesizer {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, SynthesisError> {
        let config = &self.config;
        let request = self.client.post(&config.api_url);
        let request = match config.provider {
            LlmProvider::Anthropic => request
                .header("x-api-key", &config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            LlmProvider::OpenAI => request.bearer_auth(&config.api_key),
        };
        let response = request
            .json(&CompletionBody::new(config, system, user))
            .send()
            .await
            .map_err(|e| SynthesisError::Upstream(format!("{}: {}", config.api_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Upstream(format!("{} {}", status, detail.trim())));
        }
        let completion: Completion = response
            .json()
            .await
            .map_err(|e| SynthesisError::Upstream(format!("unreadable answer: {}", e)))?;
        let text = completion.into_text();
        if text.trim().is_empty() {
            return Err(SynthesisError::Upstream("empty answer".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    fn name(&self) -> &str {
        "llm"
    }

    async fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<SqlPlan, SynthesisError> {
        if request.template.is_null() {
            return Err(SynthesisError::InvalidTemplate);
        }
        let system = system_prompt(request);
        let user = user_prompt(request);
        let answer = self.complete(&system, &user).await?;
        let plan = parse_plan(&answer)?;
        tracing::debug!(
            requester = request.requester,
            mode = request.mode.label(),
            model = %self.config.model,
            sql = %plan.sql,
            "generated"
        );
        Ok(plan)
    }
}

fn system_prompt(request: &SynthesisRequest<'_>) -> String {
    format!(
        "You write one read-only PostgreSQL SELECT statement that fills a JSON template.\n\
         Rules:\n\
         - Only SELECT. Never DROP, DELETE, TRUNCATE, ALTER, CREATE, INSERT or UPDATE.\n\
         - Only the tables and joins listed below, with the aliases given.\n\
         - Every value from the payload is a placeholder $1..$n bound as text; cast on the \
           server side, e.g. $1::text::uuid.\n\
         - Alias every projected column to the canonical field name from the business rules.\n\
         - Answer with JSON only: {{\"sql\": string, \"param_order\": [payload keys for $1..$n], \
           \"cursor_column\": string or null}}.\n\n\
         SCHEMA\n{}\nBUSINESS RULES\n{}",
        request.schema.render(),
        request.rules.render()
    )
}

fn mode_constraints(mode: &SynthesisMode) -> String {
    match mode {
        SynthesisMode::Point => {
            "Mode: point lookup. Return the rows that fill the template; use LIMIT 1 when the \
             template describes a single object without lists."
                .to_string()
        }
        SynthesisMode::Batch { cursor, page_size } => {
            let bound = if cursor.is_some() {
                format!(
                    "Filter primary_key > the `{}` payload key (bind it as a placeholder).",
                    CURSOR_KEY
                )
            } else {
                "First page: no cursor filter.".to_string()
            };
            format!(
                "Mode: batch page. {} ORDER BY the root primary key ASC, LIMIT {}. \
                 Project the primary key and report its alias as cursor_column.",
                bound, page_size
            )
        }
        SynthesisMode::Count => {
            "Mode: count. Return SELECT COUNT(*) over the same filters as the batch query, \
             without any cursor bound and without json_agg or array_agg."
                .to_string()
        }
    }
}

fn user_prompt(request: &SynthesisRequest<'_>) -> String {
    let payload = serde_json::to_string_pretty(request.payload).unwrap_or_default();
    let template = serde_json::to_string_pretty(&request.template.to_value()).unwrap_or_default();
    format!(
        "{}\n\nRequester: {}\nPayload:\n{}\nTemplate:\n{}",
        mode_constraints(&request.mode),
        request.requester,
        payload,
        template
    )
}

/// Strip markdown code fences if present.
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    for fence in ["```json", "```sql", "```"] {
        if let Some(rest) = trimmed.strip_prefix(fence) {
            if let Some(body) = rest.strip_suffix("```") {
                return body.trim();
            }
        }
    }
    trimmed
}

fn parse_plan(answer: &str) -> Result<SqlPlan, SynthesisError> {
    let generated: GeneratedPlan = serde_json::from_str(extract_json(answer))
        .map_err(|e| SynthesisError::Unusable(format!("expected a JSON plan: {}", e)))?;
    let sql = generated.sql.trim().trim_end_matches(';').trim().to_string();
    if sql.is_empty() {
        return Err(SynthesisError::Unusable("empty sql".into()));
    }
    Ok(SqlPlan {
        sql,
        param_order: generated.param_order,
        cursor_column: generated.cursor_column.filter(|c| !c.is_empty()),
        entity: None,
    })
}
