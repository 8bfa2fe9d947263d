//! Product catalog lookup and the assistant configuration built from it.
//! Fetched once at startup; any failure falls back to a built-in default so
//! the kiosk always has greetings, suggestions and a system prompt.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::CatalogConfig;

/// Appended to every system prompt. Tells the model when to stay silent.
pub const NO_RESPONSE_RULE: &str = "\n如果用户的话不是对你说的、没有实际内容、或者只是环境噪音、\
或者是你自己刚才说过的话，请只回复 [NO_RESPONSE]，不要回复任何其他内容。";

/// Marker the model emits when no spoken reply is wanted.
pub const NO_RESPONSE_MARKER: &str = "[NO_RESPONSE]";

const DEFAULT_PROMPT: &str = "你是一个友好的咖啡店助手。";
const DEFAULT_GREETINGS: [&str; 3] = ["欢迎光临", "您好", "欢迎"];
const DEFAULT_SUGGESTIONS: [&str; 3] = ["需要推荐吗?", "要试试我们的招牌饮品吗?", "有什么可以帮您的?"];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog entry not found")]
    NotFound,
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed catalog response: {0}")]
    Malformed(String),
}

/// One machine's catalog record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CatalogEntry {
    pub products: Vec<String>,
    pub prompt: String,
    pub greetings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl CatalogEntry {
    fn is_complete(&self) -> bool {
        !self.products.is_empty()
            && !self.prompt.trim().is_empty()
            && !self.greetings.is_empty()
            && !self.suggestions.is_empty()
    }
}

#[derive(Deserialize)]
struct CatalogResponse {
    code: i64,
    data: Option<CatalogEntry>,
}

pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(cfg: &CatalogConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn entry_url(&self, id: &str) -> String {
        format!(
            "{}/screen/ai-assistant/detail/{id}?machineId={id}",
            self.base_url
        )
    }

    pub async fn fetch_by_id(&self, id: &str) -> Result<CatalogEntry, CatalogError> {
        let response = self.http.get(self.entry_url(id)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound);
        }
        let body = response.text().await?;
        parse_response(status.as_u16(), &body)
    }
}

fn parse_response(status: u16, body: &str) -> Result<CatalogEntry, CatalogError> {
    let parsed: CatalogResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) if status != 200 => return Err(CatalogError::Status(status)),
        Err(e) => return Err(CatalogError::Malformed(e.to_string())),
    };
    if parsed.code == 1 {
        return Err(CatalogError::NotFound);
    }
    if status != 200 {
        return Err(CatalogError::Status(status));
    }
    parsed
        .data
        .ok_or_else(|| CatalogError::Malformed("missing data".into()))
}

/// Greetings, suggestions and system prompt shared by every speaking unit.
/// Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantConfig {
    pub greetings: Vec<String>,
    pub suggestions: Vec<String>,
    pub system_prompt: String,
    pub products: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            greetings: DEFAULT_GREETINGS.iter().map(|s| s.to_string()).collect(),
            suggestions: DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()).collect(),
            system_prompt: format!("{DEFAULT_PROMPT}{NO_RESPONSE_RULE}"),
            products: Vec::new(),
        }
    }
}

impl AssistantConfig {
    /// Use the catalog entry if it is complete, otherwise the default.
    pub fn resolve(fetched: Result<CatalogEntry, CatalogError>) -> Self {
        match fetched {
            Ok(entry) if entry.is_complete() => {
                info!(
                    products = entry.products.len(),
                    greetings = entry.greetings.len(),
                    suggestions = entry.suggestions.len(),
                    "catalog loaded"
                );
                let system_prompt = format!(
                    "{}你可以推荐以下饮品：\n{}{NO_RESPONSE_RULE}",
                    entry.prompt,
                    entry.products.join(",")
                );
                Self {
                    greetings: entry.greetings,
                    suggestions: entry.suggestions,
                    system_prompt,
                    products: entry.products,
                }
            }
            Ok(_) => {
                warn!("catalog entry incomplete, using default assistant config");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "catalog unavailable, using default assistant config");
                Self::default()
            }
        }
    }

    pub fn pick_greeting<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.greetings.choose(rng).map(String::as_str)
    }

    pub fn pick_suggestion<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.suggestions.choose(rng).map(String::as_str)
    }
}
