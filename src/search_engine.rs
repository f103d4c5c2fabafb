use std::time::Duration;

use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::errors::{ConfigError, LookupError};
use crate::input_loader::Query;
use crate::locale::LocaleConfig;

pub const DEFAULT_ENDPOINT: &str = "https://serpapi.com/search.json";
pub const DEFAULT_ENGINE: &str = "google";

/// Anything that can turn one query into a structured result bundle.
///
/// Implementations perform exactly one remote call per `lookup` and never
/// retry; an `Ok` with no data and an `Err` must stay distinguishable.
pub trait SearchBackend: Send + Sync {
    fn lookup(&self, query: &Query, locale: &LocaleConfig) -> Result<RawResult, LookupError>;
}

/// The parts of a search response this tool reads. Everything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    #[serde(default)]
    pub organic_results: Vec<OrganicResult>,
    #[serde(default)]
    pub answer_box: Option<AnswerBox>,
    #[serde(default)]
    pub featured_snippet: Option<AnswerBox>,
    #[serde(default)]
    pub related_questions: Vec<RelatedQuestion>,
    #[serde(default, skip_serializing)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganicResult {
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerBox {
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub snippet: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub answer: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub list: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub link: Option<String>,
}

impl AnswerBox {
    pub fn is_empty(&self) -> bool {
        [&self.title, &self.snippet, &self.answer, &self.list, &self.link]
            .iter()
            .all(|f| f.is_none())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatedQuestion {
    #[serde(default, deserialize_with = "lenient_text")]
    pub question: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub snippet: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub answer: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub list: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub link: Option<String>,
}

impl RawResult {
    pub fn is_empty(&self) -> bool {
        self.organic_results.is_empty()
            && self.answer_box.as_ref().map_or(true, AnswerBox::is_empty)
            && self.featured_snippet.as_ref().map_or(true, AnswerBox::is_empty)
            && self.related_questions.is_empty()
    }
}

// Text fields come back as strings, numbers or string arrays depending on the
// answer type; collapse all of them to one string. Blank means absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let text = match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.trim().is_empty())
                .collect();
            Some(parts.join("; "))
        }
        _ => None,
    };
    Ok(text.filter(|s| !s.trim().is_empty()))
}

/// SerpApi reports "no results" through its `error` field with a success
/// status; that is an empty result, not a failed call.
fn is_no_results_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("hasn't returned any results") || lower.contains("no results")
}

/// Parses a response body into a `RawResult`, mapping API-reported errors.
pub fn parse_response(body: &str) -> Result<RawResult, LookupError> {
    let raw: RawResult =
        serde_json::from_str(body).map_err(|e| LookupError::Malformed(e.to_string()))?;

    match raw.error.as_deref() {
        Some(message) if is_no_results_error(message) => {
            debug!("API reported no results: {}", message);
            Ok(RawResult::default())
        }
        Some(message) => Err(LookupError::Api(message.to_string())),
        None => Ok(raw),
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct SerpApiClient {
    client: Client,
    endpoint: Url,
    engine: String,
    api_key: String,
}

impl SerpApiClient {
    /// Fails fast when the credential is blank so no call is ever attempted
    /// without one.
    pub fn new(
        api_key: &str,
        endpoint: &str,
        engine: &str,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        let endpoint = Url::parse(endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(endpoint.to_string(), e))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("serp-harvester/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(SerpApiClient {
            client,
            endpoint,
            engine: engine.trim().to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn params<'a>(&'a self, query: &'a Query, locale: &'a LocaleConfig, num: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![
            ("engine", self.engine.as_str()),
            ("q", query.as_str()),
            ("hl", locale.language.as_str()),
            ("gl", locale.country.as_str()),
            ("num", num),
        ];
        if let Some(location) = locale.location.as_deref() {
            params.push(("location", location));
        }
        if let Some(domain) = locale.google_domain.as_deref() {
            params.push(("google_domain", domain));
        }
        params.push(("api_key", self.api_key.as_str()));
        params
    }
}

impl SearchBackend for SerpApiClient {
    fn lookup(&self, query: &Query, locale: &LocaleConfig) -> Result<RawResult, LookupError> {
        let num = locale.num.to_string();
        let params = self.params(query, locale, &num);

        info!("Searching for: '{}' (hl={}, gl={})", query, locale.language, locale.country);

        // The request URL carries the key; keep it out of error messages.
        let resp = self
            .client
            .get(self.endpoint.clone())
            .query(&params)
            .send()
            .map_err(|e| LookupError::Transport(e.without_url()))?;

        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| LookupError::Transport(e.without_url()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| body.chars().take(200).collect());
            warn!("Search failed for '{}' with status {}: {}", query, status, message);
            return Err(LookupError::Status {
                status: status.as_u16(),
                message,
            });
        }

        parse_response(&body)
    }
}
