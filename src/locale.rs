use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const DEFAULT_WORKERS: usize = 8;
pub const MAX_WORKERS: usize = 16;
pub const MAX_RESULTS: u8 = 100;

/// Which fragment of a search response a run extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Organic result URLs.
    Links,
    /// Featured snippet / answer box ("position zero").
    Snippet,
    /// "People also ask" blocks.
    Question,
}

impl ExtractionMode {
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            ExtractionMode::Links => &["URL"],
            ExtractionMode::Snippet => &["Query", "Content"],
            ExtractionMode::Question => &["Query", "Question", "Answer", "Source"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Links => "links",
            ExtractionMode::Snippet => "snippet",
            ExtractionMode::Question => "question",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run search parameters. Part of the cache key, so two runs only share
/// results when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleConfig {
    /// Interface language (`hl`).
    pub language: String,
    /// Country / geolocation (`gl`).
    pub country: String,
    /// Free-form location name understood by the API, e.g. "France".
    /// Derived from `country` when unset.
    pub location: Option<String>,
    /// Derived from `country` when unset.
    pub google_domain: Option<String>,
    /// Result-count hint (`num`).
    pub num: u8,
    pub workers: usize,
}

impl Default for LocaleConfig {
    fn default() -> Self {
        LocaleConfig {
            language: "fr".to_string(),
            country: "fr".to_string(),
            location: None,
            google_domain: None,
            num: 10,
            workers: DEFAULT_WORKERS,
        }
    }
}

// (country, location, google domain)
const COUNTRY_DEFAULTS: &[(&str, &str, &str)] = &[
    ("fr", "France", "google.fr"),
    ("be", "Belgium", "google.be"),
    ("ch", "Switzerland", "google.ch"),
    ("ca", "Canada", "google.ca"),
    ("us", "United States", "google.com"),
    ("gb", "United Kingdom", "google.co.uk"),
    ("de", "Germany", "google.de"),
    ("es", "Spain", "google.es"),
    ("it", "Italy", "google.it"),
    ("nl", "Netherlands", "google.nl"),
    ("pt", "Portugal", "google.pt"),
    ("br", "Brazil", "google.com.br"),
];

fn country_defaults(country: &str) -> Option<(&'static str, &'static str)> {
    COUNTRY_DEFAULTS
        .iter()
        .find(|(code, _, _)| *code == country)
        .map(|&(_, location, domain)| (location, domain))
}

fn language_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "fr", "en", "pt-br", "zh-tw"
    RE.get_or_init(|| Regex::new(r"^[a-z]{2,3}(-[a-z]{2,4})?$").expect("language pattern"))
}

fn country_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]{2}$").expect("country pattern"))
}

impl LocaleConfig {
    pub fn new(language: &str, country: &str, num: u8, workers: usize) -> Self {
        LocaleConfig {
            language: language.to_string(),
            country: country.to_string(),
            location: None,
            google_domain: None,
            num,
            workers,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_google_domain(mut self, domain: impl Into<String>) -> Self {
        self.google_domain = Some(domain.into());
        self
    }

    /// Normalizes the codes (trim + lowercase, blank optionals dropped) and
    /// rejects values the API would refuse. An unset location or domain
    /// follows the country; unknown countries get neither.
    pub fn validated(&self) -> Result<LocaleConfig, ConfigError> {
        let language = self.language.trim().to_lowercase();
        if !language_regex().is_match(&language) {
            return Err(ConfigError::InvalidLocale {
                field: "language",
                value: self.language.clone(),
                reason: "expected a code like \"fr\" or \"pt-br\"",
            });
        }

        let country = self.country.trim().to_lowercase();
        if !country_regex().is_match(&country) {
            return Err(ConfigError::InvalidLocale {
                field: "country",
                value: self.country.clone(),
                reason: "expected a two-letter code like \"fr\"",
            });
        }

        if self.num == 0 || self.num > MAX_RESULTS {
            return Err(ConfigError::InvalidLocale {
                field: "result count",
                value: self.num.to_string(),
                reason: "must be between 1 and 100",
            });
        }

        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidLocale {
                field: "worker count",
                value: self.workers.to_string(),
                reason: "must be between 1 and 16",
            });
        }

        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let derived = country_defaults(&country);
        let location = non_blank(&self.location)
            .or_else(|| derived.map(|(location, _)| location.to_string()));
        let google_domain = non_blank(&self.google_domain)
            .map(|d| d.to_lowercase())
            .or_else(|| derived.map(|(_, domain)| domain.to_string()));

        Ok(LocaleConfig {
            language,
            country,
            location,
            google_domain,
            num: self.num,
            workers: self.workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let locale = LocaleConfig::default().validated().unwrap();
        assert_eq!(locale.language, "fr");
        assert_eq!(locale.country, "fr");
        assert_eq!(locale.workers, DEFAULT_WORKERS);
        assert_eq!(locale.location.as_deref(), Some("France"));
        assert_eq!(locale.google_domain.as_deref(), Some("google.fr"));
    }

    #[test]
    fn test_geo_follows_country() {
        let form: LocaleConfig =
            serde_json::from_str(r#"{"language": "en", "country": "us"}"#).unwrap();
        let locale = form.validated().unwrap();
        assert_eq!(locale.location.as_deref(), Some("United States"));
        assert_eq!(locale.google_domain.as_deref(), Some("google.com"));

        let mut overridden = LocaleConfig::default();
        overridden.country = "jp".to_string();
        let locale = overridden.validated().unwrap();
        assert_eq!(locale.location, None);
        assert_eq!(locale.google_domain, None);
    }

    #[test]
    fn test_explicit_geo_wins() {
        let locale = LocaleConfig::new("en", "us", 10, 4)
            .with_location("Austin, Texas, United States")
            .with_google_domain("Google.COM")
            .validated()
            .unwrap();
        assert_eq!(locale.location.as_deref(), Some("Austin, Texas, United States"));
        assert_eq!(locale.google_domain.as_deref(), Some("google.com"));
    }

    #[test]
    fn test_codes_are_normalized() {
        let locale = LocaleConfig::new(" PT-BR ", "Br", 20, 4)
            .with_location("  ")
            .validated()
            .unwrap();
        assert_eq!(locale.language, "pt-br");
        assert_eq!(locale.country, "br");
        // Blank counts as unset.
        assert_eq!(locale.location.as_deref(), Some("Brazil"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(LocaleConfig::new("fr", "fr", 0, 4).validated().is_err());
        assert!(LocaleConfig::new("fr", "fr", 101, 4).validated().is_err());
        assert!(LocaleConfig::new("fr", "fr", 10, 0).validated().is_err());
        assert!(LocaleConfig::new("fr", "fr", 10, 17).validated().is_err());
        assert!(LocaleConfig::new("french", "fr", 10, 4).validated().is_err());
        assert!(LocaleConfig::new("fr", "fra", 10, 4).validated().is_err());
    }

    #[test]
    fn test_mode_columns() {
        assert_eq!(ExtractionMode::Links.columns(), &["URL"]);
        assert_eq!(ExtractionMode::Snippet.columns(), &["Query", "Content"]);
        assert_eq!(ExtractionMode::Question.columns().len(), 4);
    }
}
