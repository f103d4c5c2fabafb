use serde::Serialize;

use crate::input_loader::Query;
use crate::locale::ExtractionMode;
use crate::search_engine::{AnswerBox, RawResult};

/// Placeholder shown when a field has no data.
pub const SENTINEL: &str = "—";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RowStatus {
    Data,
    NoData,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RowFields {
    Link {
        url: String,
    },
    Snippet {
        content: String,
    },
    Question {
        question: String,
        answer: String,
        source: String,
    },
}

/// One output line. `position` is the index of the originating query in the
/// input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    pub position: usize,
    pub query: Query,
    pub status: RowStatus,
    pub fields: RowFields,
}

impl ResultRow {
    /// Cell values in the column order of the row's mode.
    pub fn values(&self) -> Vec<&str> {
        match &self.fields {
            RowFields::Link { url } => vec![url.as_str()],
            RowFields::Snippet { content } => vec![self.query.as_str(), content.as_str()],
            RowFields::Question {
                question,
                answer,
                source,
            } => vec![
                self.query.as_str(),
                question.as_str(),
                answer.as_str(),
                source.as_str(),
            ],
        }
    }

    /// The status-bearing field: content, sentinel or error message.
    pub fn primary(&self) -> &str {
        match &self.fields {
            RowFields::Link { url } => url.as_str(),
            RowFields::Snippet { content } => content.as_str(),
            RowFields::Question { question, .. } => question.as_str(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, RowStatus::Failed(_))
    }
}

/// Outcome of one query, independent of how many rows it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryStatus {
    Data { rows: usize },
    NoData,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub rows: Vec<ResultRow>,
    pub status: QueryStatus,
}

fn first_text<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())
}

pub struct Extractor {
    mode: ExtractionMode,
}

impl Extractor {
    pub fn new(mode: ExtractionMode) -> Self {
        Extractor { mode }
    }

    pub fn mode(&self) -> ExtractionMode {
        self.mode
    }

    pub fn extract(&self, raw: &RawResult, query: &Query, position: usize) -> Extraction {
        match self.mode {
            ExtractionMode::Links => self.extract_links(raw, query, position),
            ExtractionMode::Snippet => self.extract_snippet(raw, query, position),
            ExtractionMode::Question => self.extract_questions(raw, query, position),
        }
    }

    // Zero links means zero rows; the query is reported as NoData instead.
    fn extract_links(&self, raw: &RawResult, query: &Query, position: usize) -> Extraction {
        let rows: Vec<ResultRow> = raw
            .organic_results
            .iter()
            .filter_map(|item| first_text(&[&item.link]))
            .map(|url| ResultRow {
                position,
                query: query.clone(),
                status: RowStatus::Data,
                fields: RowFields::Link {
                    url: url.to_string(),
                },
            })
            .collect();

        let status = if rows.is_empty() {
            QueryStatus::NoData
        } else {
            QueryStatus::Data { rows: rows.len() }
        };
        Extraction { rows, status }
    }

    // Always exactly one row.
    fn extract_snippet(&self, raw: &RawResult, query: &Query, position: usize) -> Extraction {
        let answer_box = [&raw.answer_box, &raw.featured_snippet]
            .into_iter()
            .flatten()
            .find(|b| !b.is_empty());
        let content = answer_box.and_then(|b: &AnswerBox| first_text(&[&b.snippet, &b.answer, &b.list]));

        let (status, content, query_status) = match content {
            Some(text) => (RowStatus::Data, text.to_string(), QueryStatus::Data { rows: 1 }),
            None => (RowStatus::NoData, SENTINEL.to_string(), QueryStatus::NoData),
        };

        Extraction {
            rows: vec![ResultRow {
                position,
                query: query.clone(),
                status,
                fields: RowFields::Snippet { content },
            }],
            status: query_status,
        }
    }

    // One row per question block, or a single placeholder row.
    fn extract_questions(&self, raw: &RawResult, query: &Query, position: usize) -> Extraction {
        let rows: Vec<ResultRow> = raw
            .related_questions
            .iter()
            .filter_map(|block| {
                let question = first_text(&[&block.question]);
                let answer = first_text(&[&block.snippet, &block.answer, &block.list]);
                if question.is_none() && answer.is_none() {
                    return None;
                }
                Some(ResultRow {
                    position,
                    query: query.clone(),
                    status: RowStatus::Data,
                    fields: RowFields::Question {
                        question: question.unwrap_or(SENTINEL).to_string(),
                        answer: answer.unwrap_or(SENTINEL).to_string(),
                        source: first_text(&[&block.link]).unwrap_or_default().to_string(),
                    },
                })
            })
            .collect();

        if rows.is_empty() {
            return Extraction {
                rows: vec![ResultRow {
                    position,
                    query: query.clone(),
                    status: RowStatus::NoData,
                    fields: RowFields::Question {
                        question: SENTINEL.to_string(),
                        answer: SENTINEL.to_string(),
                        source: SENTINEL.to_string(),
                    },
                }],
                status: QueryStatus::NoData,
            };
        }

        let count = rows.len();
        Extraction {
            rows,
            status: QueryStatus::Data { rows: count },
        }
    }

    /// The single error-bearing row emitted for a failed lookup, in every mode.
    pub fn failure(&self, query: &Query, position: usize, reason: &str) -> Extraction {
        let message = format!("Error: {}", reason);
        let fields = match self.mode {
            ExtractionMode::Links => RowFields::Link { url: message },
            ExtractionMode::Snippet => RowFields::Snippet { content: message },
            ExtractionMode::Question => RowFields::Question {
                question: message,
                answer: SENTINEL.to_string(),
                source: SENTINEL.to_string(),
            },
        };

        Extraction {
            rows: vec![ResultRow {
                position,
                query: query.clone(),
                status: RowStatus::Failed(reason.to_string()),
                fields,
            }],
            status: QueryStatus::Failed {
                reason: reason.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_engine::{OrganicResult, RelatedQuestion};

    fn query(text: &str) -> Query {
        Query::new(text).unwrap()
    }

    fn organic(link: Option<&str>) -> OrganicResult {
        OrganicResult {
            link: link.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_links_one_row_per_link() {
        let raw = RawResult {
            organic_results: vec![
                organic(Some("https://example.com/a")),
                organic(None),
                organic(Some("https://example.com/b")),
            ],
            ..Default::default()
        };
        let out = Extractor::new(ExtractionMode::Links).extract(&raw, &query("shoes"), 3);
        assert_eq!(out.status, QueryStatus::Data { rows: 2 });
        assert_eq!(out.rows[0].values(), vec!["https://example.com/a"]);
        assert_eq!(out.rows[1].position, 3);
    }

    #[test]
    fn test_links_empty_drops_query() {
        let out = Extractor::new(ExtractionMode::Links).extract(&RawResult::default(), &query("x"), 0);
        assert!(out.rows.is_empty());
        assert_eq!(out.status, QueryStatus::NoData);
    }

    #[test]
    fn test_snippet_prefers_snippet_field() {
        let raw = RawResult {
            answer_box: Some(AnswerBox {
                snippet: Some("the snippet".into()),
                answer: Some("the answer".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = Extractor::new(ExtractionMode::Snippet).extract(&raw, &query("q"), 0);
        assert_eq!(out.rows[0].primary(), "the snippet");
    }

    #[test]
    fn test_snippet_falls_back_to_answer() {
        let raw = RawResult {
            answer_box: Some(AnswerBox::default()),
            featured_snippet: Some(AnswerBox {
                answer: Some("42 km".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = Extractor::new(ExtractionMode::Snippet).extract(&raw, &query("q"), 0);
        assert_eq!(out.rows[0].primary(), "42 km");
        assert_eq!(out.rows[0].status, RowStatus::Data);
    }

    #[test]
    fn test_snippet_sentinel_when_absent() {
        let out = Extractor::new(ExtractionMode::Snippet).extract(&RawResult::default(), &query("q"), 0);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].values(), vec!["q", SENTINEL]);
        assert_eq!(out.status, QueryStatus::NoData);
    }

    #[test]
    fn test_questions_and_placeholder() {
        let raw = RawResult {
            related_questions: vec![
                RelatedQuestion {
                    question: Some("Which shoes?".into()),
                    answer: Some("Boots".into()),
                    link: Some("https://example.com/q".into()),
                    ..Default::default()
                },
                RelatedQuestion {
                    question: Some("Why socks?".into()),
                    ..Default::default()
                },
                RelatedQuestion::default(),
            ],
            ..Default::default()
        };
        let extractor = Extractor::new(ExtractionMode::Question);
        let out = extractor.extract(&raw, &query("shoes"), 0);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].values(), vec!["shoes", "Which shoes?", "Boots", "https://example.com/q"]);
        assert_eq!(out.rows[1].values(), vec!["shoes", "Why socks?", SENTINEL, ""]);

        let empty = extractor.extract(&RawResult::default(), &query("socks"), 1);
        assert_eq!(empty.rows.len(), 1);
        assert_eq!(empty.rows[0].values(), vec!["socks", SENTINEL, SENTINEL, SENTINEL]);
        assert_eq!(empty.rows[0].status, RowStatus::NoData);
    }

    #[test]
    fn test_failure_row() {
        let out = Extractor::new(ExtractionMode::Links).failure(&query("q"), 5, "HTTP 401: bad key");
        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].is_failed());
        assert_eq!(out.rows[0].primary(), "Error: HTTP 401: bad key");
        assert_eq!(out.status, QueryStatus::Failed { reason: "HTTP 401: bad key".into() });
    }
}
