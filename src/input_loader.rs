use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::time::Duration;

use calamine::{open_workbook_auto_from_rs, Reader};
use log::{info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::errors::{ConfigError, SourceError};

/// Header names recognised as "the query column" when none is given.
const QUERY_HEADERS: &[&str] = &["query", "queries", "keyword", "keywords", "requête", "requete"];

pub const GITHUB_API: &str = "https://api.github.com";

/// One search request. Always trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Query(String);

impl Query {
    pub fn new(raw: &str) -> Option<Query> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Query(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Query {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Query::new(&raw).ok_or_else(|| serde::de::Error::custom("query must not be blank"))
    }
}

/// Builds queries from literal strings, dropping blank entries.
pub fn queries_from_list<S: AsRef<str>>(items: &[S]) -> Vec<Query> {
    items.iter().filter_map(|s| Query::new(s.as_ref())).collect()
}

fn is_query_header(cell: &str, column: Option<&str>) -> bool {
    let cell = cell.trim().to_lowercase();
    match column {
        Some(name) => cell == name.trim().to_lowercase(),
        None => QUERY_HEADERS.contains(&cell.as_str()),
    }
}

/// Parses a text blob: one query per non-blank line, or a CSV whose header
/// names the query column (explicit `column`, or one of the usual names).
pub fn parse_query_text(text: &str, column: Option<&str>) -> Result<Vec<Query>, SourceError> {
    let text = text.trim_start_matches('\u{feff}');
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");

    let delimiter = if header.contains(';') && !header.contains(',') {
        b';'
    } else {
        b','
    };
    let looks_like_csv = header
        .split(delimiter as char)
        .any(|cell| is_query_header(cell.trim_matches('"'), column));

    if looks_like_csv {
        return parse_query_csv(text, delimiter, column);
    }
    if let Some(name) = column {
        return Err(SourceError::MissingColumn(name.to_string()));
    }

    Ok(text.lines().filter_map(Query::new).collect())
}

fn parse_query_csv(text: &str, delimiter: u8, column: Option<&str>) -> Result<Vec<Query>, SourceError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let idx = rdr
        .headers()?
        .iter()
        .position(|h| is_query_header(h, column))
        .ok_or_else(|| SourceError::MissingColumn(column.unwrap_or("query").to_string()))?;

    let mut queries = Vec::new();
    for record in rdr.records() {
        match record {
            Ok(record) => {
                if let Some(q) = record.get(idx).and_then(Query::new) {
                    queries.push(q);
                }
            }
            Err(e) => warn!("Skipping unreadable CSV record: {}", e),
        }
    }
    Ok(queries)
}

fn queries_from_workbook<RS: Read + Seek, W: Reader<RS>>(
    mut workbook: W,
    column: Option<&str>,
) -> Result<Vec<Query>, SourceError> {
    let worksheets = workbook.worksheets();
    let Some((_name, range)) = worksheets.first() else {
        return Ok(Vec::new());
    };

    let mut rows = range.rows().peekable();
    let header_idx = rows.peek().and_then(|first| {
        first
            .iter()
            .position(|cell| is_query_header(&cell.to_string(), column))
    });

    let idx = match (header_idx, column) {
        (Some(idx), _) => {
            rows.next();
            idx
        }
        (None, Some(name)) => return Err(SourceError::MissingColumn(name.to_string())),
        // No header row: the first column holds the queries.
        (None, None) => 0,
    };

    Ok(rows
        .filter_map(|row| row.get(idx).and_then(|cell| Query::new(&cell.to_string())))
        .collect())
}

/// Loads queries from uploaded or fetched bytes, choosing the format from
/// the file name.
pub fn load_queries_from_bytes(
    file_name: &str,
    bytes: Vec<u8>,
    column: Option<&str>,
) -> Result<Vec<Query>, SourceError> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        // Format is sniffed from the content, not the extension.
        let workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
            .map_err(|e| SourceError::Spreadsheet(e.to_string()))?;
        return queries_from_workbook(workbook, column);
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| SourceError::UnsupportedFormat(format!("{} is not UTF-8 text", file_name)))?;
    parse_query_text(&text, column)
}

pub fn load_queries<P: AsRef<Path>>(path: P, column: Option<&str>) -> Result<Vec<Query>, SourceError> {
    let path_ref = path.as_ref();
    let display = path_ref.display().to_string();

    let bytes = fs::read(path_ref).map_err(|source| SourceError::Io {
        path: display.clone(),
        source,
    })?;
    let queries = load_queries_from_bytes(&display, bytes, column)?;

    info!("Loaded {} queries from {:?}", queries.len(), path_ref);
    Ok(queries)
}

/// A hosted location holding a query list.
pub trait RemoteSource: Send + Sync {
    /// Returns the raw text stored at `path` inside `source`.
    fn fetch(&self, source: &str, path: &str) -> Result<String, SourceError>;
}

/// Reads files through the GitHub contents API. Public repositories need no
/// token.
pub struct GithubSource {
    client: Client,
    api_base: Url,
    git_ref: Option<String>,
}

impl GithubSource {
    pub fn new(token: Option<&str>, git_ref: Option<&str>) -> Result<Self, ConfigError> {
        Self::with_api_base(GITHUB_API, token, git_ref)
    }

    pub fn with_api_base(
        api_base: &str,
        token: Option<&str>,
        git_ref: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| ConfigError::InvalidEndpoint(api_base.to_string(), e))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github.raw"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("serp-harvester/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ConfigError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(GithubSource {
            client,
            api_base,
            git_ref: git_ref.map(str::to_string),
        })
    }

    /// `owner/repo` + `dir/file.csv` -> `{api}/repos/owner/repo/contents/dir/file.csv`
    pub fn contents_url(&self, repo: &str, path: &str) -> Result<Url, SourceError> {
        let parts: Vec<&str> = repo.trim().split('/').collect();
        let valid_repo = parts.len() == 2 && parts.iter().all(|p| !p.is_empty());
        let path = path.trim().trim_matches('/');
        if !valid_repo || path.is_empty() {
            return Err(SourceError::InvalidLocation(format!("{}:{}", repo, path)));
        }

        let encoded_path: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let base = self.api_base.as_str().trim_end_matches('/');
        let raw = format!(
            "{}/repos/{}/{}/contents/{}",
            base,
            urlencoding::encode(parts[0]),
            urlencoding::encode(parts[1]),
            encoded_path.join("/")
        );

        let mut url = Url::parse(&raw).map_err(|_| SourceError::InvalidLocation(raw.clone()))?;
        if let Some(git_ref) = &self.git_ref {
            url.query_pairs_mut().append_pair("ref", git_ref);
        }
        Ok(url)
    }
}

impl RemoteSource for GithubSource {
    fn fetch(&self, source: &str, path: &str) -> Result<String, SourceError> {
        let url = self.contents_url(source, path)?;
        info!("Fetching query list from {}", url);

        let resp = self.client.get(url.clone()).send()?;
        if !resp.status().is_success() {
            return Err(SourceError::RemoteStatus {
                location: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp.text()?)
    }
}

/// Fetches and parses a remote query list in one step.
pub fn fetch_queries(
    remote: &dyn RemoteSource,
    source: &str,
    path: &str,
    column: Option<&str>,
) -> Result<Vec<Query>, SourceError> {
    let text = remote.fetch(source, path)?;
    let queries = parse_query_text(&text, column)?;
    info!("Loaded {} queries from {}:{}", queries.len(), source, path);
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;

    fn texts(queries: &[Query]) -> Vec<&str> {
        queries.iter().map(Query::as_str).collect()
    }

    #[test]
    fn test_query_trims_and_rejects_blank() {
        assert_eq!(Query::new("  shoes \t").unwrap().as_str(), "shoes");
        assert!(Query::new("   ").is_none());
        assert!(serde_json::from_str::<Query>("\" \"").is_err());
    }

    #[test]
    fn test_plain_lines() {
        let text = "site:example.com shoes\n\n   \n  site:example.com socks  \r\n";
        let queries = parse_query_text(text, None).unwrap();
        assert_eq!(texts(&queries), vec!["site:example.com shoes", "site:example.com socks"]);
    }

    #[test]
    fn test_csv_with_query_header() {
        let text = "\u{feff}id,Query,notes\n1,red shoes,x\n2,  ,y\n3,\"socks, wool\",z\n";
        let queries = parse_query_text(text, None).unwrap();
        assert_eq!(texts(&queries), vec!["red shoes", "socks, wool"]);
    }

    #[test]
    fn test_semicolon_csv_with_named_column() {
        let text = "term;volume\nbottes;100\nsandales;50\n";
        let queries = parse_query_text(text, Some("Term")).unwrap();
        assert_eq!(texts(&queries), vec!["bottes", "sandales"]);
    }

    #[test]
    fn test_missing_named_column() {
        let err = parse_query_text("a\nb\n", Some("query")).unwrap_err();
        assert!(matches!(err, SourceError::MissingColumn(_)));
    }

    #[test]
    fn test_xlsx_bytes() {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Keyword").unwrap();
        sheet.write_string(1, 0, "chaussures").unwrap();
        sheet.write_string(2, 0, " ").unwrap();
        sheet.write_string(3, 0, "chaussettes").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let queries = load_queries_from_bytes("upload.XLSX", bytes, None).unwrap();
        assert_eq!(texts(&queries), vec!["chaussures", "chaussettes"]);
    }

    #[test]
    fn test_xls_name_goes_through_workbook_reader() {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "bottes").unwrap();
        sheet.write_string(1, 0, "sandales").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        // No header row: first column is used.
        let queries = load_queries_from_bytes("queries.xls", bytes, None).unwrap();
        assert_eq!(texts(&queries), vec!["bottes", "sandales"]);

        let err = load_queries_from_bytes("broken.xls", b"not a workbook".to_vec(), None).unwrap_err();
        assert!(matches!(err, SourceError::Spreadsheet(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_queries("/definitely/not/here.csv", None).unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_github_contents_url() {
        let source = GithubSource::new(None, Some("main")).unwrap();
        let url = source.contents_url("someone/scraper-SERP", "data/my queries.csv").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/someone/scraper-SERP/contents/data/my%20queries.csv?ref=main"
        );
        assert!(source.contents_url("no-slash", "q.csv").is_err());
        assert!(source.contents_url("a/b", " ").is_err());
    }

    struct StaticSource(&'static str);

    impl RemoteSource for StaticSource {
        fn fetch(&self, _source: &str, _path: &str) -> Result<String, SourceError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_fetch_queries_parses_remote_text() {
        let remote = StaticSource("query\nfirst\nsecond\n");
        let queries = fetch_queries(&remote, "a/b", "queries.csv", None).unwrap();
        assert_eq!(texts(&queries), vec!["first", "second"]);
    }
}
