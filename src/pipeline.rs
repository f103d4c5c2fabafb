use std::sync::Arc;

use log::{error, info};

use crate::cache::{CacheOutcome, ResultCache, RunKey};
use crate::config::AppConfig;
use crate::dispatcher::{Dispatcher, Progress};
use crate::errors::{ConfigError, PipelineError};
use crate::input_loader::Query;
use crate::locale::{ExtractionMode, LocaleConfig};
use crate::search_engine::{SearchBackend, SerpApiClient};

/// Cache check, dispatch on miss, store.
pub struct Pipeline {
    dispatcher: Dispatcher,
    cache: ResultCache,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn SearchBackend>, cache: ResultCache) -> Self {
        Pipeline {
            dispatcher: Dispatcher::new(backend),
            cache,
        }
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dispatcher = self.dispatcher.with_dedupe(dedupe);
        self
    }

    /// Builds the SerpApi-backed pipeline. A missing credential fails here,
    /// before any query is read or sent.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key().map_err(|e| {
            error!("{}", e);
            e
        })?;
        let client = SerpApiClient::new(api_key, &config.endpoint, &config.engine, config.http_timeout)?;
        let cache = ResultCache::new(config.cache_ttl, config.cache_max_entries);
        Ok(Pipeline::new(Arc::new(client), cache).with_dedupe(config.dedupe_queries))
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn run(
        &self,
        queries: &[Query],
        locale: &LocaleConfig,
        mode: ExtractionMode,
        progress: &(dyn Fn(Progress) + Sync),
    ) -> Result<CacheOutcome, PipelineError> {
        let locale = locale.validated()?;
        if queries.is_empty() {
            return Err(PipelineError::NoQueries);
        }

        let key = RunKey::new(queries, &locale, mode);
        let outcome = self.cache.get_or_compute(key, || {
            self.dispatcher.run(queries, &locale, mode, progress)
        });

        if outcome.hit {
            // Nothing ran; still report a finished run to the caller.
            let total = outcome.result.reports.len();
            progress(Progress {
                completed: total,
                total,
            });
        }
        info!(
            "Run finished: {} rows for {} queries ({})",
            outcome.result.rows.len(),
            queries.len(),
            if outcome.hit { "cached" } else { "fresh" }
        );
        Ok(outcome)
    }
}
