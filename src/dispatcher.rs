use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Local};
use crossbeam_channel::unbounded;
use log::{info, warn};
use serde::Serialize;

use crate::extractor::{Extraction, Extractor, QueryStatus, ResultRow, RowStatus};
use crate::input_loader::Query;
use crate::locale::{ExtractionMode, LocaleConfig};
use crate::search_engine::SearchBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryReport {
    pub position: usize,
    pub query: Query,
    pub status: QueryStatus,
}

/// Output of one full run: rows ordered by input position, plus one report
/// per input position.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub mode: ExtractionMode,
    pub rows: Vec<ResultRow>,
    pub reports: Vec<QueryReport>,
    pub created_at: DateTime<Local>,
}

impl BatchResult {
    pub fn empty(mode: ExtractionMode) -> Self {
        BatchResult {
            mode,
            rows: Vec::new(),
            reports: Vec::new(),
            created_at: Local::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Queries that produced no data. In links mode these have no rows at
    /// all, so this is the only place their absence shows up.
    pub fn empty_queries(&self) -> Vec<&Query> {
        self.reports
            .iter()
            .filter(|r| r.status == QueryStatus::NoData)
            .map(|r| &r.query)
            .collect()
    }

    pub fn failures(&self) -> Vec<&QueryReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.status, QueryStatus::Failed { .. }))
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.failures().len()
    }

    /// Rows with actual extracted content (no sentinel, no error).
    pub fn data_rows(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.status == RowStatus::Data)
            .count()
    }
}

// One unit of work: a distinct query and every input position it occupies.
struct Task {
    query: Query,
    positions: Vec<usize>,
}

struct TaskResult {
    task_id: usize,
    extractions: Vec<Extraction>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fans queries out to a bounded pool of worker threads.
pub struct Dispatcher {
    backend: Arc<dyn SearchBackend>,
    dedupe: bool,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Dispatcher {
            backend,
            dedupe: true,
        }
    }

    /// When enabled, a query repeated in the input is looked up once and its
    /// rows are copied to every position it occupies.
    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    fn plan(&self, queries: &[Query]) -> Vec<Task> {
        if !self.dedupe {
            return queries
                .iter()
                .enumerate()
                .map(|(i, q)| Task {
                    query: q.clone(),
                    positions: vec![i],
                })
                .collect();
        }

        let mut tasks: Vec<Task> = Vec::new();
        let mut seen: HashMap<&Query, usize> = HashMap::new();
        for (i, q) in queries.iter().enumerate() {
            match seen.get(q) {
                Some(&task_id) => tasks[task_id].positions.push(i),
                None => {
                    seen.insert(q, tasks.len());
                    tasks.push(Task {
                        query: q.clone(),
                        positions: vec![i],
                    });
                }
            }
        }
        tasks
    }

    fn process(
        backend: &dyn SearchBackend,
        extractor: &Extractor,
        locale: &LocaleConfig,
        task: &Task,
    ) -> Vec<Extraction> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            backend.lookup(&task.query, locale).map(|raw| {
                task.positions
                    .iter()
                    .map(|&pos| extractor.extract(&raw, &task.query, pos))
                    .collect::<Vec<_>>()
            })
        }));

        let reason = match outcome {
            Ok(Ok(extractions)) => return extractions,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("lookup panicked: {}", panic_message(payload.as_ref())),
        };

        warn!("Lookup failed for '{}': {}", task.query, reason);
        task.positions
            .iter()
            .map(|&pos| extractor.failure(&task.query, pos, &reason))
            .collect()
    }

    /// Runs every query and returns once all of them finished. Per-query
    /// failures become error rows; nothing here returns an error.
    ///
    /// `progress` is called from the collecting thread after each lookup
    /// completes, so a slow callback never holds up a worker.
    pub fn run(
        &self,
        queries: &[Query],
        locale: &LocaleConfig,
        mode: ExtractionMode,
        progress: &(dyn Fn(Progress) + Sync),
    ) -> BatchResult {
        let extractor = Extractor::new(mode);
        let tasks = self.plan(queries);
        let total = tasks.len();
        if total == 0 {
            return BatchResult::empty(mode);
        }

        let workers = locale.workers.clamp(1, total);
        info!(
            "Dispatching {} queries ({} distinct) across {} workers, mode={}",
            queries.len(),
            total,
            workers,
            mode
        );

        let (task_tx, task_rx) = unbounded::<usize>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();
        for task_id in 0..total {
            // Receiver is alive until the scope below ends.
            let _ = task_tx.send(task_id);
        }
        drop(task_tx);

        let mut slots: Vec<Option<Vec<Extraction>>> = (0..total).map(|_| None).collect();
        let backend = self.backend.as_ref();
        let tasks_ref = &tasks;
        let extractor_ref = &extractor;

        thread::scope(|scope| {
            for _ in 0..workers {
                let rx = task_rx.clone();
                let tx = result_tx.clone();
                scope.spawn(move || {
                    for task_id in rx.iter() {
                        let extractions =
                            Self::process(backend, extractor_ref, locale, &tasks_ref[task_id]);
                        if tx.send(TaskResult { task_id, extractions }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            // Counted in input positions, so duplicates advance it together.
            let positions = queries.len();
            let mut completed = 0;
            for result in result_rx.iter() {
                completed += tasks_ref[result.task_id].positions.len();
                slots[result.task_id] = Some(result.extractions);
                progress(Progress {
                    completed,
                    total: positions,
                });
            }
        });

        let mut rows = Vec::new();
        let mut reports = Vec::with_capacity(queries.len());
        for (task, slot) in tasks.iter().zip(slots) {
            // A worker that died outside the lookup leaves its slot empty.
            let extractions = slot.unwrap_or_else(|| {
                task.positions
                    .iter()
                    .map(|&pos| extractor.failure(&task.query, pos, "worker stopped before completing"))
                    .collect()
            });
            for (extraction, &position) in extractions.into_iter().zip(&task.positions) {
                reports.push(QueryReport {
                    position,
                    query: task.query.clone(),
                    status: extraction.status,
                });
                rows.extend(extraction.rows);
            }
        }
        rows.sort_by_key(|r| r.position);
        reports.sort_by_key(|r| r.position);

        let batch = BatchResult {
            mode,
            rows,
            reports,
            created_at: Local::now(),
        };
        info!(
            "Batch complete: {} rows, {} queries without data, {} failed",
            batch.rows.len(),
            batch.empty_queries().len(),
            batch.failed_count()
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LookupError;
    use crate::extractor::SENTINEL;
    use crate::search_engine::{OrganicResult, RawResult, RelatedQuestion};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers every query with one organic link and one question, except
    /// the queries listed in `fail` / `panic_on` / `empty`.
    #[derive(Default)]
    struct FakeBackend {
        fail: Vec<&'static str>,
        panic_on: Vec<&'static str>,
        empty: Vec<&'static str>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SearchBackend for FakeBackend {
        fn lookup(&self, query: &Query, _locale: &LocaleConfig) -> Result<RawResult, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let q = query.as_str();
            if self.panic_on.contains(&q) {
                panic!("backend exploded");
            }
            if self.fail.contains(&q) {
                return Err(LookupError::Api("quota exceeded".into()));
            }
            if self.empty.contains(&q) {
                return Ok(RawResult::default());
            }
            Ok(RawResult {
                organic_results: vec![OrganicResult {
                    link: Some(format!("https://example.com/{}", q)),
                    ..Default::default()
                }],
                related_questions: vec![RelatedQuestion {
                    question: Some(format!("What about {}?", q)),
                    snippet: Some("It depends.".into()),
                    ..Default::default()
                }],
                ..Default::default()
            })
        }
    }

    fn queries(items: &[&str]) -> Vec<Query> {
        items.iter().map(|q| Query::new(q).unwrap()).collect()
    }

    fn locale(workers: usize) -> LocaleConfig {
        LocaleConfig::new("fr", "fr", 10, workers)
    }

    #[test]
    fn test_failure_is_isolated() {
        let backend = Arc::new(FakeBackend {
            fail: vec!["q3"],
            ..Default::default()
        });
        let input = queries(&["q0", "q1", "q2", "q3", "q4", "q5", "q6", "q7", "q8", "q9"]);
        let batch = Dispatcher::new(backend).run(&input, &locale(4), ExtractionMode::Question, &|_| {});

        assert_eq!(batch.reports.len(), 10);
        assert_eq!(batch.rows.len(), 10);
        assert_eq!(batch.failed_count(), 1);
        let failed: Vec<_> = batch.rows.iter().filter(|r| r.is_failed()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].query.as_str(), "q3");
        assert!(failed[0].primary().contains("quota exceeded"));
    }

    #[test]
    fn test_panic_is_contained() {
        let backend = Arc::new(FakeBackend {
            panic_on: vec!["boom"],
            ..Default::default()
        });
        let input = queries(&["ok", "boom"]);
        let batch = Dispatcher::new(backend).run(&input, &locale(2), ExtractionMode::Snippet, &|_| {});

        assert_eq!(batch.rows.len(), 2);
        assert!(matches!(&batch.rows[1].status, RowStatus::Failed(r) if r.contains("backend exploded")));
        assert_eq!(batch.rows[0].status, RowStatus::NoData);
    }

    #[test]
    fn test_rows_sorted_by_input_position() {
        let backend = Arc::new(FakeBackend::default());
        let input = queries(&["c", "a", "b", "d", "e"]);
        let batch = Dispatcher::new(backend).run(&input, &locale(5), ExtractionMode::Links, &|_| {});

        let order: Vec<&str> = batch.rows.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d", "e"]);
        let positions: Vec<usize> = batch.rows.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_links_mode_reports_empty_queries() {
        let backend = Arc::new(FakeBackend {
            empty: vec!["nothing"],
            ..Default::default()
        });
        let input = queries(&["shoes", "nothing"]);
        let batch = Dispatcher::new(backend).run(&input, &locale(2), ExtractionMode::Links, &|_| {});

        assert_eq!(batch.rows.len(), 1);
        let empty: Vec<&str> = batch.empty_queries().iter().map(|q| q.as_str()).collect();
        assert_eq!(empty, vec!["nothing"]);
    }

    #[test]
    fn test_question_mode_placeholder() {
        let backend = Arc::new(FakeBackend {
            empty: vec!["socks"],
            ..Default::default()
        });
        let input = queries(&["shoes", "socks"]);
        let batch = Dispatcher::new(backend).run(&input, &locale(2), ExtractionMode::Question, &|_| {});

        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[1].values(), vec!["socks", SENTINEL, SENTINEL, SENTINEL]);
    }

    #[test]
    fn test_worker_limit_respected() {
        let backend = Arc::new(FakeBackend::default());
        let input: Vec<Query> = (0..12).map(|i| Query::new(&format!("q{}", i)).unwrap()).collect();
        Dispatcher::new(backend.clone()).run(&input, &locale(3), ExtractionMode::Links, &|_| {});

        assert_eq!(backend.calls.load(Ordering::SeqCst), 12);
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_progress_reaches_total() {
        let backend = Arc::new(FakeBackend::default());
        let input = queries(&["a", "b", "c", "d"]);
        let seen = Mutex::new(Vec::new());
        Dispatcher::new(backend).run(&input, &locale(2), ExtractionMode::Links, &|p| {
            seen.lock().unwrap().push(p);
        });

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last().unwrap().fraction(), 1.0);
        assert!(seen.windows(2).all(|w| w[0].completed < w[1].completed));
    }

    #[test]
    fn test_duplicates_looked_up_once() {
        let backend = Arc::new(FakeBackend::default());
        let input = queries(&["same", "other", "same"]);
        let batch = Dispatcher::new(backend.clone()).run(&input, &locale(2), ExtractionMode::Snippet, &|_| {});

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.reports.len(), 3);
        assert_eq!(batch.rows[2].position, 2);
        assert_eq!(batch.rows[2].query.as_str(), "same");
    }

    #[test]
    fn test_progress_counts_input_positions() {
        let backend = Arc::new(FakeBackend::default());
        let input = queries(&["same", "other", "same", "same"]);
        let seen = Mutex::new(Vec::new());
        Dispatcher::new(backend).run(&input, &locale(2), ExtractionMode::Snippet, &|p| {
            seen.lock().unwrap().push(p);
        });

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.total == 4));
        assert_eq!(seen.last().unwrap().completed, 4);
    }

    #[test]
    fn test_dedupe_disabled() {
        let backend = Arc::new(FakeBackend::default());
        let input = queries(&["same", "same"]);
        Dispatcher::new(backend.clone())
            .with_dedupe(false)
            .run(&input, &locale(2), ExtractionMode::Snippet, &|_| {});
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_input() {
        let backend = Arc::new(FakeBackend::default());
        let batch = Dispatcher::new(backend).run(&[], &locale(2), ExtractionMode::Links, &|_| {});
        assert!(batch.is_empty());
        assert!(batch.reports.is_empty());
    }
}
