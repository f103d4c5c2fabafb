use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serp_harvester_lib::input_loader::{self, GithubSource};
use serp_harvester_lib::{
    AppConfig, BatchResult, ExtractionMode, LocaleConfig, Pipeline, Progress, Query,
};

const MAX_LOG_LINES: usize = 50;
/// Finished jobs kept for status and download.
const MAX_FINISHED_JOBS: usize = 100;
/// How long a finished job is kept when the result cache has no TTL.
const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub status: JobState,
    pub mode: ExtractionMode,
    pub total_queries: usize,
    pub completed: usize,
    pub progress: f64,
    pub cached: bool,
    /// User-facing outcome, e.g. "No results found" or the fatal error.
    pub message: Option<String>,
    pub logs: Vec<String>,
    #[serde(skip)]
    pub result: Option<Arc<BatchResult>>,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl JobStatus {
    fn queued(id: String, mode: ExtractionMode) -> Self {
        let mut status = JobStatus {
            id,
            status: JobState::Queued,
            mode,
            total_queries: 0,
            completed: 0,
            progress: 0.0,
            cached: false,
            message: None,
            logs: Vec::new(),
            result: None,
            finished_at: None,
        };
        push_log(&mut status, "Job queued.".to_string());
        status
    }

    fn finish(&mut self, state: JobState) {
        self.status = state;
        self.finished_at = Some(Instant::now());
    }
}

#[derive(Debug, Deserialize)]
pub struct GithubForm {
    pub repo: String,
    pub path: String,
    #[serde(default)]
    pub git_ref: Option<String>,
}

/// What the run form submits. Query sources are combined.
#[derive(Debug, Deserialize)]
pub struct RunForm {
    #[serde(default)]
    pub queries: Vec<String>,
    /// Pasted list, one query per line or CSV with a query column.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub github: Option<GithubForm>,
    #[serde(default)]
    pub column: Option<String>,
    pub mode: ExtractionMode,
    #[serde(default)]
    pub locale: Option<LocaleConfig>,
}

type Jobs = Arc<Mutex<HashMap<String, JobStatus>>>;

fn lock(jobs: &Jobs) -> MutexGuard<'_, HashMap<String, JobStatus>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn update(jobs: &Jobs, job_id: &str, change: impl FnOnce(&mut JobStatus)) {
    if let Some(job) = lock(jobs).get_mut(job_id) {
        change(job);
    }
}

/// Forgets finished jobs past `retention`, then the oldest finished ones
/// beyond `max_finished`. Queued and running jobs are kept.
fn prune(jobs: &mut HashMap<String, JobStatus>, retention: Duration, max_finished: usize) {
    jobs.retain(|_, job| job.finished_at.map_or(true, |at| at.elapsed() < retention));

    let mut finished: Vec<(Instant, String)> = jobs
        .values()
        .filter_map(|job| job.finished_at.map(|at| (at, job.id.clone())))
        .collect();
    if finished.len() > max_finished {
        finished.sort();
        let excess = finished.len() - max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

fn push_log(job: &mut JobStatus, line: String) {
    job.logs.push(format!("{} {}", Local::now().format("%H:%M:%S"), line));
    if job.logs.len() > MAX_LOG_LINES {
        job.logs.remove(0);
    }
}

pub struct JobManager {
    pub jobs: Jobs,
    /// Either a usable pipeline or the configuration error blocking every run.
    pipeline: Result<Arc<Pipeline>, String>,
    config: AppConfig,
    retention: Duration,
}

impl JobManager {
    pub fn new(config: AppConfig) -> Self {
        let pipeline = Pipeline::from_config(&config)
            .map(Arc::new)
            .map_err(|e| e.to_string());

        let retention = config.cache_ttl.unwrap_or(DEFAULT_JOB_RETENTION);

        JobManager {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            pipeline,
            config,
            retention,
        }
    }

    pub fn blocking_error(&self) -> Option<&str> {
        self.pipeline.as_ref().err().map(String::as_str)
    }

    pub fn default_locale(&self) -> &LocaleConfig {
        &self.config.default_locale
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        lock(&self.jobs).get(job_id).cloned()
    }

    pub fn start_job(&self, job_id: String, form: RunForm) -> Result<String, String> {
        let pipeline = self.pipeline.clone()?;

        {
            let mut jobs = lock(&self.jobs);
            prune(&mut jobs, self.retention, MAX_FINISHED_JOBS);
            jobs.insert(job_id.clone(), JobStatus::queued(job_id.clone(), form.mode));
        }

        let jobs = self.jobs.clone();
        let locale = form.locale.clone().unwrap_or_else(|| self.config.default_locale.clone());
        let github_token = self.config.github_token.clone();
        let id_clone = job_id.clone();

        thread::spawn(move || {
            Self::run_job(id_clone, jobs, pipeline, form, locale, github_token);
        });

        Ok(job_id)
    }

    fn resolve_queries(form: &RunForm, github_token: Option<&str>) -> Result<Vec<Query>, String> {
        let column = form.column.as_deref();
        let mut queries = input_loader::queries_from_list(&form.queries);

        if let Some(text) = &form.text {
            queries.extend(input_loader::parse_query_text(text, column).map_err(|e| e.to_string())?);
        }
        if let Some(github) = &form.github {
            let source = GithubSource::new(github_token, github.git_ref.as_deref())
                .map_err(|e| e.to_string())?;
            let fetched = input_loader::fetch_queries(&source, &github.repo, &github.path, column)
                .map_err(|e| e.to_string())?;
            queries.extend(fetched);
        }
        Ok(queries)
    }

    fn run_job(
        job_id: String,
        jobs: Jobs,
        pipeline: Arc<Pipeline>,
        form: RunForm,
        locale: LocaleConfig,
        github_token: Option<String>,
    ) {
        let fail = |message: String| {
            log::error!("Job {} failed: {}", job_id, message);
            update(&jobs, &job_id, |job| {
                job.finish(JobState::Failed);
                push_log(job, message.clone());
                job.message = Some(message);
            });
        };

        let queries = match Self::resolve_queries(&form, github_token.as_deref()) {
            Ok(q) => q,
            Err(e) => return fail(format!("Could not read queries: {}", e)),
        };

        update(&jobs, &job_id, |job| {
            job.status = JobState::Processing;
            job.total_queries = queries.len();
            push_log(job, format!("Running {} queries.", queries.len()));
        });

        let on_progress = |p: Progress| {
            update(&jobs, &job_id, |job| {
                job.completed = p.completed;
                job.progress = p.fraction();
            });
        };

        let outcome = match pipeline.run(&queries, &locale, form.mode, &on_progress) {
            Ok(outcome) => outcome,
            Err(e) => return fail(e.to_string()),
        };

        let batch = outcome.result;
        let message = if batch.is_empty() {
            Some("No results found for these queries.".to_string())
        } else if batch.failed_count() > 0 {
            Some(format!("{} of {} queries failed.", batch.failed_count(), batch.reports.len()))
        } else {
            None
        };

        update(&jobs, &job_id, |job| {
            job.finish(JobState::Completed);
            job.cached = outcome.hit;
            job.completed = job.total_queries;
            job.progress = 1.0;
            for failure in batch.failures() {
                push_log(job, format!("'{}' failed.", failure.query));
            }
            push_log(
                job,
                format!(
                    "Done: {} rows{}.",
                    batch.rows.len(),
                    if outcome.hit { " (from cache)" } else { "" }
                ),
            );
            job.message = message;
            job.result = Some(batch.clone());
        });
    }
}
