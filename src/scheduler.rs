use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::FetchError;
use crate::helpers::{format_chapter_label, sanitize_filename};
use crate::library::SeriesStore;
use crate::models::{
    DownloadJob, DownloadRequest, DownloadResult, JobProgress, JobStatus, PageImage,
};
use crate::orchestrator::FetchOptions;
use crate::packager::{PackageOptions, Packager, ProgressFn};
use crate::sources::Source;

/// Headers a packager should send when fetching a source's images.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    pub user_agent: String,
    pub referer: Option<String>,
}

/// Where the scheduler gets a chapter's page image URLs from.
#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn chapter_images(
        &self,
        chapter: &str,
        source: Source,
        opts: &FetchOptions,
    ) -> Result<Vec<PageImage>, FetchError>;

    fn request_headers(&self, source: Source) -> RequestHeaders {
        let profile = source.profile();
        RequestHeaders {
            user_agent: profile.user_agent.to_string(),
            referer: profile.referer.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub image_concurrency: usize,
    pub source_interval: Duration,
    pub max_attempts: u32,
    pub budget_bytes: u64,
    pub retry_backoff: Duration,
    pub download_dir: PathBuf,
}

impl SchedulerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_workers: cfg.downloads.max_workers.max(1),
            image_concurrency: cfg.downloads.image_concurrency.max(1),
            source_interval: cfg.source_interval(),
            max_attempts: cfg.downloads.max_attempts.max(1),
            budget_bytes: cfg.budget_bytes(),
            retry_backoff: cfg.retry_backoff(),
            download_dir: cfg.download_dir.clone(),
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, DownloadJob>,
    queue: VecDeque<String>,
    active: usize,
}

enum Claim {
    Run(String),
    Skip,
    Stop,
}

/// FIFO download scheduler with a bounded worker count, per-source pacing,
/// a retry budget, and cooperative cancellation.
///
/// Work is driven by a trampoline: `enqueue` and every finishing job call
/// `pump`, which claims queue entries until the worker limit is reached and
/// spawns one task per claimed job. No long-lived worker tasks exist.
pub struct DownloadScheduler {
    fetcher: Arc<dyn ChapterSource>,
    packager: Arc<dyn Packager>,
    store: Arc<dyn SeriesStore>,
    cfg: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Last reserved dispatch time per source.
    rate: Mutex<HashMap<Source, Instant>>,
}

impl DownloadScheduler {
    pub fn new(
        fetcher: Arc<dyn ChapterSource>,
        packager: Arc<dyn Packager>,
        store: Arc<dyn SeriesStore>,
        cfg: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            packager,
            store,
            cfg,
            state: Mutex::new(SchedulerState::default()),
            rate: Mutex::new(HashMap::new()),
        })
    }

    fn output_path_for(&self, title: &str, chapter_label: &str) -> PathBuf {
        self.cfg
            .download_dir
            .join(sanitize_filename(title))
            .join(format!("{}.cbz", sanitize_filename(chapter_label)))
    }

    /// Accept a download request. Rejects over-budget series; short-circuits
    /// chapters that are already on disk unless `force` is set.
    pub fn enqueue(self: &Arc<Self>, req: DownloadRequest) -> Result<DownloadJob, FetchError> {
        let chapter_label = format_chapter_label(&req.chapter, &req.chapter_url);
        let series_id = self
            .store
            .ensure_series(req.source, &req.series_id, &req.title)?;

        if !req.force {
            if let Some(existing) = self.store.find_download(series_id, &chapter_label)? {
                if Path::new(&existing.path).exists() {
                    info!(
                        "chapter {} of {} already downloaded, skipping",
                        chapter_label, req.title
                    );
                    let job = self.synthesize_completed(&req, series_id, &chapter_label, &existing.path, existing.bytes);
                    return Ok(job);
                }
            }
        }

        let used = self.store.bytes_for_series(series_id)?;
        if used >= self.cfg.budget_bytes {
            return Err(FetchError::BudgetExceeded {
                used_bytes: used,
                budget_bytes: self.cfg.budget_bytes,
            });
        }

        let job = DownloadJob {
            id: Uuid::new_v4().to_string(),
            source: req.source,
            series_id,
            source_series_id: req.series_id.clone(),
            series_title: req.title.clone(),
            chapter: chapter_label.clone(),
            chapter_url: req.chapter_url.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.cfg.max_attempts,
            progress: JobProgress::default(),
            result: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            force: req.force,
            output_path: self.output_path_for(&req.title, &chapter_label),
            cancel: CancelFlag::new(),
        };

        {
            let mut st = self
                .state
                .lock()
                .map_err(|_| FetchError::Store("scheduler lock poisoned".to_string()))?;
            st.jobs.insert(job.id.clone(), job.clone());
            st.queue.push_back(job.id.clone());
        }
        self.pump();
        Ok(job)
    }

    fn synthesize_completed(
        &self,
        req: &DownloadRequest,
        series_id: i64,
        chapter_label: &str,
        path: &str,
        bytes: u64,
    ) -> DownloadJob {
        let now = Utc::now();
        let job = DownloadJob {
            id: Uuid::new_v4().to_string(),
            source: req.source,
            series_id,
            source_series_id: req.series_id.clone(),
            series_title: req.title.clone(),
            chapter: chapter_label.to_string(),
            chapter_url: req.chapter_url.clone(),
            status: JobStatus::Completed,
            attempts: 0,
            max_attempts: self.cfg.max_attempts,
            progress: JobProgress::default(),
            result: Some(DownloadResult {
                path: path.to_string(),
                bytes,
            }),
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: Some(now),
            force: false,
            output_path: PathBuf::from(path),
            cancel: CancelFlag::new(),
        };
        if let Ok(mut st) = self.state.lock() {
            st.jobs.insert(job.id.clone(), job.clone());
        }
        job
    }

    /// Claim queued jobs up to the worker limit and spawn a task for each.
    /// Each finishing task calls back into `pump`, so the queue keeps
    /// draining without a dedicated worker loop.
    pub fn pump(self: &Arc<Self>) {
        loop {
            match self.claim_next() {
                Claim::Stop => break,
                Claim::Skip => continue,
                Claim::Run(id) => {
                    let me = self.clone();
                    tokio::spawn(async move {
                        me.clone().run_job(id).await;
                        if let Ok(mut st) = me.state.lock() {
                            st.active = st.active.saturating_sub(1);
                        }
                        me.pump();
                    });
                }
            }
        }
    }

    fn claim_next(&self) -> Claim {
        let Ok(mut st) = self.state.lock() else {
            return Claim::Stop;
        };
        if st.active >= self.cfg.max_workers {
            return Claim::Stop;
        }
        let Some(id) = st.queue.pop_front() else {
            return Claim::Stop;
        };
        let Some(job) = st.jobs.get_mut(&id) else {
            return Claim::Skip;
        };
        if job.cancel.is_canceled() {
            job.status = JobStatus::Canceled;
            job.finished_at = Some(Utc::now());
            return Claim::Skip;
        }
        job.status = JobStatus::Downloading;
        job.started_at = Some(Utc::now());
        st.active += 1;
        Claim::Run(id)
    }

    /// Reserve the next allowed dispatch slot for a source. Slots are spaced
    /// at least one interval apart even when claimed concurrently.
    fn reserve_dispatch(&self, source: Source) -> Instant {
        let now = Instant::now();
        let Ok(mut rate) = self.rate.lock() else {
            return now;
        };
        let at = match rate.get(&source) {
            Some(last) => now.max(*last + self.cfg.source_interval),
            None => now,
        };
        rate.insert(source, at);
        at
    }

    async fn run_job(self: Arc<Self>, id: String) {
        let (source, chapter, chapter_url, series_id, force, output_path, cancel) = {
            let Ok(st) = self.state.lock() else { return };
            let Some(job) = st.jobs.get(&id) else { return };
            (
                job.source,
                job.chapter.clone(),
                job.chapter_url.clone(),
                job.series_id,
                job.force,
                job.output_path.clone(),
                job.cancel.clone(),
            )
        };
        let fetch_target = if chapter_url.is_empty() {
            chapter.clone()
        } else {
            chapter_url.clone()
        };

        loop {
            if cancel.is_canceled() {
                self.finish_canceled(&id);
                return;
            }

            let at = self.reserve_dispatch(source);
            tokio::time::sleep_until(at).await;

            // The pacing slot is spent even if we bail here; a canceled job
            // must not hand its slot to a sibling early.
            if cancel.is_canceled() {
                self.finish_canceled(&id);
                return;
            }

            let opts = FetchOptions {
                refresh: false,
                cancel: Some(cancel.clone()),
            };
            let pages = match self.fetcher.chapter_images(&fetch_target, source, &opts).await {
                Ok(pages) => pages,
                Err(FetchError::Canceled) => {
                    self.finish_canceled(&id);
                    return;
                }
                Err(e) => {
                    if !self.note_attempt_failure(&id, &e) {
                        return;
                    }
                    self.backoff().await;
                    continue;
                }
            };

            if let Ok(mut st) = self.state.lock() {
                if let Some(job) = st.jobs.get_mut(&id) {
                    job.progress.total = pages.len();
                }
            }

            let headers = self.fetcher.request_headers(source);
            let me = self.clone();
            let job_id = id.clone();
            let on_progress: ProgressFn = Box::new(move |current, total, file| {
                if let Ok(mut st) = me.state.lock() {
                    if let Some(job) = st.jobs.get_mut(&job_id) {
                        job.progress = JobProgress {
                            current,
                            total,
                            file: Some(file.to_string()),
                        };
                    }
                }
            });

            let pkg_opts = PackageOptions {
                output_path: output_path.clone(),
                concurrency: self.cfg.image_concurrency,
                user_agent: headers.user_agent,
                referer: headers.referer,
                force,
                on_progress: Some(on_progress),
            };

            match self.packager.package(&pages, pkg_opts).await {
                Ok(outcome) if outcome.success => {
                    // A cancel that lands during packaging still wins; the
                    // chapter is not recorded as downloaded.
                    if cancel.is_canceled() {
                        self.finish_canceled(&id);
                        return;
                    }
                    let path = outcome.output_path.to_string_lossy().to_string();
                    if let Err(e) =
                        self.store
                            .record_download(series_id, &chapter, &path, outcome.file_size)
                    {
                        // An unrecorded chapter would dodge the budget sum, so
                        // the job must not report success.
                        warn!("failed to record download {}: {}", id, e);
                        self.note_attempt_failure(&id, &e);
                        return;
                    }
                    self.finish_completed(&id, path, outcome.file_size);
                    return;
                }
                Ok(outcome) => {
                    let e = FetchError::Acquisition(outcome.errors.join("; "));
                    if cancel.is_canceled() {
                        self.finish_canceled(&id);
                        return;
                    }
                    if !self.note_attempt_failure(&id, &e) {
                        return;
                    }
                    self.backoff().await;
                }
                Err(FetchError::Canceled) => {
                    self.finish_canceled(&id);
                    return;
                }
                Err(e) => {
                    if !self.note_attempt_failure(&id, &e) {
                        return;
                    }
                    self.backoff().await;
                }
            }
        }
    }

    async fn backoff(&self) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        tokio::time::sleep(self.cfg.retry_backoff + jitter).await;
    }

    /// Record a failed attempt. Returns whether the job may retry; when not,
    /// the job is marked failed.
    fn note_attempt_failure(&self, id: &str, err: &FetchError) -> bool {
        let Ok(mut st) = self.state.lock() else {
            return false;
        };
        let Some(job) = st.jobs.get_mut(id) else {
            return false;
        };
        job.attempts += 1;
        job.last_error = Some(err.to_string());
        let retry = err.is_retryable() && job.attempts < job.max_attempts;
        if !retry {
            warn!(
                "job {} failed after {} attempt(s): {}",
                id, job.attempts, err
            );
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
        }
        retry
    }

    fn finish_canceled(&self, id: &str) {
        info!("job {} canceled", id);
        if let Ok(mut st) = self.state.lock() {
            if let Some(job) = st.jobs.get_mut(id) {
                job.status = JobStatus::Canceled;
                job.finished_at = Some(Utc::now());
            }
        }
    }

    fn finish_completed(&self, id: &str, path: String, bytes: u64) {
        info!("job {} completed: {} ({} bytes)", id, path, bytes);
        if let Ok(mut st) = self.state.lock() {
            if let Some(job) = st.jobs.get_mut(id) {
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
                job.progress.current = job.progress.total;
                job.result = Some(DownloadResult { path, bytes });
            }
        }
    }

    /// Cancel a job. Queued jobs flip to canceled immediately; running jobs
    /// get their flag set and stop at the next checkpoint. Terminal jobs are
    /// returned unchanged.
    pub fn cancel(&self, id: &str) -> Option<DownloadJob> {
        let mut st = self.state.lock().ok()?;
        let snapshot = {
            let job = st.jobs.get_mut(id)?;
            match job.status {
                JobStatus::Queued => {
                    job.cancel.cancel();
                    job.status = JobStatus::Canceled;
                    job.finished_at = Some(Utc::now());
                }
                JobStatus::Downloading => {
                    job.cancel.cancel();
                }
                _ => {}
            }
            job.clone()
        };
        if snapshot.status == JobStatus::Canceled {
            st.queue.retain(|q| q != id);
        }
        Some(snapshot)
    }

    pub fn get_job(&self, id: &str) -> Option<DownloadJob> {
        self.state.lock().ok()?.jobs.get(id).cloned()
    }

    pub fn list_jobs(&self) -> Vec<DownloadJob> {
        let Ok(st) = self.state.lock() else {
            return Vec::new();
        };
        let mut jobs: Vec<DownloadJob> = st.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().map(|st| st.active).unwrap_or(0)
    }
}
