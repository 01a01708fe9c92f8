use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::sources::Source;

/// One entry in a search result page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesSummary {
    pub source_series_id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResults {
    pub source: Source,
    pub query: String,
    pub page: u32,
    pub entries: Vec<SeriesSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterInfo {
    pub chapter_number: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesDetails {
    pub source_series_id: String,
    pub title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub chapters: Vec<ChapterInfo>,
}

/// A single page image of a chapter, in reading order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageImage {
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    pub current: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub path: String,
    pub bytes: u64,
}

/// The scheduler's view of one download. Serialized for the API; the
/// bookkeeping fields at the bottom stay internal.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: String,
    pub source: Source,
    pub series_id: i64,
    pub source_series_id: String,
    pub series_title: String,
    pub chapter: String,
    pub chapter_url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DownloadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing)]
    pub force: bool,
    #[serde(skip_serializing)]
    pub output_path: PathBuf,
    #[serde(skip_serializing)]
    pub cancel: Arc<CancelFlag>,
}

/// Body of POST /downloads.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub source: Source,
    pub series_id: String,
    pub title: String,
    pub chapter: String,
    #[serde(default)]
    pub chapter_url: String,
    #[serde(default)]
    pub force: bool,
}
