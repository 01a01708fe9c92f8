use std::fs::File;
use std::io::{copy, Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use zip::write::{FileOptions, ZipWriter};

use crate::error::FetchError;
use crate::models::PageImage;

/// Callback reporting (pages done, pages total, current file).
pub type ProgressFn = Box<dyn Fn(usize, usize, &str) + Send + Sync>;

pub struct PackageOptions {
    pub output_path: PathBuf,
    /// Parallel image downloads.
    pub concurrency: usize,
    pub user_agent: String,
    pub referer: Option<String>,
    /// Rebuild even if the archive already exists.
    pub force: bool,
    pub on_progress: Option<ProgressFn>,
}

#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub success: bool,
    pub output_path: PathBuf,
    pub file_size: u64,
    pub errors: Vec<String>,
}

/// Turns a list of page image URLs into an archive on disk.
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(
        &self,
        pages: &[PageImage],
        opts: PackageOptions,
    ) -> Result<PackageOutcome, FetchError>;
}

/// Downloads page images over HTTP and writes a CBZ.
pub struct CbzPackager {
    client: reqwest::Client,
}

impl CbzPackager {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { client }
    }

}

async fn download_page(
    client: &reqwest::Client,
    page: &PageImage,
    user_agent: &str,
    referer: Option<&str>,
) -> Result<Vec<u8>, String> {
    let mut req = client
        .get(&page.url)
        .header(reqwest::header::USER_AGENT, user_agent);
    if let Some(referer) = referer {
        req = req.header(reqwest::header::REFERER, referer);
    }
    let resp = req.send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("page {} returned {}", page.index + 1, resp.status()));
    }
    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Err(format!("page {} was empty", page.index + 1));
    }
    Ok(bytes.to_vec())
}

impl Default for CbzPackager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Packager for CbzPackager {
    async fn package(
        &self,
        pages: &[PageImage],
        opts: PackageOptions,
    ) -> Result<PackageOutcome, FetchError> {
        if !opts.force && opts.output_path.exists() {
            let file_size = std::fs::metadata(&opts.output_path)?.len();
            debug!("archive already present: {}", opts.output_path.display());
            return Ok(PackageOutcome {
                success: true,
                output_path: opts.output_path,
                file_size,
                errors: Vec::new(),
            });
        }
        if let Some(parent) = opts.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let total = pages.len();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(total);
        for page in pages {
            let permit = semaphore.clone().acquire_owned();
            let page = page.clone();
            let user_agent = opts.user_agent.clone();
            let referer = opts.referer.clone();
            let client = self.client.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.await;
                let data = download_page(&client, &page, &user_agent, referer.as_deref()).await;
                (page.index, data)
            }));
        }

        let mut images: Vec<(usize, Vec<u8>)> = Vec::with_capacity(total);
        let mut errors: Vec<String> = Vec::new();
        let mut done = 0usize;
        for task in tasks {
            match task.await {
                Ok((index, Ok(data))) => {
                    done += 1;
                    if let Some(cb) = opts.on_progress.as_ref() {
                        cb(done, total, &format!("page_{}.jpg", index + 1));
                    }
                    images.push((index, data));
                }
                Ok((index, Err(e))) => {
                    warn!("page {} failed: {}", index + 1, e);
                    errors.push(e);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
        images.sort_by_key(|(index, _)| *index);

        if !errors.is_empty() {
            return Ok(PackageOutcome {
                success: false,
                output_path: opts.output_path,
                file_size: 0,
                errors,
            });
        }

        let output_path = opts.output_path.clone();
        let file_size = tokio::task::spawn_blocking(move || write_cbz(&output_path, &images))
            .await
            .map_err(|e| FetchError::Acquisition(e.to_string()))??;

        info!(
            "packaged {} pages into {} ({} bytes)",
            total,
            opts.output_path.display(),
            file_size
        );
        Ok(PackageOutcome {
            success: true,
            output_path: opts.output_path,
            file_size,
            errors: Vec::new(),
        })
    }
}

fn write_cbz(path: &std::path::Path, images: &[(usize, Vec<u8>)]) -> Result<u64, FetchError> {
    let tmp_path = path.with_extension("cbz.tmp");
    let file = File::create(&tmp_path)?;
    let mut zip = ZipWriter::new(file);

    let result = (|| -> Result<(), FetchError> {
        for (index, data) in images {
            zip.start_file(format!("page_{}.jpg", index + 1), FileOptions::default())
                .map_err(|e| FetchError::Acquisition(e.to_string()))?;
            let mut cursor = Cursor::new(data);
            copy(&mut cursor, &mut zip)?;
        }
        zip.finish()
            .map_err(|e| FetchError::Acquisition(e.to_string()))?
            .flush()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(std::fs::metadata(path)?.len())
}
