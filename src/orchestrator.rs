use std::sync::Arc;

use async_trait::async_trait;
use headless_chrome::Tab;
use log::info;

use crate::browser::{BrowserPool, PageOptions};
use crate::cache::TieredCache;
use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::FetchError;
use crate::helpers::normalize_query;
use crate::models::{PageImage, SearchResults, SeriesDetails};
use crate::scheduler::ChapterSource;
use crate::sources::{Source, SourceAdapter, SourceRegistry};

/// Per-call fetch behavior.
#[derive(Default, Clone)]
pub struct FetchOptions {
    /// Drop any cached value and go to the site.
    pub refresh: bool,
    pub cancel: Option<Arc<CancelFlag>>,
}

/// Cache-first front door for every acquisition operation.
///
/// Each operation consults its tiered cache before touching the browser.
/// Empty result sets are treated as misses and never cached, so a site
/// hiccup cannot pin "nothing found" for the whole TTL.
pub struct Orchestrator {
    pool: Arc<BrowserPool>,
    registry: Arc<SourceRegistry>,
    search_cache: TieredCache<SearchResults>,
    details_cache: TieredCache<SeriesDetails>,
    pages_cache: TieredCache<Vec<PageImage>>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<BrowserPool>,
        registry: Arc<SourceRegistry>,
        cfg: &Config,
    ) -> Result<Self, FetchError> {
        let multiplier = cfg.cache.disk_ttl_multiplier;
        Ok(Self {
            pool,
            registry,
            search_cache: TieredCache::new(
                cfg.cache_dir.join("search"),
                cfg.search_ttl(),
                cfg.search_ttl() * multiplier,
            )?,
            details_cache: TieredCache::new(
                cfg.cache_dir.join("series"),
                cfg.details_ttl(),
                cfg.details_ttl() * multiplier,
            )?,
            pages_cache: TieredCache::new(
                cfg.cache_dir.join("pages"),
                cfg.pages_ttl(),
                cfg.pages_ttl() * multiplier,
            )?,
        })
    }

    /// Run one adapter operation on a pooled page configured from the
    /// source's profile.
    async fn scrape<T, F>(
        &self,
        source: Source,
        cancel: Option<Arc<CancelFlag>>,
        f: F,
    ) -> Result<T, FetchError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SourceAdapter, &Tab) -> Result<T, FetchError> + Send + 'static,
    {
        let adapter = self.registry.get(source)?;
        let profile = source.profile();
        let opts = PageOptions {
            source,
            user_agent: profile.user_agent,
            referer: profile.referer,
            block_resources: !profile.needs_images,
            timeout: profile.timeout,
            cancel,
        };
        self.pool
            .with_page(opts, move |tab| f(adapter.as_ref(), tab))
            .await
    }

    pub async fn search(
        &self,
        source: Source,
        query: &str,
        page: u32,
        opts: &FetchOptions,
    ) -> Result<SearchResults, FetchError> {
        let key = format!("search:{}:{}:{}", source.key(), normalize_query(query), page);
        let cancel = opts.cancel.clone();
        let query = query.to_string();
        self.search_cache
            .fetch(
                &key,
                opts.refresh,
                |r: &SearchResults| !r.entries.is_empty(),
                || async move {
                    info!("searching {} for '{}' page {}", source.key(), query, page);
                    self.scrape(source, cancel, move |adapter, tab| {
                        adapter.search(tab, &query, page)
                    })
                    .await
                },
            )
            .await
    }

    pub async fn series_details(
        &self,
        source: Source,
        series_id: &str,
        opts: &FetchOptions,
    ) -> Result<SeriesDetails, FetchError> {
        let key = format!("series:{}:{}", source.key(), series_id);
        let cancel = opts.cancel.clone();
        let series_id = series_id.to_string();
        self.details_cache
            .fetch(
                &key,
                opts.refresh,
                |d: &SeriesDetails| !d.chapters.is_empty(),
                || async move {
                    info!("fetching series {} from {}", series_id, source.key());
                    self.scrape(source, cancel, move |adapter, tab| {
                        adapter.series_details(tab, &series_id)
                    })
                    .await
                },
            )
            .await
    }
}

#[async_trait]
impl ChapterSource for Orchestrator {
    async fn chapter_images(
        &self,
        chapter: &str,
        source: Source,
        opts: &FetchOptions,
    ) -> Result<Vec<PageImage>, FetchError> {
        let key = format!("pages:{}:{}", source.key(), chapter);
        let cancel = opts.cancel.clone();
        let chapter = chapter.to_string();
        self.pages_cache
            .fetch(&key, opts.refresh, |_: &Vec<PageImage>| true, || async move {
                info!("fetching chapter pages from {}", source.key());
                let pages = self
                    .scrape(source, cancel, move |adapter, tab| {
                        adapter.chapter_pages(tab, &chapter)
                    })
                    .await?;
                if pages.is_empty() {
                    return Err(FetchError::Acquisition(
                        "chapter returned no pages".to_string(),
                    ));
                }
                Ok(pages)
            })
            .await
    }
}
