use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::Tab;
use log::debug;

use crate::error::FetchError;
use crate::models::{PageImage, SearchResults, SeriesDetails};
use crate::sources::{FlameComicsAdapter, Source, WpMangaAdapter};

/// One site's scrape operations, run against an already configured page.
///
/// Implementations are synchronous; the pool runs them on a blocking thread.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    fn search(&self, tab: &Tab, query: &str, page: u32) -> Result<SearchResults, FetchError>;

    fn series_details(&self, tab: &Tab, series_id: &str) -> Result<SeriesDetails, FetchError>;

    /// Ordered page image URLs for one chapter. `chapter` is the chapter URL
    /// as reported by `series_details`.
    fn chapter_pages(&self, tab: &Tab, chapter: &str) -> Result<Vec<PageImage>, FetchError>;
}

pub struct SourceRegistry {
    adapters: HashMap<Source, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn with_defaults() -> Self {
        let mut adapters: HashMap<Source, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(Source::FlameComics, Arc::new(FlameComicsAdapter::new()));
        adapters.insert(
            Source::AsuraScans,
            Arc::new(WpMangaAdapter::new(Source::AsuraScans)),
        );
        adapters.insert(
            Source::Manhuaus,
            Arc::new(WpMangaAdapter::new(Source::Manhuaus)),
        );
        Self { adapters }
    }

    pub fn get(&self, source: Source) -> Result<Arc<dyn SourceAdapter>, FetchError> {
        self.adapters
            .get(&source)
            .cloned()
            .ok_or_else(|| FetchError::UnknownSource(source.key().to_string()))
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Navigate and return the page HTML once `selector` appears. A missing
/// selector is not fatal; some sites render partial result lists.
pub fn html_after(
    tab: &Tab,
    url: &str,
    selector: &str,
    wait: Duration,
) -> Result<String, FetchError> {
    tab.navigate_to(url).map_err(FetchError::acquisition)?;
    tab.wait_until_navigated().map_err(FetchError::acquisition)?;
    if tab
        .wait_for_element_with_custom_timeout(selector, wait)
        .is_err()
    {
        debug!("selector {} never appeared on {}", selector, url);
    }
    tab.get_content().map_err(FetchError::acquisition)
}
