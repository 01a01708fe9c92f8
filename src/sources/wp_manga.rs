use std::time::Duration;

use headless_chrome::Tab;
use scraper::{Html, Selector};

use crate::error::FetchError;
use crate::models::{ChapterInfo, PageImage, SearchResults, SeriesDetails, SeriesSummary};
use crate::sources::{html_after, Source, SourceAdapter};

/// Adapter for WordPress sites running the Madara manga theme. Several of
/// the supported sources share its markup, so one adapter covers them all.
pub struct WpMangaAdapter {
    source: Source,
}

impl WpMangaAdapter {
    pub fn new(source: Source) -> Self {
        Self { source }
    }

    fn base_url(&self) -> &'static str {
        self.source.profile().base_url
    }
}

fn sel(pattern: &str) -> Selector {
    // Selectors here are string literals; parsing cannot fail at runtime.
    Selector::parse(pattern).unwrap_or_else(|_| panic!("bad selector: {pattern}"))
}

fn image_url(img: &scraper::ElementRef) -> Option<String> {
    // Madara lazy-loads images; the real URL hides in data-src.
    img.value()
        .attr("data-src")
        .or_else(|| img.value().attr("src"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn slug_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

impl SourceAdapter for WpMangaAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn search(&self, tab: &Tab, query: &str, page: u32) -> Result<SearchResults, FetchError> {
        let url = format!(
            "{}/?s={}&post_type=wp-manga&paged={}",
            self.base_url(),
            query.replace(' ', "+"),
            page
        );
        let html = html_after(tab, &url, "div.page-item-detail", Duration::from_secs(10))?;
        let document = Html::parse_document(&html);

        let container = sel("div.page-item-detail");
        let title_link = sel("h3 > a");
        let cover = sel("img");

        let mut entries = Vec::new();
        for element in document.select(&container) {
            let Some(link) = element.select(&title_link).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let title = link.text().collect::<String>().trim().to_string();
            if title.is_empty() {
                continue;
            }
            let cover_url = element.select(&cover).next().and_then(|img| image_url(&img));
            entries.push(SeriesSummary {
                source_series_id: slug_from_url(href),
                title,
                url: href.to_string(),
                cover_url,
                description: None,
            });
        }

        Ok(SearchResults {
            source: self.source,
            query: query.to_string(),
            page,
            entries,
        })
    }

    fn series_details(&self, tab: &Tab, series_id: &str) -> Result<SeriesDetails, FetchError> {
        let url = format!("{}/manga/{}/", self.base_url(), series_id);
        let html = html_after(tab, &url, "li.wp-manga-chapter", Duration::from_secs(10))?;
        let document = Html::parse_document(&html);

        let title = document
            .select(&sel("div.post-title h1"))
            .next()
            .or_else(|| document.select(&sel("h1")).next())
            .map(|h| h.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchError::Acquisition(format!("no title found for {}", series_id)))?;

        let description = document
            .select(&sel("div.summary__content"))
            .next()
            .map(|d| d.text().collect::<String>().trim().to_string())
            .filter(|d| !d.is_empty());

        let cover_url = document
            .select(&sel("div.summary_image img"))
            .next()
            .and_then(|img| image_url(&img));

        let chapter_link = sel("li.wp-manga-chapter a");
        let mut chapters: Vec<ChapterInfo> = document
            .select(&chapter_link)
            .filter_map(|a| {
                let href = a.value().attr("href")?;
                let label = a.text().collect::<String>().trim().to_string();
                if label.is_empty() {
                    return None;
                }
                Some(ChapterInfo {
                    chapter_number: label,
                    url: href.to_string(),
                    title: None,
                })
            })
            .collect();
        // Madara lists newest first.
        chapters.reverse();

        Ok(SeriesDetails {
            source_series_id: series_id.to_string(),
            title,
            cover_url,
            description,
            chapters,
        })
    }

    fn chapter_pages(&self, tab: &Tab, chapter: &str) -> Result<Vec<PageImage>, FetchError> {
        let url = if chapter.starts_with("http") {
            chapter.to_string()
        } else {
            format!("{}/{}", self.base_url(), chapter.trim_start_matches('/'))
        };
        let html = html_after(tab, &url, "div.reading-content img", Duration::from_secs(15))?;
        let document = Html::parse_document(&html);

        let page_img = sel("div.reading-content img");
        let pages: Vec<PageImage> = document
            .select(&page_img)
            .filter_map(|img| image_url(&img))
            .enumerate()
            .map(|(index, url)| PageImage { index, url })
            .collect();

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_comes_from_last_path_segment() {
        assert_eq!(
            slug_from_url("https://manhuaus.com/manga/solo-leveling/"),
            "solo-leveling"
        );
        assert_eq!(slug_from_url("solo-leveling"), "solo-leveling");
    }
}
