use std::time::Duration;

use headless_chrome::Tab;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::error::FetchError;
use crate::models::{ChapterInfo, PageImage, SearchResults, SeriesDetails, SeriesSummary};
use crate::sources::{html_after, Source, SourceAdapter};

/// Flame Comics is a Next.js app; its state rides in the `__NEXT_DATA__`
/// script tag instead of the markup.
pub struct FlameComicsAdapter;

#[derive(Debug, Deserialize)]
struct NextData {
    props: NextProps,
}

#[derive(Debug, Deserialize)]
struct NextProps {
    #[serde(rename = "pageProps")]
    page_props: PageProps,
}

#[derive(Debug, Deserialize)]
struct PageProps {
    #[serde(rename = "latestEntries", default)]
    latest_entries: Option<LatestEntries>,
    #[serde(default)]
    series: Option<SeriesData>,
    #[serde(default)]
    chapters: Option<Vec<ChapterData>>,
}

#[derive(Debug, Deserialize)]
struct LatestEntries {
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct Block {
    series: Vec<SeriesData>,
}

#[derive(Debug, Deserialize)]
struct SeriesData {
    series_id: u32,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    cover: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ChapterData {
    chapter_id: u32,
    chapter: String,
    #[serde(default)]
    title: Option<String>,
}

fn extract_next_data(html: &str) -> Result<NextData, FetchError> {
    let re = Regex::new(r#"<script id="__NEXT_DATA__" type="application/json">(.+?)</script>"#)
        .map_err(FetchError::acquisition)?;
    let json = re
        .captures(html)
        .and_then(|c| c.get(1))
        .ok_or_else(|| FetchError::Acquisition("no __NEXT_DATA__ in page".to_string()))?
        .as_str();
    serde_json::from_str(json).map_err(FetchError::acquisition)
}

fn cover_url(series_id: u32, cover: &Option<String>) -> Option<String> {
    cover.as_ref().map(|c| {
        if c.starts_with("http") {
            c.clone()
        } else {
            format!(
                "https://cdn.flamecomics.xyz/uploads/images/series/{}/{}",
                series_id, c
            )
        }
    })
}

fn chapter_sort_key(chapter: &str) -> f64 {
    chapter.parse::<f64>().unwrap_or(f64::MAX)
}

impl FlameComicsAdapter {
    pub fn new() -> Self {
        Self
    }

    fn base_url(&self) -> &'static str {
        Source::FlameComics.profile().base_url
    }
}

impl Default for FlameComicsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceAdapter for FlameComicsAdapter {
    fn source(&self) -> Source {
        Source::FlameComics
    }

    fn search(&self, tab: &Tab, query: &str, page: u32) -> Result<SearchResults, FetchError> {
        // The site has no search endpoint; filter the front-page catalogue.
        let html = html_after(
            tab,
            self.base_url(),
            "script#__NEXT_DATA__",
            Duration::from_secs(10),
        )?;
        let data = extract_next_data(&html)?;

        let needle = query.to_lowercase();
        let mut entries = Vec::new();
        if let Some(latest) = data.props.page_props.latest_entries {
            for block in latest.blocks {
                for series in block.series {
                    if !needle.is_empty() && !series.title.to_lowercase().contains(&needle) {
                        continue;
                    }
                    entries.push(SeriesSummary {
                        source_series_id: series.series_id.to_string(),
                        title: series.title.clone(),
                        url: format!("{}/series/{}", self.base_url(), series.series_id),
                        cover_url: cover_url(series.series_id, &series.cover),
                        description: series.description.clone(),
                    });
                }
            }
        }
        entries.dedup_by(|a, b| a.source_series_id == b.source_series_id);

        Ok(SearchResults {
            source: Source::FlameComics,
            query: query.to_string(),
            page,
            entries,
        })
    }

    fn series_details(&self, tab: &Tab, series_id: &str) -> Result<SeriesDetails, FetchError> {
        let url = format!("{}/series/{}", self.base_url(), series_id);
        let html = html_after(tab, &url, "script#__NEXT_DATA__", Duration::from_secs(10))?;
        let data = extract_next_data(&html)?;

        let series = data
            .props
            .page_props
            .series
            .ok_or_else(|| FetchError::Acquisition(format!("no series data for {}", series_id)))?;

        let mut chapter_data = data.props.page_props.chapters.unwrap_or_default();
        chapter_data.sort_by(|a, b| {
            chapter_sort_key(&a.chapter)
                .partial_cmp(&chapter_sort_key(&b.chapter))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let chapters = chapter_data
            .into_iter()
            .map(|c| ChapterInfo {
                url: format!(
                    "{}/series/{}/{}",
                    self.base_url(),
                    series.series_id,
                    c.chapter_id
                ),
                chapter_number: c.chapter,
                title: c.title,
            })
            .collect();

        Ok(SeriesDetails {
            source_series_id: series.series_id.to_string(),
            title: series.title,
            cover_url: cover_url(series.series_id, &series.cover),
            description: series.description,
            chapters,
        })
    }

    fn chapter_pages(&self, tab: &Tab, chapter: &str) -> Result<Vec<PageImage>, FetchError> {
        let url = if chapter.starts_with("http") {
            chapter.to_string()
        } else {
            format!("{}/{}", self.base_url(), chapter.trim_start_matches('/'))
        };
        let html = html_after(tab, &url, "img", Duration::from_secs(15))?;
        let document = Html::parse_document(&html);

        let img = Selector::parse("img").unwrap();
        let pages: Vec<PageImage> = document
            .select(&img)
            .filter_map(|el| el.value().attr("src"))
            .filter(|src| src.contains("cdn.flamecomics"))
            .map(|src| src.to_string())
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
    fn next_data_parses_series_page() {
        let html = r#"<html><body><script id="__NEXT_DATA__" type="application/json">{"props":{"pageProps":{"series":{"series_id":42,"title":"The Gate","cover":"c.png"},"chapters":[{"chapter_id":2,"chapter":"2"},{"chapter_id":1,"chapter":"1"}]}}}</script></body></html>"#;
        let data = extract_next_data(html).unwrap();
        let series = data.props.page_props.series.unwrap();
        assert_eq!(series.series_id, 42);
        assert_eq!(series.title, "The Gate");
        assert_eq!(data.props.page_props.chapters.unwrap().len(), 2);
    }

    #[test]
    fn missing_next_data_is_an_acquisition_error() {
        let err = extract_next_data("<html></html>").unwrap_err();
        assert!(matches!(err, FetchError::Acquisition(_)));
    }

    #[test]
    fn relative_covers_get_the_cdn_prefix() {
        assert_eq!(
            cover_url(7, &Some("a.png".to_string())).unwrap(),
            "https://cdn.flamecomics.xyz/uploads/images/series/7/a.png"
        );
        assert_eq!(
            cover_url(7, &Some("https://x/a.png".to_string())).unwrap(),
            "https://x/a.png"
        );
    }
}
