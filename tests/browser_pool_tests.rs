//! These tests drive a real Chrome/Chromium process and are ignored by
//! default. Run with `--ignored` on a machine with a browser installed.

use std::sync::Arc;
use std::time::Duration;

use manga_fetcher::browser::{BrowserConfig, BrowserPool, PageOptions};
use manga_fetcher::error::FetchError;
use manga_fetcher::CancelFlag;
use manga_fetcher::sources::Source;

const UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn options(timeout: Duration) -> PageOptions {
    PageOptions {
        source: Source::Manhuaus,
        user_agent: UA,
        referer: None,
        block_resources: true,
        timeout,
        cancel: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn runs_a_page_operation_and_cleans_up() {
    let pool = BrowserPool::new(BrowserConfig::default());

    let title = pool
        .with_page(options(Duration::from_secs(30)), |tab| {
            tab.navigate_to("https://example.com")
                .map_err(FetchError::acquisition)?;
            tab.wait_until_navigated().map_err(FetchError::acquisition)?;
            tab.get_title().map_err(FetchError::acquisition)
        })
        .await
        .unwrap();

    assert!(title.contains("Example"));
    assert_eq!(pool.open_page_count(), 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn a_fired_abort_signal_cancels_the_operation() {
    let pool = BrowserPool::new(BrowserConfig::default());
    let flag = CancelFlag::new();

    let mut opts = options(Duration::from_secs(30));
    opts.cancel = Some(flag.clone());

    let handle = {
        let flag = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            flag.cancel();
        })
    };

    let result: Result<String, FetchError> = pool
        .with_page(opts, |tab| {
            tab.navigate_to("https://example.com")
                .map_err(FetchError::acquisition)?;
            // Hold the page long enough for the abort to land.
            std::thread::sleep(Duration::from_secs(10));
            tab.get_title().map_err(FetchError::acquisition)
        })
        .await;

    handle.await.unwrap();
    assert!(matches!(result, Err(FetchError::Canceled)));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn shutdown_relaunches_on_next_use() {
    let pool = Arc::new(BrowserPool::new(BrowserConfig::default()));

    let first = pool
        .with_page(options(Duration::from_secs(30)), |tab| {
            tab.navigate_to("https://example.com")
                .map_err(FetchError::acquisition)?;
            Ok(())
        })
        .await;
    assert!(first.is_ok());

    pool.shutdown().await;

    let second = pool
        .with_page(options(Duration::from_secs(30)), |tab| {
            tab.navigate_to("https://example.com")
                .map_err(FetchError::acquisition)?;
            Ok(())
        })
        .await;
    assert!(second.is_ok());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn slow_operations_hit_the_hard_timeout() {
    let cfg = BrowserConfig {
        hard_timeout_ms: 2_000,
        ..BrowserConfig::default()
    };
    let pool = BrowserPool::new(cfg);

    let result: Result<(), FetchError> = pool
        .with_page(options(Duration::from_secs(60)), |_tab| {
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(FetchError::Timeout(_))));
    pool.shutdown().await;
}
