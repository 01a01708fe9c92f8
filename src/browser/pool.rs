use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use headless_chrome::browser::tab::{RequestInterceptor, RequestPausedDecision};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::protocol::cdp::Fetch::FailRequest;
use headless_chrome::protocol::cdp::Network::{ErrorReason, ResourceType};
use headless_chrome::{Browser, LaunchOptions, Tab};
use log::{debug, info, warn};

use crate::browser::BrowserConfig;
use crate::cancel::CancelFlag;
use crate::error::FetchError;
use crate::sources::Source;

/// Overrides navigator properties that give headless Chrome away.
const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined
    });
    Object.defineProperty(navigator, 'plugins', {
        get: () => [1, 2, 3, 4, 5]
    });
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en']
    });
"#;

/// Per-operation page settings, derived from the source's profile.
pub struct PageOptions {
    pub source: Source,
    pub user_agent: &'static str,
    pub referer: Option<&'static str>,
    /// Block images, media, fonts and stylesheets. Off for sources whose
    /// pages only render through their own image loads.
    pub block_resources: bool,
    pub timeout: Duration,
    pub cancel: Option<Arc<CancelFlag>>,
}

struct PageLease {
    tab: Arc<Tab>,
    source: Source,
    opened_at: Instant,
}

/// Owns the single shared browser and a registry of every page opened
/// through it.
///
/// The browser launches lazily; concurrent first users coalesce on the slot
/// lock so only one launch happens. Every page is tracked in the registry so
/// stale pages can be swept and shutdown can close everything.
pub struct BrowserPool {
    cfg: BrowserConfig,
    browser: tokio::sync::Mutex<Option<Arc<Browser>>>,
    leases: Mutex<HashMap<u64, PageLease>>,
    next_lease: AtomicU64,
}

impl BrowserPool {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self {
            cfg,
            browser: tokio::sync::Mutex::new(None),
            leases: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        }
    }

    pub fn open_page_count(&self) -> usize {
        self.leases.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Open a configured page, run `handler` on a blocking thread, then close
    /// the page whatever happened.
    ///
    /// The operation is bounded by the smaller of the source timeout and the
    /// pool's hard timeout. If an abort signal fires mid-operation the page
    /// is force-closed, which makes the blocked handler error out; that error
    /// is reported as `Canceled`.
    pub async fn with_page<R, F>(&self, opts: PageOptions, handler: F) -> Result<R, FetchError>
    where
        R: Send + 'static,
        F: FnOnce(&Tab) -> Result<R, FetchError> + Send + 'static,
    {
        self.sweep_stale();

        let browser = self.ensure_browser().await?;
        let tab = {
            let block_resources = opts.block_resources;
            let user_agent = opts.user_agent;
            let referer = opts.referer;
            let timeout = opts.timeout.min(self.cfg.hard_timeout());
            tokio::task::spawn_blocking(move || {
                open_page(&browser, user_agent, referer, block_resources, timeout)
            })
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?
            .map_err(FetchError::Browser)?
        };

        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut leases) = self.leases.lock() {
            leases.insert(
                lease_id,
                PageLease {
                    tab: tab.clone(),
                    source: opts.source,
                    opened_at: Instant::now(),
                },
            );
        }
        debug!("opened page {} for {}", lease_id, opts.source.key());

        let watcher = opts.cancel.clone().map(|flag| {
            let tab = tab.clone();
            tokio::spawn(async move {
                flag.canceled().await;
                let _ = tokio::task::spawn_blocking(move || {
                    let _ = tab.close(true);
                })
                .await;
            })
        });

        let deadline = opts.timeout.min(self.cfg.hard_timeout());
        let handler_tab = tab.clone();
        let work = tokio::task::spawn_blocking(move || handler(handler_tab.as_ref()));
        let outcome = tokio::time::timeout(deadline, work).await;

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.close_lease(lease_id).await;

        let canceled = opts
            .cancel
            .as_ref()
            .map(|f| f.is_canceled())
            .unwrap_or(false);

        match outcome {
            Err(_) => {
                if canceled {
                    Err(FetchError::Canceled)
                } else {
                    Err(FetchError::Timeout(format!(
                        "page operation for {} exceeded {:?}",
                        opts.source.key(),
                        deadline
                    )))
                }
            }
            Ok(Err(join_err)) => Err(FetchError::Browser(join_err.to_string())),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                if canceled {
                    Err(FetchError::Canceled)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Close every page older than the stale threshold. Called on each
    /// checkout so leaked pages cannot accumulate.
    fn sweep_stale(&self) {
        let stale_after = self.cfg.stale_after();
        let stale: Vec<(u64, PageLease)> = match self.leases.lock() {
            Ok(mut leases) => {
                let ids: Vec<u64> = leases
                    .iter()
                    .filter(|(_, l)| l.opened_at.elapsed() > stale_after)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| leases.remove(&id).map(|l| (id, l)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for (id, lease) in stale {
            warn!(
                "sweeping stale page {} for {} open {:?}",
                id,
                lease.source.key(),
                lease.opened_at.elapsed()
            );
            let _ = tokio::task::spawn_blocking(move || {
                let _ = lease.tab.close(true);
            });
        }
    }

    async fn close_lease(&self, id: u64) {
        let lease = self
            .leases
            .lock()
            .ok()
            .and_then(|mut leases| leases.remove(&id));
        let Some(lease) = lease else {
            return;
        };
        let wait = self.cfg.close_wait();
        let tab = lease.tab;
        let closed =
            tokio::time::timeout(wait, tokio::task::spawn_blocking(move || tab.close(true))).await;
        match closed {
            Ok(Ok(Ok(_))) => debug!("closed page {}", id),
            Ok(Ok(Err(e))) => warn!("page {} close failed: {}", id, e),
            Ok(Err(e)) => warn!("page {} close task failed: {}", id, e),
            Err(_) => warn!("page {} close timed out after {:?}", id, wait),
        }
    }

    async fn ensure_browser(&self) -> Result<Arc<Browser>, FetchError> {
        let mut slot = self.browser.lock().await;
        if let Some(browser) = slot.as_ref() {
            return Ok(browser.clone());
        }
        info!("launching shared browser");
        let cfg = self.cfg.clone();
        let browser = tokio::task::spawn_blocking(move || launch_browser(&cfg))
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?
            .map_err(FetchError::Browser)?;
        let browser = Arc::new(browser);
        *slot = Some(browser.clone());
        Ok(browser)
    }

    /// Close every open page and kill the browser process. The next checkout
    /// relaunches.
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = self
            .leases
            .lock()
            .map(|leases| leases.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.close_lease(id).await;
        }

        let browser = self.browser.lock().await.take();
        if let Some(browser) = browser {
            if let Some(pid) = browser.get_process_id() {
                info!("shutting down browser process {}", pid);
            }
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
        }
    }
}

fn launch_browser(cfg: &BrowserConfig) -> Result<Browser, String> {
    let args: Vec<&OsStr> = vec![
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--no-sandbox"),
        OsStr::new("--disable-setuid-sandbox"),
        OsStr::new("--disable-web-security"),
        OsStr::new("--disable-features=IsolateOrigins,site-per-process"),
    ];

    let launch_options = LaunchOptions::default_builder()
        .headless(cfg.headless)
        .window_size(Some((cfg.window_width, cfg.window_height)))
        .idle_browser_timeout(cfg.idle_timeout())
        .args(args)
        .build()
        .map_err(|e| e.to_string())?;

    Browser::new(launch_options).map_err(|e| e.to_string())
}

fn open_page(
    browser: &Browser,
    user_agent: &'static str,
    referer: Option<&'static str>,
    block_resources: bool,
    timeout: Duration,
) -> Result<Arc<Tab>, String> {
    let tab = browser.new_tab().map_err(|e| e.to_string())?;
    tab.set_default_timeout(timeout);
    tab.set_user_agent(user_agent, None, None)
        .map_err(|e| e.to_string())?;
    if let Some(referer) = referer {
        let mut headers = HashMap::new();
        headers.insert("Referer", referer);
        tab.set_extra_http_headers(headers)
            .map_err(|e| e.to_string())?;
    }
    if block_resources {
        tab.enable_fetch(None, None).map_err(|e| e.to_string())?;
        let interceptor: Arc<dyn RequestInterceptor + Send + Sync> =
            Arc::new(block_heavy_resources);
        tab.enable_request_interception(interceptor)
            .map_err(|e| e.to_string())?;
    }
    tab.evaluate(STEALTH_SCRIPT, false)
        .map_err(|e| e.to_string())?;
    Ok(tab)
}

fn block_heavy_resources(
    _transport: Arc<Transport>,
    _session_id: SessionId,
    event: RequestPausedEvent,
) -> RequestPausedDecision {
    match event.params.resource_Type {
        ResourceType::Image | ResourceType::Media | ResourceType::Font | ResourceType::Stylesheet => {
            RequestPausedDecision::Fail(FailRequest {
                request_id: event.params.request_id,
                error_reason: ErrorReason::BlockedByClient,
            })
        }
        _ => RequestPausedDecision::Continue(None),
    }
}
