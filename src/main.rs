use std::path::Path;
use std::sync::Arc;

use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer};
use log::info;
use serde::Deserialize;

use manga_fetcher::app_state::AppState;
use manga_fetcher::browser::BrowserPool;
use manga_fetcher::library::SqliteStore;
use manga_fetcher::models::DownloadRequest;
use manga_fetcher::packager::CbzPackager;
use manga_fetcher::scheduler::{ChapterSource, SchedulerConfig};
use manga_fetcher::sources::{Source, SourceRegistry};
use manga_fetcher::{Config, DownloadScheduler, FetchError, FetchOptions, Orchestrator};

fn error_response(e: FetchError) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        FetchError::UnknownSource(_) => HttpResponse::BadRequest().json(body),
        FetchError::BudgetExceeded { .. } => HttpResponse::Conflict().json(body),
        FetchError::Canceled => HttpResponse::Conflict().json(body),
        FetchError::Acquisition(_) | FetchError::Timeout(_) | FetchError::Browser(_) => {
            HttpResponse::BadGateway().json(body)
        }
        FetchError::Store(_) | FetchError::Io(_) => HttpResponse::InternalServerError().json(body),
    }
}

fn default_page() -> u32 {
    1
}

#[derive(Deserialize)]
struct SearchQuery {
    source: String,
    q: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default)]
    refresh: bool,
}

#[derive(Deserialize)]
struct ItemQuery {
    source: String,
    id: String,
    #[serde(default)]
    refresh: bool,
}

#[get("/search")]
async fn search(data: web::Data<AppState>, query: web::Query<SearchQuery>) -> HttpResponse {
    let source = match Source::from_key(&query.source) {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let opts = FetchOptions {
        refresh: query.refresh,
        cancel: None,
    };
    match data
        .orchestrator
        .search(source, &query.q, query.page, &opts)
        .await
    {
        Ok(results) => HttpResponse::Ok().json(results),
        Err(e) => error_response(e),
    }
}

#[get("/series")]
async fn series(data: web::Data<AppState>, query: web::Query<ItemQuery>) -> HttpResponse {
    let source = match Source::from_key(&query.source) {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let opts = FetchOptions {
        refresh: query.refresh,
        cancel: None,
    };
    match data
        .orchestrator
        .series_details(source, &query.id, &opts)
        .await
    {
        Ok(details) => HttpResponse::Ok().json(details),
        Err(e) => error_response(e),
    }
}

#[get("/chapters")]
async fn chapters(data: web::Data<AppState>, query: web::Query<ItemQuery>) -> HttpResponse {
    let source = match Source::from_key(&query.source) {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let opts = FetchOptions {
        refresh: query.refresh,
        cancel: None,
    };
    match data
        .orchestrator
        .chapter_images(&query.id, source, &opts)
        .await
    {
        Ok(pages) => HttpResponse::Ok().json(pages),
        Err(e) => error_response(e),
    }
}

#[post("/downloads")]
async fn create_download(
    data: web::Data<AppState>,
    body: web::Json<DownloadRequest>,
) -> HttpResponse {
    match data.scheduler.enqueue(body.into_inner()) {
        Ok(job) => HttpResponse::Accepted().json(job),
        Err(e) => error_response(e),
    }
}

#[get("/downloads")]
async fn list_downloads(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.scheduler.list_jobs())
}

#[get("/downloads/{id}")]
async fn get_download(data: web::Data<AppState>, id: web::Path<String>) -> HttpResponse {
    match data.scheduler.get_job(&id) {
        Some(job) => HttpResponse::Ok().json(job),
        None => HttpResponse::NotFound().json(serde_json::json!({"error": "job not found"})),
    }
}

#[delete("/downloads/{id}")]
async fn cancel_download(data: web::Data<AppState>, id: web::Path<String>) -> HttpResponse {
    match data.scheduler.cancel(&id) {
        Some(job) => HttpResponse::Ok().json(job),
        None => HttpResponse::NotFound().json(serde_json::json!({"error": "job not found"})),
    }
}

#[post("/shutdown")]
async fn shutdown_browser(data: web::Data<AppState>) -> HttpResponse {
    data.pool.shutdown().await;
    HttpResponse::Ok().json(serde_json::json!({"ok": true}))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default()).unwrap();

    let cfg = Config::load();
    std::fs::create_dir_all(&cfg.download_dir)?;
    std::fs::create_dir_all(&cfg.cache_dir)?;

    let store = SqliteStore::open(Path::new("manga_fetcher.db"))
        .unwrap_or_else(|e| panic!("failed to open library database: {e}"));

    let pool = Arc::new(BrowserPool::new(cfg.browser.clone()));
    let registry = Arc::new(SourceRegistry::with_defaults());
    let orchestrator = Arc::new(
        Orchestrator::new(pool.clone(), registry, &cfg)
            .unwrap_or_else(|e| panic!("failed to set up caches: {e}")),
    );
    let scheduler = DownloadScheduler::new(
        orchestrator.clone() as Arc<dyn ChapterSource>,
        Arc::new(CbzPackager::new()),
        Arc::new(store),
        SchedulerConfig::from_config(&cfg),
    );

    let data = web::Data::new(AppState {
        orchestrator,
        scheduler,
        pool,
        config: cfg,
    });

    let mut last_err: Option<std::io::Error> = None;
    for port in 8080..=8090 {
        let data_clone = data.clone();
        let addr = format!("127.0.0.1:{}", port);
        match HttpServer::new(move || {
            App::new()
                .app_data(data_clone.clone())
                .service(search)
                .service(series)
                .service(chapters)
                .service(create_download)
                .service(list_downloads)
                .service(get_download)
                .service(cancel_download)
                .service(shutdown_browser)
        })
        .bind(&addr)
        {
            Ok(server) => {
                info!("Listening on {}", addr);
                return server.run().await;
            }
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "No available ports 8080-8090",
        )
    }))
}
