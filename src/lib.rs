pub mod app_state;
pub mod browser;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod helpers;
pub mod library;
pub mod models;
pub mod orchestrator;
pub mod packager;
pub mod scheduler;
pub mod sources;

pub use cancel::CancelFlag;
pub use config::Config;
pub use error::FetchError;
pub use orchestrator::{FetchOptions, Orchestrator};
pub use scheduler::DownloadScheduler;
