mod config;
mod pool;

pub use config::BrowserConfig;
pub use pool::{BrowserPool, PageOptions};
