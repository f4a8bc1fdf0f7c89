pub mod address;
pub mod app;
pub mod blocklist;
pub mod config;
pub mod document;
pub mod hash;
pub mod icon;
pub mod logging;
pub mod probe;
pub mod resolver;
pub mod routes;
pub mod store;
pub mod text;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
