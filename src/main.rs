//! Service binary: load config, build the pipeline, serve HTTP.

use std::sync::Arc;

use charla::charla::broker::HttpToolTransport;
use charla::charla::config::OrchestratorConfig;
use charla::charla::llm::HttpJsonModeClient;
use charla::charla::manifest::{Manifest, ManifestStore};
use charla::charla::pipeline::{Pipeline, StageClients};
use charla::charla::server::{serve, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = OrchestratorConfig::from_env();
    log::info!(
        "starting orchestrator (canary {}%, slm {})",
        config.canary_percent,
        if config.enable_slm_pipeline { "on" } else { "off" }
    );

    let manifest = match &config.manifest_path {
        Some(path) => Manifest::from_path(path)?,
        None => Manifest::builtin(),
    };
    let store = Arc::new(ManifestStore::new(manifest));
    #[cfg(unix)]
    if let Some(path) = config.manifest_path.clone() {
        charla::charla::manifest::spawn_sighup_reload(store.clone(), path);
    }

    // One connection pool shared by all backend clients.
    let http = reqwest::Client::new();
    let clients = StageClients {
        extractor: Arc::new(
            HttpJsonModeClient::new(&config.llm_endpoint, &config.extractor_model)
                .with_http_client(http.clone()),
        ),
        planner: Arc::new(
            HttpJsonModeClient::new(&config.llm_endpoint, &config.planner_model)
                .with_http_client(http.clone()),
        ),
        response: Arc::new(
            HttpJsonModeClient::new(&config.llm_endpoint, &config.response_model)
                .with_http_client(http.clone()),
        ),
    };
    let transport =
        Arc::new(HttpToolTransport::new(&config.tool_execute_endpoint).with_http_client(http));

    let pipeline = Arc::new(Pipeline::new(&config, clients, transport, store));
    let state = AppState::new(pipeline, config.max_concurrent_requests);

    serve(&config.bind_addr, state).await
}
