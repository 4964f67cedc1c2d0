use std::sync::Arc;

use jianzhen_core::{
    api,
    classifier::Classifier,
    config::{Config, LoggingConfig},
    geocode::ReverseGeocoder,
    metadata::MetadataAnalyzer,
    mmr_store::MmrStore,
    model::ModelService,
    notary::Notary,
    orchestrator::Orchestrator,
    signer::CheckpointSigner,
    store::EvidenceStore,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(cfg: &LoggingConfig) {
    // RUST_LOG 优先，其次配置文件
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    init_logging(&config.logging);
    info!(
        version = jianzhen_core::util::VERSION,
        host = %config.server.host,
        port = config.server.port,
        db = %config.storage.db_path.display(),
        notary = ?config.notary.backend,
        "configuration loaded"
    );

    // ----------------------------------------------------------------
    // 1. 存储 & 身份
    // ----------------------------------------------------------------
    let store = EvidenceStore::open(&config.storage.db_path)?;
    let signer = Arc::new(CheckpointSigner::load_or_generate(&config.notary.key_path)?);
    info!(public_key = %hex::encode(signer.public_key().to_bytes()), "notary identity");

    let mmr = MmrStore::open(store.db(), signer)?;
    let notary = Arc::new(Notary::from_config(&config, mmr)?);
    let store = Arc::new(store);

    // ----------------------------------------------------------------
    // 2. 模型：后台预热，请求到达时若未就绪则等待/触发
    // ----------------------------------------------------------------
    let model = Arc::new(ModelService::new(config.model.clone())?);
    {
        let model = model.clone();
        tokio::spawn(async move {
            if let Err(e) = model.init().await {
                warn!(error = %e, "model preload failed; classifier will report Error until retried");
            }
        });
    }
    let classifier = Arc::new(Classifier::new(model.clone()));

    let geocoder = if config.metadata.geocoding.enabled {
        Some(Arc::new(ReverseGeocoder::new(&config.metadata.geocoding)?))
    } else {
        None
    };
    let metadata = Arc::new(MetadataAnalyzer::new(&config.metadata, geocoder));

    let orchestrator = Arc::new(Orchestrator::new(store, classifier, metadata, notary));

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(Arc::new(api::AppState { orchestrator, model: model.clone() }));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    info!("  POST /verify          : submit image bytes for verification");
    info!("  GET  /evidence/{{id}}   : fetch a verification record");
    info!("  POST /verify-proof    : check the timestamp proof of a content hash");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    model.shutdown();
    Ok(())
}
