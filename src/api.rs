use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    error::VerifyError,
    evidence::EvidenceResponse,
    fingerprint::ContentHash,
    ledger::LedgerEntry,
    model::{ModelService, ModelStatus},
    orchestrator::Orchestrator,
};

/// 单张图片上限
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 编排器内部各组件自带同步，这里不再需要外层 Mutex。
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub model: Arc<ModelService>,
}

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Deserialize)]
pub struct VerifyProofRequest {
    pub hash: String,
}

#[derive(Serialize, Deserialize)]
pub struct VerifyProofResponse {
    /// "valid" or "invalid"
    pub status: String,
    pub detail: String,
    pub notarized_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model: ModelStatus,
}

type ApiError = (StatusCode, String);

fn reject(e: VerifyError) -> ApiError {
    let status = match &e {
        VerifyError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn parse_hash(hex: &str) -> Result<ContentHash, ApiError> {
    ContentHash::from_hex(hex).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

// ==========================================
// 3. API 路由构建
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/verify", post(verify_evidence))
        .route("/evidence/{id}", get(get_evidence))
        .route("/images/{hash}", get(get_image))
        .route("/verify-proof", post(verify_proof))
        .route("/ledger/{hash}", get(get_ledger_entry))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

/// 接口：提交图片进行核验，请求体即图片原始字节
async fn verify_evidence(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<EvidenceResponse>, ApiError> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty request body".into()));
    }
    info!(bytes = body.len(), "verification request");
    let record = state
        .orchestrator
        .verify_evidence(body.to_vec())
        .await
        .map_err(reject)?;
    Ok(Json(record.to_response()))
}

/// 接口：按 id 取回核验记录
async fn get_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<EvidenceResponse>, ApiError> {
    match state.orchestrator.get(id).map_err(reject)? {
        Some(record) => Ok(Json(record.to_response())),
        None => Err((StatusCode::NOT_FOUND, format!("no evidence record {id}"))),
    }
}

/// 接口：按内容哈希取回原图
async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = parse_hash(&hash)?;
    let Some(bytes) = state.orchestrator.image(&hash.to_hex()).map_err(reject)? else {
        return Err((StatusCode::NOT_FOUND, format!("no image {hash}")));
    };
    let mime = match image::guess_format(&bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

/// 接口：按内容哈希定位并验证时间戳证明
async fn verify_proof(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyProofRequest>,
) -> Result<Json<VerifyProofResponse>, ApiError> {
    let hash = parse_hash(&req.hash)?;
    let outcome = state.orchestrator.verify_proof(&hash).await.map_err(reject)?;
    info!(hash = %hash, valid = outcome.valid, "proof verification");
    Ok(Json(VerifyProofResponse {
        status: if outcome.valid { "valid" } else { "invalid" }.to_string(),
        detail: outcome.detail,
        notarized_at: outcome.notarized_at,
    }))
}

/// 接口：查询公证账本
async fn get_ledger_entry(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<LedgerEntry>, ApiError> {
    let hash = parse_hash(&hash)?;
    match state.orchestrator.notary().ledger_entry(&hash).map_err(reject)? {
        Some(entry) => Ok(Json(entry)),
        None => Err((StatusCode::NOT_FOUND, format!("hash {hash} was never notarized"))),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::util::VERSION,
        model: state.model.status(),
    })
}
