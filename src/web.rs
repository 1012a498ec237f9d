use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::semantic::{
    AnchorAxis, AuthorIndexError, IndexError, SearchError, SearchResult, SearchService,
};

#[derive(Clone)]
pub struct SharedState {
    pub service: Arc<SearchService>,
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/embed", post(embed))
        .route("/emotion_axes", get(emotion_axes))
        .route("/index/:login/status", get(index_status))
        .route("/index/update/:login", post(update_index))
        .route("/search/similar/:login", post(search_similar))
        .route("/search/centroid/:login", post(search_centroid))
        .route("/search/emotion/:login", post(search_emotion))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn start_app(service: Arc<SearchService>, listen: String, preload: bool) {
    if preload {
        let warm_service = service.clone();
        tokio::task::spawn_blocking(move || warm_service.warm());
    }

    let shared_state = Arc::new(SharedState { service });
    let app = router(shared_state);

    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    let listener = tokio::net::TcpListener::bind(&listen).await.unwrap();
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

pub fn start_daemon(service: SearchService, listen: String, preload: bool) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(Arc::new(service), listen, preload).await });
}

// Wraps `SearchError` so axum can turn service failures into responses.
#[derive(Debug)]
struct HttpError(SearchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match &self.0 {
            SearchError::IndexUnavailable(_) => (
                axum::http::StatusCode::NOT_FOUND,
                json!({"error": "index_not_available"}).to_string(),
            ),
            SearchError::LengthMismatch { .. } | SearchError::EmptyComposition => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            SearchError::Author(AuthorIndexError::Index(IndexError::DimensionMismatch {
                ..
            })) => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            SearchError::ModelUnavailable => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": self.0.to_string()}).to_string(),
            ),
            SearchError::Embedding(_) | SearchError::Author(_) => {
                log::error!("{self:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}).to_string(),
                )
            }
        }
        .into_response()
    }
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        Self(err)
    }
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "model": state.service.model_name()}))
}

#[derive(Debug, Deserialize)]
struct EmbedRequest {
    texts: Vec<String>,
    #[serde(default = "default_normalize")]
    normalize: bool,
}

fn default_normalize() -> bool {
    true
}

#[derive(Serialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, HttpError> {
    if payload.texts.is_empty() {
        return Ok(Json(EmbedResponse { embeddings: vec![] }));
    }

    tokio::task::block_in_place(move || {
        let embeddings = state.service.embed(&payload.texts, payload.normalize)?;
        Ok(Json(EmbedResponse { embeddings }))
    })
}

#[derive(Serialize)]
struct EmotionAxesResponse {
    axes: Vec<AnchorAxis>,
}

async fn emotion_axes(State(state): State<Arc<SharedState>>) -> Json<EmotionAxesResponse> {
    Json(EmotionAxesResponse {
        axes: state.service.axes(),
    })
}

#[derive(Serialize)]
struct IndexStatusResponse {
    login: String,
    total: usize,
}

async fn index_status(
    State(state): State<Arc<SharedState>>,
    Path(login): Path<String>,
) -> Result<Json<IndexStatusResponse>, HttpError> {
    tokio::task::block_in_place(move || {
        let total = state.service.status(&login)?;
        Ok(Json(IndexStatusResponse { login, total }))
    })
}

#[derive(Debug, Deserialize)]
struct IndexUpdateRequest {
    comment_ids: Vec<String>,
    texts: Vec<String>,
}

#[derive(Serialize)]
struct IndexUpdateResponse {
    status: String,
    added: usize,
    total: usize,
    login: String,
}

async fn update_index(
    State(state): State<Arc<SharedState>>,
    Path(login): Path<String>,
    Json(payload): Json<IndexUpdateRequest>,
) -> Result<Json<IndexUpdateResponse>, HttpError> {
    log::debug!("index update [{login}]: {} comments submitted", payload.comment_ids.len());

    tokio::task::block_in_place(move || {
        let outcome = state
            .service
            .update_index(&login, payload.comment_ids, payload.texts)?;
        Ok(Json(IndexUpdateResponse {
            status: "ok".to_string(),
            added: outcome.added,
            total: outcome.total,
            login,
        }))
    })
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SimilarSearchRequest {
    query: String,
    #[serde(default = "default_similar_top_k")]
    top_k: usize,
}

fn default_similar_top_k() -> usize {
    20
}

async fn search_similar(
    State(state): State<Arc<SharedState>>,
    Path(login): Path<String>,
    Json(payload): Json<SimilarSearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let results = state
            .service
            .search_similar(&login, &payload.query, payload.top_k)?;
        Ok(Json(SearchResponse { results }))
    })
}

#[derive(Debug, Deserialize)]
struct CentroidSearchRequest {
    #[serde(default = "default_position")]
    position: f32,
    #[serde(default = "default_window_top_k")]
    top_k: usize,
}

fn default_position() -> f32 {
    0.5
}

fn default_window_top_k() -> usize {
    50
}

async fn search_centroid(
    State(state): State<Arc<SharedState>>,
    Path(login): Path<String>,
    Json(payload): Json<CentroidSearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let results = state
            .service
            .search_centroid(&login, payload.position, payload.top_k)?;
        Ok(Json(SearchResponse { results }))
    })
}

#[derive(Debug, Deserialize)]
struct EmotionSearchRequest {
    weights: HashMap<String, f32>,
    #[serde(default = "default_window_top_k")]
    top_k: usize,
}

async fn search_emotion(
    State(state): State<Arc<SharedState>>,
    Path(login): Path<String>,
    Json(payload): Json<EmotionSearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let results = state
            .service
            .search_emotion(&login, &payload.weights, payload.top_k)?;
        Ok(Json(SearchResponse { results }))
    })
}
