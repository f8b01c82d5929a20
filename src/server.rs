//! HTTP surface over the query engine.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::Error;
use crate::query::{QueryEngine, QueryHit};

const MAX_TOP_K: usize = 100;

type Loader = dyn Fn() -> crate::Result<QueryEngine> + Send + Sync;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<RwLock<Arc<QueryEngine>>>,
    loader: Arc<Loader>,
    default_k: usize,
    roots: Arc<Vec<PathBuf>>,
}

impl AppState {
    /// `loader` builds a fresh engine from disk; it runs once now, on the
    /// blocking pool, and again on every `/reload`.
    pub async fn new<F>(loader: F, default_k: usize) -> crate::Result<Self>
    where
        F: Fn() -> crate::Result<QueryEngine> + Send + Sync + 'static,
    {
        let loader: Arc<Loader> = Arc::new(loader);
        let first = loader.clone();
        let engine = tokio::task::spawn_blocking(move || (*first)())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("index load task failed: {e}"))))??;
        Ok(Self {
            engine: Arc::new(RwLock::new(Arc::new(engine))),
            loader,
            default_k,
            roots: Arc::new(Vec::new()),
        })
    }

    /// Directories `/search/path` may read from. Without any, path search
    /// is refused. Roots that don't exist are skipped.
    pub fn allow_paths_under<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut allowed = Vec::new();
        for root in roots {
            let root = root.as_ref();
            match root.canonicalize() {
                Ok(r) => allowed.push(r),
                Err(e) => tracing::warn!("not serving images from {}: {}", root.display(), e),
            }
        }
        self.roots = Arc::new(allowed);
        self
    }

    fn snapshot(&self) -> Arc<QueryEngine> {
        self.engine.read().clone()
    }

    fn top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_k).min(MAX_TOP_K)
    }

    /// Resolve a client-supplied path. Anything outside the roots is
    /// forbidden whether or not it exists.
    fn resolve(&self, requested: &Path) -> Result<PathBuf, ApiError> {
        let forbidden = || ApiError::new(StatusCode::FORBIDDEN, "path is outside the served directories");
        match requested.canonicalize() {
            Ok(path) if self.roots.iter().any(|r| path.starts_with(r)) => Ok(path),
            Ok(_) => Err(forbidden()),
            Err(_) => {
                if requested.components().any(|c| c == Component::ParentDir) {
                    return Err(forbidden());
                }
                let absolute = std::path::absolute(requested).map_err(|_| forbidden())?;
                if self.roots.iter().any(|r| absolute.starts_with(r)) {
                    Err(ApiError::new(
                        StatusCode::NOT_FOUND,
                        format!("no such image: {}", requested.display()),
                    ))
                } else {
                    Err(forbidden())
                }
            }
        }
    }
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::ImageDecode { .. } | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{}", self.message);
        }
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Serialize, Deserialize)]
pub struct HealthResp {
    pub status: String,
    pub rows: usize,
    pub dim: usize,
    pub kind: String,
    pub build_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    k: Option<usize>,
}

#[derive(Deserialize)]
pub struct PathSearchReq {
    path: PathBuf,
    top_k: Option<usize>,
}

#[derive(Serialize, Deserialize)]
pub struct SearchResp {
    pub hits: Vec<QueryHit>,
}

fn health_of(engine: &QueryEngine) -> HealthResp {
    HealthResp {
        status: "ok".into(),
        rows: engine.len(),
        dim: engine.dim(),
        kind: engine.kind().to_string(),
        build_id: engine.manifest().map(|m| m.build_id.to_string()),
    }
}

async fn health(State(st): State<AppState>) -> Json<HealthResp> {
    Json(health_of(&st.snapshot()))
}

async fn search_bytes(
    State(st): State<AppState>,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Result<Json<SearchResp>, ApiError> {
    let k = st.top_k(params.k);
    let engine = st.snapshot();
    info!("search: {} bytes, k={}", body.len(), k);
    let hits = run_blocking(move || engine.query_bytes(&body, k)).await?;
    Ok(Json(SearchResp { hits }))
}

async fn search_path(
    State(st): State<AppState>,
    Json(req): Json<PathSearchReq>,
) -> Result<Json<SearchResp>, ApiError> {
    let k = st.top_k(req.top_k);
    let path = st.resolve(&req.path)?;
    let engine = st.snapshot();
    info!("search: path={}, k={}", path.display(), k);
    let hits = run_blocking(move || engine.query_path(&path, k)).await?;
    Ok(Json(SearchResp { hits }))
}

async fn reload(State(st): State<AppState>) -> Result<Json<HealthResp>, ApiError> {
    let loader = st.loader.clone();
    let fresh = run_blocking(move || (*loader)()).await?;
    let resp = health_of(&fresh);
    *st.engine.write() = Arc::new(fresh);
    info!("index reloaded: {} rows", resp.rows);
    Ok(Json(resp))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(r) => r.map_err(ApiError::from),
        Err(e) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("query task failed: {e}"),
        )),
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/search", post(search_bytes))
        .route("/search/path", post(search_path))
        .route("/reload", post(reload))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
