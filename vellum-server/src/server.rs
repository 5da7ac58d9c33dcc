use crate::access::{
    AccessPolicy, Authorized, GuardState, RouteClass, access_guard, decoded_path, signed_path,
};
use crate::config::Config;
use crate::error::ApiError;
use crate::proxy::ServeProxy;
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Extension, Path, Query, RawQuery, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tower::ServiceBuilder;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use vellum_core::operations::{
    DeleteBlobOperation, DeleteBlobOperationOutcome, DeleteBlobOperationRequest,
    ListBlobsOperation, ListBlobsOperationRequest, PutBlobOperation, PutBlobOperationRequest,
    ReadBlobOperation, ReadBlobOperationOutcome, ReadBlobOperationRequest,
};
use vellum_core::{BlobKey, BlobMetadata, MetadataIndex, Result, Storage, VellumError};

const REQUEST_ID_HEADER: &str = "x-request-id";
const SERVE_PREFIX: &str = "/serve/";

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub policy: Arc<AccessPolicy>,
    pub proxy: Option<Arc<ServeProxy>>,
    pub put_blob: PutBlobOperation,
    pub read_blob: ReadBlobOperation,
    pub delete_blob: DeleteBlobOperation,
    pub list_blobs: ListBlobsOperation,
}

impl AppState {
    pub fn new(config: &Config, storage: Storage) -> Result<Self> {
        let signer = config.signer();
        let policy = AccessPolicy::new(
            signer.clone(),
            config.api_key().map(str::to_string),
            config.public,
            config.is_development(),
        );

        let proxy = match config.serve.upstream_url.as_deref() {
            Some(upstream) => Some(Arc::new(ServeProxy::new(
                upstream,
                Duration::from_secs(config.serve.timeout_secs),
                signer,
            )?)),
            None => None,
        };

        Ok(Self {
            put_blob: PutBlobOperation::new(storage.clone()),
            read_blob: ReadBlobOperation::new(storage.clone()),
            delete_blob: DeleteBlobOperation::new(storage.clone()),
            list_blobs: ListBlobsOperation::new(storage.clone()),
            storage,
            policy: Arc::new(policy),
            proxy,
        })
    }
}

#[derive(Debug, Serialize)]
struct BlobResponse {
    key: String,
    content_type: String,
    size: u64,
    checksum: String,
    etag: String,
    created_at: String,
    modified_at: String,
}

impl From<&BlobMetadata> for BlobResponse {
    fn from(meta: &BlobMetadata) -> Self {
        Self {
            key: meta.key.to_string(),
            content_type: meta.content_type.clone(),
            size: meta.size_bytes,
            checksum: meta.checksum.clone(),
            etag: meta.etag.clone(),
            created_at: meta.created_at.to_rfc3339(),
            modified_at: meta.modified_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListResponse {
    keys: Vec<BlobResponse>,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GetBlobQuery {
    #[serde(default)]
    download: Option<String>,
}

impl GetBlobQuery {
    fn wants_attachment(&self) -> bool {
        matches!(self.download.as_deref(), Some("1" | "true" | "yes"))
    }
}

#[derive(Debug, Deserialize)]
struct SignQuery {
    #[serde(default)]
    expire: Option<i64>,
    #[serde(default, rename = "x-expire")]
    x_expire: Option<i64>,
}

pub async fn run_server(config: Config) -> Result<()> {
    let storage = Storage::open(config.store_config())?;
    let state = AppState::new(&config, storage.clone())?;

    if config.is_development() {
        tracing::warn!("Running in development mode, signed URLs are not required");
    }
    if config.api_key().is_none() {
        tracing::warn!("No API key configured, API key verification is disabled");
    }
    if state.proxy.is_none() {
        tracing::info!("No serve.upstream_url configured, /serve is disabled");
    }

    let app = build_router(state, &config);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    let compaction = compaction_loop(
        storage.index.clone(),
        config.storage.compaction_interval_secs,
    );

    tokio::select! {
        result = server => result?,
        result = compaction => result?,
    }

    // Fold the WAL back before the lock is released.
    storage.index.blocking(|index| index.compact()).await?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    let base = config.storage.base_path.trim_end_matches('/').to_string();
    let policy = state.policy.clone();
    let guarded = |route: MethodRouter<AppState>, class: RouteClass| {
        let guard = GuardState {
            policy: policy.clone(),
            class,
        };
        route.route_layer(middleware::from_fn_with_state(guard, access_guard))
    };

    let reads = get(get_blob).head(head_blob);
    let reads = if policy.is_public() {
        reads
    } else {
        guarded(reads, RouteClass::Read)
    };
    let writes = guarded(
        axum::routing::put(put_blob).delete(delete_blob),
        RouteClass::Write,
    );

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/healthz", get(health_handler))
        .route(&base, guarded(get(list_blobs), RouteClass::Write))
        .route(&format!("{}/*key", base), reads.merge(writes))
        .route("/sign/*path", guarded(get(sign_path), RouteClass::ApiKey))
        .route("/serve/*rest", guarded(get(serve), RouteClass::Read))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(TimeoutLayer::new(config.request_timeout()))
                .layer(GlobalConcurrencyLimitLayer::new(config.max_concurrency)),
        )
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn list_blobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> std::result::Result<Json<ListResponse>, ApiError> {
    let result = state
        .list_blobs
        .run(ListBlobsOperationRequest {
            prefix: query.prefix,
            after: query.after.filter(|after| !after.is_empty()),
            limit: query.limit,
        })
        .await?;

    Ok(Json(ListResponse {
        keys: result.items.iter().map(BlobResponse::from).collect(),
        next_page: result.next_page,
    }))
}

async fn get_blob(
    State(state): State<AppState>,
    Query(query): Query<GetBlobQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let key = blob_key(&state, &uri)?;
    read_blob(&state, key, &headers, query.wants_attachment(), true).await
}

async fn head_blob(
    State(state): State<AppState>,
    Query(query): Query<GetBlobQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let key = blob_key(&state, &uri)?;
    read_blob(&state, key, &headers, query.wants_attachment(), false).await
}

/// Key for a blob route: the decoded path with the base prefix stripped.
fn blob_key(state: &AppState, uri: &Uri) -> Result<BlobKey> {
    BlobKey::from_request_path(&decoded_path(uri)?, &state.storage.config.base_path)
}

async fn read_blob(
    state: &AppState,
    key: BlobKey,
    headers: &HeaderMap,
    attachment: bool,
    include_body: bool,
) -> std::result::Result<Response, ApiError> {
    let outcome = state
        .read_blob
        .run(ReadBlobOperationRequest {
            key: key.clone(),
            range: header_string(headers, header::RANGE),
            if_none_match: header_string(headers, header::IF_NONE_MATCH),
            include_body,
        })
        .await?;

    let result = match outcome {
        ReadBlobOperationOutcome::Found(result) => result,
        ReadBlobOperationOutcome::NotModified(meta) => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            insert_header(response.headers_mut(), header::ETAG, &meta.etag);
            insert_header(
                response.headers_mut(),
                header::LAST_MODIFIED,
                &http_date(&meta.modified_at),
            );
            return Ok(response);
        }
        ReadBlobOperationOutcome::NotFound | ReadBlobOperationOutcome::Deleted => {
            return Err(VellumError::NotFound(key.to_string()).into());
        }
    };

    let meta = &result.meta;
    let (status, length) = match result.range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.len()),
        None => (StatusCode::OK, meta.size_bytes),
    };

    let body = match result.body {
        Some(body) => Body::from_stream(ReaderStream::new(body.file.take(body.length))),
        None => Body::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    insert_header(response_headers, header::CONTENT_TYPE, &meta.content_type);
    insert_header(response_headers, header::CONTENT_LENGTH, &length.to_string());
    insert_header(response_headers, header::ETAG, &meta.etag);
    insert_header(response_headers, header::LAST_MODIFIED, &http_date(&meta.modified_at));
    insert_header(response_headers, HeaderName::from_static("content-md5"), &meta.checksum);
    insert_header(response_headers, header::ACCEPT_RANGES, "bytes");
    insert_header(
        response_headers,
        header::CONTENT_DISPOSITION,
        &content_disposition(&meta.key, attachment),
    );
    if let Some(range) = result.range {
        insert_header(
            response_headers,
            header::CONTENT_RANGE,
            &range.content_range(meta.size_bytes),
        );
    }

    Ok(response)
}

async fn put_blob(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> std::result::Result<Response, ApiError> {
    let key = blob_key(&state, &uri)?;
    let content_length = match header_string(&headers, header::CONTENT_LENGTH) {
        Some(value) => Some(value.parse::<u64>().map_err(|_| {
            VellumError::InvalidRequest(format!("invalid content-length: {}", value))
        })?),
        None => None,
    };

    let result = state
        .put_blob
        .run(
            PutBlobOperationRequest {
                key,
                content_type: header_string(&headers, header::CONTENT_TYPE),
                content_length,
                if_match: header_string(&headers, header::IF_MATCH),
            },
            body.into_data_stream(),
        )
        .await?;

    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response = (status, Json(BlobResponse::from(&result.meta))).into_response();
    insert_header(response.headers_mut(), header::ETAG, &result.meta.etag);
    Ok(response)
}

async fn delete_blob(
    State(state): State<AppState>,
    uri: Uri,
) -> std::result::Result<StatusCode, ApiError> {
    let key = blob_key(&state, &uri)?;
    match state
        .delete_blob
        .run(DeleteBlobOperationRequest { key })
        .await?
    {
        DeleteBlobOperationOutcome::Deleted(_) | DeleteBlobOperationOutcome::AlreadyAbsent => {
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

async fn sign_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<SignQuery>,
) -> std::result::Result<String, ApiError> {
    let expiry = match query.expire.or(query.x_expire) {
        Some(seconds) => Some(DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
            VellumError::InvalidRequest(format!("expire out of range: {}", seconds))
        })?),
        None => None,
    };
    Ok(signed_path(state.policy.signer(), &path, expiry))
}

async fn serve(
    State(state): State<AppState>,
    Extension(authorized): Extension<Authorized>,
    RawQuery(query): RawQuery,
    uri: Uri,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let Some(proxy) = state.proxy.as_ref() else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "image service is not configured" })),
        )
            .into_response());
    };

    let raw_rest = uri.path().strip_prefix(SERVE_PREFIX).unwrap_or_default();
    let decoded = decoded_path(&uri)?;
    let rest = decoded.strip_prefix(SERVE_PREFIX).unwrap_or_default();

    Ok(proxy
        .forward(raw_rest, rest, query.as_deref(), &headers, &authorized)
        .await?)
}

/// Run index compaction every `interval_secs`. Returns only on failure.
async fn compaction_loop(index: MetadataIndex, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        return std::future::pending().await;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(error) = index.blocking(|index| index.compact()).await {
            tracing::error!("Metadata index compaction failed: {}", error);
            return Err(error);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", error);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("Failed to listen for SIGTERM: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!("Dropping unrepresentable {} header value", name),
    }
}

fn http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn content_disposition(key: &BlobKey, attachment: bool) -> String {
    let kind = if attachment { "attachment" } else { "inline" };
    let name = key.file_name().replace(['"', '\\'], "_");
    if name.is_ascii() {
        format!("{}; filename=\"{}\"", kind, name)
    } else {
        format!(
            "{}; filename*=UTF-8''{}",
            kind,
            urlencoding::encode(key.file_name())
        )
    }
}
