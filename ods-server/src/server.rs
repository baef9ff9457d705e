use crate::config::Config;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use ods_core::{
    NodeContext, OdsError, PackageDetail, PeerCommand, PeerGateway, PeerLookup,
    ReceiveCommandOperation, ReceiveCommandOperationRequest, ReconcilePackagesOperation,
    RegisterPeerOperation, RegisterPeerOperationRequest, SyncJobRunner, authenticate,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub ctx: NodeContext,
    pub jobs: SyncJobRunner,
}

impl ServerState {
    pub fn new(ctx: NodeContext) -> Self {
        let jobs = SyncJobRunner::new(
            ctx.metadata.clone(),
            ctx.share.clone(),
            ctx.settings.max_sync_attempts,
        );
        Self { ctx, jobs }
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PackageListResponse {
    items: Vec<ods_core::Package>,
}

/// Maps core errors onto HTTP statuses.
pub struct ApiError(OdsError);

impl From<OdsError> for ApiError {
    fn from(error: OdsError) -> Self {
        Self(error)
    }
}

fn status_for(error: &OdsError) -> StatusCode {
    match error {
        OdsError::Authentication(_) => StatusCode::UNAUTHORIZED,
        OdsError::InvalidKey(_) => StatusCode::FORBIDDEN,
        OdsError::RegistrationConflict(_) | OdsError::Conflict(_) => StatusCode::CONFLICT,
        OdsError::PackageNotFound(_) | OdsError::PeerNotFound(_) => StatusCode::NOT_FOUND,
        OdsError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, axum::Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Open the stores and make sure this node has an identity.
pub fn open_context(config: &Config) -> anyhow::Result<NodeContext> {
    let ctx = NodeContext::open(config.node_settings(), &config.database_key()?)?;
    ctx.peers.ensure_identity(&config.identity_defaults())?;
    Ok(ctx)
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let ctx = open_context(&config)?;
    let identity = ctx.peers.identity()?;
    tracing::info!(
        issuer = %identity.issuer,
        name = %identity.name,
        stage = %identity.stage,
        "Starting ODS node on {}",
        config.node.bind_addr
    );

    if config.reconciliation.on_startup {
        let operation = ReconcilePackagesOperation::new(ctx.metadata.clone(), ctx.share.clone());
        if let Err(error) = operation.run().await {
            tracing::error!(%error, "Startup reconciliation failed");
        }
    }

    if let Some(secs) = config.reconciliation.interval_secs {
        tokio::spawn(reconciliation_loop(ctx.clone(), Duration::from_secs(secs.max(1))));
    }

    let state = Arc::new(ServerState::new(ctx));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!("Server listening on {}", config.node.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn reconciliation_loop(ctx: NodeContext, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // the first tick completes immediately; startup already had its pass
    interval.tick().await;

    let operation = ReconcilePackagesOperation::new(ctx.metadata.clone(), ctx.share.clone());
    loop {
        interval.tick().await;
        if let Err(error) = operation.run().await {
            tracing::error!(%error, "Scheduled reconciliation failed");
        }
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/about", get(about))
        .route("/command", post(command))
        .route("/packages", get(list_packages))
        .route("/packages/:id_or_name", get(get_package))
        .route("/share/:filename", get(get_share))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn remote_addr(headers: &HeaderMap, connect_info: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    forwarded.or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

async fn register(
    State(state): State<Arc<ServerState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let operation = RegisterPeerOperation::new(state.ctx.peers.clone(), state.ctx.clock.clone());
    operation
        .run(RegisterPeerOperationRequest {
            authorization: authorization(&headers).map(str::to_string),
            remote_addr: remote_addr(&headers, connect_info),
        })
        .await?;
    Ok(StatusCode::CREATED)
}

async fn about(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authenticate(
        &state.ctx.peers,
        authorization(&headers),
        state.ctx.clock.now(),
        PeerLookup::Required,
    )?;
    let identity = state.ctx.peers.identity()?;
    Ok(axum::Json(identity.profile()))
}

async fn command(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let authenticated = authenticate(
        &state.ctx.peers,
        authorization(&headers),
        state.ctx.clock.now(),
        PeerLookup::Required,
    )?;
    let peer = authenticated
        .peer
        .ok_or_else(|| OdsError::Authentication("unknown peer".to_string()))?;

    let command: PeerCommand = serde_json::from_slice(&body)
        .map_err(|error| OdsError::InvalidRequest(format!("malformed command: {}", error)))?;
    if command == PeerCommand::Unknown {
        tracing::debug!(issuer = %peer.issuer, "Ignoring unrecognized command");
        return Ok(StatusCode::ACCEPTED);
    }

    let gateway: Arc<dyn PeerGateway> = Arc::new(state.ctx.connector.connect(&peer.issuer)?);
    let operation = ReceiveCommandOperation::new(
        state.ctx.metadata.clone(),
        state.ctx.share.clone(),
        state.jobs.clone(),
    );

    tokio::spawn(async move {
        let issuer = gateway.issuer().to_string();
        let request = ReceiveCommandOperationRequest { command, gateway };
        if let Err(error) = operation.run(request).await {
            tracing::error!(issuer = %issuer, %error, "Failed to handle peer command");
        }
    });

    Ok(StatusCode::ACCEPTED)
}

async fn list_packages(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    let items = state.ctx.metadata.list_packages()?;
    Ok(axum::Json(PackageListResponse { items }))
}

async fn get_package(
    State(state): State<Arc<ServerState>>,
    Path(id_or_name): Path<String>,
) -> ApiResult<axum::Json<PackageDetail>> {
    let detail = state
        .ctx
        .metadata
        .get_package_detail(&id_or_name)?
        .ok_or(OdsError::PackageNotFound(id_or_name))?;
    Ok(axum::Json(detail))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a single `Range: bytes=...` header. Anything that is not a
/// single well-formed byte range is ignored and the full file is served.
fn parse_range(value: &str, len: u64) -> ByteRange {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: len.saturating_sub(suffix),
            end: len - 1,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end.is_empty() {
        u64::MAX
    } else {
        match end.parse::<u64>() {
            Ok(end) => end,
            Err(_) => return ByteRange::Full,
        }
    };
    if end < start {
        return ByteRange::Full;
    }
    if start >= len {
        return ByteRange::Unsatisfiable;
    }

    ByteRange::Partial {
        start,
        end: end.min(len - 1),
    }
}

async fn get_share(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let share = &state.ctx.share;
    let len = share.share_file_len(&filename).await?;
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_range(value, len))
        .unwrap_or(ByteRange::Full);

    let response = match range {
        ByteRange::Full => {
            let file = tokio::fs::File::open(share.share_path(&filename)?)
                .await
                .map_err(OdsError::from)?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from_stream(ReaderStream::new(file)))
        }
        ByteRange::Partial { start, end } => {
            let data = share.read_range(&filename, start, end).await?;
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, len),
                )
                .body(Body::from(data))
        }
        ByteRange::Unsatisfiable => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", len))
            .body(Body::empty()),
    };

    response.map_err(|e| ApiError(OdsError::Internal(e.to_string())))
}
