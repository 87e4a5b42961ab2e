//! Broker HTTP server

use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use warden_api::{AcquireResponse, HealthResponse, LeaseRequest, LeasesResponse, ReleaseResponse};
use warden_core::{Acquisition, Broker, BrokerError};

use crate::{HttpResult, PoliciesResponse};

/// How long clients may cache a "lease not required" answer
pub const NOT_REQUIRED_MAX_AGE: &str = "max-age=300";

/// Server timing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Interval between purges; zero disables periodic purging
    pub purge_interval: Duration,
    /// Time allowed for in-flight requests after shutdown is requested
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            purge_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

type AppState = Arc<Broker>;

/// Build the router for the broker's endpoints
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/policies", get(policies))
        .route("/leases", get(leases))
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Serve the broker on `listener` until `shutdown` completes.
///
/// Leases are purged when the server starts, every
/// `options.purge_interval`, and once more after the server has stopped.
pub async fn serve<F>(
    listener: TcpListener,
    broker: Arc<Broker>,
    options: ServerOptions,
    shutdown: F,
) -> HttpResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    purge(&broker).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
    });

    let purger = tokio::spawn(purge_loop(broker.clone(), options.purge_interval, stop_rx.clone()));

    let addr = listener.local_addr()?;
    info!(addr = %addr, "Broker listening");

    let app = router(broker.clone());
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();

    let deadline = {
        let stop_rx = stop_rx.clone();
        async move {
            stopped(stop_rx).await;
            tokio::time::sleep(options.shutdown_timeout).await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => warn!(
            timeout = ?options.shutdown_timeout,
            "Graceful shutdown timed out; dropping open connections"
        ),
    }

    let _ = purger.await;
    purge(&broker).await;
    info!("Broker stopped");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        // A dropped sender also counts as shutdown
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn purge_loop(broker: Arc<Broker>, interval: Duration, stop: watch::Receiver<bool>) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let stop = stopped(stop);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = ticker.tick() => purge(&broker).await,
            _ = &mut stop => break,
        }
    }
}

async fn purge(broker: &Arc<Broker>) {
    let broker = broker.clone();
    match tokio::task::spawn_blocking(move || broker.purge()).await {
        Ok(Ok(changed)) => debug!(changed, "Lease purge complete"),
        Ok(Err(e)) => warn!(error = %e, "Lease purge failed"),
        Err(e) => error!(error = %e, "Lease purge task failed"),
    }
}

/// Run a blocking broker call off the async workers
async fn blocking<T, F>(broker: &AppState, f: F) -> Result<T, ErrorResponse>
where
    F: FnOnce(&Broker) -> Result<T, BrokerError> + Send + 'static,
    T: Send + 'static,
{
    let broker = broker.clone();
    match tokio::task::spawn_blocking(move || f(&broker)).await {
        Ok(result) => result.map_err(ErrorResponse::from),
        Err(e) => Err(ErrorResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }),
    }
}

/// A broker error mapped to an HTTP status
#[derive(Debug)]
pub struct ErrorResponse {
    status: StatusCode,
    message: String,
}

impl From<BrokerError> for ErrorResponse {
    fn from(err: BrokerError) -> Self {
        let status = match err {
            BrokerError::Request(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        }
        (self.status, self.message).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn policies(State(broker): State<AppState>, headers: HeaderMap) -> Result<Response, ErrorResponse> {
    let policies = blocking(&broker, |b| b.policies()).await?;

    if wants_text(&headers) {
        let mut body = String::new();
        for policy in policies.iter() {
            body.push_str(&policy.to_string());
            body.push('\n');
        }
        return Ok(body.into_response());
    }

    Ok(Json(PoliciesResponse { policies }).into_response())
}

fn wants_text(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|t| t.trim().starts_with("text/plain"))
        })
        .unwrap_or(false)
}

async fn leases(
    State(broker): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<LeasesResponse>, ErrorResponse> {
    let request = LeaseRequest::from_form(pairs);
    let resource = request.resource().to_string();
    let snapshots = blocking(&broker, move |b| b.snapshots(&resource)).await?;
    Ok(Json(LeasesResponse::new(request, snapshots)))
}

async fn acquire(
    State(broker): State<AppState>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Result<Response, ErrorResponse> {
    let request = LeaseRequest::from_form(pairs);

    match blocking(&broker, move |b| b.acquire(request)).await? {
        Acquisition::NotRequired { .. } => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static(NOT_REQUIRED_MAX_AGE));
            Ok(response)
        }
        Acquisition::Leased {
            request,
            lease,
            snapshot,
        } => Ok(Json(AcquireResponse {
            request,
            lease,
            leases: snapshot.leases,
        })
        .into_response()),
    }
}

async fn release(
    State(broker): State<AppState>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Result<Json<ReleaseResponse>, ErrorResponse> {
    let request = LeaseRequest::from_form(pairs);
    let release = blocking(&broker, move |b| b.release(request)).await?;
    Ok(Json(ReleaseResponse {
        request: release.request,
        success: true,
    }))
}
