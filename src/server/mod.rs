//! HTTP surface binding the variables route to the policy engine.

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::routing::get;
use axum::{middleware, Extension, Json, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::engine::{Engine, ReadRequest};
use crate::errors::AppError;
use crate::models::{MetadataResponse, VariablesRequest, VariablesResponse};

pub mod auth;

use auth::AuthContext;

pub const API_VERSION: &str = "1.0";

/// Hard cap on request bodies.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the router: an unauthenticated metadata route and the
/// bearer-gated variables route, with request-id and tracing layers.
pub fn app(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };

    let protected = Router::new()
        .route("/ezoidc/1.0/variables", get(variables).post(variables))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ));

    Router::new()
        .route("/ezoidc/", get(metadata))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default();
                    info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Bind the configured address and serve until shutdown.
pub async fn serve(engine: Arc<Engine>) -> std::io::Result<()> {
    let address = engine.configuration.listen.clone();
    let listener = TcpListener::bind(&address).await?;
    info!(address = %address, "starting api server");
    axum::serve(listener, app(engine)).await
}

async fn metadata() -> Json<MetadataResponse> {
    Json(MetadataResponse {
        ezoidc: true,
        api_version: API_VERSION.to_string(),
    })
}

async fn variables(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    request: Request,
) -> Result<Json<VariablesResponse>, AppError> {
    let method = request.method().clone();
    let bytes = to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::BodyTooLarge)?;

    // Params are only carried by the POST form.
    let params = if method == Method::POST && !bytes.is_empty() {
        let body: VariablesRequest =
            serde_json::from_slice(&bytes).map_err(AppError::InvalidBody)?;
        body.params
    } else {
        None
    };

    let response = state
        .engine
        .read_variables(&ReadRequest {
            claims: Some(auth.claims.clone()),
            params,
        })
        .await?;

    let subject = auth
        .claims
        .get("sub")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    info!(
        allowed = %serde_json::to_string(&response.allowed).unwrap_or_default(),
        issuer = %auth.issuer,
        sub = %subject,
        "variables request"
    );

    Ok(Json(VariablesResponse {
        variables: response.variables,
    }))
}
