use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::parse_subject;
use crate::report::FilteredView;

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Deserialize)]
pub struct HolderQuery {
    pub limit: Option<usize>, // defaults to all
}

/// Read-only routes over a finished run's report.
pub fn router(view: Arc<FilteredView>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Target indexer report ready" }))
        .route("/report", get(get_report))
        .route("/tokens", get(get_token))
        .route("/holders", get(get_holders))
        .with_state(view)
        .layer(cors)
}

pub async fn serve(port: u16, view: Arc<FilteredView>) -> eyre::Result<()> {
    let app = router(view);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Report API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn get_report(State(view): State<Arc<FilteredView>>) -> Json<FilteredView> {
    Json(view.as_ref().clone())
}

async fn get_token(State(view): State<Arc<FilteredView>>, Query(q): Query<TokenQuery>) -> impl IntoResponse {
    let token = match parse_subject(&q.token) {
        Ok(token) => token,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match view.token(&token) {
        Some(report) => Json(report.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "token not in filtered view".to_string()).into_response(),
    }
}

async fn get_holders(State(view): State<Arc<FilteredView>>, Query(q): Query<HolderQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(view.holders.len());
    Json(view.holders.iter().take(limit).cloned().collect::<Vec<_>>())
}
