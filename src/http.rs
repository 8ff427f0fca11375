//! HTTP surface: the OAI-PMH endpoint and dump page downloads.

use crate::dumps::{PageRef, PAGE_CONTENT_TYPE};
use crate::error::{HarvestError, Result};
use crate::oai::{OaiEngine, OaiResponse, Verb};
use crate::repository::Repository;
use crate::types::DumpId;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub repository: Arc<Repository>,
    pub engine: Arc<OaiEngine>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/oai", get(handle_oai_get).post(handle_oai_post))
        .route("/dumps/:id/:kind/:index", get(handle_page))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: ServerState, config: &ServerConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_oai_get(
    State(state): State<ServerState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    respond(state, params).await
}

async fn handle_oai_post(
    State(state): State<ServerState>,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    respond(state, params).await
}

async fn respond(state: ServerState, params: Vec<(String, String)>) -> Response {
    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.respond(&params)).await;

    match result {
        Ok(Ok(response)) => xml_response(response),
        Ok(Err(e)) => internal_error(&e),
        Err(e) => {
            error!(error = %e, "OAI task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

fn xml_response(response: OaiResponse) -> Response {
    let mut http = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, XML_CONTENT_TYPE)],
        response.body,
    )
        .into_response();

    if response.verb == Some(Verb::ListRecords) {
        let headers = http.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }
    http
}

async fn handle_page(
    State(state): State<ServerState>,
    Path((id, kind, index)): Path<(u64, String, usize)>,
) -> Response {
    let repository = Arc::clone(&state.repository);
    let result = tokio::task::spawn_blocking(move || -> Result<Option<Arc<Vec<u8>>>> {
        let dump = repository.dump(DumpId(id))?;
        let page = find_page(
            &dump.marcxml_pages,
            dump.deletes_page.as_ref(),
            &dump.oai_pages,
            &kind,
            index,
        );
        match page {
            Some(page) => repository.read_page_compressed(&page).map(Some),
            None => Ok(None),
        }
    })
    .await;

    match result {
        Ok(Ok(Some(content))) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PAGE_CONTENT_TYPE)],
            content.as_ref().clone(),
        )
            .into_response(),
        Ok(Ok(None)) | Ok(Err(HarvestError::DumpNotFound(_))) => {
            (StatusCode::NOT_FOUND, "page not found").into_response()
        }
        Ok(Err(e)) => internal_error(&e),
        Err(e) => {
            error!(error = %e, "page task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

fn find_page(
    marcxml: &[PageRef],
    deletes: Option<&PageRef>,
    oai: &[PageRef],
    kind: &str,
    index: usize,
) -> Option<PageRef> {
    match kind {
        "marcxml" => marcxml.get(index),
        "oai" => oai.get(index),
        "deletes" if index == 0 => deletes,
        _ => None,
    }
    .cloned()
}

fn internal_error(e: &HarvestError) -> Response {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}
