use crate::{
    collaborators::{
        CollaboratorError, ExampleSettings, PluginSelectionRequest, PluginSelector,
        Query2SqlRequest, Text2SqlAgent,
    },
    preset::{BatchReport, PresetIndexError, PresetQuery, PresetQueryIndex, RetrievalResult},
};
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    pub index: Arc<PresetQueryIndex>,
    pub text2sql: Arc<dyn Text2SqlAgent>,
    pub plugins: Arc<dyn PluginSelector>,
    pub default_n_results: usize,
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/query2sql/", post(query2sql))
        .route("/query2sql_setting_update/", post(query2sql_setting_update))
        .route("/preset_query_retrival/", post(preset_query_retrival))
        .route("/preset_query_add/", post(preset_query_add))
        .route("/preset_query_update/", post(preset_query_update))
        .route("/preset_query_empty/", get(preset_query_empty))
        .route("/preset_delete_by_ids/", post(preset_delete_by_ids))
        .route("/preset_get_by_ids/", post(preset_get_by_ids))
        .route("/preset_query_size/", get(preset_query_size))
        .route("/plugin_selection/", post(plugin_selection))
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

async fn start_app(state: SharedState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::warn!("received Ctrl+C, shutting down"),
        _ = terminate => log::warn!("received SIGTERM, shutting down"),
    }
}

pub fn start_daemon(state: SharedState, host: &str, port: u16) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(state, host, port))
}

#[derive(Debug)]
enum HttpError {
    MissingField(&'static str),
    BadRequest(String),
    Index(PresetIndexError),
    PartialBatch(BatchReport),
    Collaborator(CollaboratorError),
    Internal(String),
}

impl From<PresetIndexError> for HttpError {
    fn from(err: PresetIndexError) -> Self {
        Self::Index(err)
    }
}

impl From<CollaboratorError> for HttpError {
    fn from(err: CollaboratorError) -> Self {
        Self::Collaborator(err)
    }
}

fn index_status(err: &PresetIndexError) -> StatusCode {
    match err {
        PresetIndexError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        PresetIndexError::DuplicateId(_) => StatusCode::CONFLICT,
        PresetIndexError::NotFound(_) => StatusCode::NOT_FOUND,
        PresetIndexError::EmbeddingProvider(_) => StatusCode::BAD_GATEWAY,
        PresetIndexError::EmbeddingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        PresetIndexError::Storage(_) | PresetIndexError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            HttpError::MissingField(field) => (
                StatusCode::BAD_REQUEST,
                json!({"error": format!("{field} is not in query_body")}),
            ),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            HttpError::Index(err) => {
                let status = index_status(&err);
                if status.is_server_error() {
                    log::error!("{err:?}");
                }
                (status, json!({"error": err.to_string()}))
            }
            HttpError::PartialBatch(report) => {
                log::error!(
                    "{} preset queries failed to embed: {:?}",
                    report.failed.len(),
                    report.failed
                );

                let all_timed_out = report
                    .failed
                    .iter()
                    .all(|f| matches!(f.error, PresetIndexError::EmbeddingTimeout(_)));
                let status = if all_timed_out {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                let failed: Vec<Value> = report
                    .failed
                    .iter()
                    .map(|f| json!({"preset_query_id": f.id, "error": f.error.to_string()}))
                    .collect();

                (
                    status,
                    json!({
                        "error": format!("{} preset queries could not be embedded", failed.len()),
                        "applied": report.applied,
                        "failed": failed,
                    }),
                )
            }
            HttpError::Collaborator(err) => {
                log::error!("{err:?}");
                let status = match &err {
                    CollaboratorError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
                    CollaboratorError::Reqwest(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                    CollaboratorError::Reqwest(_) | CollaboratorError::Upstream { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                };
                (status, json!({"error": err.to_string()}))
            }
            HttpError::Internal(msg) => {
                log::error!("{msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg}))
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Run blocking index or collaborator work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, HttpError>
where
    F: FnOnce() -> Result<T, HttpError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HttpError::Internal(format!("worker task failed: {e}")))?
}

fn as_object(body: &Value) -> Result<&Map<String, Value>, HttpError> {
    body.as_object()
        .ok_or_else(|| HttpError::BadRequest("request body must be a JSON object".to_string()))
}

/// Check `fields` are present, then decode the whole object.
fn parse_fields<T: DeserializeOwned>(
    body: Value,
    fields: &[&'static str],
) -> Result<T, HttpError> {
    let object = as_object(&body)?;
    if let Some(field) = fields.iter().find(|f| !object.contains_key(**f)) {
        return Err(HttpError::MissingField(*field));
    }

    serde_json::from_value(body).map_err(|e| HttpError::BadRequest(e.to_string()))
}

fn parse_ids(body: Value) -> Result<Vec<String>, HttpError> {
    serde_json::from_value(body).map_err(|_| {
        HttpError::BadRequest("request body must be a JSON array of preset_query_id strings".to_string())
    })
}

fn parse_presets(body: Value) -> Result<Vec<PresetQuery>, HttpError> {
    let Value::Array(items) = body else {
        return Err(HttpError::BadRequest(
            "request body must be a JSON array of {preset_query, preset_query_id}".to_string(),
        ));
    };

    items
        .into_iter()
        .map(|item| parse_fields(item, &["preset_query", "preset_query_id"]))
        .collect()
}

async fn query2sql(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let request: Query2SqlRequest = parse_fields(body, &["queryText", "schema", "currentDate"])?;
    log::debug!("query2sql: {:?}", request.query_text);

    let agent = state.text2sql.clone();
    blocking(move || Ok(agent.query2sql(request)?)).await.map(Json)
}

async fn query2sql_setting_update(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<&'static str>, HttpError> {
    let settings: ExampleSettings =
        parse_fields(body, &["sqlExamplars", "exampleNums", "isShortcut"])?;

    let agent = state.text2sql.clone();
    blocking(move || Ok(agent.update_examples(settings)?)).await?;

    Ok(Json("success"))
}

async fn plugin_selection(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let request: PluginSelectionRequest = parse_fields(body, &["queryText", "pluginConfigs"])?;

    let plugins = state.plugins.clone();
    blocking(move || Ok(plugins.select(request)?)).await.map(Json)
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalParams {
    n_results: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RetrievalBody {
    query_text_list: Vec<String>,
    n_results: Option<usize>,
}

async fn preset_query_retrival(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<RetrievalParams>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<RetrievalResult>>, HttpError> {
    let (query_texts, body_n_results) = match body {
        Value::Object(_) => {
            let body: RetrievalBody = parse_fields(body, &["query_text_list"])?;
            (body.query_text_list, body.n_results)
        }
        other => {
            let texts = serde_json::from_value(other).map_err(|_| {
                HttpError::BadRequest("query_text_list must be a list of strings".to_string())
            })?;
            (texts, None)
        }
    };

    let n_results = body_n_results
        .or(params.n_results)
        .unwrap_or(state.default_n_results);

    let index = state.index.clone();
    blocking(move || Ok(index.retrieve(&query_texts, n_results)?))
        .await
        .map(Json)
}

async fn preset_query_add(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<&'static str>, HttpError> {
    let presets = parse_presets(body)?;

    let index = state.index.clone();
    let report = blocking(move || Ok(index.add(presets)?)).await?;

    if !report.is_complete() {
        return Err(HttpError::PartialBatch(report));
    }

    Ok(Json("success"))
}

async fn preset_query_update(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<&'static str>, HttpError> {
    let presets = parse_presets(body)?;

    let index = state.index.clone();
    let report = blocking(move || Ok(index.update(presets)?)).await?;

    if !report.is_complete() {
        return Err(HttpError::PartialBatch(report));
    }

    Ok(Json("success"))
}

async fn preset_query_empty(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<&'static str>, HttpError> {
    let index = state.index.clone();
    blocking(move || Ok(index.empty()?)).await?;

    Ok(Json("success"))
}

async fn preset_delete_by_ids(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<&'static str>, HttpError> {
    let ids = parse_ids(body)?;

    let index = state.index.clone();
    blocking(move || Ok(index.delete_by_ids(&ids)?)).await?;

    Ok(Json("success"))
}

#[derive(Debug, Serialize)]
struct PresetLookup {
    preset_query_id: String,
    preset_query: Option<String>,
}

async fn preset_get_by_ids(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<PresetLookup>>, HttpError> {
    let ids = parse_ids(body)?;

    let index = state.index.clone();
    let records = blocking({
        let ids = ids.clone();
        move || Ok(index.get_by_ids(&ids)?)
    })
    .await?;

    let lookups = ids
        .into_iter()
        .zip(records)
        .map(|(preset_query_id, record)| PresetLookup {
            preset_query_id,
            preset_query: record.map(|r| r.text),
        })
        .collect();

    Ok(Json(lookups))
}

async fn preset_query_size(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<usize>, HttpError> {
    let index = state.index.clone();
    blocking(move || Ok(index.size()?)).await.map(Json)
}
