use axum::extract::{FromRequest, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::error::{AppError, EngineError, ErrorBody};
use crate::info;
use crate::model::{Actor, FieldDescriptor, LifecycleScripts, Row, TableDefinition};
use crate::orchestrator::{Engine, TableDescription};
use crate::query::{Page, RowQuery};
use crate::storage::{NewField, NewTable};
use crate::task::spawn_blocking_named;

pub const USER_HEADER: &str = "x-user-id";

// Our own JSON extractor wrapping `axum::Json`, so body rejections come back as `ErrorBody`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(EngineError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    axum::Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, AppJson(ErrorBody::from(&self))).into_response()
    }
}

/// Caller identity from the `x-user-id` header. Authentication happens in front of this service.
pub struct Caller(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Ok(Caller(Actor { user_id }))
    }
}

#[derive(Clone)]
pub struct RequestState {
    pub engine: Arc<Engine>,
}

fn flag(params: &HashMap<String, String>, name: &str) -> bool {
    params.get(name).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

async fn list_rows(
    State(state): State<RequestState>,
    Path(table): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Caller(actor): Caller,
) -> Result<AppJson<Page<Row>>, EngineError> {
    let query = RowQuery::from_params(&params);
    let engine = state.engine;
    spawn_blocking_named("rows.list", move || engine.list_rows(&table, &query, &actor)).await?.map(AppJson)
}

async fn get_row(
    State(state): State<RequestState>,
    Path((table, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    Caller(actor): Caller,
) -> Result<AppJson<Row>, EngineError> {
    let include_trashed = flag(&params, "trashed");
    let engine = state.engine;
    spawn_blocking_named("rows.get", move || engine.get_row(&table, &id, include_trashed, &actor)).await?.map(AppJson)
}

async fn create_row(
    State(state): State<RequestState>,
    Path(table): Path<String>,
    Caller(actor): Caller,
    AppJson(payload): AppJson<Value>,
) -> Result<(StatusCode, AppJson<Row>), EngineError> {
    let engine = state.engine;
    let row = spawn_blocking_named("rows.create", move || engine.create_row(&table, payload, &actor)).await??;
    Ok((StatusCode::CREATED, AppJson(row)))
}

/// A numeric `revision` in the body is the revision the caller read; the update fails if the row
/// has moved on since.
async fn update_row(
    State(state): State<RequestState>,
    Path((table, id)): Path<(String, String)>,
    Caller(actor): Caller,
    AppJson(payload): AppJson<Value>,
) -> Result<AppJson<Row>, EngineError> {
    let expected_revision = payload.get("revision").and_then(Value::as_u64);
    let engine = state.engine;
    spawn_blocking_named("rows.update", move || engine.update_row(&table, &id, payload, expected_revision, &actor)).await?.map(AppJson)
}

async fn trash_row(
    State(state): State<RequestState>,
    Path((table, id)): Path<(String, String)>,
    Caller(actor): Caller,
) -> Result<AppJson<Row>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("rows.trash", move || engine.trash_row(&table, &id, &actor)).await?.map(AppJson)
}

async fn restore_row(
    State(state): State<RequestState>,
    Path((table, id)): Path<(String, String)>,
    Caller(actor): Caller,
) -> Result<AppJson<Row>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("rows.restore", move || engine.restore_row(&table, &id, &actor)).await?.map(AppJson)
}

async fn describe_table(State(state): State<RequestState>, Path(table): Path<String>) -> Result<AppJson<TableDescription>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("tables.describe", move || engine.describe_table(&table)).await?.map(AppJson)
}

async fn create_table(
    State(state): State<RequestState>,
    AppJson(new_table): AppJson<NewTable>,
) -> Result<(StatusCode, AppJson<TableDefinition>), EngineError> {
    let engine = state.engine;
    let table = spawn_blocking_named("tables.create", move || engine.create_table(new_table)).await??;
    Ok((StatusCode::CREATED, AppJson(table)))
}

async fn trash_table(State(state): State<RequestState>, Path(table): Path<String>) -> Result<AppJson<TableDefinition>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("tables.trash", move || engine.trash_table(&table)).await?.map(AppJson)
}

async fn set_scripts(
    State(state): State<RequestState>,
    Path(table): Path<String>,
    AppJson(scripts): AppJson<LifecycleScripts>,
) -> Result<AppJson<TableDefinition>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("tables.scripts", move || engine.set_scripts(&table, scripts)).await?.map(AppJson)
}

async fn create_field(
    State(state): State<RequestState>,
    Path(table): Path<String>,
    AppJson(new_field): AppJson<NewField>,
) -> Result<(StatusCode, AppJson<FieldDescriptor>), EngineError> {
    let engine = state.engine;
    let field = spawn_blocking_named("fields.create", move || engine.create_field(&table, new_field)).await??;
    Ok((StatusCode::CREATED, AppJson(field)))
}

async fn trash_field(
    State(state): State<RequestState>,
    Path((table, field)): Path<(String, String)>,
) -> Result<AppJson<TableDefinition>, EngineError> {
    let engine = state.engine;
    spawn_blocking_named("fields.trash", move || engine.trash_field(&table, &field)).await?.map(AppJson)
}

pub fn build_router(state: RequestState, cors: Option<CorsLayer>) -> Router<()> {
    let router = Router::new()
        .route("/tables", post(create_table))
        .route("/tables/{table}", axum::routing::delete(trash_table))
        .route("/tables/{table}/schema", get(describe_table))
        .route("/tables/{table}/scripts", axum::routing::put(set_scripts))
        .route("/tables/{table}/fields", post(create_field))
        .route("/tables/{table}/fields/{field}", axum::routing::delete(trash_field))
        .route("/tables/{table}/rows", get(list_rows).post(create_row))
        .route("/tables/{table}/rows/{id}", get(get_row).patch(update_row).delete(trash_row))
        .route("/tables/{table}/rows/{id}/restore", post(restore_row))
        .with_state(state);
    if let Some(cors_layer) = cors {
        router.layer(cors_layer)
    } else {
        router
    }
}

pub async fn serve(state: RequestState, socket_addr: SocketAddr, cors: Option<CorsLayer>, shutdown: watch::Receiver<bool>) -> Result<(), AppError> {
    let router: Router<()> = build_router(state, cors);
    let tcp = TcpListener::bind(socket_addr).await?;
    info!("Serving on {}", socket_addr);

    let mut shutdown = shutdown.clone();
    axum::serve(tcp, router)
        .with_graceful_shutdown(async move {
            if shutdown.changed().await.is_ok() {
                info!("Shutting down server...");
            }
        })
        .await?;
    Ok(())
}
