use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use meter_client::domain::{Meter, MonthKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::{
    confirm::{ConfirmationRequest, PreConfirmed},
    entry::{self, EntryError, EntryOutcome},
    projection::{self, BillingRow, DailyGroup, FamilyUsage},
    repository::RepositoryError,
    store::{MeterPatch, MeterState, MeterStore, NewMeter, StoreError, StoreStatus},
};

#[derive(Clone)]
struct ApiState {
    store: MeterStore,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub loaded: bool,
    pub last_error: Option<String>,
    pub permission_denied: bool,
}

impl From<StoreStatus> for StatusView {
    fn from(status: StoreStatus) -> Self {
        Self {
            loaded: status.loaded,
            permission_denied: matches!(status.last_error, Some(RepositoryError::PermissionDenied(_))),
            last_error: status.last_error.map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    #[serde(flatten)]
    pub state: MeterState,
    pub status: StatusView,
}

impl StateView {
    fn of(state: &MeterState, store: &MeterStore) -> Self {
        Self {
            state: state.clone(),
            status: store.status().into(),
        }
    }
}

/// Readings arrive either as JSON numbers or as the raw text an operator
/// typed; text goes through the same parser as any other input.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawReading {
    Number(f64),
    Text(String),
}

impl RawReading {
    fn as_input(&self) -> String {
        match self {
            Self::Number(v) => v.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadingBody {
    value: RawReading,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
pub struct LockMonthBody {
    month: MonthKey,
    value: RawReading,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMeterBody {
    id: Option<String>,
    name: String,
    #[serde(default)]
    meter_number: String,
    family: String,
}

#[derive(Debug, Deserialize)]
pub struct FamilyBody {
    name: Option<String>,
    color: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmQuery {
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug)]
pub enum ApiError {
    Entry(EntryError),
    /// The action needs an explicit `confirm`; carries what would have been asked.
    NeedsConfirmation(ConfirmationRequest),
    BadRequest(String),
}

impl From<EntryError> for ApiError {
    fn from(e: EntryError) -> Self {
        Self::Entry(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Entry(EntryError::Store(e))
    }
}

fn error_kind(e: &EntryError) -> &'static str {
    match e {
        EntryError::Reading(r) => r.kind(),
        EntryError::Store(StoreError::UnknownMeter(_)) => "unknown_meter",
        EntryError::Store(StoreError::DuplicateMeter(_)) => "duplicate_meter",
        EntryError::Store(StoreError::UnknownFamily(_)) => "unknown_family",
        EntryError::Store(StoreError::DuplicateFamily(_)) => "duplicate_family",
        EntryError::Store(StoreError::FamilyInUse { .. }) => "family_in_use",
        EntryError::Store(StoreError::NotLoaded) => "not_loaded",
        EntryError::MonthLocked { .. } => "month_locked",
        EntryError::MonthNotLocked { .. } => "month_not_locked",
    }
}

fn error_status(e: &EntryError) -> StatusCode {
    match e {
        EntryError::Reading(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EntryError::Store(StoreError::UnknownMeter(_) | StoreError::UnknownFamily(_)) => StatusCode::NOT_FOUND,
        EntryError::Store(StoreError::NotLoaded) => StatusCode::SERVICE_UNAVAILABLE,
        EntryError::Store(_) | EntryError::MonthLocked { .. } | EntryError::MonthNotLocked { .. } => {
            StatusCode::CONFLICT
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Entry(e) => {
                let body = json!({ "error": e.to_string(), "kind": error_kind(&e) });
                (error_status(&e), Json(body)).into_response()
            }
            Self::NeedsConfirmation(request) => {
                let body = json!({ "error": "confirmation required", "confirmation": request });
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn count(route: &'static str) {
    metrics::counter!("http_api_requests_total", "route" => route).increment(1);
}

fn committed(store: &MeterStore, state: &MeterState) -> ApiResult<StateView> {
    Ok(Json(StateView::of(state, store)))
}

fn loaded_meter(store: &MeterStore, id: String) -> Result<Meter, ApiError> {
    store.ensure_loaded()?;
    Ok(store.meter(&id).ok_or(StoreError::UnknownMeter(id))?)
}

fn entry_outcome(store: &MeterStore, outcome: EntryOutcome) -> ApiResult<StateView> {
    match outcome {
        EntryOutcome::Committed(state) => committed(store, &state),
        EntryOutcome::Declined(request) => Err(ApiError::NeedsConfirmation(request)),
    }
}

pub fn router(store: MeterStore) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/status", get(get_status))
        .route("/meters", post(add_meter))
        .route("/meters/:id", axum::routing::patch(update_meter).delete(delete_meter))
        .route("/meters/:id/current", post(set_current))
        .route("/meters/:id/readings", post(record_reading))
        .route("/meters/:id/monthly", post(lock_month))
        .route("/meters/:id/monthly/:month", put(edit_month))
        .route("/meters/:id/daily", get(daily_history))
        .route("/meters/:id/billing", get(billing))
        .route("/families", post(add_family))
        .route("/families/usage", get(families_usage))
        .route("/families/:name", put(update_family).delete(delete_family))
        .with_state(ApiState { store })
}

pub async fn serve(bind_addr: &str, store: MeterStore) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api bind address {bind_addr}: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "meter API listening");
    axum::serve(listener, router(store).into_make_service()).await?;
    Ok(())
}

async fn get_state(State(api): State<ApiState>) -> Json<StateView> {
    count("get_state");
    Json(StateView::of(&api.store.snapshot(), &api.store))
}

async fn get_status(State(api): State<ApiState>) -> Json<StatusView> {
    count("get_status");
    Json(api.store.status().into())
}

async fn add_meter(State(api): State<ApiState>, Json(body): Json<AddMeterBody>) -> ApiResult<StateView> {
    count("add_meter");
    let new = NewMeter {
        id: body
            .id
            .unwrap_or_else(|| NewMeter::generated_id(OffsetDateTime::now_utc())),
        name: body.name,
        meter_number: body.meter_number,
        family: body.family,
    };
    let state = api.store.add_meter(new)?;
    committed(&api.store, &state)
}

async fn update_meter(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<MeterPatch>,
) -> ApiResult<StateView> {
    count("update_meter");
    let state = api.store.update_meter(&id, patch)?;
    committed(&api.store, &state)
}

async fn delete_meter(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<ConfirmQuery>,
) -> ApiResult<StateView> {
    count("delete_meter");
    let outcome = entry::remove_meter(&api.store, &PreConfirmed(q.confirm), &id).await?;
    entry_outcome(&api.store, outcome)
}

async fn set_current(State(api): State<ApiState>, Path(id): Path<String>) -> ApiResult<StateView> {
    count("set_current");
    let state = api.store.set_meter_as_current(&id)?;
    committed(&api.store, &state)
}

async fn record_reading(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ReadingBody>,
) -> ApiResult<StateView> {
    count("record_reading");
    let outcome = entry::record_daily_reading(
        &api.store,
        &PreConfirmed(body.confirm),
        &id,
        &body.value.as_input(),
    )
    .await?;
    entry_outcome(&api.store, outcome)
}

async fn lock_month(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<LockMonthBody>,
) -> ApiResult<StateView> {
    count("lock_month");
    let outcome = entry::lock_monthly_reading(
        &api.store,
        &PreConfirmed(body.confirm),
        &id,
        &body.month,
        &body.value.as_input(),
    )
    .await?;
    entry_outcome(&api.store, outcome)
}

async fn edit_month(
    State(api): State<ApiState>,
    Path((id, month)): Path<(String, String)>,
    Json(body): Json<ReadingBody>,
) -> ApiResult<StateView> {
    count("edit_month");
    let month = MonthKey::parse(&month).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let outcome = entry::edit_locked_month(
        &api.store,
        &PreConfirmed(body.confirm),
        &id,
        &month,
        &body.value.as_input(),
    )
    .await?;
    entry_outcome(&api.store, outcome)
}

async fn daily_history(State(api): State<ApiState>, Path(id): Path<String>) -> ApiResult<Vec<DailyGroup>> {
    count("daily_history");
    let meter = loaded_meter(&api.store, id)?;
    Ok(Json(projection::group_daily_by_month(&meter.history)))
}

async fn billing(State(api): State<ApiState>, Path(id): Path<String>) -> ApiResult<Vec<BillingRow>> {
    count("billing");
    let meter = loaded_meter(&api.store, id)?;
    Ok(Json(projection::project_monthly_billing(
        &meter.monthly_baselines,
        meter.latest_reading,
    )))
}

async fn add_family(State(api): State<ApiState>, Json(body): Json<FamilyBody>) -> ApiResult<StateView> {
    count("add_family");
    let name = body
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("family name is required".to_string()))?;
    let state = api.store.add_family(&name, &body.color)?;
    committed(&api.store, &state)
}

async fn update_family(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<FamilyBody>,
) -> ApiResult<StateView> {
    count("update_family");
    let new_name = body.name.unwrap_or_else(|| name.clone());
    let state = api.store.update_family(&name, &new_name, &body.color)?;
    committed(&api.store, &state)
}

async fn delete_family(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Query(q): Query<ConfirmQuery>,
) -> ApiResult<StateView> {
    count("delete_family");
    let outcome = entry::remove_family(&api.store, &PreConfirmed(q.confirm), &name).await?;
    entry_outcome(&api.store, outcome)
}

async fn families_usage(State(api): State<ApiState>) -> Json<Vec<FamilyUsage>> {
    count("families_usage");
    Json(projection::family_usage(&api.store.snapshot()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::repository::InMemoryRepository;
    use meter_client::domain::seed::seed_document;
    use time::macros::datetime;

    fn api() -> ApiState {
        let mut doc = seed_document(datetime!(2024-03-01 00:00:00 UTC));
        let m1 = doc.meters.iter_mut().find(|m| m.id == "m1").unwrap();
        m1.last_month_reading = 100.0;
        m1.latest_reading = 120.0;

        let store = MeterStore::new(Arc::new(InMemoryRepository::new()));
        store.apply_remote(doc);
        ApiState { store }
    }

    fn reading(value: RawReading, confirm: bool) -> Json<ReadingBody> {
        Json(ReadingBody { value, confirm })
    }

    fn status_of<T>(result: ApiResult<T>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::OK,
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn reading_status_codes() {
        let api = api();
        let id = || Path("m1".to_string());

        let low = record_reading(State(api.clone()), id(), reading(RawReading::Number(110.0), false)).await;
        assert_eq!(status_of(low), StatusCode::CONFLICT);

        let below = record_reading(State(api.clone()), id(), reading(RawReading::Number(80.0), true)).await;
        assert_eq!(status_of(below), StatusCode::UNPROCESSABLE_ENTITY);

        let garbage = record_reading(State(api.clone()), id(), reading(RawReading::Text("12abc".into()), true)).await;
        assert_eq!(status_of(garbage), StatusCode::UNPROCESSABLE_ENTITY);

        let ok = record_reading(State(api.clone()), id(), reading(RawReading::Text(" 150 ".into()), false))
            .await
            .unwrap();
        assert_eq!(ok.0.state.meter("m1").unwrap().latest_reading, 150.0);
    }

    #[tokio::test]
    async fn confirmed_lower_reading_is_saved() {
        let api = api();
        let view = record_reading(
            State(api.clone()),
            Path("m1".to_string()),
            reading(RawReading::Number(110.0), true),
        )
        .await
        .unwrap();
        assert_eq!(view.0.state.meter("m1").unwrap().latest_reading, 110.0);
    }

    #[tokio::test]
    async fn writes_before_load_are_unavailable() {
        let api = ApiState {
            store: MeterStore::new(Arc::new(InMemoryRepository::new())),
        };

        let result = add_family(
            State(api.clone()),
            Json(FamilyBody {
                name: Some("C".to_string()),
                color: "teal".to_string(),
            }),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::SERVICE_UNAVAILABLE);

        let result = record_reading(
            State(api.clone()),
            Path("m1".to_string()),
            reading(RawReading::Number(1.0), true),
        )
        .await;
        assert_eq!(status_of(result), StatusCode::SERVICE_UNAVAILABLE);
        assert!(api.store.snapshot().families.is_empty());

        let result = billing(State(api), Path("m1".to_string())).await;
        assert_eq!(status_of(result), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_meter_is_not_found() {
        let api = api();
        let result = billing(State(api), Path("nope".to_string())).await;
        assert_eq!(status_of(result), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lock_then_billing_then_edit() {
        let api = api();
        let body = Json(LockMonthBody {
            month: MonthKey::parse("2024-03").unwrap(),
            value: RawReading::Number(500.0),
            confirm: true,
        });
        lock_month(State(api.clone()), Path("m1".to_string()), body).await.unwrap();

        let rows = billing(State(api.clone()), Path("m1".to_string())).await.unwrap().0;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_projected);

        let bad_month = edit_month(
            State(api.clone()),
            Path(("m1".to_string(), "2024-13".to_string())),
            reading(RawReading::Number(505.0), true),
        )
        .await;
        assert_eq!(status_of(bad_month), StatusCode::BAD_REQUEST);

        let unconfirmed = edit_month(
            State(api.clone()),
            Path(("m1".to_string(), "2024-03".to_string())),
            reading(RawReading::Number(505.0), false),
        )
        .await;
        assert_eq!(status_of(unconfirmed), StatusCode::CONFLICT);

        edit_month(
            State(api.clone()),
            Path(("m1".to_string(), "2024-03".to_string())),
            reading(RawReading::Number(505.0), true),
        )
        .await
        .unwrap();
        assert_eq!(api.store.meter("m1").unwrap().last_month_reading, 505.0);
    }

    #[tokio::test]
    async fn family_delete_in_use_is_conflict() {
        let api = api();
        let result = delete_family(
            State(api.clone()),
            Path("A".to_string()),
            Query(ConfirmQuery { confirm: true }),
        )
        .await;

        let response = result.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(api.store.snapshot().has_family("A"));
    }

    #[tokio::test]
    async fn meter_lifecycle() {
        let api = api();
        add_meter(
            State(api.clone()),
            Json(AddMeterBody {
                id: Some("m9".to_string()),
                name: "Meter 9".to_string(),
                meter_number: "REF-009".to_string(),
                family: "B".to_string(),
            }),
        )
        .await
        .unwrap();

        let duplicate = add_meter(
            State(api.clone()),
            Json(AddMeterBody {
                id: Some("m9".to_string()),
                name: "again".to_string(),
                meter_number: String::new(),
                family: "B".to_string(),
            }),
        )
        .await;
        assert_eq!(status_of(duplicate), StatusCode::CONFLICT);

        let unconfirmed = delete_meter(State(api.clone()), Path("m9".to_string()), Query(ConfirmQuery::default())).await;
        assert_eq!(status_of(unconfirmed), StatusCode::CONFLICT);
        assert!(api.store.meter("m9").is_some());

        delete_meter(
            State(api.clone()),
            Path("m9".to_string()),
            Query(ConfirmQuery { confirm: true }),
        )
        .await
        .unwrap();
        assert!(api.store.meter("m9").is_none());
    }

    #[test]
    fn status_view_flags_permission_denied() {
        let view = StatusView::from(StoreStatus {
            loaded: true,
            last_error: Some(RepositoryError::PermissionDenied("rules".to_string())),
        });
        assert!(view.permission_denied);
        assert!(view.last_error.is_some());
    }

    #[test]
    fn reading_body_accepts_numbers_and_text() {
        let body: ReadingBody = serde_json::from_str(r#"{"value": 12.5}"#).unwrap();
        assert_eq!(body.value.as_input(), "12.5");
        assert!(!body.confirm);

        let body: ReadingBody = serde_json::from_str(r#"{"value": "abc", "confirm": true}"#).unwrap();
        assert_eq!(body.value.as_input(), "abc");
        assert!(body.confirm);
    }
}
