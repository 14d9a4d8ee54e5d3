// 🌐 Query API - read-only HTTP surface over the store
//
// Handlers hold no connection between requests: each one opens its own
// read-only connection on the blocking pool and drops it before returning.
// Store failures never reach the caller; they are logged and answered with
// an opaque 500.

use crate::aggregate::{self, OperatorTotal, RegionTotal, SummaryStats};
use crate::columns;
use crate::consolidate::ConsolidatedRecord;
use crate::db;
use crate::error::{EtlError, Result};
use crate::registry::OperatorRecord;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(db_path: PathBuf) -> Self {
        AppState {
            db_path: Arc::new(db_path),
        }
    }

    /// Run `f` on the blocking pool with a fresh read-only connection.
    async fn with_conn<T, F>(&self, f: F) -> std::result::Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = db::open_read_only(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(ApiError::from)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Logged, never shown to the caller.
    Internal(String),
}

impl From<EtlError> for ApiError {
    fn from(err: EtlError) -> Self {
        match err {
            EtlError::NotFound(msg) => ApiError::NotFound(msg),
            EtlError::InvalidParameter(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============================================================================
// RESPONSE BODIES
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    /// When the store was last loaded (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorResponse {
    pub cnpj: String,
    pub registro_ans: String,
    pub razao_social: String,
    pub modalidade: Option<String>,
    pub uf: Option<String>,
    pub situacao: String,
}

impl From<OperatorRecord> for OperatorResponse {
    fn from(op: OperatorRecord) -> Self {
        Self {
            cnpj: op.tax_id,
            registro_ans: op.operator_id,
            razao_social: op.legal_name,
            modalidade: op.modality,
            uf: op.region,
            situacao: op.status.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OperatorPage {
    pub data: Vec<OperatorResponse>,
    pub total: u64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseItem {
    pub ano: i32,
    pub trimestre: u8,
    pub valor_despesas: f64,
}

impl From<ConsolidatedRecord> for ExpenseItem {
    fn from(r: ConsolidatedRecord) -> Self {
        Self {
            ano: r.year,
            trimestre: r.quarter,
            valor_despesas: r.value,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpensesResponse {
    pub cnpj: String,
    pub despesas: Vec<ExpenseItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopOperator {
    pub registro_ans: String,
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    pub total_despesas: f64,
}

impl From<OperatorTotal> for TopOperator {
    fn from(t: OperatorTotal) -> Self {
        Self {
            registro_ans: t.operator_id,
            cnpj: t.tax_id,
            razao_social: t.legal_name,
            total_despesas: t.total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopRegion {
    pub uf: String,
    pub total_despesas: f64,
}

impl From<RegionTotal> for TopRegion {
    fn from(t: RegionTotal) -> Self {
        Self {
            uf: t.region,
            total_despesas: t.total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub total_despesas: f64,
    pub media_despesas: f64,
    pub total_registros: usize,
    pub top_5_operadoras: Vec<TopOperator>,
    pub despesas_por_uf_top5: Vec<TopRegion>,
}

impl From<SummaryStats> for StatisticsResponse {
    fn from(s: SummaryStats) -> Self {
        Self {
            total_despesas: s.total_expenses,
            media_despesas: s.mean_expense,
            total_registros: s.record_count,
            top_5_operadoras: s.top_operators.into_iter().map(Into::into).collect(),
            despesas_por_uf_top5: s.top_regions.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "ANS consolidation API".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// GET /health - store connectivity
pub async fn health(State(state): State<AppState>) -> Response {
    let checked = state
        .with_conn(|conn| {
            db::ping(conn)?;
            db::latest_load_run(conn)
        })
        .await;

    match checked {
        Ok(last_run) => Json(HealthResponse {
            status: "healthy".to_string(),
            database: "connected".to_string(),
            loaded_at: last_run.map(|run| run.loaded_at.to_rfc3339()),
        })
        .into_response(),
        Err(e) => {
            warn!(error = ?e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    database: "unavailable".to_string(),
                    loaded_at: None,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub q: Option<String>,
}

impl ListParams {
    /// (page, limit) with defaults applied, or the out-of-range one.
    pub fn validated(&self) -> std::result::Result<(i64, i64), ApiError> {
        let page = self.page.unwrap_or(DEFAULT_PAGE);
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if page < 1 {
            return Err(ApiError::BadRequest("page must be >= 1".to_string()));
        }
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(ApiError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        Ok((page, limit))
    }
}

/// GET /operators?page&limit&q
pub async fn list_operators(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<OperatorPage> {
    let (page, limit) = params.validated()?;
    let page_no = u32::try_from(page)
        .map_err(|_| ApiError::BadRequest("page out of range".to_string()))?;
    let q = params.q.clone();

    let (operators, total) = state
        .with_conn(move |conn| db::list_operators(conn, page_no, limit as u32, q.as_deref()))
        .await?;

    Ok(Json(OperatorPage {
        data: operators.into_iter().map(Into::into).collect(),
        total,
        page,
        limit,
    }))
}

/// GET /operators/:tax_id
pub async fn get_operator(
    State(state): State<AppState>,
    Path(tax_id): Path<String>,
) -> ApiResult<OperatorResponse> {
    let lookup = tax_id.clone();
    let operator = state
        .with_conn(move |conn| db::find_operator_by_tax_id(conn, &lookup))
        .await?;

    operator
        .map(|op| Json(op.into()))
        .ok_or_else(|| ApiError::NotFound(format!("operator not found: {}", tax_id)))
}

/// GET /operators/:tax_id/expenses
pub async fn get_operator_expenses(
    State(state): State<AppState>,
    Path(tax_id): Path<String>,
) -> ApiResult<ExpensesResponse> {
    let cnpj = columns::normalize_tax_id(&tax_id);
    let lookup = cnpj.clone();
    let expenses = state
        .with_conn(move |conn| db::expenses_for_tax_id(conn, &lookup))
        .await?;

    Ok(Json(ExpensesResponse {
        cnpj,
        despesas: expenses.into_iter().map(Into::into).collect(),
    }))
}

/// GET /statistics
pub async fn statistics(State(state): State<AppState>) -> ApiResult<StatisticsResponse> {
    let summary = state
        .with_conn(|conn| {
            let records = db::load_consolidated(conn)?;
            let regions = db::region_map(conn)?;
            Ok(aggregate::summarize(&records, &regions))
        })
        .await?;

    Ok(Json(summary.into()))
}

/// Routes are served at the root and again under `/api`.
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/operators", get(list_operators))
        .route("/operators/:tax_id", get(get_operator))
        .route("/operators/:tax_id/expenses", get(get_operator_expenses))
        .route("/statistics", get(statistics));

    Router::new()
        .route("/", get(root))
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LoadRun;
    use crate::registry::OperatorStatus;

    fn operator(id: usize) -> OperatorRecord {
        OperatorRecord {
            operator_id: id.to_string(),
            tax_id: format!("{:014}", id),
            legal_name: format!("OPERADORA {:02}", id),
            modality: None,
            region: Some((if id % 2 == 0 { "SP" } else { "RJ" }).to_string()),
            status: OperatorStatus::Active,
        }
    }

    fn seeded_state(dir: &std::path::Path) -> AppState {
        let path = dir.join("ans.db");
        let mut conn = Connection::open(&path).unwrap();
        db::setup_database(&conn).unwrap();

        let mut operators: Vec<OperatorRecord> = (1..=23).map(operator).collect();
        operators.push(OperatorRecord {
            operator_id: "900".to_string(),
            tax_id: "12345678000199".to_string(),
            legal_name: "ZETA SAUDE".to_string(),
            modality: Some("Autogestão".to_string()),
            region: Some("MG".to_string()),
            status: OperatorStatus::Cancelled,
        });
        let records = vec![
            ConsolidatedRecord {
                operator_id: "900".to_string(),
                tax_id: Some("12345678000199".to_string()),
                legal_name: Some("ZETA SAUDE".to_string()),
                year: 2023,
                quarter: 1,
                value: 300.0,
            },
            ConsolidatedRecord {
                operator_id: "2".to_string(),
                tax_id: Some(format!("{:014}", 2)),
                legal_name: Some("OPERADORA 02".to_string()),
                year: 2023,
                quarter: 1,
                value: 100.0,
            },
        ];
        db::load_dataset(&mut conn, &operators, &records, LoadRun::new(None)).unwrap();
        AppState::new(path)
    }

    fn params(page: Option<i64>, limit: Option<i64>) -> ListParams {
        ListParams {
            page,
            limit,
            q: None,
        }
    }

    #[tokio::test]
    async fn test_pagination_counts() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());
        let total = 24;

        for page in 1..=4i64 {
            let Json(body) = list_operators(State(state.clone()), Query(params(Some(page), Some(10))))
                .await
                .unwrap();
            let expected = (total - (page - 1) * 10).clamp(0, 10) as usize;
            assert_eq!(body.total, total as u64);
            assert_eq!(body.data.len(), expected);
            assert_eq!(body.page, page);
            assert_eq!(body.limit, 10);
        }
    }

    #[tokio::test]
    async fn test_list_defaults_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        let Json(body) = list_operators(State(state.clone()), Query(ListParams::default()))
            .await
            .unwrap();
        assert_eq!((body.page, body.limit), (1, 10));

        let Json(body) = list_operators(
            State(state),
            Query(ListParams {
                q: Some("zeta".to_string()),
                ..ListParams::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(body.total, 1);
        assert_eq!(body.data[0].situacao, "CANCELADA");
    }

    #[tokio::test]
    async fn test_out_of_range_params_are_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        for p in [params(Some(0), None), params(None, Some(0)), params(None, Some(101))] {
            let err = list_operators(State(state.clone()), Query(p)).await.unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_get_operator_normalizes_tax_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        let Json(op) = get_operator(State(state), Path("12.345.678/0001-99".to_string()))
            .await
            .unwrap();
        assert_eq!(op.cnpj, "12345678000199");
        assert_eq!(op.registro_ans, "900");
    }

    #[tokio::test]
    async fn test_missing_operator_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        let err = get_operator(State(state), Path("99.999.999/9999-99".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_expenses_empty_list_when_none() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        let Json(body) = get_operator_expenses(State(state.clone()), Path("12345678000199".to_string()))
            .await
            .unwrap();
        assert_eq!(body.despesas.len(), 1);
        assert_eq!(body.despesas[0].valor_despesas, 300.0);

        let Json(body) = get_operator_expenses(State(state), Path(format!("{:014}", 3)))
            .await
            .unwrap();
        assert!(body.despesas.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());

        let Json(stats) = statistics(State(state)).await.unwrap();
        assert_eq!(stats.total_despesas, 400.0);
        assert_eq!(stats.media_despesas, 200.0);
        assert_eq!(stats.top_5_operadoras[0].registro_ans, "900");
        assert_eq!(stats.despesas_por_uf_top5[0].uf, "MG");
        assert_eq!(stats.despesas_por_uf_top5[1].uf, "SP");
    }

    #[tokio::test]
    async fn test_store_failure_is_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().join("missing.db"));

        let err = statistics(State(state.clone())).await.unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = health(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_ok() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state(dir.path());
        assert_eq!(health(State(state)).await.status(), StatusCode::OK);
    }

    // ------------------------------------------------------------------------
    // Through the router
    // ------------------------------------------------------------------------

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_router_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(seeded_state(dir.path()));

        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, _) = get_json(app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_router_nested_operator_page() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(seeded_state(dir.path()));

        let (status, body) = get_json(app, "/api/operators?page=2&limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 24);
        assert_eq!(body["page"], 2);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(10));
    }

    #[tokio::test]
    async fn test_router_rejects_non_numeric_paging() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(seeded_state(dir.path()));

        let (status, _) = get_json(app.clone(), "/operators?page=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(app.clone(), "/api/operators?limit=ten").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get_json(app, "/operators?limit=500").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_router_encoded_tax_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(seeded_state(dir.path()));

        let (status, body) = get_json(app.clone(), "/operators/12.345.678%2F0001-99").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registro_ans"], "900");

        let (status, body) = get_json(app, "/operators/99999999999999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_router_operator_expenses() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(seeded_state(dir.path()));

        let (status, body) = get_json(app.clone(), "/operators/12345678000199/expenses").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["despesas"][0]["valor_despesas"], 300.0);

        let (status, body) = get_json(app, "/api/operators/12.345.678%2F0001-99/expenses").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["despesas"].as_array().map(Vec::len), Some(1));
    }
}
