//! API Service - Read-only queries over the CNPJ leads warehouse
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /leads - Current state, filterable by uf / cnae / municipio
//! - GET /leads/:cnpj - One current lead by CNPJ digits (base + branch)
//! - GET /snapshots/:period/leads - Historical state as of one period
//! - GET /periods - Per-period processing status

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct LeadResponse {
    cnpj_basico: String,
    cnpj_ordem: String,
    razao_social: Option<String>,
    nome_fantasia: Option<String>,
    cnae: String,
    cnae_descricao: String,
    municipio: String,
    municipio_nome: String,
    uf: String,
    uf_nome: String,
    situacao_cadastral: String,
    data_inicio_atividade: Option<String>,
    qtde_socios: i64,
    email: Option<String>,
    telefone: Option<String>,
    atualizado_em: String,
    encerrado: i64,
}

#[derive(Serialize, sqlx::FromRow)]
struct PeriodStatus {
    period: String,
    stage: String,
    updated_at: String,
    snapshot_rows: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct LeadsQuery {
    uf: Option<String>,
    cnae: Option<String>,
    municipio: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

const MAX_LIMIT: i64 = 1000;

fn safe_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, MAX_LIMIT)
}

fn safe_offset(offset: Option<i64>) -> i64 {
    offset.unwrap_or(0).max(0)
}

/// Split a CNPJ given as digits (with or without punctuation) into the
/// (base, branch) identity pair.
fn identity_from_path(raw: &str) -> Option<(String, String)> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 12 {
        return None;
    }
    Some((digits[..8].to_string(), digits[8..12].to_string()))
}

fn is_period(s: &str) -> bool {
    s.len() == 7
        && s.as_bytes()[4] == b'-'
        && s[..4].bytes().all(|b| b.is_ascii_digit())
        && s[5..].bytes().all(|b| b.is_ascii_digit())
        && matches!(s[5..].parse::<u32>(), Ok(m) if (1..=12).contains(&m))
}

const LEAD_COLUMNS: &str = "cnpj_basico, cnpj_ordem, razao_social, nome_fantasia, cnae, \
     cnae_descricao, municipio, municipio_nome, uf, uf_nome, situacao_cadastral, \
     data_inicio_atividade, qtde_socios, email, telefone, atualizado_em, encerrado";

// ============================================================================
// Handlers
// ============================================================================

fn internal_error(e: sqlx::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

/// Filterable listing over one leads table; the snapshot variant adds the
/// period condition in front of the optional filters.
async fn fetch_leads(
    pool: &SqlitePool,
    table: &str,
    period: Option<&str>,
    params: &LeadsQuery,
) -> Result<Vec<LeadResponse>, sqlx::Error> {
    let mut query = format!("SELECT {} FROM {} WHERE 1=1", LEAD_COLUMNS, table);
    if period.is_some() {
        query.push_str(" AND data_referencia = ?");
    }
    if params.uf.is_some() {
        query.push_str(" AND uf = ?");
    }
    if params.cnae.is_some() {
        query.push_str(" AND cnae = ?");
    }
    if params.municipio.is_some() {
        query.push_str(" AND municipio_nome = ?");
    }
    query.push_str(" ORDER BY cnpj_basico, cnpj_ordem LIMIT ? OFFSET ?");

    let mut q = sqlx::query_as::<_, LeadResponse>(&query);
    if let Some(p) = period {
        q = q.bind(p.to_string());
    }
    if let Some(uf) = &params.uf {
        q = q.bind(uf.clone());
    }
    if let Some(cnae) = &params.cnae {
        q = q.bind(cnae.clone());
    }
    if let Some(municipio) = &params.municipio {
        q = q.bind(municipio.clone());
    }
    q = q.bind(safe_limit(params.limit)).bind(safe_offset(params.offset));

    q.fetch_all(pool).await
}

async fn leads_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LeadsQuery>,
) -> impl IntoResponse {
    match fetch_leads(&state.pool, "leads_current", None, &params).await {
        Ok(leads) => Json(serde_json::json!({ "leads": leads })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn lead_handler(
    State(state): State<Arc<AppState>>,
    Path(cnpj): Path<String>,
) -> impl IntoResponse {
    let Some((basico, ordem)) = identity_from_path(&cnpj) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "expected at least the 12 digits of base + branch".to_string(),
            }),
        )
            .into_response();
    };

    let sql = format!(
        "SELECT {} FROM leads_current WHERE cnpj_basico = ? AND cnpj_ordem = ?",
        LEAD_COLUMNS
    );
    match sqlx::query_as::<_, LeadResponse>(&sql)
        .bind(basico)
        .bind(ordem)
        .fetch_optional(&state.pool)
        .await
    {
        Ok(Some(lead)) => Json(lead).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Lead not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn snapshot_leads_handler(
    State(state): State<Arc<AppState>>,
    Path(period): Path<String>,
    Query(params): Query<LeadsQuery>,
) -> impl IntoResponse {
    if !is_period(&period) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid period '{}', expected YYYY-MM", period),
            }),
        )
            .into_response();
    }

    match fetch_leads(&state.pool, "leads", Some(&period), &params).await {
        Ok(leads) => {
            Json(serde_json::json!({ "period": period, "leads": leads })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn periods_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result: Result<Vec<PeriodStatus>, _> = sqlx::query_as(
        r#"
        SELECT
            ps.period,
            ps.stage,
            ps.updated_at,
            (SELECT COUNT(*) FROM leads l WHERE l.data_referencia = ps.period) AS snapshot_rows
        FROM processing_state ps
        ORDER BY ps.period
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match result {
        Ok(periods) => Json(serde_json::json!({ "periods": periods })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let db_path = std::env::var("WAREHOUSE_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(data_dir).join("db/cnpj.sqlite"));
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== CNPJ Leads API ===");
    println!("Warehouse: {}", db_path.display());

    let options = SqliteConnectOptions::new().filename(&db_path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .context("Failed to open warehouse database (run `warehouse setup` first)")?;

    let state = Arc::new(AppState { pool });

    // CORS for web frontends
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/leads", get(leads_handler))
        .route("/leads/:cnpj", get(lead_handler))
        .route("/snapshots/:period/leads", get(snapshot_leads_handler))
        .route("/periods", get(periods_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /leads?uf=&cnae=&municipio=&limit=&offset=");
    println!("  GET /leads/:cnpj");
    println!("  GET /snapshots/:period/leads?uf=&cnae=&municipio=&limit=&offset=");
    println!("  GET /periods");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped_to_sane_bounds() {
        assert_eq!(safe_limit(None), 100);
        assert_eq!(safe_limit(Some(0)), 1);
        assert_eq!(safe_limit(Some(-5)), 1);
        assert_eq!(safe_limit(Some(50)), 50);
        assert_eq!(safe_limit(Some(100_000)), MAX_LIMIT);
    }

    #[test]
    fn offset_never_goes_negative() {
        assert_eq!(safe_offset(None), 0);
        assert_eq!(safe_offset(Some(-1)), 0);
        assert_eq!(safe_offset(Some(40)), 40);
    }

    #[test]
    fn identity_accepts_digits_and_punctuation() {
        assert_eq!(
            identity_from_path("12345678000181"),
            Some(("12345678".to_string(), "0001".to_string()))
        );
        assert_eq!(
            identity_from_path("12.345.678/0001-81"),
            Some(("12345678".to_string(), "0001".to_string()))
        );
        assert_eq!(identity_from_path("123456780001"), Some(("12345678".to_string(), "0001".to_string())));
        assert_eq!(identity_from_path("12345678"), None);
        assert_eq!(identity_from_path("acme"), None);
    }

    #[test]
    fn period_path_segment_is_validated() {
        assert!(is_period("2024-01"));
        assert!(!is_period("2024-13"));
        assert!(!is_period("2024-1"));
        assert!(!is_period("latest"));
    }
}
