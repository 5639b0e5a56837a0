//! Warehouse Service - Ingests CNPJ monthly releases into the leads warehouse
//!
//! Responsibilities:
//! - Stage each period's raw CSV extracts (full replace per period and file type)
//! - Upsert reference tables (CNAE, municipality, UF) keyed by code
//! - Consolidate staging into leads_current with a set-based join-and-upsert
//! - Append an immutable per-period snapshot of leads_current
//! - Track per-period progress so reruns resume instead of starting over
//!
//! CRITICAL: Ingestion must be IDEMPOTENT
//! Same period + same extracted files = same leads and snapshot content

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "warehouse", about = "CNPJ leads warehouse: staging, consolidation, snapshots")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create all warehouse tables (safe to run repeatedly)
    Setup,

    /// Ingest pending periods end to end
    Run {
        /// Periods (YYYY-MM) to ingest; discovered from the extracted dir when omitted
        #[arg(long = "period")]
        periods: Vec<String>,

        /// Rewrite snapshots of periods that already have one
        #[arg(long, default_value = "false")]
        force_snapshot: bool,

        /// Abort a staging load when the rejected-row share exceeds this value
        #[arg(long)]
        rejection_threshold: Option<f64>,

        /// What to do with establishments absent from the new export
        #[arg(long, value_enum)]
        stale_policy: Option<StalePolicy>,
    },

    /// Show per-period processing state and row counts
    Status,

    /// Clear a leftover writer lock after a crashed run
    Unlock,
}

// =============================================================================
// Configuration
// =============================================================================

/// Establishments present in leads_current but absent from a new full export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StalePolicy {
    /// Keep stale rows untouched
    Retain,
    /// Mark stale rows with encerrado = 1
    Flag,
}

impl FromStr for StalePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(StalePolicy::Retain),
            "flag" => Ok(StalePolicy::Flag),
            other => Err(anyhow!("invalid stale policy '{}', expected retain|flag", other)),
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    db_path: PathBuf,
    extracted_dir: PathBuf,
    rejection_threshold: f64,
    stale_policy: StalePolicy,
}

impl Config {
    fn from_env() -> Result<Self> {
        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let db_path = std::env::var("WAREHOUSE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("db/cnpj.sqlite"));

        let extracted_dir = std::env::var("EXTRACTED_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("extracted"));

        let rejection_threshold = std::env::var("REJECTION_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.05);

        let stale_policy = match std::env::var("STALE_POLICY") {
            Ok(v) => v.parse()?,
            Err(_) => StalePolicy::Retain,
        };

        Ok(Self {
            db_path,
            extracted_dir,
            rejection_threshold,
            stale_policy,
        })
    }
}

#[derive(Debug, Clone)]
struct RunOpts {
    /// Explicit periods; empty means discover from the extracted dir
    periods: Vec<Period>,
    force_snapshot: bool,
}

// =============================================================================
// Period
// =============================================================================

/// One monthly registry release, identified by YYYY-MM.
/// Lexicographic order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Period(String);

impl Period {
    fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let shape_ok = s.len() == 7
            && s.as_bytes()[4] == b'-'
            && s[..4].bytes().all(|b| b.is_ascii_digit())
            && s[5..].bytes().all(|b| b.is_ascii_digit());

        if !shape_ok {
            return Err(anyhow!("invalid period '{}', expected YYYY-MM", s));
        }

        let month: u32 = s[5..].parse()?;
        if !(1..=12).contains(&month) {
            return Err(anyhow!("invalid period '{}': month out of range", s));
        }

        Ok(Period(s.to_string()))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Processing state machine
// =============================================================================

/// Per-period progress. Transitions only move forward; a failed stage leaves
/// the recorded stage where it was so the next run resumes from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Pending,
    RawLoaded,
    DimensionsReady,
    Consolidated,
    Snapshotted,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::RawLoaded => "raw_loaded",
            Stage::DimensionsReady => "dimensions_ready",
            Stage::Consolidated => "consolidated",
            Stage::Snapshotted => "snapshotted",
        }
    }

    fn parse(s: &str) -> Option<Stage> {
        match s {
            "pending" => Some(Stage::Pending),
            "raw_loaded" => Some(Stage::RawLoaded),
            "dimensions_ready" => Some(Stage::DimensionsReady),
            "consolidated" => Some(Stage::Consolidated),
            "snapshotted" => Some(Stage::Snapshotted),
            _ => None,
        }
    }
}

async fn read_stage(pool: &SqlitePool, period: &Period) -> Result<Option<Stage>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT stage FROM processing_state WHERE period = ?")
            .bind(period.as_str())
            .fetch_optional(pool)
            .await?;

    match row {
        None => Ok(None),
        Some((s,)) => Stage::parse(&s)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown stage '{}' recorded for period {}", s, period)),
    }
}

async fn record_stage(pool: &SqlitePool, period: &Period, stage: Stage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO processing_state (period, stage, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(period) DO UPDATE SET stage = excluded.stage, updated_at = excluded.updated_at
        "#,
    )
    .bind(period.as_str())
    .bind(stage.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
enum WarehouseError {
    #[error("transfer incomplete for period {period}: {reason}")]
    TransferIncomplete { period: Period, reason: String },

    #[error("malformed reference data in {file}: {reason}")]
    MalformedReferenceData { file: String, reason: String },

    #[error("{table}: {rejected} of {total} rows rejected, over threshold {threshold}")]
    ExcessiveRowRejection {
        table: &'static str,
        rejected: u64,
        total: u64,
        threshold: f64,
    },

    #[error("period {period}: {count} {dimension} code(s) do not resolve, e.g. {codes:?}")]
    UnresolvedDimensionReference {
        period: Period,
        dimension: &'static str,
        count: u64,
        codes: Vec<String>,
    },

    #[error("another ingest run holds the warehouse lock (holder {holder}, acquired {acquired_at})")]
    ConcurrentRunDetected { holder: String, acquired_at: String },

    #[error("snapshot for period {0} already exists")]
    SnapshotAlreadyExists(Period),
}

// =============================================================================
// Extraction manifest (contract with the collector)
// =============================================================================

/// Completion marker written by the collector after download + extraction.
#[derive(Debug, Deserialize)]
struct Manifest {
    period: String,
    #[serde(default)]
    complete: bool,
}

fn check_manifest(extracted_dir: &Path, period: &Period) -> Result<()> {
    let dir = extracted_dir.join(period.as_str());

    let incomplete = |reason: String| WarehouseError::TransferIncomplete {
        period: period.clone(),
        reason,
    };

    if !dir.is_dir() {
        return Err(incomplete(format!("extracted directory {} missing", dir.display())).into());
    }

    let path = dir.join("manifest.json");
    if !path.is_file() {
        return Err(incomplete("manifest.json missing".to_string()).into());
    }

    let content =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&content)
        .map_err(|e| incomplete(format!("manifest.json unreadable: {}", e)))?;

    if manifest.period != period.as_str() {
        return Err(incomplete(format!(
            "manifest is for period {}, not {}",
            manifest.period, period
        ))
        .into());
    }
    if !manifest.complete {
        return Err(incomplete("manifest marks extraction as incomplete".to_string()).into());
    }

    Ok(())
}

// =============================================================================
// Schema
// =============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS staging_empresa (
        period TEXT NOT NULL,
        cnpj_basico TEXT NOT NULL,
        razao_social TEXT,
        natureza_juridica TEXT,
        porte_empresa TEXT,
        capital_social REAL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staging_empresa_lookup ON staging_empresa (period, cnpj_basico)",
    r#"
    CREATE TABLE IF NOT EXISTS staging_estabelecimento (
        period TEXT NOT NULL,
        cnpj_basico TEXT NOT NULL,
        cnpj_ordem TEXT NOT NULL,
        cnpj_dv TEXT,
        nome_fantasia TEXT,
        situacao_cadastral TEXT NOT NULL,
        data_inicio_atividade TEXT,
        cnae_fiscal_principal TEXT NOT NULL,
        uf TEXT NOT NULL,
        municipio TEXT NOT NULL,
        ddd1 TEXT,
        telefone1 TEXT,
        correio_eletronico TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staging_estabelecimento_lookup ON staging_estabelecimento (period, cnpj_basico, cnpj_ordem)",
    r#"
    CREATE TABLE IF NOT EXISTS staging_socio (
        period TEXT NOT NULL,
        cnpj_basico TEXT NOT NULL,
        nome_socio TEXT,
        qualificacao_socio TEXT,
        data_entrada_sociedade TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staging_socio_lookup ON staging_socio (period, cnpj_basico)",
    "CREATE TABLE IF NOT EXISTS dim_cnae (codigo TEXT PRIMARY KEY, descricao TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS dim_municipio (codigo TEXT PRIMARY KEY, descricao TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS dim_uf (codigo TEXT PRIMARY KEY, descricao TEXT NOT NULL)",
    r#"
    CREATE TABLE IF NOT EXISTS leads_current (
        cnpj_basico TEXT NOT NULL,
        cnpj_ordem TEXT NOT NULL,
        razao_social TEXT,
        nome_fantasia TEXT,
        cnae TEXT NOT NULL,
        cnae_descricao TEXT NOT NULL,
        municipio TEXT NOT NULL,
        municipio_nome TEXT NOT NULL,
        uf TEXT NOT NULL,
        uf_nome TEXT NOT NULL,
        situacao_cadastral TEXT NOT NULL,
        data_inicio_atividade TEXT,
        qtde_socios INTEGER NOT NULL DEFAULT 0,
        email TEXT,
        telefone TEXT,
        atualizado_em TEXT NOT NULL,
        encerrado INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (cnpj_basico, cnpj_ordem)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_leads_current_uf ON leads_current (uf)",
    "CREATE INDEX IF NOT EXISTS idx_leads_current_cnae ON leads_current (cnae)",
    "CREATE INDEX IF NOT EXISTS idx_leads_current_municipio ON leads_current (municipio)",
    r#"
    CREATE TABLE IF NOT EXISTS leads (
        data_referencia TEXT NOT NULL,
        cnpj_basico TEXT NOT NULL,
        cnpj_ordem TEXT NOT NULL,
        razao_social TEXT,
        nome_fantasia TEXT,
        cnae TEXT NOT NULL,
        cnae_descricao TEXT NOT NULL,
        municipio TEXT NOT NULL,
        municipio_nome TEXT NOT NULL,
        uf TEXT NOT NULL,
        uf_nome TEXT NOT NULL,
        situacao_cadastral TEXT NOT NULL,
        data_inicio_atividade TEXT,
        qtde_socios INTEGER NOT NULL DEFAULT 0,
        email TEXT,
        telefone TEXT,
        atualizado_em TEXT NOT NULL,
        encerrado INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (data_referencia, cnpj_basico, cnpj_ordem)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_leads_period ON leads (data_referencia)",
    r#"
    CREATE TABLE IF NOT EXISTS processing_state (
        period TEXT PRIMARY KEY,
        stage TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT,
        acquired_at TEXT
    )
    "#,
    "INSERT OR IGNORE INTO ingest_lock (id, holder, acquired_at) VALUES (1, NULL, NULL)",
];

async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);

    // Single writer: one connection serializes every statement of a run.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("Failed to open warehouse database")?;

    Ok(pool)
}

/// Create all tables if absent. Safe to run multiple times.
async fn setup_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// =============================================================================
// Writer lock
// =============================================================================

/// Take the single-writer lock or fail fast. Two concurrent ingest runs would
/// interleave upserts and break the latest-period-wins ordering.
async fn acquire_lock(pool: &SqlitePool, holder: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE ingest_lock SET holder = ?, acquired_at = ? WHERE id = 1 AND holder IS NULL",
    )
    .bind(holder)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let (current, acquired_at): (Option<String>, Option<String>) =
        sqlx::query_as("SELECT holder, acquired_at FROM ingest_lock WHERE id = 1")
            .fetch_one(pool)
            .await?;

    Err(WarehouseError::ConcurrentRunDetected {
        holder: current.unwrap_or_else(|| "unknown".to_string()),
        acquired_at: acquired_at.unwrap_or_else(|| "unknown".to_string()),
    }
    .into())
}

async fn release_lock(pool: &SqlitePool, holder: &str) -> Result<()> {
    sqlx::query("UPDATE ingest_lock SET holder = NULL, acquired_at = NULL WHERE id = 1 AND holder = ?")
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

async fn force_unlock(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE ingest_lock SET holder = NULL, acquired_at = NULL WHERE id = 1")
        .execute(pool)
        .await?;
    println!("[LOCK] Writer lock cleared");
    Ok(())
}

// =============================================================================
// Source file layouts
// =============================================================================
// Receita Federal ships every file as headerless semicolon-separated CSV in
// Windows-1252. Layouts are declared per file type, never inferred.

const INSERT_CHUNK: usize = 200;

#[derive(Debug, Clone, Copy)]
struct FileFormat {
    delimiter: u8,
    encoding: &'static encoding_rs::Encoding,
    columns: usize,
}

const REFERENCE_FORMAT: FileFormat = FileFormat {
    delimiter: b';',
    encoding: encoding_rs::WINDOWS_1252,
    columns: 2,
};

/// One typed staging row. Parsing projects the declared column layout down to
/// the fields the consolidation actually uses.
trait StagingRecord: Sized {
    const TABLE: &'static str;
    const SUFFIX: &'static str;

    fn format() -> FileFormat;
    fn insert_prefix() -> &'static str;
    fn parse(record: &csv::StringRecord) -> Result<Self, String>;
    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>, period: &str);
}

fn field(record: &csv::StringRecord, idx: usize) -> String {
    record.get(idx).unwrap_or("").trim().to_string()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

/// Dates arrive as YYYYMMDD; zero and empty mean "not informed".
fn parse_data(value: &str) -> Result<Option<NaiveDate>, String> {
    if value.is_empty() || value.chars().all(|c| c == '0') {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map(Some)
        .map_err(|_| format!("invalid date '{}'", value))
}

/// Monetary values use a decimal comma.
fn parse_capital(value: &str) -> Result<Option<f64>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .replace(',', ".")
        .parse::<f64>()
        .map(Some)
        .map_err(|_| format!("invalid capital_social '{}'", value))
}

/// Company record (*.EMPRECSV, 7 columns).
#[derive(Debug)]
struct EmpresaRow {
    cnpj_basico: String,
    razao_social: Option<String>,
    natureza_juridica: Option<String>,
    porte_empresa: Option<String>,
    capital_social: Option<f64>,
}

impl StagingRecord for EmpresaRow {
    const TABLE: &'static str = "staging_empresa";
    const SUFFIX: &'static str = "EMPRECSV";

    fn format() -> FileFormat {
        FileFormat {
            delimiter: b';',
            encoding: encoding_rs::WINDOWS_1252,
            columns: 7,
        }
    }

    fn insert_prefix() -> &'static str {
        "INSERT INTO staging_empresa \
         (period, cnpj_basico, razao_social, natureza_juridica, porte_empresa, capital_social) "
    }

    fn parse(record: &csv::StringRecord) -> Result<Self, String> {
        let cnpj_basico = field(record, 0);
        if !is_digits(&cnpj_basico, 8) {
            return Err(format!("invalid cnpj_basico '{}'", cnpj_basico));
        }

        Ok(EmpresaRow {
            cnpj_basico,
            razao_social: non_empty(field(record, 1)),
            natureza_juridica: non_empty(field(record, 2)),
            porte_empresa: non_empty(field(record, 5)),
            capital_social: parse_capital(&field(record, 4))?,
        })
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>, period: &str) {
        b.push_bind(period.to_string())
            .push_bind(self.cnpj_basico.clone())
            .push_bind(self.razao_social.clone())
            .push_bind(self.natureza_juridica.clone())
            .push_bind(self.porte_empresa.clone())
            .push_bind(self.capital_social);
    }
}

/// Establishment record (*.ESTABELE, 30 columns).
#[derive(Debug)]
struct EstabelecimentoRow {
    cnpj_basico: String,
    cnpj_ordem: String,
    cnpj_dv: Option<String>,
    nome_fantasia: Option<String>,
    situacao_cadastral: String,
    data_inicio_atividade: Option<NaiveDate>,
    cnae_fiscal_principal: String,
    uf: String,
    municipio: String,
    ddd1: Option<String>,
    telefone1: Option<String>,
    correio_eletronico: Option<String>,
}

impl StagingRecord for EstabelecimentoRow {
    const TABLE: &'static str = "staging_estabelecimento";
    const SUFFIX: &'static str = "ESTABELE";

    fn format() -> FileFormat {
        FileFormat {
            delimiter: b';',
            encoding: encoding_rs::WINDOWS_1252,
            columns: 30,
        }
    }

    fn insert_prefix() -> &'static str {
        "INSERT INTO staging_estabelecimento \
         (period, cnpj_basico, cnpj_ordem, cnpj_dv, nome_fantasia, situacao_cadastral, \
          data_inicio_atividade, cnae_fiscal_principal, uf, municipio, ddd1, telefone1, \
          correio_eletronico) "
    }

    fn parse(record: &csv::StringRecord) -> Result<Self, String> {
        let cnpj_basico = field(record, 0);
        if !is_digits(&cnpj_basico, 8) {
            return Err(format!("invalid cnpj_basico '{}'", cnpj_basico));
        }

        let cnpj_ordem = field(record, 1);
        if !is_digits(&cnpj_ordem, 4) {
            return Err(format!("invalid cnpj_ordem '{}'", cnpj_ordem));
        }

        let situacao_cadastral = field(record, 5);
        if situacao_cadastral.is_empty() {
            return Err("missing situacao_cadastral".to_string());
        }

        Ok(EstabelecimentoRow {
            cnpj_basico,
            cnpj_ordem,
            cnpj_dv: non_empty(field(record, 2)),
            nome_fantasia: non_empty(field(record, 4)),
            situacao_cadastral,
            data_inicio_atividade: parse_data(&field(record, 10))?,
            // code fields stay as plain text, empty included; the consolidation
            // check decides whether they resolve
            cnae_fiscal_principal: field(record, 11),
            uf: field(record, 19),
            municipio: field(record, 20),
            ddd1: non_empty(field(record, 21)),
            telefone1: non_empty(field(record, 22)),
            correio_eletronico: non_empty(field(record, 27)),
        })
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>, period: &str) {
        b.push_bind(period.to_string())
            .push_bind(self.cnpj_basico.clone())
            .push_bind(self.cnpj_ordem.clone())
            .push_bind(self.cnpj_dv.clone())
            .push_bind(self.nome_fantasia.clone())
            .push_bind(self.situacao_cadastral.clone())
            .push_bind(self.data_inicio_atividade)
            .push_bind(self.cnae_fiscal_principal.clone())
            .push_bind(self.uf.clone())
            .push_bind(self.municipio.clone())
            .push_bind(self.ddd1.clone())
            .push_bind(self.telefone1.clone())
            .push_bind(self.correio_eletronico.clone());
    }
}

/// Partner record (*.SOCIOCSV, 11 columns).
#[derive(Debug)]
struct SocioRow {
    cnpj_basico: String,
    nome_socio: Option<String>,
    qualificacao_socio: Option<String>,
    data_entrada_sociedade: Option<NaiveDate>,
}

impl StagingRecord for SocioRow {
    const TABLE: &'static str = "staging_socio";
    const SUFFIX: &'static str = "SOCIOCSV";

    fn format() -> FileFormat {
        FileFormat {
            delimiter: b';',
            encoding: encoding_rs::WINDOWS_1252,
            columns: 11,
        }
    }

    fn insert_prefix() -> &'static str {
        "INSERT INTO staging_socio \
         (period, cnpj_basico, nome_socio, qualificacao_socio, data_entrada_sociedade) "
    }

    fn parse(record: &csv::StringRecord) -> Result<Self, String> {
        let cnpj_basico = field(record, 0);
        if !is_digits(&cnpj_basico, 8) {
            return Err(format!("invalid cnpj_basico '{}'", cnpj_basico));
        }

        Ok(SocioRow {
            cnpj_basico,
            nome_socio: non_empty(field(record, 2)),
            qualificacao_socio: non_empty(field(record, 4)),
            data_entrada_sociedade: parse_data(&field(record, 5))?,
        })
    }

    fn push_binds(&self, b: &mut Separated<'_, '_, Sqlite, &'static str>, period: &str) {
        b.push_bind(period.to_string())
            .push_bind(self.cnpj_basico.clone())
            .push_bind(self.nome_socio.clone())
            .push_bind(self.qualificacao_socio.clone())
            .push_bind(self.data_entrada_sociedade);
    }
}

// =============================================================================
// Raw loader
// =============================================================================

#[derive(Debug, Default)]
struct LoadReport {
    loaded: u64,
    rejected: u64,
}

fn find_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_uppercase();
        if name.ends_with(suffix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Load one file type into its staging table: full replace per (period, type).
/// Existing rows for the period are deleted and reloaded, never appended, so a
/// rerun with a changed input file still lands on a clean base.
async fn load_staging_table<R: StagingRecord>(
    pool: &SqlitePool,
    period: &Period,
    dir: &Path,
    threshold: f64,
) -> Result<LoadReport> {
    let files = find_files(dir, R::SUFFIX)?;
    if files.is_empty() {
        return Err(WarehouseError::TransferIncomplete {
            period: period.clone(),
            reason: format!("no {} files in {}", R::SUFFIX, dir.display()),
        }
        .into());
    }

    let format = R::format();
    let mut tx = pool.begin().await?;

    let delete = format!("DELETE FROM {} WHERE period = ?", R::TABLE);
    sqlx::query(&delete)
        .bind(period.as_str())
        .execute(&mut *tx)
        .await?;

    let mut loaded: u64 = 0;
    let mut rejects: Vec<String> = Vec::new();
    let mut batch: Vec<R> = Vec::new();

    for file in &files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let (text, _, _) = format.encoding.decode(&bytes);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        for (idx, result) in reader.records().enumerate() {
            let line = idx + 1;
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    rejects.push(format!("{}:{}: {}", name, line, e));
                    continue;
                }
            };

            if record.len() != format.columns {
                rejects.push(format!(
                    "{}:{}: expected {} fields, found {}",
                    name,
                    line,
                    format.columns,
                    record.len()
                ));
                continue;
            }

            match R::parse(&record) {
                Ok(row) => {
                    batch.push(row);
                    loaded += 1;
                }
                Err(reason) => rejects.push(format!("{}:{}: {}", name, line, reason)),
            }

            if batch.len() >= INSERT_CHUNK {
                insert_chunk(&mut tx, period, &batch).await?;
                batch.clear();
            }
        }
    }

    if !batch.is_empty() {
        insert_chunk(&mut tx, period, &batch).await?;
    }

    let rejected = rejects.len() as u64;
    let total = loaded + rejected;

    if !rejects.is_empty() {
        eprintln!("[RAW] {}: {} rejected row(s):", R::TABLE, rejected);
        for reject in rejects.iter().take(5) {
            eprintln!("  {}", reject);
        }
        if rejects.len() > 5 {
            eprintln!("  ... and {} more", rejects.len() - 5);
        }
    }

    let rate = if total == 0 {
        0.0
    } else {
        rejected as f64 / total as f64
    };
    if rate > threshold {
        tx.rollback().await?;
        return Err(WarehouseError::ExcessiveRowRejection {
            table: R::TABLE,
            rejected,
            total,
            threshold,
        }
        .into());
    }

    tx.commit().await?;
    println!("[RAW] {}: {} rows loaded, {} rejected", R::TABLE, loaded, rejected);

    Ok(LoadReport { loaded, rejected })
}

async fn insert_chunk<R: StagingRecord>(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    period: &Period,
    rows: &[R],
) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(R::insert_prefix());
    qb.push_values(rows, |mut b, row| {
        row.push_binds(&mut b, period.as_str());
    });
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

/// Stage all three file types for one period.
async fn load_staging(
    pool: &SqlitePool,
    period: &Period,
    dir: &Path,
    threshold: f64,
) -> Result<LoadReport> {
    println!("[RAW] Loading staging tables for {}", period);

    let empresas = load_staging_table::<EmpresaRow>(pool, period, dir, threshold).await?;
    let estabelecimentos =
        load_staging_table::<EstabelecimentoRow>(pool, period, dir, threshold).await?;
    let socios = load_staging_table::<SocioRow>(pool, period, dir, threshold).await?;

    Ok(LoadReport {
        loaded: empresas.loaded + estabelecimentos.loaded + socios.loaded,
        rejected: empresas.rejected + estabelecimentos.rejected + socios.rejected,
    })
}

// =============================================================================
// Dimension loader
// =============================================================================

struct DimensionSpec {
    table: &'static str,
    label: &'static str,
    suffix: &'static str,
}

const DIMENSIONS: &[DimensionSpec] = &[
    DimensionSpec {
        table: "dim_cnae",
        label: "cnae",
        suffix: "CNAECSV",
    },
    DimensionSpec {
        table: "dim_municipio",
        label: "municipio",
        suffix: "MUNICCSV",
    },
    DimensionSpec {
        table: "dim_uf",
        label: "uf",
        suffix: "UFCSV",
    },
];

/// Upsert one reference table from its files, all-or-nothing. Codes are stable
/// across releases but descriptions get corrected, so conflicts overwrite the
/// description and never duplicate a code.
async fn load_dimension(pool: &SqlitePool, spec: &DimensionSpec, files: &[PathBuf]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut upserted: u64 = 0;
    let mut batch: Vec<(String, String)> = Vec::new();

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let (text, _, _) = REFERENCE_FORMAT.encoding.decode(&bytes);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(REFERENCE_FORMAT.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        for (idx, result) in reader.records().enumerate() {
            let line = idx + 1;
            let record = result.map_err(|e| WarehouseError::MalformedReferenceData {
                file: name.clone(),
                reason: format!("line {}: {}", line, e),
            })?;

            if record.len() != REFERENCE_FORMAT.columns {
                return Err(WarehouseError::MalformedReferenceData {
                    file: name,
                    reason: format!(
                        "line {}: expected {} columns, found {}",
                        line,
                        REFERENCE_FORMAT.columns,
                        record.len()
                    ),
                }
                .into());
            }

            let codigo = field(&record, 0);
            if codigo.is_empty() {
                return Err(WarehouseError::MalformedReferenceData {
                    file: name,
                    reason: format!("line {}: empty code", line),
                }
                .into());
            }

            batch.push((codigo, field(&record, 1)));
            if batch.len() >= INSERT_CHUNK {
                upsert_dimension_chunk(&mut tx, spec.table, &batch).await?;
                upserted += batch.len() as u64;
                batch.clear();
            }
        }
    }

    if !batch.is_empty() {
        upsert_dimension_chunk(&mut tx, spec.table, &batch).await?;
        upserted += batch.len() as u64;
    }

    tx.commit().await?;
    println!("[DIM] {}: {} codes upserted", spec.label, upserted);

    Ok(upserted)
}

async fn upsert_dimension_chunk(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    table: &str,
    rows: &[(String, String)],
) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("INSERT INTO {} (codigo, descricao) ", table));
    qb.push_values(rows, |mut b, (codigo, descricao)| {
        b.push_bind(codigo.clone()).push_bind(descricao.clone());
    });
    qb.push(" ON CONFLICT(codigo) DO UPDATE SET descricao = excluded.descricao");
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

async fn load_dimensions(pool: &SqlitePool, dir: &Path) -> Result<()> {
    println!("[DIM] Loading reference tables");
    for spec in DIMENSIONS {
        let files = find_files(dir, spec.suffix)?;
        if files.is_empty() {
            // reference data unchanged this release
            println!("[DIM] {}: no reference file, keeping existing entries", spec.label);
            continue;
        }
        load_dimension(pool, spec, &files).await?;
    }
    Ok(())
}

// =============================================================================
// Consolidator
// =============================================================================

#[derive(Debug)]
struct ConsolidationReport {
    candidates: u64,
    upserted: u64,
    flagged: u64,
}

/// Join staging with the dimension tables and merge the result into
/// leads_current in one statement. One row per active establishment identity;
/// on conflict every denormalized field is overwritten (latest period wins,
/// no field-level merge).
const CONSOLIDATE_UPSERT: &str = r#"
INSERT INTO leads_current (
    cnpj_basico, cnpj_ordem, razao_social, nome_fantasia,
    cnae, cnae_descricao, municipio, municipio_nome, uf, uf_nome,
    situacao_cadastral, data_inicio_atividade, qtde_socios,
    email, telefone, atualizado_em, encerrado
)
SELECT
    e.cnpj_basico,
    e.cnpj_ordem,
    MAX(emp.razao_social),
    MAX(e.nome_fantasia),
    MAX(e.cnae_fiscal_principal),
    MAX(c.descricao),
    MAX(e.municipio),
    MAX(m.descricao),
    MAX(e.uf),
    MAX(u.descricao),
    MAX(e.situacao_cadastral),
    MAX(e.data_inicio_atividade),
    COALESCE(MAX(s.qtde), 0),
    MAX(e.correio_eletronico),
    MAX(CASE
        WHEN e.telefone1 IS NULL OR e.telefone1 = '' THEN NULL
        ELSE COALESCE(e.ddd1, '') || e.telefone1
    END),
    ?,
    0
FROM staging_estabelecimento e
LEFT JOIN staging_empresa emp
    ON emp.period = e.period AND emp.cnpj_basico = e.cnpj_basico
JOIN dim_cnae c ON c.codigo = e.cnae_fiscal_principal
JOIN dim_municipio m ON m.codigo = e.municipio
JOIN dim_uf u ON u.codigo = e.uf
LEFT JOIN (
    SELECT cnpj_basico, COUNT(*) AS qtde
    FROM staging_socio
    WHERE period = ?
    GROUP BY cnpj_basico
) s ON s.cnpj_basico = e.cnpj_basico
WHERE e.period = ? AND e.situacao_cadastral = '02'
GROUP BY e.cnpj_basico, e.cnpj_ordem
ON CONFLICT (cnpj_basico, cnpj_ordem) DO UPDATE SET
    razao_social = excluded.razao_social,
    nome_fantasia = excluded.nome_fantasia,
    cnae = excluded.cnae,
    cnae_descricao = excluded.cnae_descricao,
    municipio = excluded.municipio,
    municipio_nome = excluded.municipio_nome,
    uf = excluded.uf,
    uf_nome = excluded.uf_nome,
    situacao_cadastral = excluded.situacao_cadastral,
    data_inicio_atividade = excluded.data_inicio_atividade,
    qtde_socios = excluded.qtde_socios,
    email = excluded.email,
    telefone = excluded.telefone,
    atualizado_em = excluded.atualizado_em,
    encerrado = 0
"#;

/// Every code referenced by an active establishment must resolve before any
/// lead is written. A missing description must stop the period, not vanish
/// into a NULL.
async fn check_dimension_refs(tx: &mut sqlx::Transaction<'_, Sqlite>, period: &Period) -> Result<()> {
    let checks: [(&'static str, &'static str, &'static str); 3] = [
        ("cnae", "cnae_fiscal_principal", "dim_cnae"),
        ("municipio", "municipio", "dim_municipio"),
        ("uf", "uf", "dim_uf"),
    ];

    for (label, col, dim) in checks {
        let count_sql = format!(
            "SELECT COUNT(DISTINCT e.{col}) FROM staging_estabelecimento e \
             WHERE e.period = ? AND e.situacao_cadastral = '02' \
             AND NOT EXISTS (SELECT 1 FROM {dim} d WHERE d.codigo = e.{col})"
        );
        let count: i64 = sqlx::query_scalar(&count_sql)
            .bind(period.as_str())
            .fetch_one(&mut **tx)
            .await?;

        if count > 0 {
            let sample_sql = format!(
                "SELECT DISTINCT e.{col} FROM staging_estabelecimento e \
                 WHERE e.period = ? AND e.situacao_cadastral = '02' \
                 AND NOT EXISTS (SELECT 1 FROM {dim} d WHERE d.codigo = e.{col}) \
                 ORDER BY e.{col} LIMIT 5"
            );
            let codes: Vec<String> = sqlx::query_scalar(&sample_sql)
                .bind(period.as_str())
                .fetch_all(&mut **tx)
                .await?;

            return Err(WarehouseError::UnresolvedDimensionReference {
                period: period.clone(),
                dimension: label,
                count: count as u64,
                codes,
            }
            .into());
        }
    }

    Ok(())
}

/// One transactional unit per period: referential check, join-and-upsert,
/// stale handling. Readers never observe a half-consolidated period.
async fn consolidate(
    pool: &SqlitePool,
    period: &Period,
    policy: StalePolicy,
) -> Result<ConsolidationReport> {
    println!("[LEADS] Consolidating period {}", period);

    let mut tx = pool.begin().await?;

    check_dimension_refs(&mut tx, period).await?;

    let candidates: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ( \
            SELECT 1 FROM staging_estabelecimento \
            WHERE period = ? AND situacao_cadastral = '02' \
            GROUP BY cnpj_basico, cnpj_ordem \
         )",
    )
    .bind(period.as_str())
    .fetch_one(&mut *tx)
    .await?;

    let upserted = sqlx::query(CONSOLIDATE_UPSERT)
        .bind(period.as_str())
        .bind(period.as_str())
        .bind(period.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let flagged = match policy {
        StalePolicy::Retain => 0,
        StalePolicy::Flag => {
            sqlx::query(
                "UPDATE leads_current SET encerrado = 1 WHERE atualizado_em <> ? AND encerrado = 0",
            )
            .bind(period.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        }
    };

    tx.commit().await?;

    println!(
        "[LEADS] {}: {} candidates, {} upserted, {} flagged closed",
        period, candidates, upserted, flagged
    );

    Ok(ConsolidationReport {
        candidates: candidates as u64,
        upserted,
        flagged,
    })
}

// =============================================================================
// Snapshot manager
// =============================================================================

#[derive(Debug, PartialEq)]
enum SnapshotOutcome {
    Written(u64),
    AlreadyExists(u64),
}

/// Full snapshot per period: every current lead row is rewritten under the
/// period label, not just deltas, because each release is a full re-export.
const SNAPSHOT_INSERT: &str = r#"
INSERT INTO leads (
    data_referencia, cnpj_basico, cnpj_ordem, razao_social, nome_fantasia,
    cnae, cnae_descricao, municipio, municipio_nome, uf, uf_nome,
    situacao_cadastral, data_inicio_atividade, qtde_socios,
    email, telefone, atualizado_em, encerrado
)
SELECT
    ?, cnpj_basico, cnpj_ordem, razao_social, nome_fantasia,
    cnae, cnae_descricao, municipio, municipio_nome, uf, uf_nome,
    situacao_cadastral, data_inicio_atividade, qtde_socios,
    email, telefone, atualizado_em, encerrado
FROM leads_current
"#;

/// Atomic at period granularity: the whole snapshot becomes visible on commit
/// or none of it does. An existing snapshot is immutable history and is only
/// rewritten under an explicit force.
async fn write_snapshot(pool: &SqlitePool, period: &Period, force: bool) -> Result<SnapshotOutcome> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE data_referencia = ?")
        .bind(period.as_str())
        .fetch_one(pool)
        .await?;

    if existing > 0 && !force {
        println!(
            "[SNAPSHOT] {} - skipping (--force-snapshot rewrites)",
            WarehouseError::SnapshotAlreadyExists(period.clone())
        );
        return Ok(SnapshotOutcome::AlreadyExists(existing as u64));
    }

    let mut tx = pool.begin().await?;

    if existing > 0 {
        println!("[SNAPSHOT] Rewriting {} ({} rows replaced)", period, existing);
        sqlx::query("DELETE FROM leads WHERE data_referencia = ?")
            .bind(period.as_str())
            .execute(&mut *tx)
            .await?;
    }

    let written = sqlx::query(SNAPSHOT_INSERT)
        .bind(period.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(SnapshotOutcome::Written(written))
}

// =============================================================================
// Run coordinator
// =============================================================================

#[derive(Debug, PartialEq)]
enum PeriodOutcome {
    Completed,
    Skipped,
}

fn discover_periods(extracted_dir: &Path) -> Result<Vec<Period>> {
    let mut periods = Vec::new();
    if !extracted_dir.is_dir() {
        return Ok(periods);
    }
    for entry in std::fs::read_dir(extracted_dir)
        .with_context(|| format!("listing {}", extracted_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(period) = name.parse::<Period>() {
            periods.push(period);
        }
    }
    periods.sort();
    Ok(periods)
}

/// Drive one period through the stage machine, resuming from the recorded
/// stage. Anything below Consolidated restarts at the raw load: staging is
/// cheap to reload and full replace guarantees a clean base. A period at
/// Consolidated resumes directly at the snapshot.
async fn process_period(
    pool: &SqlitePool,
    config: &Config,
    opts: &RunOpts,
    period: &Period,
) -> Result<PeriodOutcome> {
    let recorded = read_stage(pool, period).await?;

    match recorded {
        Some(Stage::Snapshotted) if !opts.force_snapshot => {
            println!("[RUN] {} already snapshotted, skipping", period);
            return Ok(PeriodOutcome::Skipped);
        }
        None => record_stage(pool, period, Stage::Pending).await?,
        _ => {}
    }
    let stage = recorded.unwrap_or(Stage::Pending);

    check_manifest(&config.extracted_dir, period)?;
    let dir = config.extracted_dir.join(period.as_str());

    if stage < Stage::Consolidated {
        let raw = load_staging(pool, period, &dir, config.rejection_threshold)
            .await
            .context("raw load")?;
        record_stage(pool, period, Stage::RawLoaded).await?;

        load_dimensions(pool, &dir).await.context("dimension load")?;
        record_stage(pool, period, Stage::DimensionsReady).await?;

        let consolidated = consolidate(pool, period, config.stale_policy)
            .await
            .context("consolidation")?;
        record_stage(pool, period, Stage::Consolidated).await?;

        println!(
            "[RUN] {}: {} rows staged, {} leads upserted",
            period, raw.loaded, consolidated.upserted
        );
    } else {
        println!("[RUN] Resuming {} at snapshot (stage {})", period, stage.as_str());
    }

    match write_snapshot(pool, period, opts.force_snapshot)
        .await
        .context("snapshot")?
    {
        SnapshotOutcome::Written(rows) => println!("[SNAPSHOT] {}: {} rows written", period, rows),
        SnapshotOutcome::AlreadyExists(rows) => {
            println!("[SNAPSHOT] {}: kept existing {} rows", period, rows)
        }
    }
    record_stage(pool, period, Stage::Snapshotted).await?;

    Ok(PeriodOutcome::Completed)
}

/// Periods run sequentially in ascending order so the newest export always
/// lands last in leads_current. A failed period is reported and the run moves
/// on; already-committed periods stay queryable.
async fn run_periods(pool: &SqlitePool, config: &Config, opts: &RunOpts) -> Result<()> {
    let periods = if opts.periods.is_empty() {
        discover_periods(&config.extracted_dir)?
    } else {
        let mut explicit = opts.periods.clone();
        explicit.sort();
        explicit.dedup();
        explicit
    };

    if periods.is_empty() {
        println!("[RUN] No periods found under {}", config.extracted_dir.display());
        return Ok(());
    }

    println!(
        "[RUN] Periods to process: {}",
        periods.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
    );

    let mut completed = 0usize;
    let mut skipped = 0usize;
    let mut failures: Vec<(Period, String)> = Vec::new();

    for period in &periods {
        println!("\n[RUN] Processing period {}", period);
        match process_period(pool, config, opts, period).await {
            Ok(PeriodOutcome::Completed) => completed += 1,
            Ok(PeriodOutcome::Skipped) => skipped += 1,
            Err(e) => {
                eprintln!("[RUN] Period {} failed: {:#}", period, e);
                failures.push((period.clone(), format!("{:#}", e)));
            }
        }
    }

    println!("\n=== Ingest Summary ===");
    println!("Completed: {}", completed);
    println!("Skipped:   {}", skipped);
    println!("Failed:    {}", failures.len());
    for (period, error) in &failures {
        eprintln!("  {}: {}", period, error);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} of {} periods failed", failures.len(), periods.len()))
    }
}

async fn run_ingest(pool: &SqlitePool, config: &Config, opts: &RunOpts) -> Result<()> {
    println!("=== CNPJ Warehouse Ingest ===");
    println!("Database:  {}", config.db_path.display());
    println!("Extracted: {}", config.extracted_dir.display());

    let holder = Uuid::new_v4().to_string();
    acquire_lock(pool, &holder).await?;

    let result = run_periods(pool, config, opts).await;

    if let Err(e) = release_lock(pool, &holder).await {
        eprintln!("[LOCK] Release failed: {:#}", e);
    }

    result
}

// =============================================================================
// Status
// =============================================================================

async fn print_status(pool: &SqlitePool) -> Result<()> {
    println!("=== Warehouse Status ===");

    let states: Vec<(String, String, String)> =
        sqlx::query_as("SELECT period, stage, updated_at FROM processing_state ORDER BY period")
            .fetch_all(pool)
            .await?;

    if states.is_empty() {
        println!("No periods processed yet");
    } else {
        println!("{:<10} {:<18} {}", "period", "stage", "updated_at");
        for (period, stage, updated_at) in &states {
            println!("{:<10} {:<18} {}", period, stage, updated_at);
        }
    }

    let current: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads_current")
        .fetch_one(pool)
        .await?;
    println!("\nleads_current: {} rows", current);

    let snapshots: Vec<(String, i64)> = sqlx::query_as(
        "SELECT data_referencia, COUNT(*) FROM leads GROUP BY data_referencia ORDER BY data_referencia",
    )
    .fetch_all(pool)
    .await?;
    for (period, rows) in &snapshots {
        println!("snapshot {}: {} rows", period, rows);
    }

    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let mut config = Config::from_env()?;

    match args.command {
        Command::Setup => {
            let pool = connect(&config.db_path).await?;
            setup_schema(&pool).await?;
            println!("[WAREHOUSE] Schema ready at {}", config.db_path.display());
        }
        Command::Run {
            periods,
            force_snapshot,
            rejection_threshold,
            stale_policy,
        } => {
            if let Some(threshold) = rejection_threshold {
                config.rejection_threshold = threshold;
            }
            if let Some(policy) = stale_policy {
                config.stale_policy = policy;
            }
            let explicit = periods
                .iter()
                .map(|p| p.parse::<Period>())
                .collect::<Result<Vec<_>>>()?;

            let pool = connect(&config.db_path).await?;
            setup_schema(&pool).await?;
            run_ingest(
                &pool,
                &config,
                &RunOpts {
                    periods: explicit,
                    force_snapshot,
                },
            )
            .await?;
        }
        Command::Status => {
            let pool = connect(&config.db_path).await?;
            setup_schema(&pool).await?;
            print_status(&pool).await?;
        }
        Command::Unlock => {
            let pool = connect(&config.db_path).await?;
            setup_schema(&pool).await?;
            force_unlock(&pool).await?;
        }
    }

    Ok(())
}

// =============================================================================
// TESTS - Idempotency is the property everything else hangs on
// =============================================================================
