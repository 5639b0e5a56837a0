//! Collector Service - Downloads and extracts CNPJ monthly releases
//!
//! Responsibilities:
//! - Discover recently updated months on the Receita Federal public share (WebDAV)
//! - Download each month's ZIP files, skipping files already on disk
//! - Extract archives into the per-period directory the warehouse reads
//! - Write manifest.json as the completeness marker once a period is whole
//!
//! The manifest is written last, through a rename, so the warehouse never
//! observes a half-extracted period as complete.
//!
//! Usage:
//!   # Everything updated in the last days window:
//!   cargo run --bin collector
//!
//!   # Specific months:
//!   cargo run --bin collector -- --period 2024-01 --period 2024-02

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use clap::Parser;
use quick_xml::events::Event;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Collects CNPJ monthly releases from the public share")]
struct Args {
    /// Months (YYYY-MM) to collect; discovered from the share when omitted
    #[arg(long = "period")]
    periods: Vec<String>,

    /// Only print the months that would be collected
    #[arg(long, default_value = "false")]
    list_only: bool,

    /// Re-download files already present on disk
    #[arg(long, default_value = "false")]
    force: bool,
}

// =============================================================================
// Configuration
// =============================================================================

const WEBDAV_BASE: &str = "https://dados-hom.receitafederal.gov.br/public.php/webdav";
const MONTH_ROOT: &str = "/Dados/Cadastros/CNPJ";

const LIST_RETRIES: u32 = 5;
const DOWNLOAD_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
struct Config {
    data_dir: PathBuf,
    public_token: String,
    rate_limit_ms: u64,
    days_window: i64,
    max_rounds: u32,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            public_token: std::env::var("PUBLIC_TOKEN").context("PUBLIC_TOKEN env var missing")?,
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            days_window: std::env::var("DAYS_WINDOW")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            max_rounds: std::env::var("MAX_ROUNDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
        })
    }

    fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    fn extracted_dir(&self) -> PathBuf {
        self.data_dir.join("extracted")
    }

    fn auth_header(&self) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:", self.public_token)))
    }
}

// =============================================================================
// WebDAV listing
// =============================================================================

const PROPFIND_BODY: &str = r#"<?xml version="1.0"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:getlastmodified />
    </d:prop>
</d:propfind>
"#;

#[derive(Debug)]
struct DavEntry {
    href: String,
    last_modified: Option<String>,
}

async fn propfind(client: &reqwest::Client, config: &Config, url: &str) -> Result<String> {
    let method = reqwest::Method::from_bytes(b"PROPFIND")?;
    let response = client
        .request(method, url)
        .header(reqwest::header::AUTHORIZATION, config.auth_header())
        .header("Depth", "1")
        .header(reqwest::header::CONTENT_TYPE, "application/xml")
        .body(PROPFIND_BODY)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("PROPFIND {} failed", url))?;

    Ok(response.text().await?)
}

/// Pull href + getlastmodified out of a multistatus response. Namespace
/// prefixes vary by server, so elements are matched by local name.
fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    let mut reader = quick_xml::Reader::from_str(xml);

    let mut entries = Vec::new();
    let mut href: Option<String> = None;
    let mut last_modified: Option<String> = None;
    let mut in_href = false;
    let mut in_last_modified = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => {
                    href = None;
                    last_modified = None;
                }
                b"href" => in_href = true,
                b"getlastmodified" => in_last_modified = true,
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if in_href {
                    href = Some(text);
                } else if in_last_modified {
                    last_modified = Some(text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"href" => in_href = false,
                b"getlastmodified" => in_last_modified = false,
                b"response" => {
                    if let Some(h) = href.take() {
                        entries.push(DavEntry {
                            href: h,
                            last_modified: last_modified.take(),
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

fn last_segment(href: &str) -> &str {
    href.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn is_month_folder(name: &str) -> bool {
    name.len() == 7
        && name.as_bytes()[4] == b'-'
        && name[..4].bytes().all(|b| b.is_ascii_digit())
        && name[5..].bytes().all(|b| b.is_ascii_digit())
        && matches!(name[5..].parse::<u32>(), Ok(m) if (1..=12).contains(&m))
}

/// Only the archives the warehouse consumes.
fn is_relevant_zip(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if !lower.ends_with(".zip") {
        return false;
    }
    ["estabelecimentos", "empresas", "socios", "cnaes", "cnae", "municipios", "uf"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

// =============================================================================
// Month finder
// =============================================================================

/// Month folders whose last modification falls inside the cutoff window.
fn updated_month_names(entries: &[DavEntry], cutoff: DateTime<Utc>) -> Vec<String> {
    let mut months = Vec::new();

    for entry in entries {
        let name = last_segment(&entry.href);
        if !is_month_folder(name) {
            continue;
        }
        let Some(raw) = &entry.last_modified else {
            continue;
        };
        let Ok(parsed) = DateTime::parse_from_rfc2822(raw) else {
            continue;
        };
        if parsed.with_timezone(&Utc) >= cutoff {
            months.push(name.to_string());
        }
    }

    months.sort();
    months.dedup();
    months
}

async fn updated_months(client: &reqwest::Client, config: &Config) -> Result<Vec<String>> {
    println!("[FINDER] Checking months updated in the last {} days", config.days_window);

    let url = format!("{}{}/", WEBDAV_BASE, MONTH_ROOT);
    let xml = propfind(client, config, &url).await?;
    let entries = parse_multistatus(&xml)?;

    let cutoff = Utc::now() - chrono::Duration::days(config.days_window);
    let months = updated_month_names(&entries, cutoff);

    println!("[FINDER] {} month(s) updated", months.len());
    Ok(months)
}

// =============================================================================
// Downloader
// =============================================================================

#[derive(Debug, Default)]
struct DownloadSummary {
    downloaded: usize,
    skipped: usize,
}

async fn list_month_zips(
    client: &reqwest::Client,
    config: &Config,
    period: &str,
) -> Result<Vec<String>> {
    let url = format!("{}{}/{}/", WEBDAV_BASE, MONTH_ROOT, period);

    for attempt in 1..=LIST_RETRIES {
        let result = async {
            let xml = propfind(client, config, &url).await?;
            let names: Vec<String> = parse_multistatus(&xml)?
                .iter()
                .map(|entry| last_segment(&entry.href).to_string())
                .filter(|name| is_relevant_zip(name))
                .collect();
            if names.is_empty() {
                bail!("no ZIP files listed");
            }
            Ok::<Vec<String>, anyhow::Error>(names)
        }
        .await;

        match result {
            Ok(mut names) => {
                names.sort();
                names.dedup();
                return Ok(names);
            }
            Err(e) => {
                if attempt == LIST_RETRIES {
                    return Err(e.context(format!("Failed to list ZIPs for {}", period)));
                }
                let wait = 3.0 * (attempt * attempt) as f64;
                eprintln!(
                    "[DOWNLOAD] Retry {}/{} listing ZIPs for {} (waiting {:.1}s)",
                    attempt, LIST_RETRIES, period, wait
                );
                sleep(Duration::from_secs_f64(wait)).await;
            }
        }
    }

    unreachable!("retry loop always returns")
}

fn file_is_present(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Stream one ZIP to disk. A partial file is removed before every retry so a
/// later round never mistakes it for a finished download.
async fn download_file(
    client: &reqwest::Client,
    config: &Config,
    url: &str,
    out_path: &Path,
) -> Result<()> {
    for attempt in 1..=DOWNLOAD_RETRIES {
        let result = async {
            let mut response = client
                .get(url)
                .header(reqwest::header::AUTHORIZATION, config.auth_header())
                .send()
                .await?
                .error_for_status()?;

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !content_type.contains("zip") && !content_type.contains("octet-stream") {
                bail!("expected ZIP, got content type '{}'", content_type);
            }

            let mut file = tokio::fs::File::create(out_path).await?;
            let mut size: u64 = 0;
            while let Some(chunk) = response.chunk().await? {
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;

            if size == 0 {
                bail!("empty response body");
            }
            Ok::<u64, anyhow::Error>(size)
        }
        .await;

        match result {
            Ok(size) => {
                println!(
                    "  Downloaded {} ({:.1} MiB)",
                    out_path.file_name().unwrap_or_default().to_string_lossy(),
                    size as f64 / (1024.0 * 1024.0)
                );
                return Ok(());
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(out_path).await;
                if attempt == DOWNLOAD_RETRIES {
                    return Err(e.context(format!("downloading {}", url)));
                }
                let wait = 3.0 * (attempt * attempt) as f64;
                eprintln!(
                    "[DOWNLOAD] Retry {}/{} for {} (waiting {:.1}s)",
                    attempt,
                    DOWNLOAD_RETRIES,
                    out_path.file_name().unwrap_or_default().to_string_lossy(),
                    wait
                );
                sleep(Duration::from_secs_f64(wait)).await;
            }
        }
    }

    unreachable!("retry loop always returns")
}

/// Ensure every ZIP of the month is on disk. Listing and downloading repeat in
/// rounds until nothing is missing; the share is unstable enough that a single
/// pass regularly comes back short.
async fn download_month(
    client: &reqwest::Client,
    config: &Config,
    period: &str,
    force: bool,
) -> Result<DownloadSummary> {
    println!("[DOWNLOAD] Ensuring complete download for {}", period);

    let month_dir = config.raw_dir().join(period);
    tokio::fs::create_dir_all(&month_dir).await?;

    let mut summary = DownloadSummary::default();

    for round in 1..=config.max_rounds {
        println!("[DOWNLOAD] Round {}/{}", round, config.max_rounds);

        let zips = list_month_zips(client, config, period).await?;

        for name in &zips {
            let out_path = month_dir.join(name);
            let redownload = force && round == 1;

            if file_is_present(&out_path) && !redownload {
                summary.skipped += 1;
                continue;
            }

            sleep(Duration::from_millis(config.rate_limit_ms)).await;
            let url = format!("{}{}/{}/{}", WEBDAV_BASE, MONTH_ROOT, period, name);
            match download_file(client, config, &url, &out_path).await {
                Ok(()) => summary.downloaded += 1,
                Err(e) => eprintln!("[DOWNLOAD] Failed {}: {:#}", name, e),
            }
        }

        let missing: Vec<&String> = zips
            .iter()
            .filter(|name| !file_is_present(&month_dir.join(name.as_str())))
            .collect();

        if missing.is_empty() {
            println!("[DOWNLOAD] Month {} complete", period);
            return Ok(summary);
        }

        println!("[DOWNLOAD] Month incomplete: {} ZIP(s) missing", missing.len());
        sleep(Duration::from_secs(10)).await;
    }

    bail!(
        "failed to fully download month {} after {} rounds",
        period,
        config.max_rounds
    )
}

// =============================================================================
// Extractor
// =============================================================================

fn extract_zip(path: &Path, out_dir: &Path) -> Result<usize> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let count = archive.len();
    archive.extract(out_dir)?;
    Ok(count)
}

/// Unpack every downloaded ZIP for the month. An unreadable archive is removed
/// so the next download round fetches it again, and the month is reported as
/// failed rather than half-extracted.
fn extract_month(config: &Config, period: &str) -> Result<usize> {
    println!("[EXTRACT] Extracting files for {}", period);

    let raw_month_dir = config.raw_dir().join(period);
    let out_dir = config.extracted_dir().join(period);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut zips: Vec<PathBuf> = std::fs::read_dir(&raw_month_dir)
        .with_context(|| format!("listing {}", raw_month_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false)
        })
        .collect();
    zips.sort();

    if zips.is_empty() {
        bail!("no ZIP files downloaded for {}", period);
    }

    let mut extracted = 0usize;
    let mut failed: Vec<String> = Vec::new();

    for zip_path in &zips {
        let name = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match extract_zip(zip_path, &out_dir) {
            Ok(count) => extracted += count,
            Err(e) => {
                eprintln!("[EXTRACT] Failed to extract {}: {:#}", name, e);
                if e.downcast_ref::<zip::result::ZipError>().is_some() {
                    // corrupt archive, force a re-download next round
                    let _ = std::fs::remove_file(zip_path);
                    eprintln!("[EXTRACT] Invalid ZIP removed: {}", name);
                }
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        bail!(
            "{} archive(s) failed to extract for {}: {}",
            failed.len(),
            period,
            failed.join(", ")
        );
    }

    println!("[EXTRACT] Completed: {} file(s) extracted", extracted);
    Ok(extracted)
}

// =============================================================================
// Manifest
// =============================================================================

#[derive(Debug, Serialize)]
struct Manifest {
    period: String,
    generated_at: String,
    complete: bool,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Serialize)]
struct ManifestFile {
    name: String,
    size_bytes: u64,
    sha256: String,
}

/// Record every extracted file with its hash, then move the manifest into
/// place. The rename is the commit point of the whole period.
async fn write_manifest(config: &Config, period: &str) -> Result<usize> {
    let dir = config.extracted_dir().join(period);

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|n| n != "manifest.json" && n != "manifest.json.tmp")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        bail!("nothing extracted for {}", period);
    }

    let mut files = Vec::new();
    for path in &paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        files.push(ManifestFile {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes: bytes.len() as u64,
            sha256: format!("sha256:{:x}", hasher.finalize()),
        });
    }

    let count = files.len();
    let manifest = Manifest {
        period: period.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        complete: true,
        files,
    };

    let json = serde_json::to_string_pretty(&manifest)?;
    let tmp_path = dir.join("manifest.json.tmp");
    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, dir.join("manifest.json")).await?;

    Ok(count)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== CNPJ Collector ===");
    println!("Data dir: {}", config.data_dir.display());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("cnpj-leads-collector/0.1")
        .build()?;

    let periods = if args.periods.is_empty() {
        updated_months(&client, &config).await?
    } else {
        for period in &args.periods {
            if !is_month_folder(period) {
                bail!("invalid period '{}', expected YYYY-MM", period);
            }
        }
        let mut explicit = args.periods.clone();
        explicit.sort();
        explicit.dedup();
        explicit
    };

    if periods.is_empty() {
        println!("[MAIN] No updated months found");
        return Ok(());
    }

    if args.list_only {
        for period in &periods {
            println!("{}", period);
        }
        return Ok(());
    }

    println!("[MAIN] Months to process: {}", periods.join(", "));

    let mut failures: Vec<String> = Vec::new();

    for period in &periods {
        println!("\n[MAIN] Processing month {}", period);

        let result = async {
            let summary = download_month(&client, &config, period, args.force).await?;
            println!(
                "[MAIN] Downloaded {} file(s), {} already present",
                summary.downloaded, summary.skipped
            );

            let extracted = extract_month(&config, period)?;
            println!("[MAIN] Extracted {} file(s)", extracted);

            let manifested = write_manifest(&config, period).await?;
            println!("[MAIN] Manifest written ({} files)", manifested);

            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            eprintln!("[MAIN] Month {} failed: {:#}", period, e);
            failures.push(period.clone());
        }
    }

    if failures.is_empty() {
        println!("\n[MAIN] Done");
        Ok(())
    } else {
        bail!("{} month(s) failed: {}", failures.len(), failures.join(", "))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;

    fn config_for(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            public_token: "token".to_string(),
            rate_limit_ms: 0,
            days_window: 15,
            max_rounds: 1,
        }
    }

    // -------------------------------------------------------------------------
    // Name filters
    // -------------------------------------------------------------------------

    #[test]
    fn month_folder_names() {
        assert!(is_month_folder("2024-01"));
        assert!(is_month_folder("1999-12"));
        assert!(!is_month_folder("2024-13"));
        assert!(!is_month_folder("2024-00"));
        assert!(!is_month_folder("2024-1"));
        assert!(!is_month_folder("readme"));
    }

    #[test]
    fn relevant_zip_names() {
        assert!(is_relevant_zip("Estabelecimentos0.zip"));
        assert!(is_relevant_zip("Empresas3.zip"));
        assert!(is_relevant_zip("Socios1.zip"));
        assert!(is_relevant_zip("Cnaes.zip"));
        assert!(is_relevant_zip("Municipios.zip"));
        assert!(!is_relevant_zip("Simples.zip"));
        assert!(!is_relevant_zip("Estabelecimentos0.csv"));
    }

    #[test]
    fn href_last_segment() {
        assert_eq!(
            last_segment("/public.php/webdav/Dados/Cadastros/CNPJ/2024-01/"),
            "2024-01"
        );
        assert_eq!(last_segment("Empresas0.zip"), "Empresas0.zip");
    }

    // -------------------------------------------------------------------------
    // Multistatus parsing
    // -------------------------------------------------------------------------

    const SAMPLE_MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/public.php/webdav/Dados/Cadastros/CNPJ/</d:href>
    <d:propstat>
      <d:prop><d:getlastmodified>Mon, 01 Jul 2024 10:00:00 GMT</d:getlastmodified></d:prop>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/public.php/webdav/Dados/Cadastros/CNPJ/2024-06/</d:href>
    <d:propstat>
      <d:prop><d:getlastmodified>Sat, 29 Jun 2024 08:30:00 GMT</d:getlastmodified></d:prop>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/public.php/webdav/Dados/Cadastros/CNPJ/2024-05/</d:href>
    <d:propstat>
      <d:prop><d:getlastmodified>Wed, 01 May 2024 08:30:00 GMT</d:getlastmodified></d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>
"#;

    #[test]
    fn multistatus_parses_href_and_lastmodified() {
        let entries = parse_multistatus(SAMPLE_MULTISTATUS).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(last_segment(&entries[1].href), "2024-06");
        assert_eq!(
            entries[1].last_modified.as_deref(),
            Some("Sat, 29 Jun 2024 08:30:00 GMT")
        );
    }

    #[test]
    fn updated_months_respect_cutoff() {
        let entries = parse_multistatus(SAMPLE_MULTISTATUS).unwrap();
        let cutoff = DateTime::parse_from_rfc2822("Sat, 15 Jun 2024 00:00:00 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let months = updated_month_names(&entries, cutoff);
        // the root folder is not a month and 2024-05 predates the cutoff
        assert_eq!(months, vec!["2024-06".to_string()]);
    }

    #[test]
    fn multistatus_without_months_yields_nothing() {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response><d:href>/public.php/webdav/other/</d:href></d:response>
</d:multistatus>"#;
        let entries = parse_multistatus(xml).unwrap();
        let months = updated_month_names(&entries, Utc::now());
        assert!(months.is_empty());
    }

    // -------------------------------------------------------------------------
    // Extraction
    // -------------------------------------------------------------------------

    fn write_test_zip(path: &Path, entry_name: &str, content: &[u8]) {
        let file = fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(entry_name, options).expect("start entry");
        writer.write_all(content).expect("write entry");
        writer.finish().expect("finish zip");
    }

    #[test]
    fn extract_month_unpacks_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let raw_dir = config.raw_dir().join("2024-01");
        fs::create_dir_all(&raw_dir).unwrap();

        write_test_zip(
            &raw_dir.join("Empresas0.zip"),
            "K3241.EMPRECSV",
            b"\"12345678\";\"ACME\";\"2062\";\"49\";\"\";\"03\";\"\"\n",
        );

        let extracted = extract_month(&config, "2024-01").unwrap();
        assert_eq!(extracted, 1);
        assert!(config
            .extracted_dir()
            .join("2024-01")
            .join("K3241.EMPRECSV")
            .is_file());
    }

    #[test]
    fn extract_month_removes_invalid_archives_and_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let raw_dir = config.raw_dir().join("2024-01");
        fs::create_dir_all(&raw_dir).unwrap();

        let bad_zip = raw_dir.join("Empresas0.zip");
        fs::write(&bad_zip, b"this is not a zip archive").unwrap();

        assert!(extract_month(&config, "2024-01").is_err());
        assert!(!bad_zip.exists());
    }

    // -------------------------------------------------------------------------
    // Manifest
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn manifest_records_every_extracted_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let dir = config.extracted_dir().join("2024-01");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("K3241.EMPRECSV"), b"\"12345678\";\"ACME\"\n").unwrap();
        fs::write(dir.join("K3241.ESTABELE"), b"\"12345678\";\"0001\"\n").unwrap();

        let count = write_manifest(&config, "2024-01").await.unwrap();
        assert_eq!(count, 2);
        assert!(!dir.join("manifest.json.tmp").exists());

        let content = fs::read_to_string(dir.join("manifest.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["period"], "2024-01");
        assert_eq!(parsed["complete"], true);
        assert_eq!(parsed["files"].as_array().unwrap().len(), 2);
        assert!(parsed["files"][0]["sha256"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
    }

    #[tokio::test]
    async fn manifest_refuses_an_empty_period() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        fs::create_dir_all(config.extracted_dir().join("2024-01")).unwrap();

        assert!(write_manifest(&config, "2024-01").await.is_err());
    }

    #[tokio::test]
    async fn manifest_rewrite_stays_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let dir = config.extracted_dir().join("2024-01");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("K3241.EMPRECSV"), b"one\n").unwrap();

        write_manifest(&config, "2024-01").await.unwrap();
        // a second collector pass must not count the old manifest as data
        let count = write_manifest(&config, "2024-01").await.unwrap();
        assert_eq!(count, 1);
    }
}
