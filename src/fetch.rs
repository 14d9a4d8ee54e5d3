// 🌐 Source Fetchers - statements and registries from the open-data archive
//
// Sequential, blocking downloads into the raw staging dir. A file already
// present is never downloaded again; a source that fails is logged and
// skipped so the other sources still land.

use crate::config::PipelineConfig;
use crate::error::{EtlError, Result};
use crate::registry::OperatorStatus;
use crate::statement::Period;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How far back the statement search walks.
pub const YEARS_BACK: i32 = 10;

const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// URLS & LISTINGS
// ============================================================================

/// `{base}/{year}/{q}T{year}.zip`
pub fn statement_url(base: &str, period: Period) -> String {
    format!(
        "{}/{}/{}.zip",
        base.trim_end_matches('/'),
        period.year,
        period.label()
    )
}

/// Periods to check, newest first: every quarter of `years_back` years
/// ending with `current_year`.
pub fn candidate_periods(current_year: i32, years_back: i32) -> Vec<Period> {
    let newest = Period {
        year: current_year,
        quarter: 4,
    };
    std::iter::successors(Some(newest), |p| Some(p.previous()))
        .take(years_back.max(0) as usize * 4)
        .collect()
}

/// Name of the newest delimited file in a directory listing: the last
/// `.csv` / `.txt` link by name.
pub fn latest_listing_file(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("a[href]").ok()?;

    doc.select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            let lower = href.to_ascii_lowercase();
            lower.ends_with(".csv") || lower.ends_with(".txt")
        })
        .max()
        .map(str::to_string)
}

/// Absolute URL for a listing link.
pub fn resolve_link(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Local file name for a registry link. The status must be recoverable
/// from the name, so cancelled files that do not say so get a suffix.
pub fn registry_file_name(href: &str, status: OperatorStatus) -> String {
    let last = href.rsplit('/').next().unwrap_or(href);
    let name = urlencoding::decode(last)
        .map(|n| n.into_owned())
        .unwrap_or_else(|_| last.to_string());

    let path = Path::new(&name);
    if status == OperatorStatus::Cancelled && OperatorStatus::from_file_name(path) != status {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("registry");
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("csv");
        format!("{}_canceladas.{}", stem, ext)
    } else {
        name
    }
}

// ============================================================================
// FETCHER
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegistrySource {
    pub name: String,
    pub url: String,
    pub status: OperatorStatus,
}

impl RegistrySource {
    pub fn from_config(config: &PipelineConfig) -> Vec<RegistrySource> {
        vec![
            RegistrySource {
                name: "ativas".to_string(),
                url: config.registry_active_url.clone(),
                status: OperatorStatus::Active,
            },
            RegistrySource {
                name: "canceladas".to_string(),
                url: config.registry_cancelled_url.clone(),
                status: OperatorStatus::Cancelled,
            },
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub statements: Vec<PathBuf>,
    pub registries: Vec<PathBuf>,
    pub downloaded: usize,
    pub skipped_existing: usize,
    pub failed_sources: Vec<String>,
}

/// Stream `body` into `dest` through a sibling `.part` file. The partial
/// file is removed when the copy fails.
fn save_via_partial<R: Read>(body: &mut R, dest: &Path) -> Result<u64> {
    let partial = dest.with_extension("part");
    let mut file = File::create(&partial)?;

    match io::copy(body, &mut file) {
        Ok(bytes) => {
            drop(file);
            fs::rename(&partial, dest)?;
            Ok(bytes)
        }
        Err(e) => {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %cleanup, "failed to remove partial download");
            }
            Err(e.into())
        }
    }
}

pub struct Fetcher {
    http: Client,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("ans-consolidation")),
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Fetcher { http })
    }

    /// HEAD request; any failure counts as "not published".
    pub fn is_published(&self, url: &str) -> bool {
        match self.http.head(url).timeout(HEAD_TIMEOUT).send() {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "HEAD request failed");
                false
            }
        }
    }

    /// Newest `wanted` published periods, newest first.
    pub fn find_recent_periods(&self, base: &str, wanted: usize, current_year: i32) -> Vec<Period> {
        let mut found = Vec::new();
        for period in candidate_periods(current_year, YEARS_BACK) {
            if found.len() == wanted {
                break;
            }
            if self.is_published(&statement_url(base, period)) {
                info!(period = %period, "statement published");
                found.push(period);
            }
        }
        if found.len() < wanted {
            warn!(found = found.len(), wanted, "fewer statement periods published than requested");
        }
        found
    }

    /// Download `url` to `dest`. Returns `false` when `dest` already exists.
    /// The body goes to a `.part` file first, so an interrupted download
    /// never leaves a file that looks complete.
    pub fn download(&self, url: &str, dest: &Path) -> Result<bool> {
        if dest.exists() {
            info!(path = %dest.display(), "already present, skipping");
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(url, "downloading");
        let mut resp = self.http.get(url).send()?.error_for_status()?;
        let bytes = save_via_partial(&mut resp, dest)?;

        info!(path = %dest.display(), bytes, "saved");
        Ok(true)
    }

    pub fn fetch_statements(
        &self,
        base: &str,
        dir: &Path,
        wanted: usize,
        current_year: i32,
        report: &mut FetchReport,
    ) -> Result<()> {
        for period in self.find_recent_periods(base, wanted, current_year) {
            let dest = dir.join(format!("{}.zip", period.label()));
            match self.download(&statement_url(base, period), &dest) {
                Ok(true) => report.downloaded += 1,
                Ok(false) => report.skipped_existing += 1,
                Err(e) => {
                    error!(period = %period, error = %e, "statement download failed");
                    report.failed_sources.push(period.label());
                    continue;
                }
            }
            report.statements.push(dest);
        }
        Ok(())
    }

    /// Latest file of one registry source.
    pub fn fetch_registry(&self, source: &RegistrySource, dir: &Path) -> Result<(PathBuf, bool)> {
        let listing = self.http.get(&source.url).send()?.error_for_status()?.text()?;
        let href = latest_listing_file(&listing).ok_or_else(|| {
            EtlError::MissingInput(format!("no .csv/.txt link at {}", source.url))
        })?;

        let dest = dir.join(registry_file_name(&href, source.status));
        let downloaded = self.download(&resolve_link(&source.url, &href), &dest)?;
        Ok((dest, downloaded))
    }

    pub fn fetch_registries(&self, sources: &[RegistrySource], dir: &Path, report: &mut FetchReport) {
        for source in sources {
            match self.fetch_registry(source, dir) {
                Ok((path, downloaded)) => {
                    if downloaded {
                        report.downloaded += 1;
                    } else {
                        report.skipped_existing += 1;
                    }
                    report.registries.push(path);
                }
                Err(e) => {
                    error!(source = %source.name, error = %e, "registry download failed");
                    report.failed_sources.push(source.name.clone());
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
