//! Tabular source: fetch the external sheet and normalize it into a [`RecordSet`].

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::SyncError;
use crate::model::{parse_id, ColumnLabels, Record, RecordSet};

pub type Grid = Vec<Vec<String>>;

/// How a raw grid is turned into records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeRules {
    /// A row whose cells mention any of these (case-insensitive) is the header.
    pub header_keywords: Vec<String>,
    /// Rows containing any of these are presentation-only and dropped.
    pub section_markers: Vec<String>,
    /// Preferred label of the media-link column.
    pub media_column: String,
}

impl Default for NormalizeRules {
    fn default() -> Self {
        Self {
            header_keywords: vec![
                "VEHICLE DETAILS".into(),
                "LOCATION".into(),
                "DRIVE LINK".into(),
            ],
            section_markers: vec!["ONLINE AUCTION CLOSING".into()],
            media_column: "DRIVE LINK".into(),
        }
    }
}

/// Resolves a source locator into a raw row/column grid.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Grid, SyncError>;
}

/// Fetch and normalize in one go.
#[instrument(skip_all)]
pub async fn fetch_and_normalize(
    fetcher: &dyn SourceFetcher,
    locator: &str,
    rules: &NormalizeRules,
) -> Result<RecordSet, SyncError> {
    let grid = fetcher.fetch(locator).await?;
    let set = normalize(&grid, rules)?;
    info!(rows = grid.len(), records = set.len(), "source normalized");
    Ok(set)
}

/// HTTP fetcher for published spreadsheets and plain CSV URLs.
#[derive(Debug, Clone)]
pub struct SheetFetcher {
    http: Client,
}

impl SheetFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("auction-sync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http }
    }
}

/// Turn a spreadsheet edit/view link into its CSV export URL. Any other URL
/// is returned unchanged.
pub fn export_url(locator: &str) -> Result<Url, SyncError> {
    let url = Url::parse(locator.trim()).map_err(|err| {
        SyncError::SourceUnavailable(format!("invalid source locator {:?}: {}", locator, err))
    })?;
    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let doc_id = match segments.as_slice() {
        ["spreadsheets", "d", id, ..] if url.host_str() == Some("docs.google.com") => *id,
        _ => return Ok(url),
    };

    let gid = url
        .query_pairs()
        .find(|(k, _)| k == "gid")
        .map(|(_, v)| v.into_owned())
        .or_else(|| {
            url.fragment()
                .and_then(|f| f.split('&').find_map(|p| p.strip_prefix("gid=")))
                .map(str::to_string)
        })
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| "0".to_string());

    let mut export = Url::parse("https://docs.google.com/").expect("valid sheets URL");
    export.set_path(&format!("spreadsheets/d/{}/export", doc_id));
    export
        .query_pairs_mut()
        .append_pair("format", "csv")
        .append_pair("gid", &gid);
    Ok(export)
}

pub fn parse_grid(text: &str) -> Result<Grid, SyncError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    rdr.records()
        .map(|row| {
            row.map(|r| r.iter().map(str::to_string).collect())
                .map_err(|err| SyncError::MalformedSource(format!("unreadable CSV: {}", err)))
        })
        .collect()
}

#[async_trait]
impl SourceFetcher for SheetFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, locator: &str) -> Result<Grid, SyncError> {
        let url = export_url(locator)?;
        debug!(%url, "fetching source");
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::SourceUnavailable(err.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable(format!(
                "source answered with status {}",
                status
            )));
        }
        let text = res
            .text()
            .await
            .map_err(|err| SyncError::SourceUnavailable(err.to_string()))?;
        parse_grid(&text)
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let upper = haystack.to_uppercase();
    needles
        .iter()
        .map(|n| n.trim().to_uppercase())
        .any(|n| !n.is_empty() && upper.contains(&n))
}

fn is_marker_row(row: &[String], rules: &NormalizeRules) -> bool {
    row.iter().any(|c| contains_any(c, &rules.section_markers))
}

/// Column positions resolved once per normalization pass.
#[derive(Debug)]
struct Columns {
    id: Option<usize>,
    details: usize,
    price: usize,
    location: usize,
    extra: Vec<usize>,
    media: usize,
}

fn resolve_columns(
    header: &[String],
    kept: &[usize],
    rules: &NormalizeRules,
) -> Result<Columns, SyncError> {
    let label = |i: usize| header[i].to_uppercase();

    let id = kept.iter().copied().find(|&i| label(i) == "ID");
    let candidates: Vec<usize> = kept.iter().copied().filter(|&i| Some(i) != id).collect();

    let preferred = rules.media_column.trim().to_uppercase();
    let media = candidates
        .iter()
        .copied()
        .find(|&i| label(i) == preferred)
        .or_else(|| candidates.iter().copied().find(|&i| label(i).contains("LINK")))
        .or_else(|| candidates.last().copied())
        .ok_or_else(|| SyncError::MalformedSource("header row has no usable columns".into()))?;

    let mut rest: Vec<usize> = candidates.into_iter().filter(|&i| i != media).collect();
    let mut take = |keyword: &str| -> Option<usize> {
        let pos = rest.iter().position(|&i| label(i).contains(keyword))?;
        Some(rest.remove(pos))
    };
    let mut details = take("DETAIL");
    let mut price = take("PRICE");
    let mut location = take("LOCATION");

    // Unmatched slots fall back to the leftmost remaining columns.
    for slot in [&mut details, &mut price, &mut location] {
        if slot.is_none() && !rest.is_empty() {
            *slot = Some(rest.remove(0));
        }
    }
    match (details, price, location) {
        (Some(details), Some(price), Some(location)) => Ok(Columns {
            id,
            details,
            price,
            location,
            extra: rest,
            media,
        }),
        _ => Err(SyncError::MalformedSource(format!(
            "header row needs details, price and location columns, found {:?}",
            kept.iter().map(|&i| header[i].as_str()).collect::<Vec<_>>()
        ))),
    }
}

/// Normalize a raw grid: locate the header, strip cosmetic rows and
/// placeholder columns, resolve typed columns and assign ids.
pub fn normalize(grid: &Grid, rules: &NormalizeRules) -> Result<RecordSet, SyncError> {
    let header_idx = grid
        .iter()
        .position(|row| {
            !is_marker_row(row, rules)
                && row.iter().any(|c| contains_any(c, &rules.header_keywords))
        })
        .ok_or_else(|| {
            SyncError::MalformedSource(format!(
                "no header row containing any of {:?}",
                rules.header_keywords
            ))
        })?;

    let header: Vec<String> = grid[header_idx].iter().map(|c| c.trim().to_string()).collect();
    let kept: Vec<usize> = header
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.is_empty() && !h.starts_with("Unnamed"))
        .map(|(i, _)| i)
        .collect();
    let cols = resolve_columns(&header, &kept, rules)?;

    let rows: Vec<&Vec<String>> = grid[header_idx + 1..]
        .iter()
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .filter(|row| !is_marker_row(row, rules))
        .collect();

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());
    for (n, row) in rows.iter().enumerate() {
        let cell = |i: usize| row.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
        let id = match cols.id {
            Some(i) => parse_id(&cell(i)).filter(|id| *id > 0).ok_or_else(|| {
                SyncError::MalformedSource(format!("invalid id {:?} in data row {}", cell(i), n + 1))
            })?,
            None => (n + 1) as u32,
        };
        if !seen.insert(id) {
            return Err(SyncError::MalformedSource(format!("duplicate id {}", id)));
        }
        records.push(Record {
            id,
            details: cell(cols.details),
            price: cell(cols.price),
            location: cell(cols.location),
            extra: cols.extra.iter().map(|&i| cell(i)).collect(),
            media_ref: cell(cols.media),
        });
    }

    let labels = ColumnLabels {
        details: header[cols.details].clone(),
        price: header[cols.price].clone(),
        location: header[cols.location].clone(),
        extra: cols.extra.iter().map(|&i| header[i].clone()).collect(),
        media: header[cols.media].clone(),
    };
    debug!(header_row = header_idx, records = records.len(), "grid normalized");
    Ok(RecordSet::new(labels, records))
}
