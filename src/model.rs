use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::SyncError;
use crate::promote::PromotionSummary;
use crate::stage::StagingSummary;

/// One auction listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub id: u32,
    pub details: String,
    pub price: String,
    pub location: String,
    /// Source columns beyond the three named ones, in source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
    #[serde(rename = "drive_link")]
    pub media_ref: String,
}

/// Header labels as they appeared in the source. Position is what matters;
/// the text is carried through so the published file reads like the sheet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnLabels {
    pub details: String,
    pub price: String,
    pub location: String,
    #[serde(default)]
    pub extra: Vec<String>,
    pub media: String,
}

impl Default for ColumnLabels {
    fn default() -> Self {
        Self {
            details: "VEHICLE DETAILS".into(),
            price: "PRICE".into(),
            location: "LOCATION".into(),
            extra: Vec::new(),
            media: "DRIVE LINK".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSet {
    pub labels: ColumnLabels,
    pub records: Vec<Record>,
}

/// Leading and trailing columns of every persisted record file.
const FIXED_COLUMNS: usize = 5;

/// Parse an id cell. Integral floats ("3.0") are accepted.
pub fn parse_id(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(id) = raw.parse::<u32>() {
        return Some(id);
    }
    let f = raw.parse::<f64>().ok()?;
    if f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

impl RecordSet {
    pub fn new(labels: ColumnLabels, records: Vec<Record>) -> Self {
        Self { labels, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn header(&self) -> Vec<&str> {
        let mut header = vec![
            "ID",
            self.labels.details.as_str(),
            self.labels.price.as_str(),
            self.labels.location.as_str(),
        ];
        header.extend(self.labels.extra.iter().map(String::as_str));
        header.push(self.labels.media.as_str());
        header
    }

    /// Encode as `ID,<details>,<price>,<location>,...,<media>` with `\n` line endings.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut wtr = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        wtr.write_record(self.header())?;
        let width = self.labels.extra.len();
        for r in &self.records {
            let mut row = vec![
                r.id.to_string(),
                r.details.clone(),
                r.price.clone(),
                r.location.clone(),
            ];
            let mut extra = r.extra.clone();
            extra.resize(width, String::new());
            row.extend(extra);
            row.push(r.media_ref.clone());
            wtr.write_record(&row)?;
        }
        wtr.into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }

    /// Decode a persisted record file. Empty content means "no record set yet".
    pub fn from_csv(bytes: &[u8]) -> Result<Option<RecordSet>, SyncError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let header: Vec<String> = rdr
            .headers()
            .map_err(|err| SyncError::MalformedSource(format!("record file header: {}", err)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if header.len() < FIXED_COLUMNS {
            return Err(SyncError::MalformedSource(format!(
                "record file has {} columns, expected at least {}",
                header.len(),
                FIXED_COLUMNS
            )));
        }
        let last = header.len() - 1;
        let labels = ColumnLabels {
            details: header[1].clone(),
            price: header[2].clone(),
            location: header[3].clone(),
            extra: header[4..last].to_vec(),
            media: header[last].clone(),
        };

        let mut records = Vec::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row.map_err(|err| {
                SyncError::MalformedSource(format!("record file row {}: {}", line + 2, err))
            })?;
            let cell = |i: usize| row.get(i).unwrap_or("").trim().to_string();
            if (0..header.len()).all(|i| cell(i).is_empty()) {
                continue;
            }
            let id = parse_id(&cell(0)).ok_or_else(|| {
                SyncError::MalformedSource(format!(
                    "record file row {}: invalid id {:?}",
                    line + 2,
                    cell(0)
                ))
            })?;
            records.push(Record {
                id,
                details: cell(1),
                price: cell(2),
                location: cell(3),
                extra: (4..last).map(cell).collect(),
                media_ref: cell(last),
            });
        }
        Ok(Some(RecordSet { labels, records }))
    }
}

/// Where a sync cycle currently is.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    #[default]
    Idle,
    FolderVerify,
    Fetch,
    CompareDecision,
    Stage,
    Promote,
    CacheRefresh,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Idle => "idle",
            SyncStep::FolderVerify => "folder_verify",
            SyncStep::Fetch => "fetch",
            SyncStep::CompareDecision => "compare_decision",
            SyncStep::Stage => "stage",
            SyncStep::Promote => "promote",
            SyncStep::CacheRefresh => "cache_refresh",
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub changes: bool,
    pub records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging: Option<StagingSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusError {
    pub step: SyncStep,
    pub kind: String,
    pub message: String,
}

/// Serving-layer view of the sync engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub running: bool,
    pub current_step: SyncStep,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<SyncReport>,
    pub error: Option<StatusError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, details: &str, link: &str) -> Record {
        Record {
            id,
            details: details.into(),
            price: "10000".into(),
            location: "Dubai".into(),
            extra: vec![],
            media_ref: link.into(),
        }
    }

    #[test]
    fn csv_layout_is_id_first_media_last() {
        let set = RecordSet::new(
            ColumnLabels::default(),
            vec![record(1, "Sedan, white", "L1"), record(2, "SUV", "L2")],
        );
        let text = String::from_utf8(set.to_csv().unwrap()).unwrap();
        assert_eq!(
            text,
            "ID,VEHICLE DETAILS,PRICE,LOCATION,DRIVE LINK\n\
             1,\"Sedan, white\",10000,Dubai,L1\n\
             2,SUV,10000,Dubai,L2\n"
        );
        let back = RecordSet::from_csv(text.as_bytes()).unwrap().unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn extra_columns_sit_before_media() {
        let mut labels = ColumnLabels::default();
        labels.extra = vec!["YEAR".into()];
        let mut r = record(1, "Sedan", "L1");
        r.extra = vec!["2019".into()];
        let set = RecordSet::new(labels, vec![r]);
        let text = String::from_utf8(set.to_csv().unwrap()).unwrap();
        assert!(text.starts_with("ID,VEHICLE DETAILS,PRICE,LOCATION,YEAR,DRIVE LINK\n"));
        let back = RecordSet::from_csv(text.as_bytes()).unwrap().unwrap();
        assert_eq!(back.records[0].extra, vec!["2019".to_string()]);
        assert_eq!(back.records[0].media_ref, "L1");
    }

    #[test]
    fn empty_file_is_no_record_set() {
        assert!(RecordSet::from_csv(b"").unwrap().is_none());
        assert!(RecordSet::from_csv(b" \n").unwrap().is_none());
    }

    #[test]
    fn float_ids_and_blank_rows() {
        let text = "ID,D,P,L,DRIVE LINK\r\n3.0,a,b,c,d\r\n,,,,\r\n";
        let set = RecordSet::from_csv(text.as_bytes()).unwrap().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.records[0].id, 3);
    }

    #[test]
    fn rejects_narrow_or_bad_ids() {
        assert!(matches!(
            RecordSet::from_csv(b"ID,D\n1,a\n"),
            Err(SyncError::MalformedSource(_))
        ));
        assert!(matches!(
            RecordSet::from_csv(b"ID,D,P,L,M\nx,a,b,c,d\n"),
            Err(SyncError::MalformedSource(_))
        ));
    }

    #[test]
    fn record_json_uses_drive_link_key() {
        let v = serde_json::to_value(record(1, "Sedan", "L1")).unwrap();
        assert_eq!(v["drive_link"], "L1");
        assert!(v.get("extra").is_none());
    }

    #[test]
    fn step_names() {
        assert_eq!(SyncStep::CompareDecision.to_string(), "compare_decision");
        assert_eq!(
            serde_json::to_value(SyncStep::FolderVerify).unwrap(),
            "folder_verify"
        );
    }
}
