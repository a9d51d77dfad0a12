//! Manifest parsing and attachment routing
//!
//! A manifest is a `~`-delimited text file with a header row. Columns are
//! bound to [`ManifestRow`] fields through the [`MANIFEST_COLUMNS`] table;
//! unknown columns are ignored and only the routing-key and attachment-list
//! columns are required.
//!
//! Every manifest found directly inside an extraction root contributes to a
//! single [`RoutingMap`] for that archive. A manifest that fails to parse is
//! skipped as a whole and reported in [`ParsedManifests::failures`].

use chrono::{NaiveDate, NaiveDateTime};
use posync_common::{Result, SyncError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const MANIFEST_DELIMITER: u8 = b'~';

pub const ROUTING_KEY_COLUMN: &str = "PO Number";
pub const ATTACHMENT_COLUMN: &str = "Attachment List";

/// Target field of one manifest column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestField {
    Id,
    ClaimNumber,
    ClaimDate,
    OpenAmount,
    OriginalAmount,
    Status,
    CustomerName,
    ArReasonCode,
    CustomerReasonCode,
    AttachmentList,
    CheckNumber,
    CheckDate,
    Comments,
    DaysOutstanding,
    Division,
    PoNumber,
    Brand,
    MergeStatus,
    UnresolvedAmount,
    DocumentType,
    DocumentDate,
    OriginalCustomer,
    Location,
    CustomerLocation,
    CreateDate,
    LoadId,
    CarrierName,
    InvoiceStoreNumber,
}

/// Header name to field binding
pub const MANIFEST_COLUMNS: &[(&str, ManifestField)] = &[
    ("Id", ManifestField::Id),
    ("Claim Number", ManifestField::ClaimNumber),
    ("Claim Date", ManifestField::ClaimDate),
    ("Open Amount", ManifestField::OpenAmount),
    ("Original Amount", ManifestField::OriginalAmount),
    ("Status", ManifestField::Status),
    ("Customer Name", ManifestField::CustomerName),
    ("AR Reason Code", ManifestField::ArReasonCode),
    ("Customer Reason Code", ManifestField::CustomerReasonCode),
    (ATTACHMENT_COLUMN, ManifestField::AttachmentList),
    ("Check Number", ManifestField::CheckNumber),
    ("Check Date", ManifestField::CheckDate),
    ("Comments", ManifestField::Comments),
    ("Days Outstanding", ManifestField::DaysOutstanding),
    ("Division", ManifestField::Division),
    (ROUTING_KEY_COLUMN, ManifestField::PoNumber),
    ("Brand", ManifestField::Brand),
    ("Merge Status", ManifestField::MergeStatus),
    ("Unresolved Amount", ManifestField::UnresolvedAmount),
    ("Document Type", ManifestField::DocumentType),
    ("Document Date", ManifestField::DocumentDate),
    ("Original Customer", ManifestField::OriginalCustomer),
    ("Location", ManifestField::Location),
    ("Customer Location", ManifestField::CustomerLocation),
    ("Create Date", ManifestField::CreateDate),
    ("Load Id", ManifestField::LoadId),
    ("Carrier Name", ManifestField::CarrierName),
    ("Invoice Store Number", ManifestField::InvoiceStoreNumber),
];

const REQUIRED_FIELDS: &[ManifestField] = &[ManifestField::PoNumber, ManifestField::AttachmentList];

fn field_for_header(header: &str) -> Option<ManifestField> {
    let header = header.trim_start_matches('\u{feff}').trim();
    MANIFEST_COLUMNS
        .iter()
        .find(|(name, _)| *name == header)
        .map(|(_, field)| *field)
}

fn column_name(field: ManifestField) -> &'static str {
    MANIFEST_COLUMNS
        .iter()
        .find(|(_, f)| *f == field)
        .map(|(name, _)| *name)
        .unwrap_or("?")
}

/// One parsed manifest line
///
/// Only `po_number` and `attachment_list` drive routing; the rest is carried
/// for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestRow {
    pub id: Option<i64>,
    pub claim_number: Option<i64>,
    pub claim_date: Option<NaiveDateTime>,
    pub open_amount: Option<f64>,
    pub original_amount: Option<f64>,
    pub status: Option<String>,
    pub customer_name: Option<String>,
    pub ar_reason_code: Option<String>,
    pub customer_reason_code: Option<String>,
    pub attachment_list: String,
    pub check_number: Option<String>,
    pub check_date: Option<NaiveDateTime>,
    pub comments: Option<String>,
    pub days_outstanding: Option<i64>,
    pub division: Option<i64>,
    pub po_number: String,
    pub brand: Option<String>,
    pub merge_status: Option<String>,
    pub unresolved_amount: Option<f64>,
    pub document_type: Option<String>,
    pub document_date: Option<NaiveDateTime>,
    pub original_customer: Option<String>,
    pub location: Option<String>,
    pub customer_location: Option<String>,
    pub create_date: Option<NaiveDateTime>,
    pub load_id: Option<String>,
    pub carrier_name: Option<String>,
    pub invoice_store_number: Option<String>,
}

impl ManifestRow {
    fn assign(&mut self, field: ManifestField, raw: &str) -> std::result::Result<(), String> {
        use ManifestField::*;

        match field {
            AttachmentList => self.attachment_list = raw.to_string(),
            PoNumber => self.po_number = raw.to_string(),
            Id => self.id = parse_int(raw)?,
            ClaimNumber => self.claim_number = parse_int(raw)?,
            DaysOutstanding => self.days_outstanding = parse_int(raw)?,
            Division => self.division = parse_int(raw)?,
            OpenAmount => self.open_amount = parse_amount(raw)?,
            OriginalAmount => self.original_amount = parse_amount(raw)?,
            UnresolvedAmount => self.unresolved_amount = parse_amount(raw)?,
            ClaimDate => self.claim_date = parse_date(raw)?,
            CheckDate => self.check_date = parse_date(raw)?,
            DocumentDate => self.document_date = parse_date(raw)?,
            CreateDate => self.create_date = parse_date(raw)?,
            Status => self.status = text(raw),
            CustomerName => self.customer_name = text(raw),
            ArReasonCode => self.ar_reason_code = text(raw),
            CustomerReasonCode => self.customer_reason_code = text(raw),
            CheckNumber => self.check_number = text(raw),
            Comments => self.comments = text(raw),
            Brand => self.brand = text(raw),
            MergeStatus => self.merge_status = text(raw),
            DocumentType => self.document_type = text(raw),
            OriginalCustomer => self.original_customer = text(raw),
            Location => self.location = text(raw),
            CustomerLocation => self.customer_location = text(raw),
            LoadId => self.load_id = text(raw),
            CarrierName => self.carrier_name = text(raw),
            InvoiceStoreNumber => self.invoice_store_number = text(raw),
        }
        Ok(())
    }

    /// Routing key with surrounding whitespace removed; may be empty
    pub fn routing_key(&self) -> &str {
        self.po_number.trim()
    }

    /// Attachment file names in list order: comma-split, trimmed, reduced to
    /// the final path segment, blanks dropped
    pub fn attachments(&self) -> Vec<String> {
        self.attachment_list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| entry.rsplit(|c: char| c == '/' || c == '\\').next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_int(raw: &str) -> std::result::Result<Option<i64>, String> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return Ok(None);
    }
    cleaned
        .parse()
        .map(Some)
        .map_err(|_| format!("invalid integer '{}'", raw.trim()))
}

fn parse_amount(raw: &str) -> std::result::Result<Option<f64>, String> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return Ok(None);
    }
    cleaned
        .parse()
        .map(Some)
        .map_err(|_| format!("invalid amount '{}'", raw.trim()))
}

fn parse_date(raw: &str) -> std::result::Result<Option<NaiveDateTime>, String> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M",
    ];
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }

    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Some(parsed));
        }
    }
    for format in DATE_FORMATS {
        if let Some(parsed) = NaiveDate::parse_from_str(value, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
        {
            return Ok(Some(parsed));
        }
    }

    Err(format!("invalid date '{value}'"))
}

/// File-name suffix test with optional ASCII case folding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixMatcher {
    suffix: String,
    case_insensitive: bool,
}

impl SuffixMatcher {
    pub fn new(suffix: impl Into<String>, case_insensitive: bool) -> Self {
        let suffix = suffix.into();
        Self {
            suffix: if case_insensitive {
                suffix.to_ascii_lowercase()
            } else {
                suffix
            },
            case_insensitive,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.case_insensitive {
            name.to_ascii_lowercase().ends_with(&self.suffix)
        } else {
            name.ends_with(&self.suffix)
        }
    }
}

/// Routing key to attachment names, per archive
///
/// Lists keep manifest order and duplicates; rows sharing a key append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl RoutingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, routing_key: &str, files: impl IntoIterator<Item = String>) {
        self.entries
            .entry(routing_key.to_string())
            .or_default()
            .extend(files);
    }

    pub fn get(&self, routing_key: &str) -> Option<&[String]> {
        self.entries.get(routing_key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, files)| (key.as_str(), files.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn attachment_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Result of parsing every manifest in one extraction root
#[derive(Debug, Default)]
pub struct ParsedManifests {
    pub routing: RoutingMap,
    pub files_parsed: usize,
    pub failures: Vec<SyncError>,
}

impl ParsedManifests {
    /// Folder-level problems worth recording on the archive checkpoint
    pub fn diagnostic(&self) -> Option<String> {
        if !self.failures.is_empty() {
            let reasons: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
            Some(reasons.join("; "))
        } else if self.files_parsed == 0 {
            Some("no manifest found".to_string())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestParser {
    manifest_suffix: SuffixMatcher,
    document_suffix: SuffixMatcher,
}

impl ManifestParser {
    pub fn new(manifest_suffix: SuffixMatcher, document_suffix: SuffixMatcher) -> Self {
        Self {
            manifest_suffix,
            document_suffix,
        }
    }

    /// Parse every manifest directly inside `folder` into one routing map
    pub async fn parse_folder(&self, folder: &Path) -> Result<ParsedManifests> {
        let manifests = self.find_manifests(folder).await?;
        let mut parsed = ParsedManifests::default();

        if manifests.is_empty() {
            warn!(folder = %folder.display(), "No manifest found in extracted folder");
            return Ok(parsed);
        }

        for path in manifests {
            let file_name = display_name(&path);
            info!(manifest = %file_name, "Parsing manifest and routing attachments");

            let task_path = path.clone();
            let rows = tokio::task::spawn_blocking(move || parse_manifest_file(&task_path))
                .await
                .map_err(|e| SyncError::parse(&file_name, format!("parse task failed: {e}")))
                .and_then(|result| result);

            match rows {
                Ok(rows) => {
                    self.route_rows(&file_name, &rows, &mut parsed.routing);
                    parsed.files_parsed += 1;
                    debug!(manifest = %file_name, rows = rows.len(), "Manifest parsed");
                }
                Err(e) => {
                    error!(manifest = %file_name, error = %e, "Failed to parse manifest");
                    parsed.failures.push(e);
                }
            }
        }

        info!(
            folder = %folder.display(),
            manifests = parsed.files_parsed,
            failures = parsed.failures.len(),
            routing_keys = parsed.routing.len(),
            attachments = parsed.routing.attachment_count(),
            "Manifest parsing complete"
        );

        Ok(parsed)
    }

    /// Append the recognized attachments of each row to `routing`
    pub fn route_rows(&self, file_name: &str, rows: &[ManifestRow], routing: &mut RoutingMap) {
        for row in rows {
            let key = row.routing_key();
            if key.is_empty() {
                warn!(
                    manifest = %file_name,
                    row = %serde_json::to_string(row).unwrap_or_default(),
                    "PO Number does not exist for manifest row"
                );
            }

            let documents: Vec<String> = row
                .attachments()
                .into_iter()
                .filter(|name| self.document_suffix.matches(name))
                .collect();

            if !documents.is_empty() {
                routing.append(key, documents);
            }
        }
    }

    async fn find_manifests(&self, folder: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(folder).await?;

        while let Some(entry) = dir.next_entry().await? {
            let is_file = entry.file_type().await?.is_file();
            if is_file && self.manifest_suffix.matches(&entry.file_name().to_string_lossy()) {
                found.push(entry.path());
            }
        }

        found.sort();
        Ok(found)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Parse one manifest file into rows
///
/// Fails when a required column is absent, a row has the wrong number of
/// fields, or a typed column holds an unparseable value.
pub fn parse_manifest_file(path: &Path) -> Result<Vec<ManifestRow>> {
    let file_name = display_name(path);
    let reader = csv::ReaderBuilder::new()
        .delimiter(MANIFEST_DELIMITER)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| SyncError::parse(&file_name, e))?;

    parse_manifest(&file_name, reader)
}

/// Parse manifest text already held in memory
pub fn parse_manifest_str(file_name: &str, content: &str) -> Result<Vec<ManifestRow>> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(MANIFEST_DELIMITER)
        .has_headers(true)
        .from_reader(content.as_bytes());

    parse_manifest(file_name, reader)
}

fn parse_manifest<R: std::io::Read>(
    file_name: &str,
    mut reader: csv::Reader<R>,
) -> Result<Vec<ManifestRow>> {
    let headers = reader
        .headers()
        .map_err(|e| SyncError::parse(file_name, e))?
        .clone();

    let bindings: Vec<(usize, ManifestField)> = headers
        .iter()
        .enumerate()
        .filter_map(|(idx, header)| field_for_header(header).map(|field| (idx, field)))
        .collect();

    for required in REQUIRED_FIELDS {
        if !bindings.iter().any(|(_, field)| field == required) {
            return Err(SyncError::parse(
                file_name,
                format!("missing required column '{}'", column_name(*required)),
            ));
        }
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| SyncError::parse(file_name, e))?;
        let mut row = ManifestRow::default();

        for (idx, field) in &bindings {
            let raw = record.get(*idx).unwrap_or_default();
            row.assign(*field, raw).map_err(|message| {
                SyncError::parse(
                    file_name,
                    format!("row {}, column '{}': {message}", line + 2, column_name(*field)),
                )
            })?;
        }

        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEADER: &str = "Id~Claim Number~Claim Date~Open Amount~PO Number~Attachment List~Comments";

    fn pdf_parser() -> ManifestParser {
        ManifestParser::new(
            SuffixMatcher::new(".csv", false),
            SuffixMatcher::new(".pdf", false),
        )
    }

    #[test]
    fn test_attachments_strip_paths_and_blanks() {
        let row = ManifestRow {
            attachment_list: "sub/a.pdf, b.txt , c.PDF".to_string(),
            ..Default::default()
        };
        assert_eq!(row.attachments(), vec!["a.pdf", "b.txt", "c.PDF"]);

        let row = ManifestRow {
            attachment_list: r"C:\scans\x.pdf,, ,dir/,y.pdf".to_string(),
            ..Default::default()
        };
        assert_eq!(row.attachments(), vec!["x.pdf", "y.pdf"]);
    }

    #[test]
    fn test_case_sensitive_routing() {
        let row = ManifestRow {
            po_number: "PO-1".to_string(),
            attachment_list: "sub/a.pdf, b.txt , c.PDF".to_string(),
            ..Default::default()
        };

        let mut routing = RoutingMap::new();
        pdf_parser().route_rows("m.csv", &[row], &mut routing);

        assert_eq!(routing.get("PO-1"), Some(&["a.pdf".to_string()][..]));
    }

    #[test]
    fn test_case_insensitive_routing() {
        let parser = ManifestParser::new(
            SuffixMatcher::new(".csv", true),
            SuffixMatcher::new(".PDF", true),
        );
        let row = ManifestRow {
            po_number: "PO-1".to_string(),
            attachment_list: "a.pdf,c.PDF".to_string(),
            ..Default::default()
        };

        let mut routing = RoutingMap::new();
        parser.route_rows("m.csv", &[row], &mut routing);
        assert_eq!(routing.attachment_count(), 2);
    }

    #[test]
    fn test_blank_routing_key_is_routed_under_empty_key() {
        let row = ManifestRow {
            po_number: "   ".to_string(),
            attachment_list: "inv.pdf".to_string(),
            ..Default::default()
        };

        let mut routing = RoutingMap::new();
        pdf_parser().route_rows("m.csv", &[row], &mut routing);

        assert_eq!(routing.get(""), Some(&["inv.pdf".to_string()][..]));
    }

    #[test]
    fn test_rows_sharing_a_key_append_in_order() {
        let rows = vec![
            ManifestRow {
                po_number: "PO-9".into(),
                attachment_list: "b.pdf,a.pdf".into(),
                ..Default::default()
            },
            ManifestRow {
                po_number: "PO-9".into(),
                attachment_list: "b.pdf".into(),
                ..Default::default()
            },
            ManifestRow {
                po_number: "PO-10".into(),
                attachment_list: "notes.txt".into(),
                ..Default::default()
            },
        ];

        let mut routing = RoutingMap::new();
        pdf_parser().route_rows("m.csv", &rows, &mut routing);

        assert_eq!(routing.len(), 1);
        assert_eq!(
            routing.get("PO-9").unwrap(),
            &["b.pdf".to_string(), "a.pdf".to_string(), "b.pdf".to_string()]
        );
    }

    #[test]
    fn test_parse_manifest_binds_typed_columns() {
        let content = format!(
            "{HEADER}~Unknown Column\n\
             17~1,204~2024-03-05~1,250.75~PO-123~scans/inv.pdf~first~x\n\
             ~~~~~~~\n"
        );

        let rows = parse_manifest_str("m.csv", &content).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.id, Some(17));
        assert_eq!(first.claim_number, Some(1204));
        assert_eq!(first.open_amount, Some(1250.75));
        assert_eq!(
            first.claim_date.map(|d| d.date()),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(first.routing_key(), "PO-123");
        assert_eq!(first.comments.as_deref(), Some("first"));

        let blank = &rows[1];
        assert_eq!(blank.id, None);
        assert_eq!(blank.routing_key(), "");
        assert!(blank.attachments().is_empty());
    }

    #[test]
    fn test_parse_manifest_rejects_missing_required_column() {
        let err = parse_manifest_str("m.csv", "Id~PO Number\n1~PO-1\n").unwrap_err();
        assert!(err.to_string().contains("Attachment List"));
    }

    #[test]
    fn test_parse_manifest_rejects_bad_typed_value() {
        let content = format!("{HEADER}\nnot-a-number~~~~PO-1~a.pdf~\n");
        let err = parse_manifest_str("m.csv", &content).unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("03/05/2024").unwrap().is_some());
        assert!(parse_date("2024-03-05 10:11:12").unwrap().is_some());
        assert!(parse_date("").unwrap().is_none());
        assert!(parse_date("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_parse_folder_skips_broken_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.csv"),
            format!("{HEADER}\n1~~~~PO-1~one.pdf,two.pdf~\n"),
        )
        .unwrap();
        std::fs::write(dir.path().join("b.csv"), "Id~Comments\n1~x\n").unwrap();
        std::fs::write(dir.path().join("one.pdf"), b"%PDF").unwrap();

        let parsed = pdf_parser().parse_folder(dir.path()).await.unwrap();

        assert_eq!(parsed.files_parsed, 1);
        assert_eq!(parsed.failures.len(), 1);
        assert_eq!(parsed.routing.attachment_count(), 2);
        assert!(parsed.diagnostic().unwrap().contains("b.csv"));
    }

    #[tokio::test]
    async fn test_parse_folder_without_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.pdf"), b"%PDF").unwrap();

        let parsed = pdf_parser().parse_folder(dir.path()).await.unwrap();

        assert!(parsed.routing.is_empty());
        assert_eq!(parsed.diagnostic().as_deref(), Some("no manifest found"));
    }
}
