use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};
use tv_core::{AffirmativeAction, KeyStrategy};
use tv_storage::HttpFetcher;

use crate::{
    text_or_none, AdapterError, CandidateTender, DeadlineField, FetchedDocument, SourceAdapter, SourceKind,
};

/// Accepted spellings per logical column, snake_case first.
const COLUMNS: &[(&str, &[&str])] = &[
    ("title", &["title", "Title"]),
    ("description", &["description", "Description"]),
    ("procuring_entity", &["procuring_entity", "Procuring Entity"]),
    ("tender_no", &["tender_no", "Tender No"]),
    ("category", &["category", "Category"]),
    ("deadline", &["deadline", "Deadline"]),
    ("location", &["location", "Location"]),
    ("tender_url", &["tender_url", "Tender URL"]),
    ("contact_info", &["contact_info", "Contact Info"]),
    ("requirements", &["requirements", "Requirements"]),
    ("points_required", &["points_required", "Points Required"]),
    ("affirmative_action", &["affirmative_action", "Affirmative Action"]),
];

/// Imports tenders from a header-driven CSV export, read from a URL or a local file.
#[derive(Debug, Clone)]
pub struct CsvImportAdapter {
    source_id: String,
    locations: Vec<String>,
    default_location: Option<String>,
}

impl CsvImportAdapter {
    pub fn new(source_id: String, locations: Vec<String>, default_location: Option<String>) -> Self {
        Self {
            source_id,
            locations,
            default_location,
        }
    }
}

fn local_path(location: &str) -> Option<PathBuf> {
    if let Some(path) = location.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        None
    } else {
        Some(PathBuf::from(location))
    }
}

struct HeaderIndex(HashMap<&'static str, usize>);

impl HeaderIndex {
    fn new(headers: &csv::StringRecord) -> Self {
        let mut index = HashMap::new();
        for (logical, spellings) in COLUMNS {
            let position = spellings
                .iter()
                .find_map(|spelling| headers.iter().position(|h| h.trim() == *spelling));
            if let Some(position) = position {
                index.insert(*logical, position);
            }
        }
        Self(index)
    }

    fn get(&self, row: &csv::StringRecord, column: &str) -> Option<String> {
        self.0
            .get(column)
            .and_then(|i| row.get(*i))
            .and_then(|v| text_or_none(v))
    }
}

/// Negative or non-numeric values count as zero points.
fn parse_points(raw: Option<String>) -> u32 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .map(|n| u32::try_from(n).unwrap_or(if n < 0 { 0 } else { u32::MAX }))
        .unwrap_or(0)
}

#[async_trait]
impl SourceAdapter for CsvImportAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    fn key_strategy(&self) -> KeyStrategy {
        KeyStrategy::TenderNumberFirst
    }

    async fn fetch_documents(&self, http: &HttpFetcher) -> Result<Vec<FetchedDocument>, AdapterError> {
        let mut documents = Vec::with_capacity(self.locations.len());
        for location in &self.locations {
            let body = match local_path(location) {
                Some(path) => {
                    debug!(source_id = %self.source_id, path = %path.display(), "reading local export");
                    tokio::fs::read_to_string(&path).await?
                }
                None => http.fetch_bytes(&self.source_id, location).await?.text(),
            };
            documents.push(FetchedDocument {
                url: location.clone(),
                body,
            });
        }
        Ok(documents)
    }

    fn parse_document(&self, document: &FetchedDocument) -> Result<Vec<CandidateTender>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(document.body.as_bytes());
        let header = HeaderIndex::new(reader.headers()?);
        if !header.0.contains_key("title") {
            return Err(AdapterError::Message(format!(
                "{} has no title column",
                document.url
            )));
        }

        let mut out = Vec::new();
        let mut untitled = 0usize;
        for row in reader.records() {
            let row = row?;
            let Some(title) = header.get(&row, "title") else {
                untitled += 1;
                continue;
            };
            out.push(CandidateTender {
                source_id: self.source_id.clone(),
                title,
                organization: header.get(&row, "procuring_entity"),
                category: header.get(&row, "category"),
                description: header.get(&row, "description"),
                location: header
                    .get(&row, "location")
                    .or_else(|| self.default_location.clone()),
                deadline: DeadlineField::from_text(header.get(&row, "deadline")),
                tender_url: header.get(&row, "tender_url"),
                tender_no: header.get(&row, "tender_no"),
                contact_info: header.get(&row, "contact_info"),
                requirements: header.get(&row, "requirements"),
                affirmative_action: header
                    .get(&row, "affirmative_action")
                    .map(|raw| AffirmativeAction::from_text(&raw)),
                points_required: parse_points(header.get(&row, "points_required")),
            });
        }
        if untitled > 0 {
            warn!(source_id = %self.source_id, untitled, "skipped csv rows without a title");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tv_core::AffirmativeActionType;
    use tv_storage::HttpClientConfig;

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/csv/ppip_export.csv")
    }

    fn adapter(locations: Vec<String>) -> CsvImportAdapter {
        CsvImportAdapter::new("ppip-export".into(), locations, Some("Kenya".into()))
    }

    fn parse(body: &str) -> Vec<CandidateTender> {
        adapter(vec![])
            .parse_document(&FetchedDocument {
                url: "memory.csv".into(),
                body: body.into(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn reads_local_export_and_maps_columns() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = adapter(vec![fixture_path().display().to_string()]);
        let documents = adapter.fetch_documents(&http).await.unwrap();
        assert_eq!(documents.len(), 1);

        let rows = adapter.parse_document(&documents[0]).unwrap();
        assert_eq!(rows.len(), 4, "untitled row is skipped");

        let footbridge = &rows[0];
        assert_eq!(footbridge.tender_no.as_deref(), Some("NCC/RD/001/2030"));
        assert_eq!(footbridge.organization.as_deref(), Some("Nairobi City County"));
        assert_eq!(footbridge.points_required, 5);
        assert!(footbridge.deadline.value().is_some());

        let towels = rows.iter().find(|r| r.title.contains("Sanitary")).unwrap();
        assert_eq!(
            towels.affirmative_action.as_ref().map(|a| a.kind),
            Some(AffirmativeActionType::Women)
        );
        assert_eq!(towels.deadline.value().unwrap().format("%Y-%m-%d").to_string(), "2030-04-01");

        let catering = rows.iter().find(|r| r.title.contains("Catering")).unwrap();
        assert_eq!(catering.points_required, 0);
        assert!(matches!(catering.deadline, DeadlineField::NotFound { .. }));
        let action = catering.affirmative_action.as_ref().unwrap();
        assert_eq!(action.kind, AffirmativeActionType::Youth);
        assert_eq!(action.percentage, Some(30.0));
    }

    #[tokio::test]
    async fn file_scheme_locations_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        std::fs::write(&path, "title,tender_no\nRoad Works,KURA/1\n").unwrap();

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = adapter(vec![format!("file://{}", path.display())]);
        let documents = adapter.fetch_documents(&http).await.unwrap();
        let rows = adapter.parse_document(&documents[0]).unwrap();
        assert_eq!(rows[0].tender_no.as_deref(), Some("KURA/1"));
        assert_eq!(rows[0].location.as_deref(), Some("Kenya"));
    }

    #[test]
    fn snake_case_headers_are_accepted() {
        let rows = parse(
            "title,tender_no,deadline\n\
             A,T1,2030-01-01\n\
             A2,T1,2031-01-01\n",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].title, "A2");
        assert_eq!(rows[1].tender_no.as_deref(), Some("T1"));
    }

    #[test]
    fn export_without_title_column_is_rejected() {
        let err = adapter(vec![])
            .parse_document(&FetchedDocument {
                url: "broken.csv".into(),
                body: "name,deadline\nX,2030-01-01\n".into(),
            })
            .unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn points_parsing_is_lenient() {
        assert_eq!(parse_points(Some("12".into())), 12);
        assert_eq!(parse_points(Some("-4".into())), 0);
        assert_eq!(parse_points(Some("many".into())), 0);
        assert_eq!(parse_points(None), 0);
    }

    #[test]
    fn locations_resolve_to_disk_or_http() {
        assert_eq!(local_path("file:///tmp/a.csv"), Some(PathBuf::from("/tmp/a.csv")));
        assert_eq!(local_path("exports/a.csv"), Some(PathBuf::from("exports/a.csv")));
        assert_eq!(local_path("https://ppip.go.ke/export.csv"), None);
    }
}
