//! Core domain model for Tenders Ville: tenders, natural keys, run logs and derived status.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tv-core";

/// Source tag carried by synthetic/demo rows; never shown in production listings.
pub const SAMPLE_SOURCE: &str = "sample";

/// Deadlines closer than this are reported as closing soon.
pub const CLOSING_SOON_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffirmativeActionType {
    Youth,
    Women,
    Pwds,
    #[default]
    None,
}

impl AffirmativeActionType {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "youth" => Self::Youth,
            "women" => Self::Women,
            "pwds" | "pwd" | "disabled" | "persons with disabilities" => Self::Pwds,
            _ => Self::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youth => "youth",
            Self::Women => "women",
            Self::Pwds => "pwds",
            Self::None => "none",
        }
    }
}

/// Reservation of a tender for a designated group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AffirmativeAction {
    #[serde(rename = "type", default)]
    pub kind: AffirmativeActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AffirmativeAction {
    pub fn of(kind: AffirmativeActionType) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Lenient decoding of the stored JSON column.
    ///
    /// Accepts an object, a JSON-encoded string holding an object, or a bare type name.
    /// Anything else decodes to type `none`.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Object(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
            JsonValue::String(text) => Self::from_text(text),
            _ => Self::default(),
        }
    }

    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).unwrap_or_default();
        }
        Self::of(AffirmativeActionType::parse(trimmed))
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// A procurement opportunity as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: Uuid,
    pub natural_key: String,
    pub tender_no: Option<String>,
    pub title: String,
    pub procuring_entity: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub source: String,
    pub contact_info: Option<String>,
    pub tender_url: Option<String>,
    pub requirements: Option<String>,
    pub affirmative_action: AffirmativeAction,
    pub points_required: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload produced by the pipeline. Identity and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTender {
    pub natural_key: String,
    pub tender_no: Option<String>,
    pub title: String,
    pub procuring_entity: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub source: String,
    pub contact_info: Option<String>,
    pub tender_url: Option<String>,
    pub requirements: Option<String>,
    pub affirmative_action: AffirmativeAction,
    pub points_required: u32,
}

impl NewTender {
    pub fn id(&self) -> Uuid {
        tender_id_for_key(&self.natural_key)
    }

    pub fn into_record(self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> TenderRecord {
        TenderRecord {
            id: self.id(),
            natural_key: self.natural_key,
            tender_no: self.tender_no,
            title: self.title,
            procuring_entity: self.procuring_entity,
            description: self.description,
            category: self.category,
            location: self.location,
            deadline: self.deadline,
            source: self.source,
            contact_info: self.contact_info,
            tender_url: self.tender_url,
            requirements: self.requirements,
            affirmative_action: self.affirmative_action,
            points_required: self.points_required,
            created_at,
            updated_at,
        }
    }
}

/// Stable row identity derived from the natural key, so every writer agrees on it.
pub fn tender_id_for_key(natural_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("tenders-ville:{natural_key}").as_bytes())
}

/// Which identifying field wins when deriving a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// URL, then title+deadline, then tender number.
    UrlFirst,
    /// Tender number, then URL, then title+deadline.
    TenderNumberFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Url(String),
    TitleDeadline { title: String, deadline: String },
    TenderNo(String),
}

impl NaturalKey {
    pub fn derive(
        strategy: KeyStrategy,
        url: Option<&str>,
        title: &str,
        deadline: Option<DateTime<Utc>>,
        tender_no: Option<&str>,
    ) -> Option<Self> {
        let by_url = || non_empty(url).map(|u| Self::Url(normalize_url(u)));
        let by_title = || {
            let title = normalize_fragment(title);
            match (title.is_empty(), deadline) {
                (false, Some(deadline)) => Some(Self::TitleDeadline {
                    title,
                    deadline: deadline.format("%Y-%m-%d").to_string(),
                }),
                _ => None,
            }
        };
        let by_number = || non_empty(tender_no).map(|n| Self::TenderNo(n.to_ascii_lowercase()));

        match strategy {
            KeyStrategy::UrlFirst => by_url().or_else(by_title).or_else(by_number),
            KeyStrategy::TenderNumberFirst => by_number().or_else(by_url).or_else(by_title),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "url:{url}"),
            Self::TitleDeadline { title, deadline } => write!(f, "title:{title}@{deadline}"),
            Self::TenderNo(no) => write!(f, "tender:{no}"),
        }
    }
}

/// Lowercases scheme and host only; paths and queries are case-sensitive.
fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(parsed) => parsed.as_str().trim_end_matches('/').to_string(),
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn normalize_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "started" => Some(Self::Started),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    #[default]
    Manual,
    Fallback,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Fallback => "fallback",
        }
    }

    pub fn parse(input: &str) -> Self {
        match input {
            "scheduled" => Self::Scheduled,
            "fallback" => Self::Fallback,
            _ => Self::Manual,
        }
    }
}

/// Append-only outcome record of one ingestion phase for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunLog {
    pub id: i64,
    pub source: String,
    pub status: RunStatus,
    pub records_found: u32,
    pub records_inserted: u32,
    pub error_message: Option<String>,
    pub trigger: TriggerKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunLog {
    pub source: String,
    pub status: RunStatus,
    pub records_found: u32,
    pub records_inserted: u32,
    pub error_message: Option<String>,
    pub trigger: TriggerKind,
}

impl NewRunLog {
    pub fn started(source: &str, trigger: TriggerKind) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Started,
            records_found: 0,
            records_inserted: 0,
            error_message: None,
            trigger,
        }
    }

    pub fn success(source: &str, trigger: TriggerKind, found: u32, inserted: u32) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Success,
            records_found: found,
            records_inserted: inserted,
            error_message: None,
            trigger,
        }
    }

    pub fn error(source: &str, trigger: TriggerKind, found: u32, message: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Error,
            records_found: found,
            records_inserted: 0,
            error_message: Some(message.into()),
            trigger,
        }
    }
}

/// Display status computed from the deadline at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderStatus {
    Open,
    ClosingSoon,
    Closed,
    NoDeadline,
}

pub fn derive_status(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> TenderStatus {
    match deadline {
        None => TenderStatus::NoDeadline,
        Some(deadline) if deadline < now => TenderStatus::Closed,
        Some(deadline) if deadline - now <= Duration::days(CLOSING_SOON_DAYS) => {
            TenderStatus::ClosingSoon
        }
        Some(_) => TenderStatus::Open,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderView {
    #[serde(flatten)]
    pub record: TenderRecord,
    pub status: TenderStatus,
}

impl TenderView {
    pub fn at(record: TenderRecord, now: DateTime<Utc>) -> Self {
        let status = derive_status(record.deadline, now);
        Self { record, status }
    }

    pub fn refreshed(mut self, now: DateTime<Utc>) -> Self {
        self.status = derive_status(self.record.deadline, now);
        self
    }
}

/// Browse filters applied over an already-fetched listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenderFilter {
    pub category: Option<String>,
    pub location: Option<String>,
    pub search: Option<String>,
    pub affirmative: Option<AffirmativeActionType>,
}

impl TenderFilter {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.location.is_none()
            && self.search.is_none()
            && self.affirmative.is_none()
    }

    pub fn matches(&self, view: &TenderView) -> bool {
        let record = &view.record;
        if let Some(category) = &self.category {
            if !eq_ci(record.category.as_deref(), category) {
                return false;
            }
        }
        if let Some(location) = &self.location {
            if !contains_ci(record.location.as_deref(), location) {
                return false;
            }
        }
        if let Some(kind) = self.affirmative {
            if record.affirmative_action.kind != kind {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let hit = contains_ci(Some(&record.title), search)
                || contains_ci(record.description.as_deref(), search)
                || contains_ci(record.category.as_deref(), search);
            if !hit {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, views: Vec<TenderView>) -> Vec<TenderView> {
        if self.is_empty() {
            return views;
        }
        views.into_iter().filter(|v| self.matches(v)).collect()
    }
}

fn eq_ci(value: Option<&str>, needle: &str) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case(needle.trim()))
}

fn contains_ci(value: Option<&str>, needle: &str) -> bool {
    value.is_some_and(|v| {
        v.to_ascii_lowercase()
            .contains(&needle.trim().to_ascii_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    fn record(title: &str, deadline: Option<DateTime<Utc>>) -> TenderRecord {
        NewTender {
            natural_key: format!("title:{title}"),
            tender_no: None,
            title: title.to_string(),
            procuring_entity: Some("Kenya Power".into()),
            description: Some("Supply of office furniture".into()),
            category: Some("Supplies".into()),
            location: Some("Nairobi".into()),
            deadline,
            source: "tenders-go-ke".into(),
            contact_info: None,
            tender_url: None,
            requirements: None,
            affirmative_action: AffirmativeAction::of(AffirmativeActionType::Youth),
            points_required: 0,
        }
        .into_record(at(2026, 1, 1), at(2026, 1, 1))
    }

    #[test]
    fn affirmative_action_defaults_to_none() {
        assert_eq!(AffirmativeAction::from_json(&JsonValue::Null).kind, AffirmativeActionType::None);
        assert_eq!(
            AffirmativeAction::from_json(&serde_json::json!({"percentage": 30})).kind,
            AffirmativeActionType::None
        );
        assert_eq!(AffirmativeAction::from_text("not json").kind, AffirmativeActionType::None);
    }

    #[test]
    fn affirmative_action_accepts_object_string_and_name() {
        let obj = AffirmativeAction::from_json(&serde_json::json!({"type": "women", "percentage": 30.0}));
        assert_eq!(obj.kind, AffirmativeActionType::Women);
        assert_eq!(obj.percentage, Some(30.0));

        let encoded = AffirmativeAction::from_json(&JsonValue::String(r#"{"type":"pwds","details":"AGPO"}"#.into()));
        assert_eq!(encoded.kind, AffirmativeActionType::Pwds);
        assert_eq!(encoded.details.as_deref(), Some("AGPO"));

        assert_eq!(AffirmativeAction::from_text("Youth").kind, AffirmativeActionType::Youth);
    }

    #[test]
    fn natural_key_precedence_follows_strategy() {
        let deadline = Some(at(2030, 1, 1));
        let url_first = NaturalKey::derive(
            KeyStrategy::UrlFirst,
            Some("HTTPS://Tenders.GO.ke/T/1/"),
            "Road Works",
            deadline,
            Some("T1"),
        )
        .unwrap();
        assert_eq!(url_first.to_string(), "url:https://tenders.go.ke/T/1");

        let no_url = NaturalKey::derive(KeyStrategy::UrlFirst, None, "Road  Works!", deadline, Some("T1")).unwrap();
        assert_eq!(no_url.to_string(), "title:road works@2030-01-01");

        let number_first = NaturalKey::derive(
            KeyStrategy::TenderNumberFirst,
            Some("https://tenders.go.ke/t/1"),
            "Road Works",
            deadline,
            Some(" T1 "),
        )
        .unwrap();
        assert_eq!(number_first.to_string(), "tender:t1");

        assert!(NaturalKey::derive(KeyStrategy::UrlFirst, Some("  "), "Road Works", None, None).is_none());
    }

    #[test]
    fn url_keys_keep_path_and_query_case() {
        let key = |u: &str| NaturalKey::derive(KeyStrategy::UrlFirst, Some(u), "Desks", None, None).unwrap();
        assert_ne!(
            key("https://tenders.go.ke/t?id=AbC"),
            key("https://tenders.go.ke/t?id=abc")
        );
        assert_eq!(key("https://TENDERS.go.ke/t/9/"), key("https://tenders.go.ke/t/9"));
        assert_eq!(key("not a url/").to_string(), "url:not a url");
    }

    #[test]
    fn tender_id_is_stable_per_key() {
        assert_eq!(tender_id_for_key("tender:t1"), tender_id_for_key("tender:t1"));
        assert_ne!(tender_id_for_key("tender:t1"), tender_id_for_key("tender:t2"));
    }

    #[test]
    fn status_is_derived_from_deadline() {
        let now = at(2026, 3, 1);
        assert_eq!(derive_status(None, now), TenderStatus::NoDeadline);
        assert_eq!(derive_status(Some(at(2026, 2, 28)), now), TenderStatus::Closed);
        assert_eq!(derive_status(Some(at(2026, 3, 5)), now), TenderStatus::ClosingSoon);
        assert_eq!(derive_status(Some(at(2026, 4, 1)), now), TenderStatus::Open);
    }

    #[test]
    fn view_status_changes_as_time_passes() {
        let view = TenderView::at(record("Desks", Some(at(2026, 3, 20))), at(2026, 3, 1));
        assert_eq!(view.status, TenderStatus::Open);
        let later = view.refreshed(at(2026, 3, 21));
        assert_eq!(later.status, TenderStatus::Closed);
    }

    #[test]
    fn filter_matches_category_location_search_and_group() {
        let now = at(2026, 3, 1);
        let views = vec![
            TenderView::at(record("Office Desks", None), now),
            TenderView::at(
                TenderRecord {
                    category: Some("Works".into()),
                    location: Some("Mombasa".into()),
                    affirmative_action: AffirmativeAction::default(),
                    ..record("Road Repair", None)
                },
                now,
            ),
        ];

        let by_category = TenderFilter {
            category: Some("supplies".into()),
            ..Default::default()
        };
        assert_eq!(by_category.apply(views.clone()).len(), 1);

        let by_location = TenderFilter {
            location: Some("mombasa".into()),
            ..Default::default()
        };
        assert_eq!(by_location.apply(views.clone())[0].record.title, "Road Repair");

        let by_search = TenderFilter {
            search: Some("furniture".into()),
            affirmative: Some(AffirmativeActionType::Youth),
            ..Default::default()
        };
        assert_eq!(by_search.apply(views.clone())[0].record.title, "Office Desks");

        assert_eq!(TenderFilter::default().apply(views).len(), 2);
    }
}
