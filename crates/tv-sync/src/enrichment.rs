use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tv_adapters::CandidateTender;
use tv_core::{AffirmativeAction, AffirmativeActionType};

use crate::EnrichmentHook;

#[derive(Debug, Clone, Deserialize)]
struct EnrichmentRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: Vec<CategoryRule>,
    #[serde(default)]
    affirmative: Vec<AffirmativeRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    category: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AffirmativeRule {
    #[serde(rename = "type")]
    kind: AffirmativeActionType,
    contains_any: Vec<String>,
}

fn matches_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
}

/// Keyword rules that fill in a missing category or affirmative-action tag.
///
/// Values given by the source always win over inferred ones.
pub struct YamlRuleEnrichmentHook {
    categories: Vec<CategoryRule>,
    affirmative: Vec<AffirmativeRule>,
}

impl YamlRuleEnrichmentHook {
    pub fn rules_path(root: &Path) -> PathBuf {
        root.join("rules").join("enrichment.yaml")
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = Self::rules_path(root);
        let text = std::fs::read_to_string(&path).context("reading rules/enrichment.yaml")?;
        let rules: EnrichmentRulesFile =
            serde_yaml::from_str(&text).context("parsing rules/enrichment.yaml")?;
        Ok(Self {
            categories: rules.categories,
            affirmative: rules.affirmative,
        })
    }
}

impl EnrichmentHook for YamlRuleEnrichmentHook {
    fn apply(&self, mut items: Vec<CandidateTender>) -> Result<Vec<CandidateTender>> {
        for item in &mut items {
            let combined = format!(
                "{} {}",
                item.title,
                item.description.as_deref().unwrap_or_default()
            )
            .to_ascii_lowercase();

            if item.category.is_none() {
                item.category = self
                    .categories
                    .iter()
                    .find(|rule| matches_any(&combined, &rule.contains_any))
                    .map(|rule| rule.category.clone());
            }

            // An explicit `none` from the source is a value, not a gap.
            if item.affirmative_action.is_none() {
                item.affirmative_action = self
                    .affirmative
                    .iter()
                    .find(|rule| matches_any(&combined, &rule.contains_any))
                    .map(|rule| AffirmativeAction::of(rule.kind));
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tv_adapters::DeadlineField;

    fn tender(title: &str, description: Option<&str>) -> CandidateTender {
        CandidateTender {
            source_id: "mygov-tenders".into(),
            title: title.into(),
            organization: None,
            category: None,
            description: description.map(Into::into),
            location: None,
            deadline: DeadlineField::NotFound { raw: None },
            tender_url: None,
            tender_no: None,
            contact_info: None,
            requirements: None,
            affirmative_action: None,
            points_required: 0,
        }
    }

    fn hook() -> YamlRuleEnrichmentHook {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            YamlRuleEnrichmentHook::rules_path(dir.path()),
            r#"
version: 1
categories:
  - category: Works
    contains_any: ["construction", "borehole"]
  - category: Goods
    contains_any: ["supply"]
affirmative:
  - type: pwds
    contains_any: ["persons with disabilities"]
  - type: women
    contains_any: ["AGPO women"]
"#,
        )
        .unwrap();
        YamlRuleEnrichmentHook::from_workspace_root(dir.path()).unwrap()
    }

    #[test]
    fn infers_missing_category_and_reservation() {
        let items = hook()
            .apply(vec![
                tender("Drilling of Borehole", Some("Reserved for persons with disabilities")),
                tender("Supply of uniforms", Some("Open to AGPO Women registered firms")),
                tender("Legal retainer", None),
            ])
            .unwrap();

        let kind = |i: usize| items[i].affirmative_action.as_ref().map(|a| a.kind);
        assert_eq!(items[0].category.as_deref(), Some("Works"));
        assert_eq!(kind(0), Some(AffirmativeActionType::Pwds));
        assert_eq!(items[1].category.as_deref(), Some("Goods"));
        assert_eq!(kind(1), Some(AffirmativeActionType::Women));
        assert_eq!(items[2].category, None);
        assert_eq!(items[2].affirmative_action, None);
    }

    #[test]
    fn source_values_are_not_overwritten() {
        let mut given = tender("Construction of classrooms", Some("AGPO women"));
        given.category = Some("Consultancy".into());
        given.affirmative_action = Some(AffirmativeAction::of(AffirmativeActionType::Youth));

        let items = hook().apply(vec![given]).unwrap();
        assert_eq!(items[0].category.as_deref(), Some("Consultancy"));
        assert_eq!(
            items[0].affirmative_action.as_ref().map(|a| a.kind),
            Some(AffirmativeActionType::Youth)
        );
    }

    #[test]
    fn explicit_none_from_the_source_is_kept() {
        let mut given = tender("Cleaning services", Some("Persons with disabilities encouraged"));
        given.affirmative_action = Some(AffirmativeAction::from_text("none"));

        let items = hook().apply(vec![given]).unwrap();
        assert_eq!(
            items[0].affirmative_action.as_ref().map(|a| a.kind),
            Some(AffirmativeActionType::None)
        );
    }
}
