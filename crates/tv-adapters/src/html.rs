use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use tv_core::KeyStrategy;
use tv_storage::HttpFetcher;
use url::Url;

use crate::{
    text_or_none, AdapterError, CandidateTender, DeadlineField, FetchedDocument, HtmlRule, SourceAdapter,
    SourceKind,
};

#[derive(Debug)]
struct CompiledRule {
    item: Selector,
    title: Selector,
    organization: Selector,
    deadline: Selector,
    link: Selector,
    description: Option<Selector>,
    location: Option<Selector>,
    category: Option<Selector>,
    tender_no: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_opt(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(compile).transpose()
}

impl CompiledRule {
    fn new(rule: &HtmlRule) -> Result<Self, AdapterError> {
        Ok(Self {
            item: compile(&rule.item)?,
            title: compile(&rule.title)?,
            organization: compile(&rule.organization)?,
            deadline: compile(&rule.deadline)?,
            link: compile(&rule.link)?,
            description: compile_opt(&rule.description)?,
            location: compile_opt(&rule.location)?,
            category: compile_opt(&rule.category)?,
            tender_no: compile_opt(&rule.tender_no)?,
        })
    }
}

/// Scrapes a public listing page with a configurable set of CSS selectors.
#[derive(Debug)]
pub struct HtmlSelectorAdapter {
    source_id: String,
    listing_urls: Vec<String>,
    rule: CompiledRule,
    default_location: Option<String>,
}

impl HtmlSelectorAdapter {
    pub fn new(
        source_id: String,
        listing_urls: Vec<String>,
        rule: HtmlRule,
        default_location: Option<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            source_id,
            listing_urls,
            rule: CompiledRule::new(&rule)?,
            default_location,
        })
    }

    fn extract(&self, item: ElementRef<'_>, base: Option<&Url>) -> Option<CandidateTender> {
        let rule = &self.rule;
        let title = select_first_text(item, &rule.title)?;
        let organization = select_first_text(item, &rule.organization);
        let deadline_text = select_first_text(item, &rule.deadline);
        let href = select_first_attr(item, &rule.link, "href");
        let tender_url = href.map(|href| resolve_link(base, &href));
        let optional = |sel: &Option<Selector>| sel.as_ref().and_then(|s| select_first_text(item, s));

        Some(CandidateTender {
            source_id: self.source_id.clone(),
            title,
            organization,
            category: optional(&rule.category),
            description: optional(&rule.description),
            location: optional(&rule.location).or_else(|| self.default_location.clone()),
            deadline: DeadlineField::from_text(deadline_text),
            tender_url,
            tender_no: optional(&rule.tender_no),
            contact_info: None,
            requirements: None,
            affirmative_action: None,
            points_required: 0,
        })
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s))
}

fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

#[async_trait]
impl SourceAdapter for HtmlSelectorAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    fn key_strategy(&self) -> KeyStrategy {
        KeyStrategy::UrlFirst
    }

    async fn fetch_documents(&self, http: &HttpFetcher) -> Result<Vec<FetchedDocument>, AdapterError> {
        let mut documents = Vec::with_capacity(self.listing_urls.len());
        for url in &self.listing_urls {
            let resp = http.fetch_bytes(&self.source_id, url).await?;
            documents.push(FetchedDocument {
                url: resp.final_url.clone(),
                body: resp.text(),
            });
        }
        Ok(documents)
    }

    fn parse_document(&self, document: &FetchedDocument) -> Result<Vec<CandidateTender>, AdapterError> {
        let html = Html::parse_document(&document.body);
        let base = Url::parse(&document.url).ok();
        let mut out = Vec::new();
        let mut untitled = 0usize;
        for item in html.select(&self.rule.item) {
            match self.extract(item, base.as_ref()) {
                Some(candidate) => out.push(candidate),
                None => untitled += 1,
            }
        }
        if untitled > 0 {
            warn!(source_id = %self.source_id, untitled, "skipped listing items without a title");
        }
        Ok(out)
    }
}
