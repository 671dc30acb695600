// ScholarOne Manuscripts (mc.manuscriptcentral.com) pages: MOR, MF.
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use url::Url;

use crate::layers::extraction::{self, DashboardParser, ExtractError, ManuscriptDetail};
use crate::layers::normalize;
use crate::layers::table::{self, HtmlTable};
use crate::layers::{Journal, Manuscript};

const DASHBOARD_FIELDS: &[(&str, &[&str])] = &[
    ("id", &["manuscript id", "manuscript #", "ms id", "manuscript", "id"]),
    ("title", &["title"]),
    ("author", &["author"]),
    ("submitted", &["submitted", "received", "date"]),
    ("editor", &["associate editor", "editor"]),
    ("status", &["status", "decision"]),
    ("days", &["days"]),
];

const REVIEWER_FIELDS: &[(&str, &[&str])] = &[
    ("name", &["reviewer name", "reviewer", "referee", "name"]),
    ("email", &["e-mail", "email"]),
    ("institution", &["institution", "affiliation"]),
    ("status", &["status"]),
    ("history", &["history", "dates", "date"]),
    ("recommendation", &["recommendation", "score"]),
];

// "AE: Doe, Jane" lines inside the status cell of the AE center list.
static AE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(?:AE|Associate Editor)\s*:\s*(.+)$").unwrap());

pub struct ScholarOneParser;

impl DashboardParser for ScholarOneParser {
    fn parse_dashboard(&self, html: &str, journal: Journal) -> Result<Vec<Manuscript>, ExtractError> {
        let document = Html::parse_document(html);
        let base = Url::parse(journal.base_url())?;
        let tables = HtmlTable::parse_all(&document);
        let (tbl, map) = table::find_table(&tables, DASHBOARD_FIELDS, &["id", "title"])
            .ok_or(ExtractError::NoTable("AE center manuscript"))?;

        let mut manuscripts = Vec::new();
        for row in &tbl.rows {
            let Some(id) = map
                .text(row, "id")
                .and_then(|t| normalize::normalize_manuscript_id(journal, t))
            else {
                tracing::debug!("Skipping ScholarOne row without manuscript ID");
                continue;
            };
            let mut manuscript = Manuscript::new(id, journal);
            manuscript.title = map
                .cell(row, "title")
                .and_then(|c| c.lines.first().cloned())
                .unwrap_or_default();
            manuscript.authors = map
                .text(row, "author")
                .map(extraction::split_authors)
                .unwrap_or_default();
            manuscript.corresponding_author = manuscript.authors.first().cloned();
            manuscript.submitted = map.text(row, "submitted").and_then(normalize::parse_date);
            manuscript.days_in_system = map
                .text(row, "days")
                .and_then(|t| t.split_whitespace().next())
                .and_then(|t| t.parse().ok());

            if let Some(cell) = map.cell(row, "status") {
                manuscript.status = cell
                    .lines
                    .iter()
                    .find(|l| !AE_LINE.is_match(l))
                    .cloned();
                manuscript.associate_editor = cell
                    .lines
                    .iter()
                    .find_map(|l| AE_LINE.captures(l))
                    .and_then(|caps| caps.get(1))
                    .map(|m| normalize::normalize_name(m.as_str()));
            }
            if let Some(editor) = map.text(row, "editor") {
                manuscript.associate_editor = Some(normalize::normalize_name(editor));
            }

            // Links on ScholarOne are mostly javascript: handlers; keep whatever resolves.
            manuscript.detail_url = row
                .iter()
                .flat_map(|c| c.links.iter())
                .find_map(|l| table::absolutize(&base, &l.href));
            manuscript.pdf_url = extraction::row_link(row, extraction::is_pdf_link)
                .and_then(|l| table::absolutize(&base, &l.href));

            manuscripts.push(manuscript);
        }

        if manuscripts.is_empty() {
            tracing::warn!("No manuscripts found in the ScholarOne AE center for {}.", journal);
        }
        Ok(manuscripts)
    }

    fn parse_detail(&self, html: &str, journal: Journal) -> Result<ManuscriptDetail, ExtractError> {
        let document = Html::parse_document(html);
        let base = Url::parse(journal.base_url())?;
        let manuscript_id = extraction::page_manuscript_id(&document, journal)
            .ok_or(ExtractError::MissingManuscriptId)?;
        let fields = extraction::key_values(&document);

        let title = fields
            .get("title")
            .or_else(|| fields.get("manuscript title"))
            .cloned()
            .or_else(|| extraction::heading_title(&document, journal));
        let authors = fields
            .get("authors")
            .or_else(|| fields.get("author(s)"))
            .map(|a| extraction::split_authors(a))
            .unwrap_or_default();

        let tables = HtmlTable::parse_all(&document);
        let referees = match table::find_table(&tables, REVIEWER_FIELDS, &["name", "status"]) {
            Some((tbl, map)) => tbl
                .rows
                .iter()
                .filter_map(|row| extraction::referee_from_row(row, &map, &base))
                .collect(),
            None => {
                tracing::warn!("No reviewer list on ScholarOne page for {}", manuscript_id);
                Vec::new()
            }
        };

        Ok(ManuscriptDetail {
            manuscript_id,
            title,
            authors,
            pdf_url: extraction::page_pdf_link(&document, &base),
            referees,
        })
    }
}
