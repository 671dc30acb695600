// SIAM editorial system (SICON, SIFIN) pages.
use scraper::Html;
use url::Url;

use crate::layers::extraction::{self, DashboardParser, ExtractError, ManuscriptDetail};
use crate::layers::normalize;
use crate::layers::table::{self, HtmlTable};
use crate::layers::{Journal, Manuscript};

const DASHBOARD_FIELDS: &[(&str, &[&str])] = &[
    ("id", &["manuscript #", "manuscript id", "ms #", "manuscript", "ms id"]),
    ("title", &["title"]),
    ("author", &["corresponding author", "author"]),
    ("days", &["days in stage", "days"]),
    ("stage", &["current stage", "stage", "status", "task"]),
    ("editor", &["associate editor", "editor"]),
    ("submitted", &["submitted", "received", "date"]),
];

const REFEREE_FIELDS: &[(&str, &[&str])] = &[
    ("name", &["referee", "reviewer", "name"]),
    ("email", &["e-mail", "email"]),
    ("status", &["status"]),
    ("invited", &["invited", "contacted", "requested"]),
    ("agreed", &["agreed", "accepted", "response"]),
    ("due", &["due"]),
    ("returned", &["received", "returned", "report"]),
    ("recommendation", &["recommendation"]),
];

pub struct SiamParser;

impl DashboardParser for SiamParser {
    fn parse_dashboard(&self, html: &str, journal: Journal) -> Result<Vec<Manuscript>, ExtractError> {
        let document = Html::parse_document(html);
        let base = Url::parse(journal.base_url())?;
        let tables = HtmlTable::parse_all(&document);
        let (tbl, map) = table::find_table(&tables, DASHBOARD_FIELDS, &["id"])
            .ok_or(ExtractError::NoTable("associate editor tasks"))?;

        let mut manuscripts = Vec::new();
        for row in &tbl.rows {
            let Some(id) = map
                .text(row, "id")
                .and_then(|t| normalize::normalize_manuscript_id(journal, t))
            else {
                tracing::debug!("Skipping SIAM row without manuscript ID");
                continue;
            };

            let mut manuscript = Manuscript::new(id, journal);

            // Titles often carry the corresponding author on a second line.
            if let Some(cell) = map.cell(row, "title") {
                manuscript.title = cell.lines.first().cloned().unwrap_or_default();
                if !map.has("author") {
                    manuscript.corresponding_author =
                        cell.lines.get(1).map(|l| normalize::normalize_name(l));
                }
            }
            if let Some(author) = map.text(row, "author") {
                manuscript.corresponding_author = Some(normalize::normalize_name(author));
            }
            manuscript.authors = manuscript.corresponding_author.iter().cloned().collect();
            manuscript.submitted = map.text(row, "submitted").and_then(normalize::parse_date);
            manuscript.status = map.text(row, "stage").map(str::to_string);
            manuscript.associate_editor = map.text(row, "editor").map(normalize::normalize_name);
            manuscript.days_in_system = map
                .text(row, "days")
                .and_then(|t| t.split_whitespace().next())
                .and_then(|t| t.parse().ok());

            // The "Take Action" link opens the detail view.
            manuscript.detail_url = map
                .cell(row, "id")
                .and_then(|c| c.links.first())
                .or_else(|| {
                    extraction::row_link(row, |l| l.text.to_lowercase().contains("take action"))
                })
                .and_then(|l| table::absolutize(&base, &l.href));
            manuscript.pdf_url = extraction::row_link(row, extraction::is_pdf_link)
                .and_then(|l| table::absolutize(&base, &l.href));

            manuscripts.push(manuscript);
        }

        if manuscripts.is_empty() {
            tracing::warn!("No manuscripts found in the SIAM dashboard for {}.", journal);
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
            .cloned()
            .or_else(|| extraction::heading_title(&document, journal));

        let mut authors = fields
            .get("corresponding author")
            .map(|a| extraction::split_authors(a))
            .unwrap_or_default();
        if let Some(co_authors) = fields.get("co-authors").or_else(|| fields.get("authors")) {
            for author in extraction::split_authors(co_authors) {
                if !authors.contains(&author) {
                    authors.push(author);
                }
            }
        }

        let tables = HtmlTable::parse_all(&document);
        let referees = match table::find_table(&tables, REFEREE_FIELDS, &["name", "status"]) {
            Some((tbl, map)) => tbl
                .rows
                .iter()
                .filter_map(|row| extraction::referee_from_row(row, &map, &base))
                .collect(),
            None => {
                tracing::warn!("No referee table on SIAM detail page for {}", manuscript_id);
                Vec::new()
            }
        };

        let pdf_url = extraction::page_pdf_link(&document, &base);

        Ok(ManuscriptDetail {
            manuscript_id,
            title,
            authors,
            pdf_url,
            referees,
        })
    }
}
