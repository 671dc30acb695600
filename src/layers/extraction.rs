use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::layers::normalize::{self, base_manuscript_id};
use crate::layers::scholarone::ScholarOneParser;
use crate::layers::siam::SiamParser;
use crate::layers::table::{self, Cell, ColumnMap};
use crate::layers::{
    ExtractionQuery, ExtractionResult, Journal, Manuscript, Platform, Referee, RefereeStatus,
};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no {0} table found in page")]
    NoTable(&'static str),

    #[error("manuscript ID not found in page")]
    MissingManuscriptId,

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a manuscript detail page contributes on top of the dashboard row.
#[derive(Debug, Clone, Default)]
pub struct ManuscriptDetail {
    pub manuscript_id: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub pdf_url: Option<String>,
    pub referees: Vec<Referee>,
}

/// Common contract for the platform-specific page parsers.
pub trait DashboardParser: Send + Sync {
    fn parse_dashboard(&self, html: &str, journal: Journal) -> Result<Vec<Manuscript>, ExtractError>;

    fn parse_detail(&self, html: &str, journal: Journal) -> Result<ManuscriptDetail, ExtractError>;
}

pub fn parser_for(journal: Journal) -> Box<dyn DashboardParser> {
    match journal.platform() {
        Platform::Siam => {
            tracing::debug!("Using SiamParser for {}", journal);
            Box::new(SiamParser)
        }
        Platform::ScholarOne => {
            tracing::debug!("Using ScholarOneParser for {}", journal);
            Box::new(ScholarOneParser)
        }
    }
}

pub struct Extractor {
    parser: Box<dyn DashboardParser>,
}

impl Extractor {
    pub fn new(journal: Journal) -> Self {
        Self {
            parser: parser_for(journal),
        }
    }

    /// Parses the saved dashboard plus any saved detail pages into one result.
    /// Unparseable detail pages are logged and skipped; an unreadable or
    /// table-less dashboard fails the whole extraction.
    pub fn extract(&self, query: &ExtractionQuery) -> Result<ExtractionResult, ExtractError> {
        let html = read_page(&query.dashboard)?;
        let mut manuscripts = self.parser.parse_dashboard(&html, query.journal)?;
        tracing::info!(
            "Parsed {} manuscripts from dashboard {:?}",
            manuscripts.len(),
            query.dashboard
        );

        if let Some(dir) = &query.details {
            let mut details = Vec::new();
            for path in detail_pages(dir)? {
                let page = match read_page(&path) {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::warn!("Skipping detail page: {}", e);
                        continue;
                    }
                };
                match self.parser.parse_detail(&page, query.journal) {
                    Ok(detail) => {
                        tracing::info!(
                            "Parsed detail page {:?}: {} ({} referees)",
                            path,
                            detail.manuscript_id,
                            detail.referees.len()
                        );
                        details.push(detail);
                    }
                    Err(e) => tracing::error!("Error parsing detail page {:?}: {}", path, e),
                }
            }
            merge_details(&mut manuscripts, details, query.journal);
        }

        Ok(ExtractionResult::new(query.journal, manuscripts))
    }
}

fn read_page(path: &Path) -> Result<String, ExtractError> {
    std::fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn detail_pages(dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ExtractError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut pages: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
        })
        .collect();
    pages.sort();
    Ok(pages)
}

/// Folds detail pages into dashboard rows by base manuscript ID. A detail page
/// for a manuscript missing from the dashboard becomes a new manuscript.
pub fn merge_details(manuscripts: &mut Vec<Manuscript>, details: Vec<ManuscriptDetail>, journal: Journal) {
    let mut index: HashMap<String, usize> = manuscripts
        .iter()
        .enumerate()
        .map(|(i, m)| (m.base_id().to_string(), i))
        .collect();

    for detail in details {
        let key = base_manuscript_id(&detail.manuscript_id).to_string();
        let idx = match index.get(&key) {
            Some(idx) => *idx,
            None => {
                tracing::debug!("Detail page for {} has no dashboard row", detail.manuscript_id);
                manuscripts.push(Manuscript::new(detail.manuscript_id.clone(), journal));
                index.insert(key, manuscripts.len() - 1);
                manuscripts.len() - 1
            }
        };

        let target = &mut manuscripts[idx];
        // A revision's detail page carries the more specific ID.
        if detail.manuscript_id.len() > target.id.len() {
            target.id = detail.manuscript_id.clone();
        }
        if let Some(title) = detail.title.filter(|t| t.len() > target.title.len()) {
            target.title = title;
        }
        if target.authors.is_empty() {
            target.authors = detail.authors;
        }
        if target.pdf_url.is_none() {
            target.pdf_url = detail.pdf_url;
        }
        target.referees.extend(detail.referees);
    }
}

static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static HEADING: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4, .pagecontents b, title").unwrap());

/// "Label:" / value pairs from two-column rows, keyed by the lowercased label.
pub(crate) fn key_values(document: &Html) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for tr in document.select(&ROW) {
        let cells: Vec<_> = tr
            .children()
            .filter_map(scraper::ElementRef::wrap)
            .filter(|e| matches!(e.value().name(), "td" | "th"))
            .collect();
        if cells.len() < 2 {
            continue;
        }
        let label = table::collapse_ws(&cells[0].text().collect::<String>());
        let Some(label) = label.strip_suffix(':') else {
            continue;
        };
        let value = table::cell_lines(cells[1]).join("; ");
        if !value.is_empty() {
            out.entry(label.trim().to_lowercase()).or_insert(value);
        }
    }
    out
}

/// The journal's manuscript ID, looked up in headings first and then in the whole page.
pub(crate) fn page_manuscript_id(document: &Html, journal: Journal) -> Option<String> {
    document
        .select(&HEADING)
        .find_map(|h| normalize::normalize_manuscript_id(journal, &h.text().collect::<Vec<_>>().join(" ")))
        .or_else(|| {
            let text = document.root_element().text().collect::<Vec<_>>().join(" ");
            normalize::normalize_manuscript_id(journal, &text)
        })
}

/// "M172838 - Some Title" style headings: whatever follows the ID.
pub(crate) fn heading_title(document: &Html, journal: Journal) -> Option<String> {
    let pattern = journal.manuscript_id_pattern();
    document.select(&HEADING).find_map(|h| {
        let text = table::collapse_ws(&h.text().collect::<Vec<_>>().join(" "));
        let m = pattern.find(&text)?;
        let rest = text[m.end()..]
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '-' | ':' | '\u{2013}' | '|'))
            .trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

/// Splits "A. One, B. Two; C. Three and D. Four" into names. A lone
/// "Last, First" is kept as one name.
pub(crate) fn split_authors(text: &str) -> Vec<String> {
    let text = text.replace(" and ", ";");
    let pieces: Vec<&str> = if text.contains(';') {
        text.split(';').collect()
    } else {
        let commas: Vec<&str> = text.split(',').collect();
        if commas.iter().all(|p| p.split_whitespace().count() >= 2) {
            commas
        } else {
            vec![text.as_str()]
        }
    };
    pieces
        .into_iter()
        .map(normalize::normalize_name)
        .filter(|a| !a.is_empty() && !a.contains('@'))
        .collect()
}

pub(crate) fn row_link<'a>(row: &'a [Cell], wanted: impl Fn(&table::Link) -> bool) -> Option<&'a table::Link> {
    row.iter().flat_map(|c| c.links.iter()).find(|l| wanted(l))
}

pub(crate) fn is_pdf_link(link: &table::Link) -> bool {
    link.href.to_lowercase().contains(".pdf") || link.text.to_lowercase().contains("pdf")
}

/// The manuscript's own PDF link anywhere on the page, skipping referee report files.
pub(crate) fn page_pdf_link(document: &Html, base: &Url) -> Option<String> {
    document
        .select(&LINK)
        .filter_map(|a| {
            Some(table::Link {
                text: table::collapse_ws(&a.text().collect::<String>()),
                href: a.value().attr("href")?.to_string(),
            })
        })
        .filter(|l| {
            let text = l.text.to_lowercase();
            !text.contains("report") && !text.contains("review")
        })
        .find(is_pdf_link)
        .and_then(|l| table::absolutize(base, &l.href))
}

/// Builds a referee from one row of a reviewer table. Both portals pack extra
/// lines (institution, e-mail, labelled dates) into cells, so every cell is mined.
pub(crate) fn referee_from_row(row: &[Cell], map: &ColumnMap, base: &Url) -> Option<Referee> {
    let name_cell = map.cell(row, "name")?;
    let raw_name = name_cell.lines.first()?;
    let name = normalize::normalize_name(raw_name);
    let lower = name.to_lowercase();
    if name.is_empty() || lower.starts_with("no ") || lower.contains("none assigned") {
        return None;
    }

    let mut referee = Referee::new(name);

    let row_text: String = row.iter().map(|c| c.lines.join("\n")).collect::<Vec<_>>().join("\n");
    referee.email = map
        .cell(row, "email")
        .and_then(|c| c.mailto().map(str::to_string).or_else(|| Some(c.text.clone())))
        .and_then(|e| normalize::normalize_email(&e))
        .or_else(|| row.iter().find_map(|c| c.mailto()).and_then(normalize::normalize_email))
        .or_else(|| normalize::extract_emails(&row_text).into_iter().next());

    referee.institution = name_cell
        .lines
        .iter()
        .skip(1)
        .find(|line| {
            !line.contains('@')
                && normalize::parse_date(line).is_none()
                && RefereeStatus::parse(line) == RefereeStatus::Unknown
        })
        .cloned()
        .or_else(|| map.text(row, "institution").map(str::to_string));

    let labelled = normalize::labelled_dates(&row_text);
    let column_date = |field: &str| map.text(row, field).and_then(normalize::parse_date);
    referee.invited = column_date("invited").or_else(|| labelled.get("invited").copied());
    referee.agreed = column_date("agreed").or_else(|| labelled.get("agreed").copied());
    referee.due = column_date("due").or_else(|| labelled.get("due").copied());
    referee.returned = column_date("returned").or_else(|| labelled.get("returned").copied());

    referee.status = map
        .text(row, "status")
        .map(RefereeStatus::parse)
        .unwrap_or_default();
    if referee.status == RefereeStatus::Unknown {
        referee.status = if referee.returned.is_some() {
            RefereeStatus::ReportSubmitted
        } else if labelled.contains_key("declined") {
            RefereeStatus::Declined
        } else if referee.agreed.is_some() {
            RefereeStatus::Agreed
        } else if referee.invited.is_some() {
            RefereeStatus::Invited
        } else {
            RefereeStatus::Unknown
        };
    }

    referee.recommendation = map.text(row, "recommendation").map(str::to_string);
    referee.report_url = row_link(row, |l| {
        let text = l.text.to_lowercase();
        text.contains("report") || (text.contains("review") && !text.contains("reviewer"))
    })
    .and_then(|l| table::absolutize(base, &l.href));

    Some(referee)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(id: &str, referee: &str) -> ManuscriptDetail {
        ManuscriptDetail {
            manuscript_id: id.to_string(),
            title: Some("A much longer and more complete title".to_string()),
            authors: vec!["A. Author".to_string()],
            pdf_url: None,
            referees: vec![Referee::new(referee)],
        }
    }

    #[test]
    fn test_merge_details_by_base_id() {
        let mut manuscript = Manuscript::new("MOR-2024-0101", Journal::Mor);
        manuscript.title = "Short".to_string();
        let mut manuscripts = vec![manuscript];

        merge_details(&mut manuscripts, vec![detail("MOR-2024-0101.R1", "Jane Doe")], Journal::Mor);

        assert_eq!(manuscripts.len(), 1);
        assert_eq!(manuscripts[0].id, "MOR-2024-0101.R1");
        assert_eq!(manuscripts[0].title, "A much longer and more complete title");
        assert_eq!(manuscripts[0].referees.len(), 1);
    }

    #[test]
    fn test_merge_details_creates_missing_manuscript() {
        let mut manuscripts = Vec::new();
        merge_details(&mut manuscripts, vec![detail("M172838", "Jane Doe")], Journal::Sicon);
        assert_eq!(manuscripts.len(), 1);
        assert_eq!(manuscripts[0].journal, Journal::Sicon);
        assert_eq!(manuscripts[0].authors, vec!["A. Author"]);
    }

    #[test]
    fn test_extract_from_saved_pages() {
        let dir = tempfile::tempdir().unwrap();
        let dashboard = dir.path().join("dashboard.html");
        std::fs::write(
            &dashboard,
            r#"<table>
                <tr><th>Manuscript #</th><th>Title</th><th>Submitted</th></tr>
                <tr><td>M172838</td><td>Stochastic control</td><td>2025-01-02</td></tr>
            </table>"#,
        )
        .unwrap();
        let details = dir.path().join("details");
        std::fs::create_dir(&details).unwrap();
        std::fs::write(
            details.join("M172838.html"),
            r#"<h2>M172838 - Stochastic control</h2>
            <table>
                <tr><th>Referee</th><th>Status</th><th>Invited</th></tr>
                <tr><td>Doe, Jane</td><td>Agreed</td><td>2025-01-05</td></tr>
            </table>"#,
        )
        .unwrap();
        std::fs::write(details.join("notes.txt"), "ignored").unwrap();

        let query = ExtractionQuery {
            journal: Journal::Sicon,
            dashboard,
            details: Some(details),
        };
        let result = Extractor::new(Journal::Sicon).extract(&query).unwrap();
        assert_eq!(result.manuscripts.len(), 1);
        assert_eq!(result.manuscripts[0].referees[0].name, "Jane Doe");
    }

    #[test]
    fn test_extract_missing_dashboard_is_io_error() {
        let query = ExtractionQuery {
            journal: Journal::Mor,
            dashboard: PathBuf::from("/nonexistent/dashboard.html"),
            details: None,
        };
        let err = Extractor::new(Journal::Mor).extract(&query).unwrap_err();
        assert!(matches!(err, ExtractError::Io { .. }));
    }
}
