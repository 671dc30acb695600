// Generic reader for the hand-built HTML tables editorial portals render.
use std::collections::HashMap;

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use once_cell::sync::Lazy;
use url::Url;

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

/// Words that mark a row as a header row when the portal did not use `<th>`.
const HEADER_WORDS: &[&str] = &[
    "manuscript", "title", "author", "referee", "reviewer", "status", "submitted", "invited",
    "agreed", "due", "name", "date", "editor", "days", "stage", "returned", "received",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    pub text: String,
    pub lines: Vec<String>,
    pub links: Vec<Link>,
    pub is_header: bool,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn mailto(&self) -> Option<&str> {
        self.links
            .iter()
            .find_map(|l| l.href.strip_prefix("mailto:"))
            .map(|addr| addr.split('?').next().unwrap_or(addr))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HtmlTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl HtmlTable {
    /// Parses every table in the document, nested ones included. Tables without a
    /// recognizable header row are dropped.
    pub fn parse_all(document: &Html) -> Vec<HtmlTable> {
        document
            .select(&TABLE)
            .filter_map(HtmlTable::from_element)
            .collect()
    }

    fn from_element(table: ElementRef<'_>) -> Option<HtmlTable> {
        let raw_rows: Vec<Vec<Cell>> = direct_rows(table)
            .into_iter()
            .map(parse_row)
            .filter(|cells| !cells.is_empty())
            .collect();

        // A real `<th>` row anywhere beats a header guessed from wording.
        let header_idx = raw_rows
            .iter()
            .position(|row| is_th_row(row))
            .or_else(|| raw_rows.iter().position(|row| looks_like_header(row)))?;
        let headers: Vec<String> = raw_rows[header_idx].iter().map(|c| c.text.clone()).collect();

        let mut rows = Vec::new();
        for mut row in raw_rows.into_iter().skip(header_idx + 1) {
            if row.iter().all(Cell::is_empty) {
                continue;
            }
            let texts: Vec<&str> = row.iter().map(|c| c.text.as_str()).collect();
            if texts == headers.iter().map(String::as_str).collect::<Vec<_>>() {
                continue;
            }
            if row.len() < headers.len() {
                row.resize(headers.len(), Cell::default());
            }
            rows.push(row);
        }

        Some(HtmlTable { headers, rows })
    }
}

fn direct_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|e| e.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn parse_row(tr: ElementRef<'_>) -> Vec<Cell> {
    let mut cells = Vec::new();
    for cell_el in tr.children().filter_map(ElementRef::wrap) {
        let name = cell_el.value().name();
        if name != "td" && name != "th" {
            continue;
        }
        let span = cell_el
            .value()
            .attr("colspan")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, 50);

        let lines = cell_lines(cell_el);
        let links = cell_el
            .select(&LINK)
            .filter_map(|a| {
                let href = a.value().attr("href")?.trim().to_string();
                Some(Link {
                    text: collapse_ws(&a.text().collect::<String>()),
                    href,
                })
            })
            .collect();

        let is_header = name == "th";
        cells.push(Cell {
            text: lines.join(" "),
            lines,
            links,
            is_header,
        });
        for _ in 1..span {
            cells.push(Cell {
                is_header,
                ..Cell::default()
            });
        }
    }
    cells
}

/// Text of a cell split on `<br>`, block-level and nested-table cell boundaries.
pub fn cell_lines(el: ElementRef<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for node in el.descendants() {
        match node.value() {
            Node::Text(text) => {
                let inside_script = node
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|a| matches!(a.value().name(), "script" | "style"));
                if !inside_script {
                    current.push_str(text);
                }
            }
            Node::Element(e) if matches!(e.name(), "br" | "p" | "div" | "li" | "table" | "tr" | "td" | "th") => {
                push_line(&mut lines, &mut current);
            }
            _ => {}
        }
    }
    push_line(&mut lines, &mut current);
    lines
}

fn push_line(lines: &mut Vec<String>, current: &mut String) {
    let line = collapse_ws(current);
    if !line.is_empty() {
        lines.push(line);
    }
    current.clear();
}

/// Collapses whitespace runs (including non-breaking spaces) into single spaces.
pub fn collapse_ws(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_th_row(row: &[Cell]) -> bool {
    row.iter().any(|c| !c.is_empty()) && row.iter().all(|c| c.is_header)
}

fn looks_like_header(row: &[Cell]) -> bool {
    let non_empty: Vec<&Cell> = row.iter().filter(|c| !c.is_empty()).collect();
    if non_empty.is_empty() {
        return false;
    }
    let plausible = non_empty.iter().all(|c| {
        c.text.len() <= 40 && !c.text.chars().any(|ch| ch.is_ascii_digit())
    });
    plausible
        && non_empty.iter().any(|c| {
            let lower = c.text.to_lowercase();
            HEADER_WORDS.iter().any(|w| lower.contains(w))
        })
}

/// Logical field name -> column index, resolved from header aliases.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    columns: HashMap<&'static str, usize>,
}

impl ColumnMap {
    /// Each field takes the first unclaimed column whose header contains one of its
    /// aliases (case-insensitive); aliases are tried in order.
    pub fn resolve(headers: &[String], fields: &[(&'static str, &[&str])]) -> Self {
        let lowered: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();
        let mut columns = HashMap::new();
        let mut claimed = vec![false; headers.len()];

        for (field, aliases) in fields {
            let hit = aliases.iter().find_map(|alias| {
                lowered
                    .iter()
                    .enumerate()
                    .find(|(idx, h)| !claimed[*idx] && h.contains(alias))
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = hit {
                claimed[idx] = true;
                columns.insert(*field, idx);
            }
        }
        Self { columns }
    }

    pub fn has(&self, field: &str) -> bool {
        self.columns.contains_key(field)
    }

    pub fn cell<'a>(&self, row: &'a [Cell], field: &str) -> Option<&'a Cell> {
        self.columns.get(field).and_then(|idx| row.get(*idx))
    }

    pub fn text<'a>(&self, row: &'a [Cell], field: &str) -> Option<&'a str> {
        self.cell(row, field)
            .map(|c| c.text.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// First table whose header resolves every required field.
pub fn find_table<'a>(
    tables: &'a [HtmlTable],
    fields: &[(&'static str, &[&str])],
    required: &[&str],
) -> Option<(&'a HtmlTable, ColumnMap)> {
    tables.iter().find_map(|table| {
        let map = ColumnMap::resolve(&table.headers, fields);
        required.iter().all(|f| map.has(f)).then_some((table, map))
    })
}

/// Resolves a scraped href against the portal root. Script and fragment links yield `None`.
pub fn absolutize(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.to_lowercase().starts_with("javascript:") {
        return None;
    }
    match base.join(href) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            tracing::warn!("Failed to join URL: {} with base {}: {}", href, base, e);
            None
        }
    }
}
