use std::collections::HashMap;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::layers::table::collapse_ws;
use crate::layers::Journal;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").unwrap());
static PARENS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").unwrap());
static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:dr|prof|professor|mr|mrs|ms|miss)\.?\s+").unwrap()
});
static SEPT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bsept\b").unwrap());
static REVISION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.R\d+$").unwrap());

// Candidate date shapes, each paired with the chrono formats that can read it.
static DATE_PATTERNS: Lazy<Vec<(Regex, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        (Regex::new(r"\b\d{4}-\d{1,2}-\d{1,2}\b").unwrap(), &["%Y-%m-%d"] as &[&str]),
        (Regex::new(r"\b\d{4}/\d{1,2}/\d{1,2}\b").unwrap(), &["%Y/%m/%d"] as &[&str]),
        (
            Regex::new(r"(?i)\b\d{1,2}-[a-z]{3,9}-\d{4}\b").unwrap(),
            &["%d-%b-%Y", "%d-%B-%Y"] as &[&str],
        ),
        (
            Regex::new(r"(?i)\b\d{1,2} [a-z]{3,9}\.? \d{4}\b").unwrap(),
            &["%d %b %Y", "%d %B %Y", "%d %b. %Y"] as &[&str],
        ),
        (
            Regex::new(r"(?i)\b[a-z]{3,9}\.? \d{1,2},? \d{4}\b").unwrap(),
            &["%b %d, %Y", "%B %d, %Y", "%b %d %Y", "%B %d %Y", "%b. %d, %Y"] as &[&str],
        ),
        (Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").unwrap(), &["%m/%d/%Y"] as &[&str]),
    ]
});

static LABELLED_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(invited|agreed|accepted|due|returned|received|submitted|declined)\s*(?:on|date)?\s*:\s*",
    )
    .unwrap()
});

/// "Doe, Jane (Invited)" -> "Jane Doe".
pub fn normalize_name(raw: &str) -> String {
    let cleaned = PARENS_RE.replace_all(raw, " ");
    let mut name = strip_titles(collapse_ws(&cleaned));

    if let Some((last, first)) = name.split_once(',') {
        let (last, first) = (last.trim(), first.trim());
        if !first.is_empty() && !last.is_empty() {
            name = format!("{} {}", first, last);
        } else {
            name = format!("{}{}", first, last);
        }
        // "Doe, Prof. Jane" only exposes its title after the flip.
        name = strip_titles(name);
    }

    let letters: Vec<char> = name.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        name = name
            .split(' ')
            .map(title_case)
            .collect::<Vec<_>>()
            .join(" ");
    }
    collapse_ws(&name)
}

fn strip_titles(mut name: String) -> String {
    while let Some(m) = TITLE_RE.find(&name) {
        name = name[m.end()..].to_string();
    }
    name
}

fn title_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut start = true;
    for ch in word.chars() {
        if start {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        start = ch == '-' || ch == '\'';
    }
    out
}

fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        _ => c,
    }
}

/// Comparison key: lowercase, accents folded, punctuation dropped.
pub fn name_key(name: &str) -> String {
    let folded: String = normalize_name(name)
        .to_lowercase()
        .chars()
        .map(fold_char)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_ws(&folded)
}

pub fn last_name(name: &str) -> Option<String> {
    name_key(name).split(' ').last().filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("mailto:")
        .unwrap_or(trimmed)
        .trim_matches(|c| c == '<' || c == '>')
        .to_lowercase();
    let (local, domain) = trimmed.split_once('@')?;
    if local.is_empty() || domain.contains('@') || !domain.contains('.') || domain.ends_with('.') {
        return None;
    }
    if trimmed.chars().any(char::is_whitespace) {
        return None;
    }
    Some(trimmed)
}

pub fn extract_emails(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in EMAIL_RE.find_iter(text) {
        if let Some(email) = normalize_email(m.as_str()) {
            if !found.contains(&email) {
                found.push(email);
            }
        }
    }
    found
}

/// First date found anywhere in `text`, or `None`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    // chrono's %b only knows three-letter months.
    let text = SEPT_RE.replace_all(&collapse_ws(text), "Sep").into_owned();
    let mut best: Option<(usize, NaiveDate)> = None;
    for (re, formats) in DATE_PATTERNS.iter() {
        for m in re.find_iter(&text) {
            let parsed = formats
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(m.as_str(), f).ok());
            if let Some(date) = parsed {
                if best.map_or(true, |(pos, _)| m.start() < pos) {
                    best = Some((m.start(), date));
                }
                break;
            }
        }
    }
    best.map(|(_, date)| date)
}

/// Splits "Invited: 12-Jan-2025 Agreed: 14-Jan-2025 Due: ..." into label -> date.
/// Labels are canonicalized to invited / agreed / due / returned / declined.
pub fn labelled_dates(text: &str) -> HashMap<&'static str, NaiveDate> {
    let text = collapse_ws(text);
    let mut out = HashMap::new();
    let labels: Vec<_> = LABELLED_DATE_RE.captures_iter(&text).collect();
    for (i, caps) in labels.iter().enumerate() {
        let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = labels
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let canonical = match label.as_str().to_lowercase().as_str() {
            "invited" => "invited",
            "agreed" | "accepted" => "agreed",
            "due" => "due",
            "declined" => "declined",
            _ => "returned",
        };
        if let Some(date) = parse_date(&text[whole.end()..end]) {
            out.entry(canonical).or_insert(date);
        }
    }
    out
}

/// The journal's manuscript ID found in `text`, uppercased.
pub fn normalize_manuscript_id(journal: Journal, text: &str) -> Option<String> {
    journal
        .manuscript_id_pattern()
        .find(text)
        .map(|m| m.as_str().to_uppercase())
}

pub fn base_manuscript_id(id: &str) -> &str {
    match REVISION_RE.find(id) {
        Some(m) => &id[..m.start()],
        None => id,
    }
}
