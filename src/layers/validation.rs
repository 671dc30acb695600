// Normalization, deduplication, sanity checks and quality scoring for extraction results.
use std::collections::HashMap;

use crate::layers::normalize::{self, name_key};
use crate::layers::{
    ExtractionResult, ExtractionStats, Journal, Manuscript, Referee, RefereeStatus, Severity,
    ValidationIssue,
};

pub struct Validator;

/// Issue fields whose offending value is removed from the result.
const DROPPED_FIELDS: &[&str] = &["referee.name", "referee.email"];

impl Validator {
    /// Rewrites `result` in place. Issues are recomputed, except those about data
    /// already dropped, so running it twice gives the same result.
    pub fn validate(result: &mut ExtractionResult) {
        // Dropped data is gone after the first run; its issues have to survive reruns.
        let mut issues: Vec<ValidationIssue> = result
            .issues
            .iter()
            .filter(|i| DROPPED_FIELDS.contains(&i.field.as_str()))
            .cloned()
            .collect();
        let journal = result.journal;

        let manuscripts = std::mem::take(&mut result.manuscripts)
            .into_iter()
            .map(|m| normalize_manuscript(m, journal, &mut issues))
            .collect();
        result.manuscripts = dedup_manuscripts(manuscripts);

        for manuscript in &mut result.manuscripts {
            manuscript.referees = dedup_referees(std::mem::take(&mut manuscript.referees));
            check_manuscript(manuscript, &mut issues);
            for referee in &mut manuscript.referees {
                referee.quality_score = referee_quality(referee);
            }
            manuscript.quality_score = manuscript_quality(manuscript);
        }

        result.quality_score = if result.manuscripts.is_empty() {
            0.0
        } else {
            result.manuscripts.iter().map(|m| m.quality_score).sum::<f64>() / result.manuscripts.len() as f64
        };
        result.stats = compute_stats(&result.manuscripts);

        issues.sort_by(|a, b| {
            (&a.manuscript_id, &a.field, &a.message).cmp(&(&b.manuscript_id, &b.field, &b.message))
        });
        issues.dedup();

        for issue in &issues {
            match issue.severity {
                Severity::Error => tracing::warn!("{}: {} {}", issue.manuscript_id, issue.field, issue.message),
                Severity::Warning => tracing::debug!("{}: {} {}", issue.manuscript_id, issue.field, issue.message),
            }
        }
        tracing::info!(
            "Validated {} manuscripts, {} referees, {} issues (quality {:.2})",
            result.stats.manuscripts,
            result.stats.referees,
            issues.len(),
            result.quality_score
        );
        result.issues = issues;
    }

    /// A referee record with everything an editor needs to chase a report.
    pub fn is_complete(referee: &Referee) -> bool {
        !referee.name.is_empty()
            && referee.email.is_some()
            && referee.status != RefereeStatus::Unknown
            && referee.invited.is_some()
    }
}

fn issue(severity: Severity, manuscript_id: &str, field: &str, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        severity,
        manuscript_id: manuscript_id.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

fn normalize_manuscript(mut m: Manuscript, journal: Journal, issues: &mut Vec<ValidationIssue>) -> Manuscript {
    match normalize::normalize_manuscript_id(journal, &m.id) {
        Some(id) => m.id = id,
        None => issues.push(issue(
            Severity::Error,
            &m.id,
            "id",
            format!("does not match the {} manuscript ID format", journal.code().to_uppercase()),
        )),
    }
    m.title = crate::layers::table::collapse_ws(&m.title);
    m.authors = m
        .authors
        .iter()
        .map(|a| normalize::normalize_name(a))
        .filter(|a| !a.is_empty())
        .collect();
    m.corresponding_author = m.corresponding_author.as_deref().map(normalize::normalize_name).filter(|a| !a.is_empty());
    m.associate_editor = m.associate_editor.as_deref().map(normalize::normalize_name).filter(|a| !a.is_empty());

    let id = m.id.clone();
    m.referees = m
        .referees
        .into_iter()
        .filter_map(|mut r| {
            r.name = normalize::normalize_name(&r.name);
            if r.name.is_empty() {
                issues.push(issue(Severity::Error, &id, "referee.name", "referee without a name dropped"));
                return None;
            }
            if let Some(raw) = r.email.take() {
                match normalize::normalize_email(&raw) {
                    Some(email) => r.email = Some(email),
                    None => issues.push(issue(
                        Severity::Warning,
                        &id,
                        "referee.email",
                        format!("invalid email '{}' for {} dropped", raw, r.name),
                    )),
                }
            }
            Some(r)
        })
        .collect();
    m
}

fn check_manuscript(m: &Manuscript, issues: &mut Vec<ValidationIssue>) {
    if m.title.is_empty() {
        issues.push(issue(Severity::Warning, &m.id, "title", "missing title"));
    }
    for r in &m.referees {
        if let (Some(invited), Some(agreed)) = (r.invited, r.agreed) {
            if agreed < invited {
                issues.push(issue(
                    Severity::Warning,
                    &m.id,
                    "referee.agreed",
                    format!("{} agreed ({}) before being invited ({})", r.name, agreed, invited),
                ));
            }
        }
        if let (Some(invited), Some(due)) = (r.invited, r.due) {
            if due < invited {
                issues.push(issue(
                    Severity::Warning,
                    &m.id,
                    "referee.due",
                    format!("{} is due ({}) before being invited ({})", r.name, due, invited),
                ));
            }
        }
        if r.status == RefereeStatus::ReportSubmitted && r.returned.is_none() {
            issues.push(issue(
                Severity::Warning,
                &m.id,
                "referee.returned",
                format!("{} submitted a report but no return date was found", r.name),
            ));
        }
    }
}

fn dedup_manuscripts(manuscripts: Vec<Manuscript>) -> Vec<Manuscript> {
    let mut out: Vec<Manuscript> = Vec::with_capacity(manuscripts.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for m in manuscripts {
        let key = m.base_id().to_string();
        match index.get(&key) {
            Some(&idx) => {
                tracing::debug!("Merging duplicate manuscript {}", m.id);
                merge_manuscript(&mut out[idx], m);
            }
            None => {
                index.insert(key, out.len());
                out.push(m);
            }
        }
    }
    out
}

fn longer(current: &mut String, candidate: String) {
    if candidate.len() > current.len() {
        *current = candidate;
    }
}

fn longer_opt(current: &mut Option<String>, candidate: Option<String>) {
    match (current.as_mut(), candidate) {
        (Some(current), Some(candidate)) => longer(current, candidate),
        (None, candidate) => *current = candidate,
        (Some(_), None) => {}
    }
}

fn merge_manuscript(into: &mut Manuscript, other: Manuscript) {
    longer(&mut into.id, other.id);
    longer(&mut into.title, other.title);
    for author in other.authors {
        if !into.authors.contains(&author) {
            into.authors.push(author);
        }
    }
    longer_opt(&mut into.corresponding_author, other.corresponding_author);
    into.submitted = match (into.submitted, other.submitted) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    longer_opt(&mut into.status, other.status);
    longer_opt(&mut into.associate_editor, other.associate_editor);
    into.days_in_system = into.days_in_system.max(other.days_in_system);
    into.pdf_url = into.pdf_url.take().or(other.pdf_url);
    into.detail_url = into.detail_url.take().or(other.detail_url);
    into.referees.extend(other.referees);
}

fn same_referee(a: &Referee, b: &Referee) -> bool {
    match (&a.email, &b.email) {
        (Some(x), Some(y)) if x == y => true,
        _ => name_key(&a.name) == name_key(&b.name),
    }
}

/// Merging can rename a referee into a match for one already kept, so passes
/// repeat until nothing merges.
fn dedup_referees(mut referees: Vec<Referee>) -> Vec<Referee> {
    loop {
        let before = referees.len();
        referees = dedup_pass(referees);
        if referees.len() == before {
            return referees;
        }
    }
}

fn dedup_pass(referees: Vec<Referee>) -> Vec<Referee> {
    let mut out: Vec<Referee> = Vec::with_capacity(referees.len());
    for referee in referees {
        match out.iter_mut().find(|existing| same_referee(existing, &referee)) {
            Some(existing) => merge_referee(existing, referee),
            None => out.push(referee),
        }
    }
    out
}

fn earliest<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn merge_referee(into: &mut Referee, other: Referee) {
    longer(&mut into.name, other.name);
    into.email = into.email.take().or(other.email);
    into.institution = into.institution.take().or(other.institution);
    into.status = into.status.upgrade(other.status);
    into.invited = earliest(into.invited, other.invited);
    into.agreed = earliest(into.agreed, other.agreed);
    // Deadlines only move later when extended.
    into.due = into.due.max(other.due);
    into.returned = earliest(into.returned, other.returned);
    into.recommendation = into.recommendation.take().or(other.recommendation);
    into.report_url = into.report_url.take().or(other.report_url);
    into.contacted_at = earliest(into.contacted_at, other.contacted_at);
    into.accepted_at = earliest(into.accepted_at, other.accepted_at);
    for id in other.email_evidence {
        if !into.email_evidence.contains(&id) {
            into.email_evidence.push(id);
        }
    }
    into.match_confidence = into.match_confidence.max(other.match_confidence);
}

fn referee_quality(r: &Referee) -> f64 {
    let mut score = 0.0;
    if !r.name.is_empty() {
        score += 0.2;
    }
    if r.email.is_some() {
        score += 0.2;
    }
    if r.status != RefereeStatus::Unknown {
        score += 0.15;
    }
    if r.invited.is_some() {
        score += 0.15;
    }
    if r.agreed.is_some() || r.status == RefereeStatus::Declined {
        score += 0.1;
    }
    if r.due.is_some() {
        score += 0.1;
    }
    if !r.email_evidence.is_empty() {
        score += 0.1;
    }
    round(score)
}

fn manuscript_quality(m: &Manuscript) -> f64 {
    let mut own = 0.0;
    if !m.title.is_empty() {
        own += 0.25;
    }
    if m.journal.manuscript_id_pattern().is_match(&m.id) {
        own += 0.25;
    }
    if m.submitted.is_some() {
        own += 0.15;
    }
    if m.status.is_some() {
        own += 0.1;
    }
    if !m.authors.is_empty() || m.corresponding_author.is_some() {
        own += 0.15;
    }
    if m.associate_editor.is_some() || m.detail_url.is_some() {
        own += 0.1;
    }
    if m.referees.is_empty() {
        return round(own);
    }
    let referees = m.referees.iter().map(|r| r.quality_score).sum::<f64>() / m.referees.len() as f64;
    round(0.5 * own + 0.5 * referees)
}

fn round(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

fn compute_stats(manuscripts: &[Manuscript]) -> ExtractionStats {
    let mut stats = ExtractionStats {
        manuscripts: manuscripts.len(),
        ..ExtractionStats::default()
    };
    for referee in manuscripts.iter().flat_map(|m| m.referees.iter()) {
        stats.referees += 1;
        if referee.email.is_some() {
            stats.referees_with_email += 1;
        }
        if !referee.email_evidence.is_empty() {
            stats.referees_matched += 1;
        }
        *stats.by_status.entry(referee.status).or_default() += 1;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2025, m, d)
    }

    fn create_referee(name: &str, email: Option<&str>) -> Referee {
        let mut r = Referee::new(name);
        r.email = email.map(str::to_string);
        r
    }

    fn create_manuscript(id: &str, referees: Vec<Referee>) -> Manuscript {
        let mut m = Manuscript::new(id, Journal::Mor);
        m.title = "Title".to_string();
        m.referees = referees;
        m
    }

    #[test]
    fn test_is_complete() {
        let mut r = create_referee("Jane Doe", Some("jd@mit.edu"));
        assert!(!Validator::is_complete(&r));
        r.status = RefereeStatus::Agreed;
        r.invited = date(1, 2);
        assert!(Validator::is_complete(&r));
    }

    #[test]
    fn test_dedup_manuscripts_across_revisions() {
        let mut first = create_manuscript("MOR-2024-0101", vec![create_referee("Doe, Jane", None)]);
        first.submitted = date(3, 1);
        let mut second = create_manuscript("mor-2024-0101.r1", vec![create_referee("Jane Doe", Some("JD@MIT.EDU"))]);
        second.title = "A longer title".to_string();
        second.submitted = date(2, 1);
        let mut result = ExtractionResult::new(Journal::Mor, vec![first, second]);

        Validator::validate(&mut result);

        assert_eq!(result.manuscripts.len(), 1);
        let m = &result.manuscripts[0];
        assert_eq!(m.id, "MOR-2024-0101.R1");
        assert_eq!(m.title, "A longer title");
        assert_eq!(m.submitted, date(2, 1));
        assert_eq!(m.referees.len(), 1);
        assert_eq!(m.referees[0].name, "Jane Doe");
        assert_eq!(m.referees[0].email.as_deref(), Some("jd@mit.edu"));
    }

    #[test]
    fn test_merge_referee_fields() {
        let mut a = create_referee("J. Doe", Some("jd@mit.edu"));
        a.status = RefereeStatus::Invited;
        a.invited = date(1, 10);
        a.due = date(3, 1);
        let mut b = create_referee("Jane Doe", Some("jd@mit.edu"));
        b.status = RefereeStatus::Agreed;
        b.invited = date(1, 5);
        b.due = date(4, 1);
        b.email_evidence = vec!["m1".to_string()];

        let merged = dedup_referees(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "Jane Doe");
        assert_eq!(merged[0].status, RefereeStatus::Agreed);
        assert_eq!(merged[0].invited, date(1, 5));
        assert_eq!(merged[0].due, date(4, 1));
        assert_eq!(merged[0].email_evidence, vec!["m1"]);
    }

    #[test]
    fn test_issues_reported() {
        let mut bad_dates = create_referee("Jane Doe", Some("not-an-email"));
        bad_dates.invited = date(2, 1);
        bad_dates.agreed = date(1, 1);
        bad_dates.due = date(1, 15);
        let mut submitted = create_referee("Ada Lovelace", None);
        submitted.status = RefereeStatus::ReportSubmitted;
        let nameless = create_referee("  ", None);

        let mut m = create_manuscript("X-1", vec![bad_dates, submitted, nameless]);
        m.title = String::new();
        let mut result = ExtractionResult::new(Journal::Mor, vec![m]);

        Validator::validate(&mut result);

        let fields: Vec<(&str, Severity)> = result
            .issues
            .iter()
            .map(|i| (i.field.as_str(), i.severity))
            .collect();
        assert!(fields.contains(&("id", Severity::Error)));
        assert!(fields.contains(&("title", Severity::Warning)));
        assert!(fields.contains(&("referee.email", Severity::Warning)));
        assert!(fields.contains(&("referee.name", Severity::Error)));
        assert!(fields.contains(&("referee.agreed", Severity::Warning)));
        assert!(fields.contains(&("referee.due", Severity::Warning)));
        assert!(fields.contains(&("referee.returned", Severity::Warning)));

        let m = &result.manuscripts[0];
        assert_eq!(m.referees.len(), 2);
        assert_eq!(m.referees[0].email, None);
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut result = ExtractionResult::new(
            Journal::Mor,
            vec![create_manuscript("MOR-2024-0101", vec![create_referee("Jane Doe", None)])],
        );
        Validator::validate(&mut result);
        let first_issues = result.issues.clone();
        let first_quality = result.quality_score;
        Validator::validate(&mut result);
        assert_eq!(result.issues, first_issues);
        assert_eq!(result.quality_score, first_quality);
    }

    #[test]
    fn test_validate_is_idempotent_on_dirty_data() {
        let referees = vec![
            create_referee("J. Doe", Some("jd@mit.edu")),
            create_referee("Jane Doe", None),
            create_referee("Jane Doe", Some("jd@mit.edu")),
            create_referee("Ada Lovelace", Some("ada at example")),
            create_referee(" ", None),
        ];
        let mut result = ExtractionResult::new(
            Journal::Mor,
            vec![create_manuscript("MOR-2024-0101", referees)],
        );

        Validator::validate(&mut result);
        let first_manuscripts = result.manuscripts.clone();
        let first_issues = result.issues.clone();
        let names: Vec<&str> = first_manuscripts[0].referees.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Jane Doe", "Ada Lovelace"]);
        let fields: Vec<&str> = first_issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["referee.email", "referee.name"]);

        Validator::validate(&mut result);
        assert_eq!(result.manuscripts, first_manuscripts);
        assert_eq!(result.issues, first_issues);
        assert_eq!(result.stats.referees, 2);
    }

    #[test]
    fn test_merge_manuscript_keeps_longer_optional_text() {
        let mut first = create_manuscript("MOR-2024-0101", Vec::new());
        first.status = Some("Under review".to_string());
        first.associate_editor = Some("R. Roe".to_string());
        first.corresponding_author = Some("Smith".to_string());
        let mut second = create_manuscript("MOR-2024-0101.R1", Vec::new());
        second.status = Some("Under review - awaiting AE recommendation".to_string());
        second.associate_editor = Some("Richard Roe".to_string());

        merge_manuscript(&mut first, second);
        assert_eq!(first.status.as_deref(), Some("Under review - awaiting AE recommendation"));
        assert_eq!(first.associate_editor.as_deref(), Some("Richard Roe"));
        assert_eq!(first.corresponding_author.as_deref(), Some("Smith"));
    }

    #[test]
    fn test_quality_scores_and_stats() {
        let mut full = create_referee("Jane Doe", Some("jd@mit.edu"));
        full.status = RefereeStatus::Agreed;
        full.invited = date(1, 1);
        full.agreed = date(1, 2);
        full.due = date(3, 1);
        full.email_evidence = vec!["m1".to_string()];
        let bare = create_referee("Ada Lovelace", None);

        let mut m = create_manuscript("MOR-2024-0101", vec![full, bare]);
        m.submitted = date(1, 1);
        m.status = Some("Under review".to_string());
        m.authors = vec!["John Smith".to_string()];
        m.associate_editor = Some("Richard Roe".to_string());
        let mut result = ExtractionResult::new(Journal::Mor, vec![m]);

        Validator::validate(&mut result);

        let m = &result.manuscripts[0];
        assert_eq!(m.referees[0].quality_score, 1.0);
        assert_eq!(m.referees[1].quality_score, 0.2);
        assert_eq!(m.quality_score, 0.8);
        assert_eq!(result.quality_score, 0.8);

        assert_eq!(result.stats.manuscripts, 1);
        assert_eq!(result.stats.referees, 2);
        assert_eq!(result.stats.referees_with_email, 1);
        assert_eq!(result.stats.referees_matched, 1);
        assert_eq!(result.stats.by_status.get(&RefereeStatus::Agreed), Some(&1));
        assert_eq!(result.stats.by_status.get(&RefereeStatus::Unknown), Some(&1));
    }

    #[test]
    fn test_empty_result_quality_is_zero() {
        let mut result = ExtractionResult::new(Journal::Sicon, Vec::new());
        Validator::validate(&mut result);
        assert_eq!(result.quality_score, 0.0);
        assert!(result.issues.is_empty());
    }
}
