use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;

use crate::layers::validation::Validator;
use crate::layers::{ExtractionResult, Referee, RefereeStatus, Severity};

pub struct ReportWriter {
    out_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Writes `<journal>_<timestamp>.json` and the matching `.txt` report.
    pub async fn write(&self, result: &ExtractionResult) -> Result<(PathBuf, PathBuf)> {
        create_dir_all(&self.out_dir)
            .await
            .with_context(|| format!("creating output directory {:?}", self.out_dir))?;

        let stem = format!("{}_{}", result.journal.code(), result.extracted_at.format("%Y%m%d_%H%M%S"));
        let json_path = self.out_dir.join(format!("{}.json", stem));
        let text_path = self.out_dir.join(format!("{}.txt", stem));

        tracing::info!("Saving results to: {:?}", json_path);
        let json = serde_json::to_string_pretty(result)?;
        let mut file = File::create(&json_path).await?;
        file.write_all(json.as_bytes()).await?;

        tracing::info!("Saving report to: {:?}", text_path);
        let mut file = File::create(&text_path).await?;
        file.write_all(render_text(result).as_bytes()).await?;

        Ok((json_path, text_path))
    }
}

pub async fn load_result(path: &Path) -> Result<ExtractionResult> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {:?}", path))?;
    let result: ExtractionResult =
        serde_json::from_str(&raw).with_context(|| format!("parsing extraction result {:?}", path))?;
    tracing::info!(
        "Loaded {} manuscripts for {} from {:?}",
        result.manuscripts.len(),
        result.journal,
        path
    );
    Ok(result)
}

fn status_label(status: RefereeStatus) -> &'static str {
    match status {
        RefereeStatus::Unknown => "unknown",
        RefereeStatus::Invited => "invited",
        RefereeStatus::Agreed => "agreed",
        RefereeStatus::Declined => "declined",
        RefereeStatus::Overdue => "overdue",
        RefereeStatus::Terminated => "terminated",
        RefereeStatus::ReportSubmitted => "report submitted",
    }
}

fn referee_line(r: &Referee) -> String {
    let mut line = r.name.clone();
    if let Some(email) = &r.email {
        let _ = write!(line, " <{}>", email);
    }
    let _ = write!(line, " | {}", status_label(r.status));
    for (label, date) in [
        ("invited", r.invited),
        ("agreed", r.agreed),
        ("due", r.due),
        ("returned", r.returned),
    ] {
        if let Some(date) = date {
            let _ = write!(line, " | {} {}", label, date);
        }
    }
    if let Some(at) = r.contacted_at {
        let _ = write!(line, " | emailed {}", at.format("%Y-%m-%d"));
    }
    if let Some(at) = r.accepted_at {
        let _ = write!(line, " | accepted by email {}", at.format("%Y-%m-%d"));
    }
    if let Some(rec) = &r.recommendation {
        let _ = write!(line, " | recommends {}", rec);
    }
    line
}

pub fn render_text(result: &ExtractionResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", result.journal.name(), result.journal.code().to_uppercase());
    let _ = writeln!(out, "Extracted: {}", result.extracted_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Manuscripts: {}", result.manuscripts.len());

    for m in &result.manuscripts {
        let _ = writeln!(out);
        let _ = writeln!(out, "[{}] {}", m.id, if m.title.is_empty() { "(untitled)" } else { &m.title });
        if let Some(status) = &m.status {
            let _ = writeln!(out, "  Status: {}", status);
        }
        if let Some(ae) = &m.associate_editor {
            let _ = writeln!(out, "  AE: {}", ae);
        }
        if let Some(submitted) = m.submitted {
            let _ = writeln!(out, "  Submitted: {}", submitted);
        }
        if let Some(days) = m.days_in_system {
            let _ = writeln!(out, "  Days in system: {}", days);
        }
        if m.referees.is_empty() {
            let _ = writeln!(out, "  Referees: none");
        } else {
            let _ = writeln!(out, "  Referees:");
            for r in &m.referees {
                let _ = writeln!(out, "    - {}", referee_line(r));
            }
        }
    }

    let stats = &result.stats;
    let _ = writeln!(out);
    let _ = writeln!(out, "Summary");
    let _ = writeln!(
        out,
        "  Referees: {} ({} with email, {} matched to messages)",
        stats.referees, stats.referees_with_email, stats.referees_matched
    );
    if !stats.by_status.is_empty() {
        let by_status: Vec<String> = stats
            .by_status
            .iter()
            .map(|(status, count)| format!("{}={}", status_label(*status), count))
            .collect();
        let _ = writeln!(out, "  By status: {}", by_status.join(", "));
    }
    let complete = result
        .manuscripts
        .iter()
        .flat_map(|m| m.referees.iter())
        .filter(|r| Validator::is_complete(r))
        .count();
    let _ = writeln!(out, "  Complete referee records: {}/{}", complete, stats.referees);
    let _ = writeln!(out, "  Quality: {:.2}", result.quality_score);

    if !result.issues.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Issues ({})", result.issues.len());
        for issue in &result.issues {
            let level = match issue.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            let _ = writeln!(out, "  [{}] {} {}: {}", level, issue.manuscript_id, issue.field, issue.message);
        }
    }
    out
}
