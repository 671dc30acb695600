use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Siam,
    ScholarOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Journal {
    Sicon,
    Sifin,
    Mor,
    Mf,
}

static SIAM_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bM\d{5,6}\b").unwrap());
static MOR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bMOR-\d{4}-\d{3,5}(?:\.R\d+)?\b").unwrap());
static MF_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bMAFI-\d{4}-\d{3,5}(?:\.R\d+)?\b").unwrap());

impl Journal {
    pub const ALL: [Journal; 4] = [Journal::Sicon, Journal::Sifin, Journal::Mor, Journal::Mf];

    pub fn code(&self) -> &'static str {
        match self {
            Journal::Sicon => "sicon",
            Journal::Sifin => "sifin",
            Journal::Mor => "mor",
            Journal::Mf => "mf",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Journal::Sicon => "SIAM Journal on Control and Optimization",
            Journal::Sifin => "SIAM Journal on Financial Mathematics",
            Journal::Mor => "Mathematics of Operations Research",
            Journal::Mf => "Mathematical Finance",
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Journal::Sicon | Journal::Sifin => Platform::Siam,
            Journal::Mor | Journal::Mf => Platform::ScholarOne,
        }
    }

    /// Root used to absolutize relative links scraped from portal pages.
    pub fn base_url(&self) -> &'static str {
        match self {
            Journal::Sicon => "https://sicon.siam.org/",
            Journal::Sifin => "https://sifin.siam.org/",
            Journal::Mor => "https://mc.manuscriptcentral.com/mathor/",
            Journal::Mf => "https://mc.manuscriptcentral.com/mafi/",
        }
    }

    pub fn manuscript_id_pattern(&self) -> &'static Regex {
        match self {
            Journal::Sicon | Journal::Sifin => &SIAM_ID,
            Journal::Mor => &MOR_ID,
            Journal::Mf => &MF_ID,
        }
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Journal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Journal::ALL
            .into_iter()
            .find(|j| j.code() == wanted)
            .ok_or_else(|| format!("unknown journal '{}' (expected one of sicon, sifin, mor, mf)", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefereeStatus {
    #[default]
    Unknown,
    Invited,
    Agreed,
    Declined,
    Overdue,
    Terminated,
    ReportSubmitted,
}

impl RefereeStatus {
    /// Ordered so that merging two observations keeps the furthest-along one.
    pub fn rank(&self) -> u8 {
        match self {
            RefereeStatus::Unknown => 0,
            RefereeStatus::Invited => 1,
            RefereeStatus::Declined => 2,
            RefereeStatus::Terminated => 2,
            RefereeStatus::Agreed => 3,
            RefereeStatus::Overdue => 4,
            RefereeStatus::ReportSubmitted => 5,
        }
    }

    pub fn parse(text: &str) -> Self {
        let lower = text.to_lowercase();
        // Order matters: "report submitted" must win over "submitted" dates, "declined" over "invited".
        const TABLE: &[(&str, RefereeStatus)] = &[
            ("report submitted", RefereeStatus::ReportSubmitted),
            ("review returned", RefereeStatus::ReportSubmitted),
            ("report received", RefereeStatus::ReportSubmitted),
            ("completed", RefereeStatus::ReportSubmitted),
            ("received", RefereeStatus::ReportSubmitted),
            ("declined", RefereeStatus::Declined),
            ("unassigned", RefereeStatus::Terminated),
            ("terminated", RefereeStatus::Terminated),
            ("contract ended", RefereeStatus::Terminated),
            ("overdue", RefereeStatus::Overdue),
            ("accepted", RefereeStatus::Agreed),
            ("agreed", RefereeStatus::Agreed),
            ("awaiting response", RefereeStatus::Invited),
            ("invited", RefereeStatus::Invited),
            ("pending", RefereeStatus::Invited),
        ];
        TABLE
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, status)| *status)
            .unwrap_or(RefereeStatus::Unknown)
    }

    pub fn upgrade(self, other: RefereeStatus) -> RefereeStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Referee {
    pub name: String,
    pub email: Option<String>,
    pub institution: Option<String>,
    #[serde(default)]
    pub status: RefereeStatus,
    pub invited: Option<NaiveDate>,
    pub agreed: Option<NaiveDate>,
    pub due: Option<NaiveDate>,
    pub returned: Option<NaiveDate>,
    pub recommendation: Option<String>,
    pub report_url: Option<String>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub email_evidence: Vec<String>,
    #[serde(default)]
    pub match_confidence: f64,
    #[serde(default)]
    pub quality_score: f64,
}

impl Referee {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Manuscript {
    pub id: String,
    pub journal: Journal,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub corresponding_author: Option<String>,
    pub submitted: Option<NaiveDate>,
    pub status: Option<String>,
    pub associate_editor: Option<String>,
    pub days_in_system: Option<u32>,
    pub pdf_url: Option<String>,
    pub detail_url: Option<String>,
    #[serde(default)]
    pub referees: Vec<Referee>,
    #[serde(default)]
    pub quality_score: f64,
}

impl Manuscript {
    pub fn new(id: impl Into<String>, journal: Journal) -> Self {
        Self {
            id: id.into(),
            journal,
            title: String::new(),
            authors: Vec::new(),
            corresponding_author: None,
            submitted: None,
            status: None,
            associate_editor: None,
            days_in_system: None,
            pdf_url: None,
            detail_url: None,
            referees: Vec::new(),
            quality_score: 0.0,
        }
    }

    pub fn base_id(&self) -> &str {
        normalize::base_manuscript_id(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub manuscript_id: String,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub manuscripts: usize,
    pub referees: usize,
    pub referees_with_email: usize,
    pub referees_matched: usize,
    pub by_status: BTreeMap<RefereeStatus, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub journal: Journal,
    pub extracted_at: DateTime<Utc>,
    pub manuscripts: Vec<Manuscript>,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub stats: ExtractionStats,
    #[serde(default)]
    pub quality_score: f64,
}

impl ExtractionResult {
    pub fn new(journal: Journal, manuscripts: Vec<Manuscript>) -> Self {
        Self {
            journal,
            extracted_at: Utc::now(),
            manuscripts,
            issues: Vec::new(),
            stats: ExtractionStats::default(),
            quality_score: 0.0,
        }
    }
}

/// Inputs for one extraction run: pages saved from the portal by whatever drove the browser.
pub struct ExtractionQuery {
    pub journal: Journal,
    pub dashboard: std::path::PathBuf,
    pub details: Option<std::path::PathBuf>,
}

pub mod table;
pub mod normalize;
pub mod extraction;
pub mod siam;
pub mod scholarone;
pub mod mailbox;
pub mod resolution;
pub mod validation;
pub mod report;
