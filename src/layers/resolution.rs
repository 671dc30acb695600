use chrono::{DateTime, Utc};
use strsim::jaro_winkler;

use crate::layers::mailbox::EmailMessage;
use crate::layers::normalize::{self, name_key};
use crate::layers::{ExtractionResult, Referee, RefereeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invitation,
    Acceptance,
    Decline,
    Reminder,
    ReportReceived,
    Other,
}

impl MessageKind {
    pub fn classify(message: &EmailMessage) -> Self {
        let text = message.text().to_lowercase();
        const KEYWORDS: &[(MessageKind, &[&str])] = &[
            (
                MessageKind::ReportReceived,
                &["report received", "review submitted", "thank you for your review", "received your report"],
            ),
            (
                MessageKind::Decline,
                &["declined", "unable to review", "cannot review", "not able to review"],
            ),
            (
                MessageKind::Acceptance,
                &["agreed to review", "accepted the invitation", "thank you for agreeing", "has agreed", "accept to review"],
            ),
            (MessageKind::Reminder, &["reminder", "overdue"]),
            (
                MessageKind::Invitation,
                &["invitation to review", "invite you to review", "referee request", "review request", "would you be willing", "referee invitation"],
            ),
        ];
        KEYWORDS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| text.contains(n)))
            .map(|(kind, _)| *kind)
            .unwrap_or(MessageKind::Other)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchScore {
    pub confidence: f64,
    pub by_address: bool,
    pub by_manuscript: bool,
    pub name_similarity: f64,
    /// Address of the participant that looked like the referee.
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub messages_attributed: usize,
    pub referees_matched: usize,
}

pub const DEFAULT_NAME_THRESHOLD: f64 = 0.88;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;

pub struct Resolver {
    name_threshold: f64,
    min_confidence: f64,
}

impl Default for Resolver {
    fn default() -> Self {
        Self {
            name_threshold: DEFAULT_NAME_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

struct Attribution<'m> {
    message: &'m EmailMessage,
    kind: MessageKind,
    score: MatchScore,
}

impl Resolver {
    pub fn new(name_threshold: f64, min_confidence: f64) -> Self {
        Self {
            name_threshold: name_threshold.clamp(0.0, 1.0),
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }

    /// Address match 0.7, manuscript ID 0.3, name evidence up to 0.6 when the
    /// address did not match. Without an address match the ID must be present.
    pub fn score(&self, referee: &Referee, base_id: &str, message: &EmailMessage) -> MatchScore {
        let mut score = MatchScore::default();
        let text = message.text();
        let participants = message.participants();

        if let Some(email) = &referee.email {
            if participants.iter().any(|p| &p.address == email) {
                score.by_address = true;
                score.address = Some(email.clone());
            }
        }

        score.by_manuscript = !base_id.is_empty() && text.to_uppercase().contains(&base_id.to_uppercase());

        let referee_key = name_key(&referee.name);
        for participant in &participants {
            let Some(display_name) = &participant.name else {
                continue;
            };
            let similarity = jaro_winkler(&referee_key, &name_key(display_name));
            tracing::debug!(
                "Candidate: {} vs {} (Similarity: {:.3})",
                referee.name,
                display_name,
                similarity
            );
            if similarity >= self.name_threshold && similarity > score.name_similarity {
                score.name_similarity = similarity;
                if score.address.is_none() {
                    score.address = Some(participant.address.clone());
                }
            }
        }

        let mut name_weight = score.name_similarity * 0.6;
        if name_weight == 0.0 && mentions_name(&referee.name, &text) {
            name_weight = 0.5;
        }

        if !score.by_address && !score.by_manuscript {
            return score;
        }
        let mut confidence = 0.0;
        if score.by_address {
            confidence += 0.7;
        } else {
            confidence += name_weight;
        }
        if score.by_manuscript {
            confidence += 0.3;
        }
        score.confidence = confidence.min(1.0);
        score
    }

    /// Attributes every message to at most one referee per manuscript and folds
    /// the evidence into contact / acceptance dates and status.
    pub fn reconcile(&self, result: &mut ExtractionResult, messages: &[EmailMessage]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for manuscript in &mut result.manuscripts {
            let base_id = manuscript.base_id().to_string();
            let mut attributions: Vec<Vec<Attribution<'_>>> =
                manuscript.referees.iter().map(|_| Vec::new()).collect();

            for message in messages {
                let mut best: Option<(usize, MatchScore)> = None;
                for (idx, referee) in manuscript.referees.iter().enumerate() {
                    let score = self.score(referee, &base_id, message);
                    if score.confidence < self.min_confidence {
                        continue;
                    }
                    if best.as_ref().map_or(true, |(_, b)| score.confidence > b.confidence) {
                        best = Some((idx, score));
                    }
                }
                if let Some((idx, score)) = best {
                    attributions[idx].push(Attribution {
                        message,
                        kind: MessageKind::classify(message),
                        score,
                    });
                    summary.messages_attributed += 1;
                }
            }

            for (referee, mut found) in manuscript.referees.iter_mut().zip(attributions) {
                if found.is_empty() {
                    continue;
                }
                found.sort_by(|a, b| a.message.date.cmp(&b.message.date));
                apply_attributions(referee, &found);
                summary.referees_matched += 1;
                tracing::info!(
                    "Matched {} to {} messages for {} (confidence {:.2})",
                    referee.name,
                    found.len(),
                    base_id,
                    referee.match_confidence
                );
            }
        }

        summary
    }
}

fn apply_attributions(referee: &mut Referee, found: &[Attribution<'_>]) {
    let earliest = |kind: MessageKind| -> Option<DateTime<Utc>> {
        found.iter().find(|a| a.kind == kind).map(|a| a.message.date)
    };

    let contacted = earliest(MessageKind::Invitation).or_else(|| found.first().map(|a| a.message.date));
    referee.contacted_at = match (referee.contacted_at, contacted) {
        (Some(old), Some(new)) => Some(old.min(new)),
        (old, new) => old.or(new),
    };
    if let Some(accepted) = earliest(MessageKind::Acceptance) {
        referee.accepted_at = Some(referee.accepted_at.map_or(accepted, |old| old.min(accepted)));
    }

    for attribution in found {
        let upgrade = match attribution.kind {
            MessageKind::Acceptance => RefereeStatus::Agreed,
            MessageKind::ReportReceived => RefereeStatus::ReportSubmitted,
            MessageKind::Decline => RefereeStatus::Declined,
            MessageKind::Invitation => RefereeStatus::Invited,
            MessageKind::Reminder | MessageKind::Other => RefereeStatus::Unknown,
        };
        referee.status = referee.status.upgrade(upgrade);

        if !referee.email_evidence.contains(&attribution.message.id) {
            referee.email_evidence.push(attribution.message.id.clone());
        }
        referee.match_confidence = referee.match_confidence.max(attribution.score.confidence);
        if referee.email.is_none() {
            referee.email = attribution.score.address.clone();
        }
    }
}

/// Last name as a whole word in the text; short last names also need the first name.
fn mentions_name(name: &str, text: &str) -> bool {
    let Some(last) = normalize::last_name(name) else {
        return false;
    };
    let key = name_key(name);
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| name_key(w))
        .collect();
    if !words.iter().any(|w| *w == last) {
        return false;
    }
    if last.chars().count() >= 3 {
        return true;
    }
    key.split(' ')
        .next()
        .map_or(false, |first| first != last && words.iter().any(|w| w == first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Journal, Manuscript};
    use chrono::TimeZone;

    fn message(id: &str, day: u32, from: &str, to: &str, subject: &str) -> EmailMessage {
        EmailMessage {
            id: id.to_string(),
            thread_id: None,
            from: from.to_string(),
            to: vec![to.to_string()],
            subject: subject.to_string(),
            snippet: String::new(),
            date: Utc.with_ymd_and_hms(2025, 1, day, 9, 0, 0).unwrap(),
        }
    }

    fn create_result() -> ExtractionResult {
        let mut manuscript = Manuscript::new("M172838", Journal::Sicon);
        let mut jane = Referee::new("Jane Doe");
        jane.status = RefereeStatus::Invited;
        manuscript.referees = vec![jane, Referee::new("Li Wei")];
        ExtractionResult::new(Journal::Sicon, vec![manuscript])
    }

    #[test]
    fn test_classify() {
        let m = message("1", 1, "a@b.org", "c@d.org", "SICON M172838: Invitation to review");
        assert_eq!(MessageKind::classify(&m), MessageKind::Invitation);
        let m = message("2", 1, "a@b.org", "c@d.org", "Re: M172838 - Jane Doe has agreed to review");
        assert_eq!(MessageKind::classify(&m), MessageKind::Acceptance);
        let m = message("3", 1, "a@b.org", "c@d.org", "Referee declined: M172838");
        assert_eq!(MessageKind::classify(&m), MessageKind::Decline);
        let m = message("4", 1, "a@b.org", "c@d.org", "Lunch?");
        assert_eq!(MessageKind::classify(&m), MessageKind::Other);
        let m = message("5", 1, "a@b.org", "c@d.org", "Reminder: review of M172838 overdue");
        assert_eq!(MessageKind::classify(&m), MessageKind::Reminder);
        let m = message("6", 1, "a@b.org", "c@d.org", "M172838: report received, thank you");
        assert_eq!(MessageKind::classify(&m), MessageKind::ReportReceived);
    }

    #[test]
    fn test_score_requires_manuscript_or_address() {
        let resolver = Resolver::default();
        let jane = Referee::new("Jane Doe");
        let unrelated = message("1", 2, "Jane Doe <jd@mit.edu>", "me@x.org", "Seminar next week");
        assert_eq!(resolver.score(&jane, "M172838", &unrelated).confidence, 0.0);

        let related = message("2", 2, "Jane Doe <jd@mit.edu>", "me@x.org", "Re: M172838 invitation");
        let score = resolver.score(&jane, "M172838", &related);
        assert!(score.by_manuscript);
        assert!((score.confidence - 0.9).abs() < 1e-9);
        assert_eq!(score.address.as_deref(), Some("jd@mit.edu"));
    }

    #[test]
    fn test_score_address_match() {
        let resolver = Resolver::default();
        let mut jane = Referee::new("Jane Doe");
        jane.email = Some("jd@mit.edu".to_string());
        let m = message("1", 2, "editor@siam.org", "jd@mit.edu", "Your review");
        let score = resolver.score(&jane, "M172838", &m);
        assert!(score.by_address);
        assert!((score.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_score_last_name_in_text() {
        let resolver = Resolver::default();
        let jane = Referee::new("Jane Doe");
        let m = message("1", 2, "editor@siam.org", "ae@x.org", "M172838: Dr. Doe has agreed to review");
        assert!((resolver.score(&jane, "M172838", &m).confidence - 0.8).abs() < 1e-9);

        let li = Referee::new("Wei Li");
        let m = message("2", 2, "editor@siam.org", "ae@x.org", "M172838: Li agreed");
        assert!(resolver.score(&li, "M172838", &m).confidence < 0.6);
        let m = message("3", 2, "editor@siam.org", "ae@x.org", "M172838: Wei Li agreed");
        assert!(resolver.score(&li, "M172838", &m).confidence >= 0.6);
    }

    #[test]
    fn test_reconcile_sets_dates_and_status() {
        let mut result = create_result();
        let messages = vec![
            message("m2", 5, "\"Doe, Jane\" <jd@mit.edu>", "sicon@siam.org", "Re: M172838 - I have agreed to review"),
            message("m1", 3, "sicon@siam.org", "Jane Doe <jd@mit.edu>", "M172838 invitation to review"),
            message("m3", 4, "sicon@siam.org", "someone@else.org", "M172838 status"),
        ];

        let summary = Resolver::default().reconcile(&mut result, &messages);
        assert_eq!(summary.messages_attributed, 2);
        assert_eq!(summary.referees_matched, 1);

        let jane = &result.manuscripts[0].referees[0];
        assert_eq!(jane.contacted_at, Some(Utc.with_ymd_and_hms(2025, 1, 3, 9, 0, 0).unwrap()));
        assert_eq!(jane.accepted_at, Some(Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap()));
        assert_eq!(jane.status, RefereeStatus::Agreed);
        assert_eq!(jane.email.as_deref(), Some("jd@mit.edu"));
        assert_eq!(jane.email_evidence, vec!["m1", "m2"]);

        let li = &result.manuscripts[0].referees[1];
        assert!(li.email_evidence.is_empty());
        assert_eq!(li.contacted_at, None);
    }

    #[test]
    fn test_reconcile_attributes_message_once() {
        let mut result = create_result();
        result.manuscripts[0].referees[1] = Referee::new("Jane Doe");
        let messages = vec![message("m1", 3, "sicon@siam.org", "Jane Doe <jd@mit.edu>", "M172838 invitation")];

        let summary = Resolver::default().reconcile(&mut result, &messages);
        assert_eq!(summary.messages_attributed, 1);
        assert_eq!(result.manuscripts[0].referees[0].email_evidence, vec!["m1"]);
        assert!(result.manuscripts[0].referees[1].email_evidence.is_empty());
    }

    #[test]
    fn test_reconcile_status_from_message_kinds() {
        let mut result = create_result();
        result.manuscripts[0].referees[1].status = RefereeStatus::Agreed;
        let messages = vec![
            message("m1", 3, "Jane Doe <jd@mit.edu>", "sicon@siam.org", "Re: M172838 - unable to review"),
            message("m2", 4, "Li Wei <lw@nus.edu.sg>", "sicon@siam.org", "Re: M172838 - unable to review"),
        ];

        Resolver::default().reconcile(&mut result, &messages);
        assert_eq!(result.manuscripts[0].referees[0].status, RefereeStatus::Declined);
        // A decline never undoes an agreement already on record.
        assert_eq!(result.manuscripts[0].referees[1].status, RefereeStatus::Agreed);
    }

    #[test]
    fn test_reconcile_report_received_and_reminder() {
        let mut result = create_result();
        let messages = vec![
            message("m1", 3, "sicon@siam.org", "Jane Doe <jd@mit.edu>", "Reminder: M172838 review overdue"),
            message("m2", 6, "sicon@siam.org", "Li Wei <lw@nus.edu.sg>", "M172838: report received"),
        ];

        Resolver::default().reconcile(&mut result, &messages);
        let jane = &result.manuscripts[0].referees[0];
        assert_eq!(jane.status, RefereeStatus::Invited);
        assert_eq!(jane.email_evidence, vec!["m1"]);
        let li = &result.manuscripts[0].referees[1];
        assert_eq!(li.status, RefereeStatus::ReportSubmitted);
        assert_eq!(li.email.as_deref(), Some("lw@nus.edu.sg"));
    }
}
