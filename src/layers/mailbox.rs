use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures_util::stream::{self, StreamExt};
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::layers::normalize;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Date the mailbox search starts from: `lookback_days` before the earliest submission.
pub fn search_window_start(earliest: NaiveDate, lookback_days: i64) -> Result<NaiveDate> {
    if lookback_days < 0 {
        return Err(anyhow!("lookback of {} days is negative", lookback_days));
    }
    TimeDelta::try_days(lookback_days)
        .and_then(|delta| earliest.checked_sub_signed(delta))
        .ok_or_else(|| anyhow!("lookback of {} days before {} is out of range", lookback_days, earliest))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    pub date: DateTime<Utc>,
}

impl EmailMessage {
    /// Every address on the message, sender first.
    pub fn participants(&self) -> Vec<EmailAddress> {
        std::iter::once(self.from.as_str())
            .chain(self.to.iter().map(String::as_str))
            .flat_map(split_address_list)
            .filter_map(|raw| EmailAddress::parse(&raw))
            .collect()
    }

    pub fn text(&self) -> String {
        format!("{}\n{}", self.subject, self.snippet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    /// Accepts `Jane Doe <jane@x.org>`, `"Doe, Jane" <jane@x.org>` and bare addresses.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
            if open < close {
                let address = normalize::normalize_email(&raw[open + 1..close])?;
                let name = raw[..open].trim().trim_matches('"').trim();
                return Some(Self {
                    name: (!name.is_empty()).then(|| name.to_string()),
                    address,
                });
            }
        }
        normalize::normalize_email(raw).map(|address| Self { name: None, address })
    }
}

/// Splits a header address list on commas that sit outside quotes and angle brackets.
fn split_address_list(header: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let (mut in_quotes, mut in_angle) = (false, false);
    for ch in header.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' => in_angle = true,
            '>' => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Loads a mailbox previously exported as a JSON array of messages.
pub async fn load_export(path: &Path) -> Result<Vec<EmailMessage>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read mailbox export {:?}", path))?;
    let messages: Vec<EmailMessage> = serde_json::from_str(&raw)
        .with_context(|| format!("mailbox export {:?} is not a JSON message list", path))?;
    tracing::info!("Loaded {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn into_message(self) -> Result<EmailMessage> {
        let date = self
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .or_else(|| {
                self.header("Date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
            .ok_or_else(|| anyhow!("message {} has no usable date", self.id))?;

        Ok(EmailMessage {
            from: self.header("From").unwrap_or_default().to_string(),
            to: self
                .header("To")
                .map(|to| split_address_list(to).into_iter().map(|a| a.trim().to_string()).collect::<Vec<_>>())
                .unwrap_or_default(),
            subject: self.header("Subject").unwrap_or_default().to_string(),
            id: self.id,
            thread_id: self.thread_id,
            snippet: self.snippet,
            date,
        })
    }
}

/// Gmail REST v1 reader. The access token comes from the environment; obtaining
/// it is somebody else's job.
pub struct GmailClient {
    client: Client,
    base_url: String,
    access_token: String,
    max_results: usize,
    concurrency: usize,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl GmailClient {
    pub fn new(access_token: impl Into<String>) -> Self {
        // messages.get costs 5 quota units against a 250 units/s per-user budget.
        let quota = Quota::per_second(nonzero!(40u32));

        Self {
            client: Client::new(),
            base_url: GMAIL_API_BASE.to_string(),
            access_token: access_token.into(),
            max_results: 500,
            concurrency: 8,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// `("M172838" OR "MOR-2024-0101") after:2024/01/31`
    pub fn build_query(manuscript_ids: &[String], since: Option<NaiveDate>) -> String {
        let mut ids: Vec<&str> = manuscript_ids
            .iter()
            .map(|id| normalize::base_manuscript_id(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let mut query = ids
            .iter()
            .map(|id| format!("\"{}\"", id))
            .collect::<Vec<_>>()
            .join(" OR ");
        if ids.len() > 1 {
            query = format!("({})", query);
        }
        if let Some(since) = since {
            if !query.is_empty() {
                query.push(' ');
            }
            query.push_str(&format!("after:{}", since.format("%Y/%m/%d")));
        }
        query
    }

    pub async fn search_for_manuscripts(
        &self,
        manuscript_ids: &[String],
        since: Option<NaiveDate>,
    ) -> Result<Vec<EmailMessage>> {
        if manuscript_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.search(&Self::build_query(manuscript_ids, since)).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<EmailMessage>> {
        let ids = self.list_message_ids(query).await?;
        tracing::info!("Gmail query matched {} messages", ids.len());

        let results: Vec<Result<EmailMessage>> = stream::iter(ids)
            .map(|id| async move { self.get_message(&id).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut messages = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping Gmail message: {}", e),
            }
        }
        messages.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn list_message_ids(&self, query: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            self.limiter.until_ready().await;
            let page_size = (self.max_results - ids.len()).min(500);
            let mut url = format!(
                "{}/messages?q={}&maxResults={}",
                self.base_url,
                urlencoding::encode(query),
                page_size
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            tracing::info!("Querying Gmail: {}", url);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(|e| anyhow!("Request failed: {}", e))?;
            if !resp.status().is_success() {
                return Err(anyhow!("Gmail API error: {}", resp.status()));
            }
            let page: ListResponse = resp.json().await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if ids.len() < self.max_results => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(self.max_results);
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.limiter.until_ready().await;
        let url = format!(
            "{}/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=To&metadataHeaders=Subject&metadataHeaders=Date",
            self.base_url,
            urlencoding::encode(id)
        );
        tracing::debug!("Fetching Gmail message {}", id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| anyhow!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(anyhow!("Gmail API error for message {}: {}", id, resp.status()));
        }
        let message: GmailMessage = resp.json().await?;
        message.into_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_email_address() {
        let addr = EmailAddress::parse("\"Doe, Jane\" <Jane.Doe@MIT.edu>").unwrap();
        assert_eq!(addr.name.as_deref(), Some("Doe, Jane"));
        assert_eq!(addr.address, "jane.doe@mit.edu");

        let bare = EmailAddress::parse("x@y.org").unwrap();
        assert_eq!(bare.name, None);
        assert!(EmailAddress::parse("undisclosed-recipients:;").is_none());
    }

    #[test]
    fn test_participants_split_quoted_commas() {
        let message = EmailMessage {
            id: "1".into(),
            thread_id: None,
            from: "Editor <editor@siam.org>".into(),
            to: vec!["\"Doe, Jane\" <jd@mit.edu>, bob@x.org".into()],
            subject: String::new(),
            snippet: String::new(),
            date: Utc::now(),
        };
        let addresses: Vec<String> = message.participants().into_iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec!["editor@siam.org", "jd@mit.edu", "bob@x.org"]);
    }

    #[test]
    fn test_build_query() {
        let ids = vec!["MOR-2024-0101.R1".to_string(), "MOR-2024-0101".to_string(), "MOR-2024-0207".to_string()];
        let since = NaiveDate::from_ymd_opt(2024, 1, 31);
        assert_eq!(
            GmailClient::build_query(&ids, since),
            "(\"MOR-2024-0101\" OR \"MOR-2024-0207\") after:2024/01/31"
        );
        assert_eq!(GmailClient::build_query(&["M172838".to_string()], None), "\"M172838\"");
    }

    #[tokio::test]
    async fn test_load_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","from":"x@y.org","subject":"Hi","date":"2025-01-02T03:04:05Z"}]"#,
        )
        .unwrap();
        let messages = load_export(&path).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].to.is_empty());
    }

    #[tokio::test]
    async fn test_load_export_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_export(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_gmail_search_pages_and_fetches() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m2", "threadId": "t2"}]
            })))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "\"M172838\""))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m1", "threadId": "t1"}],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "m1",
                "threadId": "t1",
                "snippet": "Invitation to review M172838",
                "internalDate": "1736900000000",
                "payload": {"headers": [
                    {"name": "From", "value": "SICON <sicon@siam.org>"},
                    {"name": "To", "value": "\"Doe, Jane\" <jd@mit.edu>"},
                    {"name": "Subject", "value": "SICON M172838 referee invitation"}
                ]}
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "m2",
                "snippet": "Agreed",
                "payload": {"headers": [
                    {"name": "From", "value": "jd@mit.edu"},
                    {"name": "Date", "value": "Thu, 16 Jan 2025 10:00:00 +0000"}
                ]}
            })))
            .mount(&server)
            .await;

        let client = GmailClient::new("test-token")
            .with_base_url(format!("{}/gmail/v1/users/me", server.uri()));
        let messages = client
            .search_for_manuscripts(&["M172838".to_string()], None)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].to, vec!["\"Doe, Jane\" <jd@mit.edu>"]);
        assert_eq!(messages[1].id, "m2");
        assert_eq!(messages[1].date.to_rfc3339(), "2025-01-16T10:00:00+00:00");
    }

    #[test]
    fn test_search_window_start() {
        let earliest = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(search_window_start(earliest, 30).unwrap(), NaiveDate::from_ymd_opt(2025, 1, 30).unwrap());
        assert_eq!(search_window_start(earliest, 0).unwrap(), earliest);
        assert!(search_window_start(earliest, -1).is_err());
        assert!(search_window_start(earliest, i64::MAX).is_err());
        assert!(search_window_start(earliest, 1_000_000_000).is_err());
    }

    #[tokio::test]
    async fn test_gmail_search_stops_at_max_results() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("pageToken", "p2"))
            .and(query_param("maxResults", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m3"}, {"id": "m4"}],
                "nextPageToken": "p3"
            })))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("maxResults", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m1"}, {"id": "m2"}],
                "nextPageToken": "p2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/gmail/v1/users/me/messages/m[123]$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "m0",
                "snippet": "M172838",
                "internalDate": "1736900000000",
                "payload": {"headers": [{"name": "From", "value": "sicon@siam.org"}]}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let client = GmailClient::new("test-token")
            .with_base_url(format!("{}/gmail/v1/users/me", server.uri()))
            .with_max_results(3);
        let messages = client.search("\"M172838\"").await.unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_gmail_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = GmailClient::new("expired").with_base_url(server.uri() + "/gmail/v1/users/me");
        let err = client.search("anything").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
