use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

use twilio_exporter_core::types::{BalanceSnapshot, CallRecord, MessageRecord, UsageRecord};
use twilio_exporter_core::window::ReportWindow;

/// Largest page the list endpoints accept.
const MAX_PAGE_SIZE: usize = 1000;

/// Read-only client for the account resources of the Twilio REST API.
#[derive(Clone)]
pub struct TwilioClient {
    http: Client,
    base_url: Url,
    account_sid: String,
    auth_token: String,
}

impl std::fmt::Debug for TwilioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioClient")
            .field("base_url", &self.base_url.as_str())
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<REDACTED>")
            .finish()
    }
}

impl TwilioClient {
    /// Creates a client authenticating with the account SID and auth token.
    ///
    /// `base_url` must end with a slash so resource paths join beneath it.
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
        }
    }

    pub fn account_sid(&self) -> &str {
        &self.account_sid
    }

    /// Fetches the account balance. The resource holds a single entry.
    pub async fn fetch_balance(&self) -> Result<Vec<BalanceSnapshot>, TwilioError> {
        let url = self.account_url("Balance.json")?;
        let response = self.get(url).send().await?;
        let balance = parse_json::<BalanceSnapshot>(response).await?;
        Ok(vec![balance])
    }

    /// Lists today's usage records, up to `limit` entries.
    pub async fn list_usage_today(&self, limit: u32) -> Result<Vec<UsageRecord>, TwilioError> {
        let url = self.account_url("Usage/Records/Today.json")?;
        self.list::<UsageRecordList>(url, limit).await
    }

    /// Lists calls that started inside `window`, up to `limit` entries.
    pub async fn list_calls(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<CallRecord>, TwilioError> {
        let mut url = self.account_url("Calls.json")?;
        url.query_pairs_mut()
            .append_pair("StartTime>", &format_timestamp(window.start))
            .append_pair("StartTime<", &format_timestamp(window.end));
        self.list::<CallList>(url, limit).await
    }

    /// Lists messages sent inside `window`, up to `limit` entries.
    pub async fn list_messages(
        &self,
        window: &ReportWindow,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, TwilioError> {
        let mut url = self.account_url("Messages.json")?;
        url.query_pairs_mut()
            .append_pair("DateSent>", &format_timestamp(window.start))
            .append_pair("DateSent<", &format_timestamp(window.end));
        self.list::<MessageList>(url, limit).await
    }

    /// Follows `next_page_uri` until `limit` records are collected or the list ends.
    async fn list<P>(&self, mut url: Url, limit: u32) -> Result<Vec<P::Item>, TwilioError>
    where
        P: ListPage,
    {
        let limit = limit as usize;
        url.query_pairs_mut()
            .append_pair("PageSize", &limit.min(MAX_PAGE_SIZE).to_string());

        let mut records = Vec::new();
        loop {
            let response = self.get(url).send().await?;
            let page = parse_json::<P>(response).await?;
            let (items, next_page_uri) = page.into_parts();
            let exhausted = items.is_empty();
            records.extend(items);

            if records.len() >= limit || exhausted {
                break;
            }
            match next_page_uri.filter(|uri| !uri.is_empty()) {
                Some(next) => url = self.base_url.join(&next)?,
                None => break,
            }
        }
        records.truncate(limit);
        Ok(records)
    }

    fn account_url(&self, resource: &str) -> Result<Url, TwilioError> {
        Ok(self
            .base_url
            .join(&format!("Accounts/{}/{resource}", self.account_sid))?)
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
    }
}

/// One page of a Twilio list resource.
trait ListPage: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

#[derive(Debug, Clone, Deserialize)]
struct UsageRecordList {
    #[serde(default)]
    usage_records: Vec<UsageRecord>,
    next_page_uri: Option<String>,
}

impl ListPage for UsageRecordList {
    type Item = UsageRecord;

    fn into_parts(self) -> (Vec<UsageRecord>, Option<String>) {
        (self.usage_records, self.next_page_uri)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CallList {
    #[serde(default)]
    calls: Vec<CallRecord>,
    next_page_uri: Option<String>,
}

impl ListPage for CallList {
    type Item = CallRecord;

    fn into_parts(self) -> (Vec<CallRecord>, Option<String>) {
        (self.calls, self.next_page_uri)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRecord>,
    next_page_uri: Option<String>,
}

impl ListPage for MessageList {
    type Item = MessageRecord;

    fn into_parts(self) -> (Vec<MessageRecord>, Option<String>) {
        (self.messages, self.next_page_uri)
    }
}

/// Errors produced by the Twilio client.
#[derive(Debug, Error)]
pub enum TwilioError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn parse_json<T>(response: Response) -> Result<T, TwilioError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(TwilioError::Status { status, body });
    }

    Ok(response.json().await?)
}
