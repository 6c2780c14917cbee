// Gateway — HTTP client
// GatewayClient implements GatewayApi over the partner's bearer-token JSON API.
//
// Two surfaces:
//   partner_url  PUT/GET /channels, DELETE /channels/{id}, PATCH /channels/{id}/mode
//   base_url     /health, /users/login[/{phone}], /users/logout, /groups, /messages/text
//
// Status, QR and channel-listing reads are retried on RateLimited/Timeout
// with the shared backoff curve. Everything else is sent once: mutations,
// phone pairing (a repeat issues a new code), and the group reads whose
// pacing and API-call budget belong to the sync engine.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::qr::extract_qr;
use super::status_map::{map_participant_rank, map_upstream_status, UpstreamState};
use super::{
    ChannelHealth, ChannelSummary, ErrorKind, GatewayApi, GatewayError, GatewayGroup,
    GatewayResult, GroupMetadata, Participant, PhoneLoginOutcome, ProvisionedChannel, QrOutcome,
    SentMessage,
};
use crate::atoms::error::EngineResult;
use crate::atoms::types::ChannelMode;
use crate::engine::config::GatewayConfig;
use crate::engine::http::{parse_retry_after, redact, retry_delay, truncate_body};

/// Who backs off when a request hits a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Client,
    Caller,
}

pub struct GatewayClient {
    http: Client,
    base_url: String,
    partner_url: String,
    partner_token: String,
    project_id: String,
    max_retries: u32,
    retry_scale: f64,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> EngineResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(GatewayClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            partner_url: config.partner_url.trim_end_matches('/').to_string(),
            partner_token: config.partner_token.clone(),
            project_id: config.project_id.clone(),
            max_retries: config.max_retries,
            retry_scale: config.retry_scale,
        })
    }

    // ── Transport ──────────────────────────────────────────────────────

    async fn call(
        &self,
        method: Method,
        url: &str,
        bearer: &str,
        body: Option<&Value>,
        retry: Retry,
    ) -> GatewayResult<Value> {
        let retries = match retry {
            Retry::Client => self.max_retries,
            Retry::Caller => 0,
        };
        let mut attempt = 0;
        loop {
            let mut req = self
                .http
                .request(method.clone(), url)
                .bearer_auth(bearer)
                .header("Accept", "application/json");
            if let Some(b) = body {
                req = req.json(b);
            }
            debug!("[gateway] {} {} (token {})", method, url, redact(bearer));

            let result = match req.send().await {
                Ok(resp) => read_response(resp).await,
                Err(e) => Err(transport_error(&e)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = retry_delay(attempt, e.retry_after, self.retry_scale).await;
                    warn!(
                        "[gateway] {} {} {:?}, retry {}/{} after {}ms",
                        method, url, e.kind, attempt + 1, retries, delay.as_millis()
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn gate(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn partner(&self, path: &str) -> String {
        format!("{}{}", self.partner_url, path)
    }
}

async fn read_response(resp: Response) -> GatewayResult<Value> {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let text = resp.text().await.unwrap_or_default();

    if let Some(kind) = ErrorKind::from_status(status) {
        let mut err = GatewayError::new(kind, truncate_body(&text)).with_status(status);
        err.retry_after = retry_after;
        return Err(err);
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| {
        warn!("[gateway] Unparseable body [{}]: {}", status, truncate_body(&text));
        GatewayError::new(ErrorKind::Unknown, format!("invalid JSON: {}", e)).with_status(status)
    })
}

fn transport_error(e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        GatewayError::new(ErrorKind::Timeout, e.to_string())
    } else {
        GatewayError::new(ErrorKind::Unknown, e.to_string())
    }
}

fn malformed(what: &str, body: &Value) -> GatewayError {
    let text = body.to_string();
    GatewayError::new(ErrorKind::Unknown, format!("{}: {}", what, truncate_body(&text)))
}

/// Status text lives at `status.text`, `status` or `state` depending on version.
fn status_text(body: &Value) -> Option<&str> {
    body["status"]["text"]
        .as_str()
        .or_else(|| body["status"].as_str())
        .or_else(|| body["state"].as_str())
        .or_else(|| body["instance"]["state"].as_str())
}

// ── Wire payloads ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawGroup {
    id: String,
    #[serde(default, alias = "subject")]
    name: Option<String>,
    #[serde(default, alias = "size")]
    participants_count: Option<u32>,
    #[serde(default)]
    participants: Vec<RawParticipant>,
}

#[derive(Deserialize)]
struct RawParticipant {
    id: String,
    #[serde(default, alias = "role")]
    rank: Option<String>,
}

impl RawGroup {
    fn summary(self) -> GatewayGroup {
        let count = self.participants_count.unwrap_or(self.participants.len() as u32);
        GatewayGroup { name: self.name.unwrap_or_default(), id: self.id, participant_count: count }
    }

    fn metadata(self) -> GroupMetadata {
        GroupMetadata {
            id: self.id,
            name: self.name.unwrap_or_default(),
            participants: self
                .participants
                .into_iter()
                .map(|p| Participant {
                    rank: map_participant_rank(p.rank.as_deref().unwrap_or("member")),
                    id: p.id,
                })
                .collect(),
        }
    }
}

/// Listing bodies come either as a bare array or wrapped under `key`.
fn unwrap_list(body: Value, key: &str) -> Value {
    match body {
        Value::Array(_) => body,
        mut obj => obj.get_mut(key).map(Value::take).unwrap_or(Value::Null),
    }
}

// ── GatewayApi ─────────────────────────────────────────────────────────────

#[async_trait]
impl GatewayApi for GatewayClient {
    async fn create_channel(&self, name: &str) -> GatewayResult<ProvisionedChannel> {
        let body = json!({ "name": name, "projectId": self.project_id });
        let resp = self
            .call(Method::PUT, &self.partner("/channels"), &self.partner_token, Some(&body), Retry::Caller)
            .await?;
        let channel_id = resp["id"].as_str().ok_or_else(|| malformed("create: missing id", &resp))?;
        let token = resp["token"].as_str().ok_or_else(|| malformed("create: missing token", &resp))?;
        info!("[gateway] Channel {} provisioned (token {})", channel_id, redact(token));
        Ok(ProvisionedChannel {
            channel_id: channel_id.to_string(),
            token: token.to_string(),
            name: resp["name"].as_str().unwrap_or(name).to_string(),
        })
    }

    async fn delete_channel(&self, channel_id: &str) -> GatewayResult<()> {
        let url = self.partner(&format!("/channels/{}", urlencoding::encode(channel_id)));
        self.call(Method::DELETE, &url, &self.partner_token, None, Retry::Caller).await?;
        info!("[gateway] Channel {} deleted upstream", channel_id);
        Ok(())
    }

    async fn list_channels(&self) -> GatewayResult<Vec<ChannelSummary>> {
        let resp = self
            .call(Method::GET, &self.partner("/channels"), &self.partner_token, None, Retry::Client)
            .await?;
        let list = unwrap_list(resp, "channels");
        let rows = list.as_array().ok_or_else(|| malformed("channel listing", &list))?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(ChannelSummary {
                    channel_id: row["id"].as_str()?.to_string(),
                    name: row["name"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn set_channel_mode(&self, channel_id: &str, mode: ChannelMode) -> GatewayResult<()> {
        let url = self.partner(&format!("/channels/{}/mode", urlencoding::encode(channel_id)));
        let body = json!({ "mode": mode.as_str() });
        self.call(Method::PATCH, &url, &self.partner_token, Some(&body), Retry::Caller).await?;
        Ok(())
    }

    async fn get_status(&self, token: &str) -> GatewayResult<ChannelHealth> {
        let resp = self.call(Method::GET, &self.gate("/health"), token, None, Retry::Client).await?;
        let raw = status_text(&resp).unwrap_or_default().to_string();
        let me = resp["user"]["id"].as_str().or_else(|| resp["me"].as_str()).map(str::to_string);
        Ok(ChannelHealth { state: map_upstream_status(&raw), raw, me })
    }

    async fn get_qr(&self, token: &str) -> GatewayResult<QrOutcome> {
        let resp = match self.call(Method::GET, &self.gate("/users/login"), token, None, Retry::Client).await {
            Ok(resp) => resp,
            // 409: the account is already logged in.
            Err(e) if e.status == Some(409) => return Ok(QrOutcome::AlreadyAuthenticated),
            Err(e) => return Err(e),
        };
        if status_text(&resp).map(map_upstream_status) == Some(UpstreamState::Connected) {
            return Ok(QrOutcome::AlreadyAuthenticated);
        }
        extract_qr(&resp)
            .map(QrOutcome::Image)
            .ok_or_else(|| malformed("login: no QR payload", &resp))
    }

    async fn login_with_phone(&self, token: &str, phone: &str) -> GatewayResult<PhoneLoginOutcome> {
        let url = self.gate(&format!("/users/login/{}", urlencoding::encode(phone)));
        let resp = match self.call(Method::GET, &url, token, None, Retry::Caller).await {
            Ok(resp) => resp,
            Err(e) if e.status == Some(409) => return Ok(PhoneLoginOutcome::Connected),
            Err(e) => return Err(e),
        };
        if let Some(code) = resp["code"].as_str().filter(|c| !c.is_empty()) {
            return Ok(PhoneLoginOutcome::CodeRequired { code: code.to_string() });
        }
        match status_text(&resp).map(map_upstream_status) {
            Some(UpstreamState::Connected) => Ok(PhoneLoginOutcome::Connected),
            _ => Err(malformed("phone login: neither code nor connected", &resp)),
        }
    }

    async fn logout(&self, token: &str) -> GatewayResult<()> {
        self.call(Method::POST, &self.gate("/users/logout"), token, None, Retry::Caller).await?;
        Ok(())
    }

    async fn list_groups(&self, token: &str, offset: u32, count: u32) -> GatewayResult<Vec<GatewayGroup>> {
        let url = self.gate(&format!("/groups?count={}&offset={}", count, offset));
        let resp = self.call(Method::GET, &url, token, None, Retry::Caller).await?;
        let list = unwrap_list(resp, "groups");
        if list.is_null() {
            return Ok(Vec::new());
        }
        let rows: Vec<RawGroup> = serde_json::from_value(list)
            .map_err(|e| GatewayError::new(ErrorKind::Unknown, format!("group listing: {}", e)))?;
        Ok(rows.into_iter().map(RawGroup::summary).collect())
    }

    async fn get_group(&self, token: &str, group_id: &str) -> GatewayResult<GroupMetadata> {
        let url = self.gate(&format!("/groups/{}", urlencoding::encode(group_id)));
        let resp = self.call(Method::GET, &url, token, None, Retry::Caller).await?;
        let raw: RawGroup = serde_json::from_value(resp)
            .map_err(|e| GatewayError::new(ErrorKind::Unknown, format!("group metadata: {}", e)))?;
        Ok(raw.metadata())
    }

    async fn send_message(&self, token: &str, to: &str, body: &str) -> GatewayResult<SentMessage> {
        let payload = json!({ "to": to, "body": body });
        let resp = self
            .call(Method::POST, &self.gate("/messages/text"), token, Some(&payload), Retry::Caller)
            .await?;
        let id = resp["message"]["id"]
            .as_str()
            .or_else(|| resp["id"].as_str())
            .unwrap_or_default();
        Ok(SentMessage { message_id: id.to_string() })
    }
}
