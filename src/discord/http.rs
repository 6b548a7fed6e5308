//! reqwest-backed Discord REST client

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::NotKeyed};
use reqwest::{Client, Method, multipart};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;

use super::retry::{RetryPolicy, delay_for_attempt, is_recoverable, is_recoverable_transport, parse_retry_after};
use super::{
    Auth, DiscordApi, DiscordApiError, Emoji, FileUpload, Message, MessagePayload, Snowflake,
    Webhook,
};
use crate::config::DiscordConfig;
use crate::{Error, Result};

/// Global request limiter shared by every call
type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Derive the application id from a bot token
///
/// The first dot-separated segment of a bot token is the base64-encoded id.
#[must_use]
pub fn application_id_from_token(token: &str) -> Option<Snowflake> {
    let first = token.split('.').next()?;
    let decoded = STANDARD_NO_PAD.decode(first.trim_end_matches('=')).ok()?;
    std::str::from_utf8(&decoded).ok()?.parse().ok()
}

/// Request body variants
enum Body<'a> {
    Empty,
    Json(serde_json::Value),
    Multipart {
        payload: serde_json::Value,
        files: &'a [FileUpload],
    },
}

/// Discord REST client
pub struct DiscordHttp {
    client: Client,
    api_url: String,
    bot_token: SecretString,
    application_id: Snowflake,
    limiter: SharedLimiter,
    retry: RetryPolicy,
}

impl DiscordHttp {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the application id cannot be derived from the token
    /// or the HTTP client cannot be built
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        let application_id = application_id_from_token(config.bot_token.expose_secret())
            .ok_or_else(|| Error::Config("bot token does not encode an application id".into()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!(
                "DiscordBot (https://github.com/plural-gg/plural-proxy, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()?;

        let rps = NonZeroU32::new(config.rest_rate_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: SecretString::from(config.bot_token.expose_secret().to_string()),
            application_id,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            retry: RetryPolicy::default(),
        })
    }

    fn authorization(&self, auth: Auth<'_>) -> String {
        match auth {
            Auth::Bot => format!("Bot {}", self.bot_token.expose_secret()),
            Auth::Dedicated { token, .. } => format!("Bot {token}"),
        }
    }

    const fn application_for(&self, auth: Auth<'_>) -> Snowflake {
        match auth {
            Auth::Bot => self.application_id,
            Auth::Dedicated { application_id, .. } => application_id,
        }
    }

    /// Send a request with rate limiting and retries, returning the raw body
    async fn send(
        &self,
        auth: Option<Auth<'_>>,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Body<'_>,
        reason: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}{path}", self.api_url);
        let mut attempt = 0;

        loop {
            self.limiter.until_ready().await;

            let mut request = self.client.request(method.clone(), &url).query(query);

            if let Some(auth) = auth {
                request = request.header("Authorization", self.authorization(auth));
            }
            if let Some(reason) = reason {
                request = request.header("X-Audit-Log-Reason", urlencoding::encode(reason).into_owned());
            }

            request = match &body {
                Body::Empty => request,
                Body::Json(value) => request.json(value),
                Body::Multipart { payload, files } => request.multipart(build_form(payload, files)?),
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if is_recoverable_transport(&e) && attempt < self.retry.max_retries => {
                    let delay = delay_for_attempt(&self.retry, attempt, None);
                    tracing::warn!(%method, path, attempt, error = %e, ?delay, "discord request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(Error::Http(e)),
            };

            let status = response.status().as_u16();
            let retry_header = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await?;

            if (200..300).contains(&status) {
                return Ok(text);
            }

            if is_recoverable(status) && attempt < self.retry.max_retries {
                let retry_after = if status == 429 {
                    parse_retry_after(&text, retry_header.as_deref())
                } else {
                    None
                };
                let delay = delay_for_attempt(&self.retry, attempt, retry_after);
                tracing::warn!(%method, path, status, attempt, ?delay, "discord request failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let err = DiscordApiError::from_response(status, &text);
            tracing::debug!(%method, path, status, code = err.code, "discord request rejected");
            return Err(Error::Discord(err));
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        auth: Option<Auth<'_>>,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Body<'_>,
    ) -> Result<T> {
        let text = self.send(auth, method, path, query, body, None).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Build the multipart form for a message with files
fn build_form(payload: &serde_json::Value, files: &[FileUpload]) -> Result<multipart::Form> {
    let mut form = multipart::Form::new().text("payload_json", serde_json::to_string(payload)?);

    for (index, file) in files.iter().enumerate() {
        let mut part = multipart::Part::bytes(file.data.clone()).file_name(file.filename.clone());
        if let Some(content_type) = &file.content_type {
            part = part.mime_str(content_type)?;
        }
        form = form.part(format!("files[{index}]"), part);
    }

    Ok(form)
}

/// Message body with attachment descriptors and the voice flag applied
fn message_body<'a>(payload: &MessagePayload, files: &'a [FileUpload]) -> Result<Body<'a>> {
    if files.is_empty() {
        return Ok(Body::Json(serde_json::to_value(payload)?));
    }

    let mut payload = payload.clone();
    payload.attachments = files
        .iter()
        .enumerate()
        .map(|(index, file)| file.as_payload(index))
        .collect();

    if files.iter().any(FileUpload::is_voice_message) {
        payload.flags = Some(payload.flags.unwrap_or(0) | super::FLAG_VOICE_MESSAGE);
    }

    Ok(Body::Multipart {
        payload: serde_json::to_value(&payload)?,
        files,
    })
}

fn webhook_token(webhook: &Webhook) -> Result<&str> {
    webhook
        .token
        .as_deref()
        .ok_or_else(|| Error::NotFound(format!("webhook {} has no token", webhook.id)))
}

#[async_trait]
impl DiscordApi for DiscordHttp {
    fn application_id(&self) -> Snowflake {
        self.application_id
    }

    async fn create_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        payload: &MessagePayload,
        files: &[FileUpload],
    ) -> Result<Message> {
        self.send_json(
            Some(auth),
            Method::POST,
            &format!("/channels/{channel_id}/messages"),
            &[],
            message_body(payload, files)?,
        )
        .await
    }

    async fn delete_message(
        &self,
        auth: Auth<'_>,
        channel_id: Snowflake,
        message_id: Snowflake,
        reason: Option<&str>,
    ) -> Result<()> {
        self.send(
            Some(auth),
            Method::DELETE,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            &[],
            Body::Empty,
            reason,
        )
        .await
        .map(|_| ())
    }

    async fn execute_webhook(
        &self,
        webhook: &Webhook,
        thread_id: Option<Snowflake>,
        payload: &MessagePayload,
        files: &[FileUpload],
    ) -> Result<Message> {
        let mut query = vec![("wait", "true".to_string())];
        if let Some(thread_id) = thread_id {
            query.push(("thread_id", thread_id.to_string()));
        }

        self.send_json(
            None,
            Method::POST,
            &format!("/webhooks/{}/{}", webhook.id, webhook_token(webhook)?),
            &query,
            message_body(payload, files)?,
        )
        .await
    }

    async fn delete_webhook_message(
        &self,
        webhook: &Webhook,
        message_id: Snowflake,
        thread_id: Option<Snowflake>,
    ) -> Result<()> {
        let query: Vec<(&str, String)> = thread_id
            .map(|id| ("thread_id", id.to_string()))
            .into_iter()
            .collect();

        self.send(
            None,
            Method::DELETE,
            &format!(
                "/webhooks/{}/{}/messages/{message_id}",
                webhook.id,
                webhook_token(webhook)?
            ),
            &query,
            Body::Empty,
            None,
        )
        .await
        .map(|_| ())
    }

    async fn list_webhooks(&self, channel_id: Snowflake) -> Result<Vec<Webhook>> {
        self.send_json(
            Some(Auth::Bot),
            Method::GET,
            &format!("/channels/{channel_id}/webhooks"),
            &[],
            Body::Empty,
        )
        .await
    }

    async fn create_webhook(&self, channel_id: Snowflake, name: &str) -> Result<Webhook> {
        self.send_json(
            Some(Auth::Bot),
            Method::POST,
            &format!("/channels/{channel_id}/webhooks"),
            &[],
            Body::Json(serde_json::json!({ "name": name })),
        )
        .await
    }

    async fn create_application_emoji(
        &self,
        auth: Auth<'_>,
        name: &str,
        image: &str,
    ) -> Result<Emoji> {
        self.send_json(
            Some(auth),
            Method::POST,
            &format!("/applications/{}/emojis", self.application_for(auth)),
            &[],
            Body::Json(serde_json::json!({ "name": name, "image": image })),
        )
        .await
    }

    async fn delete_application_emoji(&self, auth: Auth<'_>, emoji_id: Snowflake) -> Result<()> {
        self.send(
            Some(auth),
            Method::DELETE,
            &format!("/applications/{}/emojis/{emoji_id}", self.application_for(auth)),
            &[],
            Body::Empty,
            None,
        )
        .await
        .map(|_| ())
    }

    async fn get_guild_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<serde_json::Value> {
        self.send_json(
            Some(Auth::Bot),
            Method::GET,
            &format!("/guilds/{guild_id}/members/{user_id}"),
            &[],
            Body::Empty,
        )
        .await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.limiter.until_ready().await;

        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Err(Error::Discord(DiscordApiError {
                status,
                code: 0,
                message: format!("download failed: {url}"),
                retry_after: None,
            }));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_application_id() {
        // "1234567890" base64-encoded without padding
        let token = "MTIzNDU2Nzg5MA.GhIjKl.abcdefghijklmnop";
        assert_eq!(application_id_from_token(token), Some(Snowflake(1_234_567_890)));
    }

    #[test]
    fn rejects_garbage_token() {
        assert_eq!(application_id_from_token("not-a-token"), None);
        assert_eq!(application_id_from_token(""), None);
    }

    #[test]
    fn voice_flag_applied_to_multipart_payload() {
        let files = vec![FileUpload {
            filename: "voice-message.ogg".into(),
            data: vec![1, 2, 3],
            duration_secs: Some(1.5),
            waveform: Some("AAAA".into()),
            ..FileUpload::default()
        }];
        let payload = MessagePayload {
            content: "hi".into(),
            ..MessagePayload::default()
        };

        let Body::Multipart { payload, .. } = message_body(&payload, &files).unwrap() else {
            panic!("expected multipart body");
        };
        assert_eq!(payload["flags"], serde_json::json!(super::super::FLAG_VOICE_MESSAGE));
        assert_eq!(payload["attachments"][0]["filename"], "voice-message.ogg");
    }

    #[test]
    fn json_body_without_files() {
        let payload = MessagePayload {
            content: "hi".into(),
            ..MessagePayload::default()
        };
        assert!(matches!(message_body(&payload, &[]).unwrap(), Body::Json(_)));
    }
}
