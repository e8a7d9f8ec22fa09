//! HTTP SMS gateway transport for direct and forwarded-voice replies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::channels::transport::{Outbound, ReplyTransport};
use crate::config::SmsConfig;
use crate::error::ChannelError;

const NAME: &str = "sms";

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread: Option<&'a str>,
}

pub struct SmsGateway {
    client: Client,
    config: SmsConfig,
}

impl SmsGateway {
    pub fn new(config: SmsConfig) -> Result<Self, ChannelError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ChannelError::StartupFailed {
                name: NAME.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReplyTransport for SmsGateway {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, outbound: &Outbound) -> Result<(), ChannelError> {
        let mut request = self.client.post(&self.config.url).json(&SendRequest {
            to: &outbound.target,
            body: &outbound.body,
            thread: outbound.thread.as_deref(),
        });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("SMS gateway request failed: {e}")))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // The gateway no longer has a route to this recipient or thread.
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(ChannelError::Unreachable {
                name: NAME.into(),
                target: outbound.target.clone(),
            }),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(ChannelError::SendFailed {
                    name: NAME.into(),
                    reason: format!("gateway returned {s}: {body}"),
                })
            }
        }
    }
}
