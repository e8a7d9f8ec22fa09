//! SMTP reply transport for the mail channel.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::channels::transport::{Outbound, ReplyTransport};
use crate::config::SmtpConfig;
use crate::error::ChannelError;

const NAME: &str = "email";

/// `Re: <subject>`, without stacking prefixes.
pub fn reply_subject(subject: Option<&str>) -> String {
    match subject.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) if s.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) => s.to_string(),
        Some(s) => format!("Re: {s}"),
        None => "Re: your message".to_string(),
    }
}

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build(&self, outbound: &Outbound) -> Result<Message, ChannelError> {
        Message::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                ChannelError::SendFailed {
                    name: NAME.into(),
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(outbound.target.parse().map_err(|e| ChannelError::Unreachable {
                name: NAME.into(),
                target: format!("{} ({e})", outbound.target),
            })?)
            .subject(reply_subject(outbound.subject.as_deref()))
            .body(outbound.body.clone())
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    fn send_blocking(config: &SmtpConfig, email: &Message) -> Result<(), ChannelError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        transport.send(email).map_err(|e| {
            if e.is_permanent() {
                // 5xx: the server refused this recipient outright.
                ChannelError::Unreachable {
                    name: NAME.into(),
                    target: format!("{e}"),
                }
            } else {
                ChannelError::SendFailed {
                    name: NAME.into(),
                    reason: format!("SMTP send failed: {e}"),
                }
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl ReplyTransport for SmtpMailer {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(&self, outbound: &Outbound) -> Result<(), ChannelError> {
        let email = self.build(outbound)?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP task failed: {e}"),
            })??;
        tracing::info!("Email sent to {}", outbound.target);
        Ok(())
    }
}
