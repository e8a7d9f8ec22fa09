//! Configuration types.
//!
//! Everything is read from the environment at startup. Optional
//! integrations (mail, SMS gateway, inference) are `None` when their
//! anchor variable is unset, which disables that piece.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::contacts::normalize::normalize_identifier;
use crate::error::ConfigError;

const DEFAULT_FALLBACK_REPLY: &str =
    "Thanks for your message. I can't reply right now but will get back to you soon.";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Normalized identities always treated as the operator.
    pub operator_ids: Vec<String>,
    /// Code for remote admin login and destructive confirmations.
    pub admin_code: SecretString,
    pub admin_window: Duration,
    /// How long a proposed destructive action stays confirmable.
    pub pending_expiry: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub db_path: String,
    pub port: u16,
    /// Rolling file logs go here when set.
    pub log_dir: Option<String>,
    /// Whose inbox this is, for reply prompts.
    pub owner_name: String,
    /// Canned reply when generation fails or returns nothing.
    pub fallback_reply: String,
    /// Mail senders whose messages are forwarded voicemail.
    pub voice_forward_senders: Vec<String>,
    pub inference: Option<InferenceConfig>,
    pub mail: Option<MailConfig>,
    pub sms: Option<SmsConfig>,
}

/// Local inference endpoint.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub url: String,
    pub model: String,
    /// Caller-side ceiling on any single inference call.
    pub timeout: Duration,
}

/// Remote mailbox (delta sync) plus optional SMTP for replies.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    /// Bearer token. Missing means sync reports `NoCredential`.
    pub token: Option<SecretString>,
    pub mailbox_folder: String,
    pub poll_interval: Duration,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

/// HTTP SMS gateway for direct-channel replies.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub url: String,
    pub token: Option<SecretString>,
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Vec<String> {
    lookup(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn secret(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<SecretString> {
    lookup(key)
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Tests pass a map instead of the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let operator_ids = list(&lookup, "RELAY_OPERATOR_IDS")
            .iter()
            .map(|id| normalize_identifier(id))
            .collect();

        let inference = match lookup("RELAY_INFERENCE_URL").filter(|v| !v.is_empty()) {
            Some(url) => Some(InferenceConfig {
                url,
                model: lookup("RELAY_INFERENCE_MODEL").unwrap_or_else(|| "llama3.2:3b".into()),
                timeout: Duration::from_secs(parse_or(&lookup, "RELAY_INFERENCE_TIMEOUT_SECS", 20)?),
            }),
            None => None,
        };

        let mail = match lookup("RELAY_MAIL_API_URL").filter(|v| !v.is_empty()) {
            Some(api_url) => {
                let smtp = match lookup("RELAY_SMTP_HOST").filter(|v| !v.is_empty()) {
                    Some(host) => {
                        let username = lookup("RELAY_SMTP_USERNAME").unwrap_or_default();
                        Some(SmtpConfig {
                            port: parse_or(&lookup, "RELAY_SMTP_PORT", 587)?,
                            password: SecretString::from(
                                lookup("RELAY_SMTP_PASSWORD").unwrap_or_default(),
                            ),
                            from_address: lookup("RELAY_SMTP_FROM")
                                .unwrap_or_else(|| username.clone()),
                            username,
                            host,
                        })
                    }
                    None => None,
                };
                Some(MailConfig {
                    api_url,
                    token: secret(&lookup, "RELAY_MAIL_TOKEN"),
                    mailbox_folder: lookup("RELAY_MAIL_FOLDER").unwrap_or_else(|| "inbox".into()),
                    poll_interval: Duration::from_secs(parse_or(&lookup, "RELAY_MAIL_POLL_SECS", 60)?),
                    smtp,
                })
            }
            None => None,
        };

        let sms = lookup("RELAY_SMS_GATEWAY_URL")
            .filter(|v| !v.is_empty())
            .map(|url| SmsConfig {
                url,
                token: secret(&lookup, "RELAY_SMS_GATEWAY_TOKEN"),
            });

        Ok(Self {
            operator_ids,
            admin_code: SecretString::from(lookup("RELAY_ADMIN_CODE").unwrap_or_default()),
            admin_window: Duration::from_secs(60 * parse_or::<u64>(&lookup, "RELAY_ADMIN_WINDOW_MINS", 30)?),
            pending_expiry: Duration::from_secs(parse_or(&lookup, "RELAY_CONFIRM_EXPIRY_SECS", 600)?),
            dedup_ttl: Duration::from_secs(parse_or(&lookup, "RELAY_DEDUP_TTL_SECS", 300)?),
            dedup_capacity: parse_or(&lookup, "RELAY_DEDUP_CAPACITY", 2_000)?,
            db_path: lookup("RELAY_DB_PATH").unwrap_or_else(|| "relay-assist.db".into()),
            port: parse_or(&lookup, "RELAY_PORT", 8787)?,
            log_dir: lookup("RELAY_LOG_DIR").filter(|v| !v.is_empty()),
            owner_name: lookup("RELAY_OWNER_NAME").unwrap_or_else(|| "the owner".into()),
            fallback_reply: lookup("RELAY_FALLBACK_REPLY")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FALLBACK_REPLY.into()),
            voice_forward_senders: list(&lookup, "RELAY_VOICE_FORWARD_SENDERS")
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            inference,
            mail,
            sms,
        })
    }
}

impl Default for RelayConfig {
    /// Defaults with nothing external configured.
    fn default() -> Self {
        // An empty lookup only hits defaults, which always parse.
        match Self::from_lookup(|_| None) {
            Ok(config) => config,
            Err(e) => unreachable!("defaults failed to parse: {e}"),
        }
    }
}
