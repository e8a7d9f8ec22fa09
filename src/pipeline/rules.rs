//! Rule evaluator: ordered condition/action matching, no LLM involved.
//!
//! Rules are kept newest-first and the first match wins. A match bumps the
//! rule's counter in memory immediately; persisting the new count happens
//! on a spawned task so evaluation never waits on the store. That task runs
//! under the list's write lock and skips rules deleted in the meantime.
//!
//! No match means [`RuleAction::DeferToContactPolicy`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::types::Channel;
use crate::store::{RecordStore, kinds, list_records, put_record};

/// Which message family a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Direct,
    Mail,
}

impl RuleScope {
    /// Forwarded voice arrives as text to reply to, so direct rules cover it.
    pub fn for_channel(channel: Channel) -> Option<Self> {
        match channel {
            Channel::Direct | Channel::ForwardedVoice => Some(Self::Direct),
            Channel::Mail => Some(Self::Mail),
            Channel::Operator => None,
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Mail => "mail",
        })
    }
}

impl FromStr for RuleScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" | "sms" | "text" | "texts" => Ok(Self::Direct),
            "mail" | "email" | "emails" => Ok(Self::Mail),
            other => Err(format!("unknown rule scope '{other}'")),
        }
    }
}

/// How a rule's value is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Substring of the sender identifier or display name.
    SenderContains,
    /// Substring of the body.
    BodyContains,
    /// Substring of the subject. Mail only.
    SubjectContains,
    /// Sender address domain, exact or subdomain. Mail only.
    SenderDomain,
    /// Comma-separated keywords; any one in any field matches.
    AnyKeyword,
    /// Heuristic bulk/marketing detector; the value is ignored. Mail only.
    Promotional,
}

impl ConditionType {
    pub fn allowed_in(&self, scope: RuleScope) -> bool {
        match self {
            Self::SenderContains | Self::BodyContains | Self::AnyKeyword => true,
            Self::SubjectContains | Self::SenderDomain | Self::Promotional => {
                scope == RuleScope::Mail
            }
        }
    }
}

impl FromStr for ConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "sender" | "sender_contains" | "from" => Ok(Self::SenderContains),
            "body" | "body_contains" | "contains" => Ok(Self::BodyContains),
            "subject" | "subject_contains" => Ok(Self::SubjectContains),
            "domain" | "sender_domain" => Ok(Self::SenderDomain),
            "any" | "any_keyword" | "keywords" => Ok(Self::AnyKeyword),
            "promotional" | "promo" | "marketing" => Ok(Self::Promotional),
            other => Err(format!("unknown condition '{other}'")),
        }
    }
}

/// What to do when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    AutoReply,
    SilentDiscard,
    NotifyOnly,
    DeferToContactPolicy,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoReply => "auto_reply",
            Self::SilentDiscard => "silent_discard",
            Self::NotifyOnly => "notify_only",
            Self::DeferToContactPolicy => "defer",
        })
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "auto_reply" | "reply" | "autoreply" => Ok(Self::AutoReply),
            "silent_discard" | "discard" | "ignore" | "silent" => Ok(Self::SilentDiscard),
            "notify_only" | "notify" => Ok(Self::NotifyOnly),
            "defer" | "defer_to_contact_policy" | "default" => Ok(Self::DeferToContactPolicy),
            other => Err(format!("unknown rule action '{other}'")),
        }
    }
}

/// A stored routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub scope: RuleScope,
    pub condition: ConditionType,
    pub value: String,
    pub action: RuleAction,
    #[serde(default)]
    pub match_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Build a rule, rejecting conditions that do not apply to `scope`.
    pub fn new(
        scope: RuleScope,
        condition: ConditionType,
        value: impl Into<String>,
        action: RuleAction,
    ) -> Result<Self, PipelineError> {
        let value = value.into().trim().to_string();
        if !condition.allowed_in(scope) {
            return Err(PipelineError::Rules(format!(
                "{condition:?} does not apply to {scope} rules"
            )));
        }
        if value.is_empty() && condition != ConditionType::Promotional {
            return Err(PipelineError::Rules("rule value is empty".into()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            scope,
            condition,
            value,
            action,
            match_count: 0,
            created_at: Utc::now(),
        })
    }

    /// One-line description for operator listings.
    pub fn describe(&self) -> String {
        format!(
            "[{}] {:?} '{}' -> {} ({} hits)",
            self.scope, self.condition, self.value, self.action, self.match_count
        )
    }
}

/// Parse `"<condition> <value> -> <action>"` into a rule for `scope`.
///
/// The value may be empty for conditions that ignore it
/// (`"promotional -> discard"`).
pub fn parse_rule_spec(scope: RuleScope, spec: &str) -> Result<Rule, PipelineError> {
    let (lhs, action) = spec
        .rsplit_once("->")
        .ok_or_else(|| PipelineError::Rules(format!("expected '<condition> <value> -> <action>', got '{spec}'")))?;
    let lhs = lhs.trim();
    let (condition, value) = lhs.split_once(char::is_whitespace).unwrap_or((lhs, ""));
    let condition: ConditionType = condition.parse().map_err(PipelineError::Rules)?;
    let action: RuleAction = action.parse().map_err(PipelineError::Rules)?;
    Rule::new(scope, condition, value.trim().trim_matches(['"', '\'']), action)
}

/// Message fields a rule can look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleFields<'a> {
    pub sender: &'a str,
    pub sender_name: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub body: &'a str,
}

impl<'a> RuleFields<'a> {
    pub fn from_message(msg: &'a crate::pipeline::types::Message) -> Self {
        Self {
            sender: &msg.sender,
            sender_name: msg.sender_name.as_deref(),
            subject: msg.subject.as_deref(),
            body: &msg.body,
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn matches(condition: ConditionType, value: &str, fields: &RuleFields<'_>) -> bool {
    match condition {
        ConditionType::SenderContains => {
            contains_ci(fields.sender, value)
                || fields.sender_name.is_some_and(|n| contains_ci(n, value))
        }
        ConditionType::BodyContains => contains_ci(fields.body, value),
        ConditionType::SubjectContains => fields.subject.is_some_and(|s| contains_ci(s, value)),
        ConditionType::SenderDomain => {
            let domain = value.trim_start_matches('@').to_lowercase();
            fields
                .sender
                .rsplit_once('@')
                .map(|(_, d)| d.to_lowercase())
                .is_some_and(|d| d == domain || d.ends_with(&format!(".{domain}")))
        }
        ConditionType::AnyKeyword => value
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .any(|k| {
                contains_ci(fields.body, k)
                    || fields.subject.is_some_and(|s| contains_ci(s, k))
                    || contains_ci(fields.sender, k)
            }),
        ConditionType::Promotional => is_promotional(fields),
    }
}

// ── Promotional heuristic ───────────────────────────────────────────

struct PromoPatterns {
    sender: Vec<Regex>,
    subject: Vec<Regex>,
    body: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

static PROMO: LazyLock<PromoPatterns> = LazyLock::new(|| PromoPatterns {
    sender: compile(&[
        r"(?i)^no[\-_.]?reply@",
        r"(?i)@(marketing|newsletter|promo|campaign|news|offers)\b",
        r"(?i)^(mailer[\-_]?daemon|postmaster)@",
        r"(?i)^(deals|offers|promotions|marketing|newsletter)@",
    ]),
    subject: compile(&[
        r"(?i)\bunsubscribe\b",
        r"(?i)\b\d{1,2}% off\b",
        r"(?i)\b(limited time|flash sale|last chance|exclusive offer|don't miss)\b",
    ]),
    body: compile(&[
        r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
        r"(?i)\bunsubscribe\b",
        r"(?i)\bview (this email )?in (your )?browser\b",
    ]),
});

/// Bulk/marketing detector: one strong sender signal, or any two signals.
pub fn is_promotional(fields: &RuleFields<'_>) -> bool {
    let p = &*PROMO;
    let sender_hit = p.sender.iter().any(|r| r.is_match(fields.sender));
    if sender_hit {
        return true;
    }
    let subject_hit = fields
        .subject
        .is_some_and(|s| p.subject.iter().any(|r| r.is_match(s)));
    let body_hits = p.body.iter().filter(|r| r.is_match(fields.body)).count();
    usize::from(subject_hit) + body_hits >= 2
}

// ── Evaluator ───────────────────────────────────────────────────────

struct Entry {
    rule: Rule,
    hits: Arc<AtomicU64>,
}

impl Entry {
    fn snapshot(&self) -> Rule {
        let mut rule = self.rule.clone();
        rule.match_count = self.hits.load(Ordering::Relaxed);
        rule
    }
}

/// Store-backed, newest-first rule list.
pub struct RuleEvaluator {
    store: Arc<dyn RecordStore>,
    rules: Arc<RwLock<Vec<Entry>>>,
}

impl RuleEvaluator {
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self, DatabaseError> {
        let stored: Vec<Rule> = list_records(store.as_ref(), kinds::RULE).await?;
        // Records come back in insertion order; newest goes first.
        let rules = stored
            .into_iter()
            .rev()
            .map(|rule| Entry {
                hits: Arc::new(AtomicU64::new(rule.match_count)),
                rule,
            })
            .collect::<Vec<_>>();
        info!(count = rules.len(), "Rules loaded");
        Ok(Self {
            store,
            rules: Arc::new(RwLock::new(rules)),
        })
    }

    /// Store a rule ahead of every existing one.
    pub async fn add(&self, rule: Rule) -> Result<Rule, PipelineError> {
        put_record(
            self.store.as_ref(),
            kinds::RULE,
            &rule.id.to_string(),
            &rule,
        )
        .await?;
        info!(rule = %rule.describe(), "Rule added");
        self.rules.write().await.insert(
            0,
            Entry {
                hits: Arc::new(AtomicU64::new(rule.match_count)),
                rule: rule.clone(),
            },
        );
        Ok(rule)
    }

    /// Delete every rule. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize, DatabaseError> {
        let mut rules = self.rules.write().await;
        let count = rules.len();
        for entry in rules.iter() {
            self.store
                .delete(kinds::RULE, &entry.rule.id.to_string())
                .await?;
        }
        rules.clear();
        info!(count, "Rules cleared");
        Ok(count)
    }

    /// Current rules, newest first, with live counters.
    pub async fn rules(&self, scope: Option<RuleScope>) -> Vec<Rule> {
        self.rules
            .read()
            .await
            .iter()
            .filter(|e| scope.is_none_or(|s| e.rule.scope == s))
            .map(Entry::snapshot)
            .collect()
    }

    /// First matching rule's action, or defer when nothing matches.
    pub async fn evaluate(
        &self,
        scope: RuleScope,
        fields: &RuleFields<'_>,
    ) -> (RuleAction, Option<Rule>) {
        let rules = self.rules.read().await;
        let Some(entry) = rules
            .iter()
            .filter(|e| e.rule.scope == scope)
            .find(|e| matches(e.rule.condition, &e.rule.value, fields))
        else {
            return (RuleAction::DeferToContactPolicy, None);
        };

        let count = entry.hits.fetch_add(1, Ordering::Relaxed) + 1;
        let mut matched = entry.rule.clone();
        matched.match_count = count;
        debug!(
            rule = %matched.id,
            action = %matched.action,
            count,
            "Rule matched"
        );

        let store = Arc::clone(&self.store);
        let list = Arc::clone(&self.rules);
        let id = matched.id;
        tokio::spawn(async move {
            // The write lock orders counter writes against each other and
            // against clear().
            let list = list.write().await;
            let Some(record) = list.iter().find(|e| e.rule.id == id).map(Entry::snapshot) else {
                debug!(rule = %id, "Rule deleted before its counter was saved");
                return;
            };
            if let Err(e) = put_record(
                store.as_ref(),
                kinds::RULE,
                &record.id.to_string(),
                &record,
            )
            .await
            {
                warn!(rule = %record.id, error = %e, "Failed to persist rule counter");
            }
        });

        (matched.action, Some(matched))
    }
}
