//! Contact records and reply policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contacts::normalize::{normalize_address, normalize_handle, normalize_phone};

/// How the router treats messages from a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPolicy {
    /// Follow the rules; fall back to the channel default.
    #[default]
    Automatic,
    /// Always reply, even when a rule says otherwise.
    Always,
    /// Drop everything from this contact.
    Never,
    /// Notify the operator, never auto-reply.
    ManualReview,
}

impl fmt::Display for ReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Automatic => "automatic",
            Self::Always => "always",
            Self::Never => "never",
            Self::ManualReview => "manual_review",
        })
    }
}

impl FromStr for ReplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "automatic" | "auto" | "default" => Ok(Self::Automatic),
            "always" => Ok(Self::Always),
            "never" | "ignore" | "block" => Ok(Self::Never),
            "manual_review" | "manual" | "review" | "ask" | "ask_me" => Ok(Self::ManualReview),
            other => Err(format!("unknown reply policy '{other}'")),
        }
    }
}

/// Where a contact record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactSource {
    /// Created on first contact from an unknown identifier.
    Observed,
    /// Imported from an external address book.
    DirectorySync,
    /// Created by an operator command.
    Operator,
}

/// A known correspondent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: Option<String>,
    /// Normalized `+<digits>` numbers.
    pub phones: BTreeSet<String>,
    /// Lowercased mail addresses.
    pub addresses: BTreeSet<String>,
    pub aliases: BTreeSet<String>,
    /// Sender ids that are neither numbers nor addresses (short codes,
    /// alphanumeric sender ids), lowercased.
    #[serde(default)]
    pub handles: BTreeSet<String>,
    pub relationship: Option<String>,
    pub policy: ReplyPolicy,
    /// Free-text guidance fed into reply generation.
    pub instruction: Option<String>,
    pub source: ContactSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(source: ContactSource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: None,
            phones: BTreeSet::new(),
            addresses: BTreeSet::new(),
            aliases: BTreeSet::new(),
            handles: BTreeSet::new(),
            relationship: None,
            policy: ReplyPolicy::default(),
            instruction: None,
            source,
            created_at: now,
            updated_at: now,
        }
    }

    /// Minimal record for an identifier nobody has seen before.
    pub fn observed(identifier: &str) -> Self {
        let mut contact = Self::new(ContactSource::Observed);
        contact.add_identifier(identifier);
        contact
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        if let Some(p) = normalize_phone(phone) {
            self.phones.insert(p);
        }
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        if let Some(a) = normalize_address(address) {
            self.addresses.insert(a);
        }
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn with_policy(mut self, policy: ReplyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// File an identifier under phones, addresses or handles. Returns false
    /// if nothing new was stored.
    pub fn add_identifier(&mut self, identifier: &str) -> bool {
        if let Some(a) = normalize_address(identifier) {
            self.addresses.insert(a)
        } else if let Some(p) = normalize_phone(identifier) {
            self.phones.insert(p)
        } else if let Some(h) = normalize_handle(identifier) {
            self.handles.insert(h)
        } else {
            false
        }
    }

    /// Best human label for notices.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.phones
            .iter()
            .chain(self.addresses.iter())
            .chain(self.handles.iter())
            .next()
            .cloned()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// One entry from an external address book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Result of a directory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Contact),
    NotFound,
    /// Several fuzzy matches; the caller disambiguates.
    Ambiguous(Vec<Contact>),
}
