//! Contact directory: identity resolution and per-contact reply policy.
//!
//! Resolution order for a query:
//! 1. exact normalized phone
//! 2. exact lowercase address
//! 3. exact sender handle (short codes, alphanumeric sender ids)
//! 4. display name (exact, then substring)
//! 5. alias (exact, then substring)
//! 6. exact relationship label
//!
//! The first stage with any hit wins. Fuzzy stages may return several
//! contacts; the caller decides what to do with them.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::contacts::model::{Contact, ContactSource, DirectoryEntry, Lookup, ReplyPolicy};
use crate::contacts::normalize::{normalize_address, normalize_handle, normalize_phone};
use crate::error::DatabaseError;
use crate::store::{RecordStore, kinds, list_records, put_record};

/// Counts from a bulk directory merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub merged: usize,
    pub skipped: usize,
}

/// Store-backed directory with an in-memory cache.
pub struct ContactDirectory {
    store: Arc<dyn RecordStore>,
    contacts: RwLock<Vec<Contact>>,
}

impl ContactDirectory {
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self, DatabaseError> {
        let contacts: Vec<Contact> = list_records(store.as_ref(), kinds::CONTACT).await?;
        info!(count = contacts.len(), "Contact directory loaded");
        Ok(Self {
            store,
            contacts: RwLock::new(contacts),
        })
    }

    /// All contacts matching `query` at the first resolution stage that hits.
    pub async fn resolve(&self, query: &str) -> Vec<Contact> {
        let contacts = self.contacts.read().await;
        resolve_in(&contacts, query)
            .into_iter()
            .map(|i| contacts[i].clone())
            .collect()
    }

    /// Single-result view of [`resolve`](Self::resolve).
    pub async fn lookup(&self, query: &str) -> Lookup {
        let mut found = self.resolve(query).await;
        match found.len() {
            0 => Lookup::NotFound,
            1 => Lookup::Found(found.remove(0)),
            _ => Lookup::Ambiguous(found),
        }
    }

    /// Resolve a sender identifier, creating a minimal record if unknown.
    pub async fn find_or_create(&self, identifier: &str) -> Result<Contact, DatabaseError> {
        if let Some(existing) = self.resolve(identifier).await.into_iter().next() {
            return Ok(existing);
        }

        let mut contacts = self.contacts.write().await;
        // Another task may have created it while we waited for the lock.
        if let Some(&i) = resolve_in(&contacts, identifier).first() {
            return Ok(contacts[i].clone());
        }

        let contact = Contact::observed(identifier);
        self.persist(&contact).await?;
        debug!(id = %contact.id, identifier, "Created contact for unknown identifier");
        contacts.push(contact.clone());
        Ok(contact)
    }

    /// Insert a fully-specified contact (operator-created or test fixture).
    pub async fn insert(&self, contact: Contact) -> Result<(), DatabaseError> {
        self.persist(&contact).await?;
        self.contacts.write().await.push(contact);
        Ok(())
    }

    /// Update instruction and/or policy for the contact `query` names.
    ///
    /// Only a unique match is mutated; ambiguity is returned untouched.
    pub async fn set_policy(
        &self,
        query: &str,
        instruction: Option<String>,
        policy: Option<ReplyPolicy>,
    ) -> Result<Lookup, DatabaseError> {
        let mut contacts = self.contacts.write().await;
        let hits = resolve_in(&contacts, query);
        let idx = match hits.as_slice() {
            [] => return Ok(Lookup::NotFound),
            [i] => *i,
            many => {
                return Ok(Lookup::Ambiguous(
                    many.iter().map(|&i| contacts[i].clone()).collect(),
                ));
            }
        };

        let mut updated = contacts[idx].clone();
        if let Some(instruction) = instruction {
            updated.instruction = Some(instruction).filter(|s| !s.trim().is_empty());
        }
        if let Some(policy) = policy {
            updated.policy = policy;
        }
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        info!(
            contact = %updated.label(),
            policy = %updated.policy,
            "Contact policy updated"
        );
        contacts[idx] = updated.clone();
        Ok(Lookup::Found(updated))
    }

    /// Merge external address-book entries.
    ///
    /// Entries match existing contacts by normalized phone (address when the
    /// entry has no phone). On a match only missing fields are filled and a
    /// differing name is appended as an alias; names are never overwritten.
    pub async fn sync_directory(
        &self,
        entries: Vec<DirectoryEntry>,
    ) -> Result<SyncReport, DatabaseError> {
        let mut report = SyncReport::default();
        let mut contacts = self.contacts.write().await;

        for entry in entries {
            let phones: Vec<String> = entry.phones.iter().filter_map(|p| normalize_phone(p)).collect();
            let addresses: Vec<String> = entry
                .addresses
                .iter()
                .filter_map(|a| normalize_address(a))
                .collect();
            let name = entry
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());

            if phones.is_empty() && addresses.is_empty() {
                report.skipped += 1;
                continue;
            }

            let existing = if phones.is_empty() {
                contacts
                    .iter()
                    .position(|c| addresses.iter().any(|a| c.addresses.contains(a)))
            } else {
                contacts
                    .iter()
                    .position(|c| phones.iter().any(|p| c.phones.contains(p)))
            };

            match existing {
                Some(i) => {
                    let mut merged = contacts[i].clone();
                    merged.phones.extend(phones);
                    merged.addresses.extend(addresses);
                    match (&merged.name, name) {
                        (None, Some(n)) => merged.name = Some(n),
                        (Some(current), Some(n)) if !current.eq_ignore_ascii_case(&n) => {
                            merged.aliases.insert(n);
                        }
                        _ => {}
                    }
                    if merged != contacts[i] {
                        merged.updated_at = Utc::now();
                        self.persist(&merged).await?;
                        contacts[i] = merged;
                    }
                    report.merged += 1;
                }
                None => {
                    let mut contact = Contact::new(ContactSource::DirectorySync);
                    contact.name = name;
                    contact.phones.extend(phones);
                    contact.addresses.extend(addresses);
                    self.persist(&contact).await?;
                    contacts.push(contact);
                    report.created += 1;
                }
            }
        }

        info!(
            created = report.created,
            merged = report.merged,
            skipped = report.skipped,
            "Directory sync complete"
        );
        Ok(report)
    }

    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contacts.read().await.is_empty()
    }

    async fn persist(&self, contact: &Contact) -> Result<(), DatabaseError> {
        put_record(
            self.store.as_ref(),
            kinds::CONTACT,
            &contact.id.to_string(),
            contact,
        )
        .await
    }
}

/// Indices of contacts matching `query`, by resolution stage.
fn resolve_in(contacts: &[Contact], query: &str) -> Vec<usize> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    if let Some(phone) = normalize_phone(query) {
        let hits = indices(contacts, |c| c.phones.contains(&phone));
        if !hits.is_empty() {
            return hits;
        }
    }

    if let Some(address) = normalize_address(query) {
        let hits = indices(contacts, |c| c.addresses.contains(&address));
        if !hits.is_empty() {
            return hits;
        }
        // An address never fuzzy-matches a name.
        return Vec::new();
    }

    if let Some(handle) = normalize_handle(query) {
        let hits = indices(contacts, |c| c.handles.contains(&handle));
        if !hits.is_empty() {
            return hits;
        }
    }

    let q = query.to_lowercase();

    let stages: [&dyn Fn(&Contact) -> bool; 5] = [
        &|c| c.name.as_deref().is_some_and(|n| n.to_lowercase() == q),
        &|c| c.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&q)),
        &|c| c.aliases.iter().any(|a| a.to_lowercase() == q),
        &|c| c.aliases.iter().any(|a| a.to_lowercase().contains(&q)),
        &|c| c.relationship.as_deref().is_some_and(|r| r.to_lowercase() == q),
    ];

    for stage in stages {
        let hits = indices(contacts, stage);
        if !hits.is_empty() {
            return hits;
        }
    }
    Vec::new()
}

fn indices(contacts: &[Contact], pred: impl Fn(&Contact) -> bool) -> Vec<usize> {
    contacts
        .iter()
        .enumerate()
        .filter(|(_, c)| pred(c))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn directory() -> (ContactDirectory, Arc<dyn RecordStore>) {
        let store: Arc<dyn RecordStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (
            ContactDirectory::load(Arc::clone(&store)).await.unwrap(),
            store,
        )
    }

    fn ann() -> Contact {
        Contact::new(ContactSource::Operator)
            .with_name("Ann Lee")
            .with_phone("555-123-4567")
            .with_address("ann@example.com")
            .with_alias("annie")
            .with_relationship("sister")
    }

    #[tokio::test]
    async fn resolves_in_documented_order() {
        let (dir, _) = directory().await;
        dir.insert(ann()).await.unwrap();

        assert_eq!(dir.resolve("+1 555 123 4567").await.len(), 1);
        assert_eq!(dir.resolve("ANN@example.com").await.len(), 1);
        assert_eq!(dir.resolve("ann lee").await.len(), 1);
        assert_eq!(dir.resolve("lee").await.len(), 1);
        assert_eq!(dir.resolve("annie").await.len(), 1);
        assert_eq!(dir.resolve("sister").await.len(), 1);
        assert!(dir.resolve("brother").await.is_empty());
    }

    #[tokio::test]
    async fn short_code_sender_is_created_once() {
        let (dir, store) = directory().await;
        let first = dir.find_or_create("72345").await.unwrap();
        let second = dir.find_or_create(" 72345").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.handles.contains("72345"));
        assert_eq!(dir.len().await, 1);

        let reloaded = ContactDirectory::load(store).await.unwrap();
        assert_eq!(reloaded.find_or_create("72345").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn sender_id_can_be_set_to_never() {
        let (dir, _) = directory().await;
        dir.find_or_create("AMAZON").await.unwrap();

        match dir
            .set_policy("amazon", None, Some(ReplyPolicy::Never))
            .await
            .unwrap()
        {
            Lookup::Found(c) => assert_eq!(c.policy, ReplyPolicy::Never),
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(
            dir.find_or_create("AMAZON").await.unwrap().policy,
            ReplyPolicy::Never
        );
    }

    #[tokio::test]
    async fn exact_phone_beats_fuzzy_alias() {
        let (dir, _) = directory().await;
        let owner = Contact::new(ContactSource::Operator)
            .with_name("Owner")
            .with_phone("5551234567");
        let fan = Contact::new(ContactSource::Operator)
            .with_name("Fan")
            .with_alias("5551234567 fan club");
        dir.insert(owner.clone()).await.unwrap();
        dir.insert(fan).await.unwrap();

        let hits = dir.resolve("5551234567").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, owner.id);
    }

    #[tokio::test]
    async fn exact_name_beats_substring() {
        let (dir, _) = directory().await;
        dir.insert(Contact::new(ContactSource::Operator).with_name("Sam"))
            .await
            .unwrap();
        dir.insert(Contact::new(ContactSource::Operator).with_name("Samantha"))
            .await
            .unwrap();

        match dir.lookup("sam").await {
            Lookup::Found(c) => assert_eq!(c.name.as_deref(), Some("Sam")),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fuzzy_matches_return_list() {
        let (dir, _) = directory().await;
        dir.insert(Contact::new(ContactSource::Operator).with_name("Jo Smith"))
            .await
            .unwrap();
        dir.insert(Contact::new(ContactSource::Operator).with_name("Al Smith"))
            .await
            .unwrap();

        match dir.lookup("smith").await {
            Lookup::Ambiguous(list) => assert_eq!(list.len(), 2),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let (dir, store) = directory().await;
        let a = dir.find_or_create("(555) 987-6543").await.unwrap();
        let b = dir.find_or_create("+15559876543").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.source, ContactSource::Observed);
        assert_eq!(dir.len().await, 1);

        let reloaded = ContactDirectory::load(store).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn set_policy_mutates_unique_match() {
        let (dir, store) = directory().await;
        dir.insert(ann()).await.unwrap();

        let result = dir
            .set_policy("annie", Some("keep it short".into()), Some(ReplyPolicy::Never))
            .await
            .unwrap();
        match result {
            Lookup::Found(c) => {
                assert_eq!(c.policy, ReplyPolicy::Never);
                assert_eq!(c.instruction.as_deref(), Some("keep it short"));
            }
            other => panic!("expected Found, got {other:?}"),
        }

        let reloaded = ContactDirectory::load(store).await.unwrap();
        let hits = reloaded.resolve("ann@example.com").await;
        assert_eq!(hits[0].policy, ReplyPolicy::Never);
    }

    #[tokio::test]
    async fn set_policy_leaves_ambiguous_untouched() {
        let (dir, _) = directory().await;
        dir.insert(Contact::new(ContactSource::Operator).with_name("Jo Smith"))
            .await
            .unwrap();
        dir.insert(Contact::new(ContactSource::Operator).with_name("Al Smith"))
            .await
            .unwrap();

        let result = dir
            .set_policy("smith", None, Some(ReplyPolicy::Never))
            .await
            .unwrap();
        assert!(matches!(result, Lookup::Ambiguous(_)));
        for c in dir.resolve("smith").await {
            assert_eq!(c.policy, ReplyPolicy::Automatic);
        }
    }

    #[tokio::test]
    async fn sync_fills_gaps_without_overwriting_name() {
        let (dir, _) = directory().await;
        dir.insert(ann()).await.unwrap();

        let report = dir
            .sync_directory(vec![
                DirectoryEntry {
                    name: Some("Annie L.".into()),
                    phones: vec!["+15551234567".into()],
                    addresses: vec!["ann.work@example.com".into()],
                },
                DirectoryEntry {
                    name: Some("Bob".into()),
                    phones: vec!["555 000 1111".into()],
                    addresses: vec![],
                },
                DirectoryEntry::default(),
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            SyncReport {
                created: 1,
                merged: 1,
                skipped: 1
            }
        );

        let merged = dir.resolve("+15551234567").await.remove(0);
        assert_eq!(merged.name.as_deref(), Some("Ann Lee"));
        assert!(merged.aliases.contains("Annie L."));
        assert!(merged.addresses.contains("ann.work@example.com"));

        let bob = dir.resolve("bob").await.remove(0);
        assert_eq!(bob.source, ContactSource::DirectorySync);
    }

    #[tokio::test]
    async fn sync_fills_missing_name() {
        let (dir, _) = directory().await;
        let observed = dir.find_or_create("5552223333").await.unwrap();
        assert!(observed.name.is_none());

        dir.sync_directory(vec![DirectoryEntry {
            name: Some("Carol".into()),
            phones: vec!["5552223333".into()],
            addresses: vec![],
        }])
        .await
        .unwrap();

        let carol = dir.resolve("carol").await.remove(0);
        assert_eq!(carol.id, observed.id);
        assert!(carol.aliases.is_empty());
    }
}
