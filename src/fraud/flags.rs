use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::config::fraud::FLAG_TTL_DAYS;

/// A bidder account or source address marked as suspicious.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Bidder(String),
    Ip(String),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Bidder(id) => write!(f, "bidder:{id}"),
            Subject::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlaggedEntity {
    pub subject: Subject,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Flagged subjects, read on every risk evaluation. Entries expire after
/// `FLAG_TTL_DAYS`; re-flagging refreshes the expiry.
pub struct FlaggedStore {
    entries: DashMap<Subject, FlaggedEntity>,
}

impl FlaggedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new() })
    }

    pub fn flag(&self, subject: Subject, reason: &str) {
        let now = Utc::now();
        self.flag_until(subject, reason, now + Duration::days(FLAG_TTL_DAYS));
    }

    pub fn flag_until(&self, subject: Subject, reason: &str, expires_at: DateTime<Utc>) {
        let entity = FlaggedEntity {
            subject,
            reason: reason.to_string(),
            flagged_at: Utc::now(),
            expires_at,
        };
        info!(
            subject = %entity.subject,
            reason = %entity.reason,
            flagged_at = %entity.flagged_at,
            expires_at = %entity.expires_at,
            "subject flagged"
        );
        self.entries.insert(entity.subject.clone(), entity);
    }

    /// Expired entries are treated as absent even before the purge runs.
    pub fn is_flagged(&self, subject: &Subject) -> bool {
        self.entries
            .get(subject)
            .map(|e| e.expires_at > Utc::now())
            .unwrap_or(false)
    }

    pub fn get(&self, subject: &Subject) -> Option<FlaggedEntity> {
        self.entries
            .get(subject)
            .filter(|e| e.expires_at > Utc::now())
            .map(|e| e.value().clone())
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Utc::now();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flagged_subject_is_visible_until_expiry() {
        let store = FlaggedStore::new();
        let subject = Subject::Bidder("mallory".to_string());
        assert!(!store.is_flagged(&subject));

        store.flag(subject.clone(), "coordinated bidding");
        assert!(store.is_flagged(&subject));
        assert_eq!(store.get(&subject).unwrap().reason, "coordinated bidding");
        assert!(!store.is_flagged(&Subject::Ip("mallory".to_string())));
    }

    #[test]
    fn expired_flags_are_ignored_and_purged() {
        let store = FlaggedStore::new();
        let subject = Subject::Ip("10.0.0.1".to_string());
        store.flag_until(subject.clone(), "multi-account", Utc::now() - Duration::seconds(1));

        assert!(!store.is_flagged(&subject));
        assert!(store.get(&subject).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn reflag_refreshes_expiry() {
        let store = FlaggedStore::new();
        let subject = Subject::Bidder("m".to_string());
        store.flag_until(subject.clone(), "old", Utc::now() - Duration::seconds(1));
        store.flag(subject.clone(), "new");

        assert!(store.is_flagged(&subject));
        assert_eq!(store.get(&subject).unwrap().reason, "new");
    }
}
