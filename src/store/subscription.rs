//! Key subscriptions and notification fan-out.
//!
//! The subscriber set of a key lives inside its [`KeyEntry`]; the key set of
//! a session lives inside the [`Session`]. Both halves of that index are
//! only ever mutated while the owning bucket's write lock is held, taking
//! the session's own lock second. Fan-out also happens inside the bucket
//! write-lock critical section: a session observes an event if and only if
//! that critical section saw it subscribed.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{hash, KeyEntry, KvStore};
use crate::protocol::Notification;
use crate::session::Session;
use crate::Result;

/// result of a subscribe call
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// the key existed; the session now observes it
    Subscribed,
    /// no such key at the instant the bucket write lock was held
    KeyNotFound,
}

/// result of an unsubscribe call
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// the observation was removed
    Unsubscribed,
    /// the session was not observing that key (possibly because a racing
    /// delete won the bucket lock first and already ended the subscription)
    NotSubscribed,
}

impl KvStore {
    /// Registers `session` as an observer of `key`.
    ///
    /// Succeeds only if the key exists at the instant the bucket write lock
    /// is taken. Both sides of the session/key index are updated under
    /// bucket write lock then session lock.
    pub fn subscribe(&self, session: &Arc<Session>, key: &str) -> Result<SubscribeOutcome> {
        let index = match hash(key) {
            Some(index) => index,
            None => return Ok(SubscribeOutcome::KeyNotFound),
        };
        let mut bucket = self.write_bucket(index)?;
        let entry = match bucket.get_mut(key) {
            Some(entry) => entry,
            None => return Ok(SubscribeOutcome::KeyNotFound),
        };
        entry.subscribers.insert(session.id, Arc::downgrade(session));
        session.subscribed_keys()?.insert(key.to_string());
        debug!(session = session.id, key, "subscribed");
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Removes `session`'s observation of `key`.
    ///
    /// The key side of the index decides the outcome: when a delete already
    /// ended the subscription, this is a no-op reported as `NotSubscribed`.
    pub fn unsubscribe(&self, session: &Arc<Session>, key: &str) -> Result<UnsubscribeOutcome> {
        let index = match hash(key) {
            Some(index) => index,
            None => return Ok(UnsubscribeOutcome::NotSubscribed),
        };
        let mut bucket = self.write_bucket(index)?;
        let removed = match bucket.get_mut(key) {
            Some(entry) => entry.subscribers.remove(&session.id).is_some(),
            None => false,
        };
        if !removed {
            return Ok(UnsubscribeOutcome::NotSubscribed);
        }
        session.subscribed_keys()?.remove(key);
        debug!(session = session.id, key, "unsubscribed");
        Ok(UnsubscribeOutcome::Unsubscribed)
    }

    /// Ends every observation `session` holds: the disconnect and
    /// sudden-disconnect path. After this returns, no bucket lists the
    /// session and no further notification will be delivered to it.
    pub fn purge_session(&self, session: &Arc<Session>) -> Result<()> {
        let keys = session.subscribed_snapshot()?;
        for key in keys {
            let index = match hash(&key) {
                Some(index) => index,
                None => continue,
            };
            let mut bucket = self.write_bucket(index)?;
            if let Some(entry) = bucket.get_mut(&key) {
                entry.subscribers.remove(&session.id);
            }
            session.subscribed_keys()?.remove(&key);
        }
        // a concurrent delete may already have stripped entries the snapshot
        // still listed; the session side must end empty either way
        session.subscribed_keys()?.clear();
        debug!(session = session.id, "purged");
        Ok(())
    }
}

/// Delivers `Changed(new_value)` to every live subscriber of the entry.
/// Called with the owning bucket's write lock held. Dead sessions are
/// pruned from the subscriber set as a side effect.
pub(crate) fn fan_out_changed(entry: &mut KeyEntry, key: &str) {
    let event = Notification::Changed {
        key: key.to_string(),
        value: entry.value.clone(),
    };
    deliver(entry, &event);
}

/// Delivers `Deleted` to every live subscriber of the entry.
/// Called with the owning bucket's write lock held.
pub(crate) fn fan_out_deleted(entry: &mut KeyEntry, key: &str) {
    let event = Notification::Deleted {
        key: key.to_string(),
    };
    deliver(entry, &event);
}

fn deliver(entry: &mut KeyEntry, event: &Notification) {
    entry.subscribers.retain(|id, weak| match weak.upgrade() {
        Some(session) => {
            session.push_notification(event);
            true
        }
        None => {
            warn!(session = *id, "pruning dead subscriber");
            false
        }
    });
}

/// Removes the deleted key from every subscriber session's key set, still
/// inside the bucket write-lock critical section, so the session side of
/// the index cannot outlive the entry.
pub(crate) fn strip_backlinks(entry: &KeyEntry, key: &str) {
    for weak in entry.subscribers.values() {
        if let Some(session) = weak.upgrade() {
            match session.subscribed_keys() {
                Ok(mut keys) => {
                    keys.remove(key);
                }
                Err(e) => warn!(session = session.id, error = %e, "backlink strip failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use std::fs::File;
    use std::io::Read;
    use tempfile::TempDir;

    struct Fixture {
        session: Arc<Session>,
        notif_reader: File,
        _dir: TempDir,
    }

    fn session_fixture(id: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let notif_path = dir.path().join("notif");
        let notif = File::create(&notif_path).unwrap();
        let notif_reader = File::open(&notif_path).unwrap();
        let session = Arc::new(Session::new(
            id,
            tempfile::tempfile().unwrap(),
            tempfile::tempfile().unwrap(),
            notif,
        ));
        Fixture {
            session,
            notif_reader,
            _dir: dir,
        }
    }

    fn received(fixture: &mut Fixture) -> String {
        let mut text = String::new();
        fixture.notif_reader.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn subscribe_requires_the_key_to_exist() {
        let store = KvStore::new();
        let fx = session_fixture(1);
        assert_eq!(
            store.subscribe(&fx.session, "apple").unwrap(),
            SubscribeOutcome::KeyNotFound
        );
        store.put("apple", "red").unwrap();
        assert_eq!(
            store.subscribe(&fx.session, "apple").unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert!(fx.session.subscribed_keys().unwrap().contains("apple"));
    }

    #[test]
    fn overwrite_notifies_each_subscriber_exactly_once() {
        let store = KvStore::new();
        let mut fx = session_fixture(1);
        store.put("apple", "red").unwrap();
        store.subscribe(&fx.session, "apple").unwrap();

        store.put("apple", "green").unwrap();
        assert_eq!(received(&mut fx), "(apple,green)\n");
    }

    #[test]
    fn delete_notifies_and_ends_the_subscription() {
        let store = KvStore::new();
        let mut fx1 = session_fixture(1);
        let mut fx2 = session_fixture(2);
        store.put("kiwi", "fuzzy").unwrap();
        store.subscribe(&fx1.session, "kiwi").unwrap();
        store.subscribe(&fx2.session, "kiwi").unwrap();

        assert!(store.remove("kiwi").unwrap());
        assert_eq!(received(&mut fx1), "(kiwi,DELETED)\n");
        assert_eq!(received(&mut fx2), "(kiwi,DELETED)\n");
        // both halves of the index are gone
        assert!(fx1.session.subscribed_keys().unwrap().is_empty());
        assert!(fx2.session.subscribed_keys().unwrap().is_empty());

        // recreating the key does not revive old subscriptions
        store.put("kiwi", "new").unwrap();
        store.put("kiwi", "newer").unwrap();
        assert_eq!(received(&mut fx1), "");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = KvStore::new();
        let mut fx = session_fixture(1);
        store.put("pear", "hard").unwrap();
        store.subscribe(&fx.session, "pear").unwrap();
        assert_eq!(
            store.unsubscribe(&fx.session, "pear").unwrap(),
            UnsubscribeOutcome::Unsubscribed
        );
        assert_eq!(
            store.unsubscribe(&fx.session, "pear").unwrap(),
            UnsubscribeOutcome::NotSubscribed
        );
        store.put("pear", "ripe").unwrap();
        assert_eq!(received(&mut fx), "");
    }

    #[test]
    fn unsubscribe_after_delete_reports_not_subscribed() {
        let store = KvStore::new();
        let fx = session_fixture(1);
        store.put("plum", "purple").unwrap();
        store.subscribe(&fx.session, "plum").unwrap();
        store.remove("plum").unwrap();
        assert_eq!(
            store.unsubscribe(&fx.session, "plum").unwrap(),
            UnsubscribeOutcome::NotSubscribed
        );
    }

    #[test]
    fn purge_strips_every_bucket() {
        let store = KvStore::new();
        let mut fx = session_fixture(1);
        for (k, v) in &[("apple", "1"), ("banana", "2"), ("cherry", "3")] {
            store.put(k, v).unwrap();
            store.subscribe(&fx.session, k).unwrap();
        }

        store.purge_session(&fx.session).unwrap();
        assert!(fx.session.subscribed_keys().unwrap().is_empty());

        store.put("apple", "4").unwrap();
        store.put("banana", "5").unwrap();
        store.remove("cherry").unwrap();
        assert_eq!(received(&mut fx), "");
    }

    #[test]
    fn dropped_sessions_are_pruned_on_fan_out() {
        let store = KvStore::new();
        store.put("grape", "sour").unwrap();
        {
            let fx = session_fixture(9);
            store.subscribe(&fx.session, "grape").unwrap();
            // session arc (and its channels) dropped here
        }
        store.put("grape", "sweet").unwrap();
        let index = hash("grape").unwrap();
        let bucket = store.read_bucket(index).unwrap();
        assert!(bucket.get("grape").unwrap().subscribers.is_empty());
    }

    #[test]
    fn failed_notification_write_marks_the_session_draining() {
        let store = KvStore::new();
        store.put("fig", "dry").unwrap();

        // a notification sink opened read-only makes every delivery fail
        let dir = tempfile::tempdir().unwrap();
        let notif_path = dir.path().join("notif");
        File::create(&notif_path).unwrap();
        let broken_sink = File::open(&notif_path).unwrap();
        let session = Arc::new(Session::new(
            6,
            tempfile::tempfile().unwrap(),
            tempfile::tempfile().unwrap(),
            broken_sink,
        ));

        store.subscribe(&session, "fig").unwrap();
        store.put("fig", "fresh").unwrap();
        assert_eq!(session.state(), SessionState::Draining);
    }
}
