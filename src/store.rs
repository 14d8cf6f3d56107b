use crate::{bits::Bitmap, contact::Contact};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Contacts that announced blobs to us, indexed by blob hash.
#[derive(Default)]
pub(crate) struct ContactStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<Bitmap, HashSet<Bitmap>>,
    contacts: HashMap<Bitmap, Contact>,
}

impl ContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `contact` has the blob. Replaces any previously stored address of the
    /// same contact.
    pub fn upsert(&self, blob_hash: Bitmap, contact: Contact) {
        let mut inner = self.inner.write();
        inner
            .hashes
            .entry(blob_hash)
            .or_default()
            .insert(contact.id);
        inner.contacts.insert(contact.id, contact);
    }

    pub fn get(&self, blob_hash: &Bitmap) -> Vec<Contact> {
        let inner = self.inner.read();
        inner
            .hashes
            .get(blob_hash)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.contacts.get(id).copied())
            .collect()
    }

    pub fn count_stored_hashes(&self) -> usize {
        self.inner.read().hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_upsert_and_get() {
        let store = ContactStore::new();
        let hash = Bitmap::rand();
        let contact = test::dummy_contact().with_peer_port(1000);

        assert!(store.get(&hash).is_empty());

        store.upsert(hash, contact);
        store.upsert(hash, contact.with_peer_port(2000));

        let stored = store.get(&hash);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].peer_port, 2000);
        assert_eq!(store.count_stored_hashes(), 1);
    }

    #[test]
    fn positive_contact_shared_between_hashes() {
        let store = ContactStore::new();
        let (a, b) = (Bitmap::rand(), Bitmap::rand());
        let contact = test::dummy_contact();

        store.upsert(a, contact);
        store.upsert(b, contact);
        store.upsert(b, test::dummy_contact());

        assert_eq!(store.get(&a), vec![contact]);
        assert_eq!(store.get(&b).len(), 2);
        assert_eq!(store.count_stored_hashes(), 2);
    }
}
