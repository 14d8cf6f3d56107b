use super::{bucket::Bucket, peer::Peer};
use crate::{
    bits::{Bitmap, Range},
    contact::Contact,
    error::Error,
    BUCKET_SIZE,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, time::Duration};

/// Routing table of contacts, kept in buckets that partition the distance space.
///
/// The outer lock is taken for writing only when the bucket list itself can change (an
/// `update` that may split). Everything else takes it for reading and locks single buckets.
pub(crate) struct RoutingTable {
    id: Bitmap,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(id: Bitmap) -> Self {
        Self {
            id,
            buckets: RwLock::new(vec![Bucket::new(Range::max_range())]),
        }
    }

    pub fn id(&self) -> Bitmap {
        self.id
    }

    /// Inserts or refreshes a contact.
    pub fn update(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }

        let distance = self.id ^ contact.id;

        if self.insert(&self.buckets.read(), contact, distance).is_none() {
            return;
        }

        let mut buckets = self.buckets.write();
        // Someone else may have split or filled the bucket while it was unlocked.
        let index = match self.insert(&buckets, contact, distance) {
            Some(index) => index,
            None => return,
        };

        let bucket = buckets.remove(index);
        let (left, right) = bucket.split();
        buckets.insert(index, right);
        buckets.insert(index, left);

        let index = bucket_index(&buckets, &distance);
        if !buckets[index].update_peer(Peer::new(contact, distance), true) {
            self.log_dropped(&contact);
        }
    }

    /// Refreshes a contact only if it is already in the table.
    pub fn fresh(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }

        let distance = self.id ^ contact.id;
        let buckets = self.buckets.read();
        buckets[bucket_index(&buckets, &distance)].update_peer(Peer::new(contact, distance), false);
    }

    /// Records that the contact did not respond. The contact stays in the table until a
    /// newcomer needs its slot.
    pub fn fail(&self, contact: &Contact) {
        let distance = self.id ^ contact.id;
        let buckets = self.buckets.read();
        buckets[bucket_index(&buckets, &distance)].fail_contact(contact);
    }

    /// Up to `limit` contacts sorted by distance to `target`.
    pub fn get_closest(&self, target: &Bitmap, limit: usize) -> Vec<Contact> {
        let mut contacts: Vec<_> = self
            .buckets
            .read()
            .iter()
            .flat_map(|bucket| bucket.contacts())
            .collect();

        sort_by_distance(&mut contacts, target);
        contacts.truncate(limit);
        contacts
    }

    /// Number of contacts.
    pub fn count(&self) -> usize {
        self.buckets.read().iter().map(|bucket| bucket.len()).sum()
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Random ids to look up in order to refresh the buckets not updated within `interval`.
    pub fn get_ids_for_refresh(&self, interval: Duration) -> Vec<Bitmap> {
        self.buckets
            .read()
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.needs_refresh(interval))
            .map(|(i, _)| Bitmap::rand().prefix(i, false))
            .collect()
    }

    pub fn buckets(&self) -> Vec<(Range, Vec<Contact>)> {
        self.buckets
            .read()
            .iter()
            .map(|bucket| (bucket.range, bucket.contacts()))
            .collect()
    }

    pub fn bucket_info(&self) -> String {
        let info: Vec<_> = self
            .buckets
            .read()
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(i, bucket)| {
                let contacts = bucket.contacts();
                let ids: Vec<_> = contacts.iter().map(|c| c.id.hex_short()).collect();
                format!("bucket {}: ({}) {}", i, contacts.len(), ids.join(", "))
            })
            .collect();

        if info.is_empty() {
            "buckets are empty".to_owned()
        } else {
            info.join("\n")
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        let saved = SavedTable {
            id: self.id.hex(),
            contacts: self
                .buckets
                .read()
                .iter()
                .flat_map(|bucket| bucket.contacts())
                .map(|c| format!("{}-{}-{}", c.id.hex(), c.ip, c.port))
                .collect(),
        };

        Ok(serde_json::to_string(&saved)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        let saved: SavedTable = serde_json::from_str(json)?;
        let table = Self::new(Bitmap::from_hex(&saved.id)?);

        for contact in &saved.contacts {
            table.update(parse_saved_contact(contact)?);
        }

        Ok(table)
    }

    /// Puts the contact into its bucket, locking that bucket only. Returns the index of the
    /// bucket to split if the contact needs room that a split would make.
    fn insert(&self, buckets: &[Bucket], contact: Contact, distance: Bitmap) -> Option<usize> {
        let index = bucket_index(buckets, &distance);

        if buckets[index].update_peer(Peer::new(contact, distance), true) {
            return None;
        }

        if self.should_split(buckets, index, &contact) {
            Some(index)
        } else {
            self.log_dropped(&contact);
            None
        }
    }

    fn log_dropped(&self, contact: &Contact) {
        log::trace!(
            "[{}] bucket full, dropping {}",
            self.id.hex_short(),
            contact
        );
    }

    // Split only full buckets that either hold our own neighbourhood or would take a
    // contact closer than the k-th closest we know.
    fn should_split(&self, buckets: &[Bucket], index: usize, contact: &Contact) -> bool {
        let bucket = &buckets[index];

        if bucket.has(contact) || !bucket.is_full() {
            return false;
        }

        if bucket.range.start.is_zero() {
            return true;
        }

        let mut contacts: Vec<_> = buckets.iter().flat_map(|b| b.contacts()).collect();
        sort_by_distance(&mut contacts, &self.id);

        match contacts.get(BUCKET_SIZE - 1) {
            Some(kth) => self.id.closer(&contact.id, &kth.id),
            None => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SavedTable {
    id: String,
    contacts: Vec<String>,
}

fn parse_saved_contact(s: &str) -> Result<Contact, Error> {
    let invalid = || Error::InvalidSavedContact(s.to_owned());
    let mut parts = s.splitn(3, '-');

    let id = Bitmap::from_hex(parts.next().ok_or_else(invalid)?)?;
    let ip: IpAddr = parts
        .next()
        .and_then(|ip| ip.parse().ok())
        .ok_or_else(invalid)?;
    let port: u16 = parts
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(invalid)?;

    Ok(Contact::new(id, (ip, port).into()))
}

fn bucket_index(buckets: &[Bucket], distance: &Bitmap) -> usize {
    buckets
        .iter()
        .position(|bucket| bucket.range.contains(distance))
        .unwrap_or_else(|| panic!("no bucket covers distance {}", distance.hex_short()))
}

/// Stable sort by XOR distance to `target`.
pub(crate) fn sort_by_distance(contacts: &mut [Contact], target: &Bitmap) {
    contacts.sort_by_key(|contact| contact.id ^ *target);
}
