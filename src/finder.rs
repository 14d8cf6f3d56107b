//! Iterative lookup of the contacts closest to a target.

use crate::{
    bits::Bitmap,
    contact::Contact,
    error::Error,
    message::Request,
    node::{Node, SendOptions},
    routing::sort_by_distance,
    stop::StopGroup,
    ALPHA, BUCKET_SIZE,
};
use futures_util::future;
use std::collections::HashSet;

/// Looks up the `BUCKET_SIZE` contacts closest to `target`. With `find_value`, stops as
/// soon as some node returns contacts stored under `target` and returns those instead.
///
/// The returned flag tells whether a value was found. The lookup ends early, with whatever
/// it found so far, when `parent` is stopped.
pub(crate) async fn find_contacts(
    node: &Node,
    target: Bitmap,
    find_value: bool,
    parent: Option<&StopGroup>,
) -> Result<(Vec<Contact>, bool), Error> {
    let stop = StopGroup::child_of(parent);
    let mut finder = ContactFinder::new(node, target, find_value)?;

    log::debug!(
        "[{}] {} lookup of {} started",
        node.id().hex_short(),
        finder.kind(),
        target.hex_short()
    );

    let mut big_cycle = false;

    loop {
        let improved = tokio::select! {
            improved = finder.cycle(big_cycle) => improved,
            _ = stop.stopped() => {
                log::debug!(
                    "[{}] lookup of {} cancelled",
                    node.id().hex_short(),
                    target.hex_short()
                );
                break;
            }
        };

        if finder.values.is_some() || finder.active.len() >= BUCKET_SIZE {
            break;
        }

        if improved {
            big_cycle = false;
        } else if !big_cycle {
            big_cycle = true;
        } else {
            log::trace!(
                "[{}] lookup of {} not getting closer",
                node.id().hex_short(),
                target.hex_short()
            );
            break;
        }
    }

    let result = finder.into_result();

    log::debug!(
        "[{}] lookup of {} done: {} contacts, found = {}",
        node.id().hex_short(),
        target.hex_short(),
        result.0.len(),
        result.1
    );

    Ok(result)
}

struct ContactFinder<'a> {
    node: &'a Node,
    target: Bitmap,
    find_value: bool,
    /// Contacts yet to be probed, closest first.
    shortlist: Vec<Contact>,
    /// Ids of every contact that ever made it to the shortlist.
    added: HashSet<Bitmap>,
    /// Contacts that responded, closest first.
    active: Vec<Contact>,
    closest: Option<Contact>,
    values: Option<Vec<Contact>>,
}

impl<'a> ContactFinder<'a> {
    fn new(node: &'a Node, target: Bitmap, find_value: bool) -> Result<Self, Error> {
        let shortlist = node.routing_table().get_closest(&target, ALPHA);
        if shortlist.is_empty() {
            return Err(Error::NoContacts);
        }

        let added = shortlist.iter().map(|contact| contact.id).collect();

        Ok(Self {
            node,
            target,
            find_value,
            shortlist,
            added,
            active: Vec::new(),
            closest: None,
            values: None,
        })
    }

    fn kind(&self) -> &'static str {
        if self.find_value {
            "value"
        } else {
            "node"
        }
    }

    /// Probes the next `ALPHA` contacts (`BUCKET_SIZE` in a big cycle) in parallel. Returns
    /// whether some response got us closer to the target.
    async fn cycle(&mut self, big: bool) -> bool {
        let count = if big { BUCKET_SIZE } else { ALPHA };
        let own_id = self.node.id();

        let mut probes = Vec::with_capacity(count);
        while probes.len() < count && !self.shortlist.is_empty() {
            let contact = self.shortlist.remove(0);
            if contact.id != own_id {
                probes.push(contact);
            }
        }

        let node = self.node;
        let target = self.target;
        let find_value = self.find_value;
        let responses = future::join_all(probes.iter().map(|contact| {
            let request = if find_value {
                Request::find_value(target)
            } else {
                Request::find_node(target)
            };
            node.send(*contact, request, SendOptions::default())
        }))
        .await;

        let mut best: Option<Contact> = None;

        for (contact, response) in probes.into_iter().zip(responses) {
            let response = match response {
                Some(response) => response,
                None => continue,
            };

            if self.find_value && response.is_value() {
                log::trace!(
                    "[{}] {} has value for {}",
                    own_id.hex_short(),
                    contact,
                    self.target.hex_short()
                );
                self.values = Some(response.contacts().to_vec());
                return true;
            }

            self.insert_active(contact);

            for returned in response.contacts() {
                if self.added.insert(returned.id) {
                    self.shortlist.push(*returned);
                }

                if best.map_or(true, |b| self.target.closer(&returned.id, &b.id)) {
                    best = Some(*returned);
                }
            }
        }

        sort_by_distance(&mut self.shortlist, &self.target);

        match best {
            Some(best)
                if self
                    .closest
                    .map_or(true, |closest| self.target.closer(&best.id, &closest.id)) =>
            {
                self.closest = Some(best);
                true
            }
            _ => false,
        }
    }

    fn insert_active(&mut self, contact: Contact) {
        if self.active.iter().any(|c| c.id == contact.id) {
            return;
        }

        let distance = contact.id ^ self.target;
        let index = self
            .active
            .partition_point(|c| (c.id ^ self.target) < distance);
        self.active.insert(index, contact);
    }

    fn into_result(mut self) -> (Vec<Contact>, bool) {
        match self.values.take() {
            Some(values) => (values, true),
            None => {
                self.active.truncate(BUCKET_SIZE);
                (self.active, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[tokio::test]
    async fn negative_empty_routing_table() {
        let node = Node::new(Bitmap::rand());

        assert!(matches!(
            find_contacts(&node, Bitmap::rand(), false, None).await,
            Err(Error::NoContacts)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn positive_finds_closest_contacts() {
        let _ = pretty_env_logger::try_init();
        let nodes = test::connected_nodes(10).await;
        let searcher = &nodes[0];
        let target = Bitmap::rand();

        let (contacts, found) = find_contacts(searcher, target, false, None).await.unwrap();

        let mut expected: Vec<_> = nodes[1..]
            .iter()
            .map(|node| node.contact().unwrap())
            .collect();
        sort_by_distance(&mut expected, &target);
        expected.truncate(BUCKET_SIZE);

        assert!(!found);
        assert_eq!(contacts, expected);
        assert!(!contacts.iter().any(|c| c.id == searcher.id()));

        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn positive_finds_value() {
        let _ = pretty_env_logger::try_init();
        let nodes = test::connected_nodes(10).await;
        let hash = Bitmap::rand();
        let announcer = test::dummy_contact().with_peer_port(3333);

        let holder = nodes[1..]
            .iter()
            .min_by_key(|node| node.id() ^ hash)
            .unwrap();
        holder.store().upsert(hash, announcer);

        let (contacts, found) = find_contacts(&nodes[0], hash, true, None).await.unwrap();

        assert!(found);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, announcer.id);
        assert_eq!(contacts[0].peer_port, 3333);

        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn positive_stops_when_cancelled() {
        let nodes = test::connected_nodes(3).await;
        let parent = StopGroup::new();
        parent.stop();

        let (contacts, found) = find_contacts(&nodes[0], Bitmap::rand(), false, Some(&parent))
            .await
            .unwrap();

        assert!(contacts.is_empty());
        assert!(!found);

        for node in &nodes {
            node.shutdown().await;
        }
    }
}
