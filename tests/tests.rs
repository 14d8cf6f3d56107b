use lbry_dht::{
    AnnounceAction, Bitmap, BootstrapNode, Dht, Error, DEFAULT_BOOTSTRAP_CHECK_INTERVAL,
};
use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{sync::mpsc, time};

async fn start_bootstrap(addr: SocketAddr) -> BootstrapNode {
    let bootstrap =
        BootstrapNode::new(Bitmap::rand(), Duration::ZERO, DEFAULT_BOOTSTRAP_CHECK_INTERVAL);
    bootstrap.bind(addr).await.unwrap();
    bootstrap
}

async fn start_node(addr: SocketAddr, seed: SocketAddr) -> Dht {
    let dht = Dht::builder()
        .set_address(addr)
        .set_seed_nodes([seed.to_string()])
        .start()
        .await
        .unwrap();

    time::timeout(Duration::from_secs(30), dht.wait_until_joined())
        .await
        .unwrap();

    dht
}

async fn start_seed() -> Dht {
    let dht = Dht::builder()
        .set_address(localhost(0))
        .set_seed_nodes(Vec::<String>::new())
        .start()
        .await
        .unwrap();
    dht.wait_until_joined().await;
    dht
}

async fn lookup_ids(dht: &Dht) -> HashSet<Bitmap> {
    let (contacts, found) = dht.find_contacts(Bitmap::rand(), false).await.unwrap();
    assert!(!found);
    contacts.iter().map(|contact| contact.id).collect()
}

async fn wait_until_known(bootstrap: &BootstrapNode, id: Bitmap) {
    time::timeout(Duration::from_secs(10), async {
        while !bootstrap.contacts().iter().any(|contact| contact.id == id) {
            time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
}

fn localhost(port: u16) -> SocketAddr {
    (Ipv4Addr::LOCALHOST, port).into()
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_lookup() {
    let _ = pretty_env_logger::try_init();

    let bootstrap = start_bootstrap(localhost(21216)).await;

    let a = start_node(localhost(21217), localhost(21216)).await;
    wait_until_known(&bootstrap, a.id()).await;

    let b = start_node(localhost(21218), localhost(21216)).await;

    let (contacts, found) = b.find_contacts(Bitmap::rand(), false).await.unwrap();
    assert!(!found);

    let ids: HashSet<_> = contacts.iter().map(|contact| contact.id).collect();
    assert_eq!(ids, HashSet::from([bootstrap.id(), a.id()]));
    assert_eq!(contacts.len(), 2);

    b.shutdown().await;
    a.shutdown().await;
    bootstrap.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn announce_and_get() {
    let _ = pretty_env_logger::try_init();

    let bootstrap = start_bootstrap(localhost(0)).await;
    let seed = bootstrap.contact().unwrap().addr();

    let (notifications_tx, mut notifications_rx) = mpsc::unbounded_channel();
    let announcer = Dht::builder()
        .set_address(localhost(0))
        .set_seed_nodes([seed.to_string()])
        .set_peer_protocol_port(5567)
        .set_announce_notifications(notifications_tx)
        .start()
        .await
        .unwrap();
    announcer.wait_until_joined().await;
    wait_until_known(&bootstrap, announcer.id()).await;

    let searcher = start_node(localhost(0), seed).await;
    wait_until_known(&bootstrap, searcher.id()).await;

    let hash = Bitmap::rand();
    announcer.add(hash);

    // Let the announce finish, stores at unresponsive nodes included.
    let finished = time::timeout(Duration::from_secs(60), async {
        loop {
            let notification = notifications_rx.recv().await.unwrap();
            if notification.hash == hash && notification.action == AnnounceAction::Finished {
                break notification;
            }
        }
    })
    .await
    .unwrap();
    assert!(finished.error.is_none(), "{:?}", finished.error);

    let peers = searcher.get(hash).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, announcer.id());
    assert_eq!(peers[0].peer_port, 5567);

    assert!(searcher.get(Bitmap::rand()).await.unwrap().is_empty());

    searcher.shutdown().await;
    announcer.shutdown().await;
    bootstrap.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_seed_lookup() {
    let _ = pretty_env_logger::try_init();

    let seed = start_seed().await;
    let seed_addr = seed.contact().addr();

    let a = start_node(localhost(0), seed_addr).await;
    let b = start_node(localhost(0), seed_addr).await;

    // A plain seed answers joiners, but keeps only nodes that answered its own requests.
    assert_eq!(lookup_ids(&a).await, HashSet::from([seed.id()]));
    assert_eq!(lookup_ids(&b).await, HashSet::from([seed.id()]));
    assert!(matches!(
        seed.find_contacts(Bitmap::rand(), false).await,
        Err(Error::NoContacts)
    ));

    a.ping(&b.contact().addr().to_string()).await.unwrap();
    b.ping(&a.contact().addr().to_string()).await.unwrap();

    assert_eq!(lookup_ids(&a).await, HashSet::from([seed.id(), b.id()]));
    assert_eq!(lookup_ids(&b).await, HashSet::from([seed.id(), a.id()]));

    b.shutdown().await;
    a.shutdown().await;
    seed.shutdown().await;
}
