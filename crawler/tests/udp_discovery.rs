// Discovery over real sockets on the loopback interface.
//
// Responders are minimal discv4 peers built from the message types: they
// answer PING (and ping back), FINDNODE and ENRREQUEST.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use discmap_common::crypto::Secp256k1KeyPair;
use discmap_crawler::discovery::messages::{
    EnrResponse, Endpoint, NeighborNode, Neighbors, Ping, Pong, MAX_PACKET_SIZE,
};
use discmap_crawler::discovery::{
    lookup, DiscoveryConfig, DiscoveryRpc, LookupStatus, Message, Node, NodeDb, NodeId,
    NodeIdentity, NodeRecord, RecordBuilder, SignedPacket, UdpTransport,
};
use discmap_crawler::registry::{
    EntryStatus, MergeConfig, Registry, RegistryEntry, RegistryMerge, UdpSessionFactory,
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn local_config() -> DiscoveryConfig {
    DiscoveryConfig {
        bind_address: Some("127.0.0.1:0".to_string()),
        query_timeout_ms: 200,
        ..Default::default()
    }
}

struct Responder {
    keypair: Secp256k1KeyPair,
    addr: SocketAddr,
    node: Node,
}

async fn serve(
    socket: UdpSocket,
    signer: NodeIdentity,
    record: NodeRecord,
    neighbors: Vec<NeighborNode>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let Ok(local) = socket.local_addr() else {
        return;
    };
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(packet) = SignedPacket::decode(&buf[..len]) else {
            continue;
        };

        let replies = match packet.message {
            Message::Ping(ping) => vec![
                Message::Pong(Pong::new(
                    Endpoint::from_socket(from, ping.from.tcp),
                    packet.hash,
                    record.seq(),
                )),
                Message::Ping(Ping::new(
                    Endpoint::from_socket(local, 0),
                    Endpoint::from_socket(from, 0),
                    record.seq(),
                )),
            ],
            Message::FindNode(_) => Neighbors::split(neighbors.clone())
                .into_iter()
                .map(Message::Neighbors)
                .collect(),
            Message::EnrRequest(_) => {
                vec![Message::EnrResponse(EnrResponse::new(packet.hash, &record))]
            }
            _ => Vec::new(),
        };

        for message in replies {
            let (bytes, _) = SignedPacket::encode(&signer, &message).unwrap();
            let _ = socket.send_to(&bytes, from).await;
        }
    }
}

/// Start a peer listing `keypair` in its record and signing packets as `signer`.
async fn spawn_peer(
    keypair: Secp256k1KeyPair,
    signer: Option<NodeIdentity>,
    seq: u64,
    neighbors: Vec<NeighborNode>,
) -> Responder {
    let socket = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let record = RecordBuilder::new()
        .seq(seq)
        .ip(LOOPBACK)
        .udp(addr.port())
        .tcp(addr.port())
        .build(&keypair)
        .unwrap();
    let node = Node::from_record(record.clone()).unwrap();
    let signer = signer.unwrap_or_else(|| NodeIdentity::from_keypair(keypair.clone()));

    tokio::spawn(serve(socket, signer, record, neighbors));
    Responder {
        keypair,
        addr,
        node,
    }
}

async fn honest_peer(neighbors: Vec<NeighborNode>) -> Responder {
    spawn_peer(Secp256k1KeyPair::generate(), None, 1, neighbors).await
}

struct Overlay {
    bootstrap: Responder,
    honest: Vec<Responder>,
    forger: Responder,
}

/// A bootstrap peer listing three honest peers, one peer whose packets are
/// signed by a key other than the listed one, and one entry on a privileged
/// port.
async fn spawn_overlay(bootstrap_seq: u64) -> Overlay {
    let mut honest = Vec::new();
    for _ in 0..3 {
        honest.push(honest_peer(Vec::new()).await);
    }
    let forger = spawn_peer(
        Secp256k1KeyPair::generate(),
        Some(NodeIdentity::generate()),
        1,
        Vec::new(),
    )
    .await;
    let privileged = NeighborNode {
        ip: LOOPBACK,
        udp: 80,
        tcp: 80,
        public_key: *Secp256k1KeyPair::generate().public_key().as_bytes(),
    };

    let mut listed: Vec<NeighborNode> = honest
        .iter()
        .chain(std::iter::once(&forger))
        .map(|peer| NeighborNode::from_node(&peer.node).unwrap())
        .collect();
    listed.push(privileged);

    let bootstrap = spawn_peer(Secp256k1KeyPair::generate(), None, bootstrap_seq, listed).await;
    Overlay {
        bootstrap,
        honest,
        forger,
    }
}

fn sorted(mut ids: Vec<NodeId>) -> Vec<NodeId> {
    ids.sort();
    ids
}

#[tokio::test]
async fn test_lookup_keeps_only_valid_neighbors() {
    let overlay = spawn_overlay(1).await;
    let config = local_config();
    let db = Arc::new(NodeDb::temporary().unwrap());
    let transport = UdpTransport::open(&config, NodeIdentity::generate(), db)
        .await
        .unwrap();

    let bootstrap = &overlay.bootstrap.node;
    let result = lookup(&transport, bootstrap, bootstrap, &config.lookup_config()).await;

    assert_eq!(result.status, LookupStatus::Converged);
    assert_eq!(
        sorted(result.nodes.iter().map(|n| *n.id()).collect()),
        sorted(overlay.honest.iter().map(|p| *p.node.id()).collect())
    );
    assert!(result.nodes.iter().all(|n| n.id() != overlay.forger.node.id()));
    // Bootstrap, the honest peers and the forger. The privileged entry is never asked.
    assert_eq!(result.queried, 5);
    assert_eq!(result.failed, 1);

    transport.close().await;
}

#[tokio::test]
async fn test_request_record_from_peer() {
    let peer = spawn_peer(Secp256k1KeyPair::generate(), None, 9, Vec::new()).await;
    let config = local_config();
    let db = Arc::new(NodeDb::temporary().unwrap());
    let transport = UdpTransport::open(&config, NodeIdentity::generate(), db)
        .await
        .unwrap();

    let record = transport.request_record(&peer.node).await.unwrap();
    assert_eq!(record.seq(), 9);
    assert_eq!(record.node_id().unwrap(), peer.keypair.node_id());

    let pong = transport.ping(&peer.node).await.unwrap();
    assert_eq!(pong.enr_seq, Some(9));
    assert_eq!(pong.to.udp, transport.local_addr().unwrap().port());
    assert_eq!(peer.addr, peer.node.udp_endpoint().unwrap());
}

#[tokio::test]
async fn test_registry_merge_over_udp() {
    let overlay = spawn_overlay(2).await;
    let stale = RecordBuilder::new()
        .seq(1)
        .ip(LOOPBACK)
        .udp(overlay.bootstrap.addr.port())
        .tcp(overlay.bootstrap.addr.port())
        .build(&overlay.bootstrap.keypair)
        .unwrap();
    let key = overlay.bootstrap.node.id().to_hex();

    let mut registry = Registry::new();
    registry.insert(
        key.clone(),
        RegistryEntry {
            seq: 1,
            ..RegistryEntry::new(stale.to_text())
        },
    );

    let discovery = local_config();
    let merge_config = MergeConfig {
        workers: 2,
        lookup: discovery.lookup_config(),
        ..MergeConfig::default()
    };
    let db = Arc::new(NodeDb::temporary().unwrap());
    let merge = RegistryMerge::new(UdpSessionFactory::new(discovery, db), merge_config);
    let summary = merge.run(&mut registry).await.unwrap();

    assert_eq!(
        summary.report(&key).unwrap().status,
        EntryStatus::Responsive {
            neighbors: 3,
            refreshed: true
        }
    );
    let entry = &registry[&key];
    assert_eq!(entry.score, 1);
    assert_eq!(entry.seq, 2);
    assert_eq!(entry.record, overlay.bootstrap.node.to_text());
    assert_eq!(
        sorted(entry.neighbors.iter().map(|n| *n.id()).collect()),
        sorted(overlay.honest.iter().map(|p| *p.node.id()).collect())
    );
}
