use std::net::SocketAddr;
use std::time::Duration;

use sphynx_crypto::curve::KeyPair;
use sphynx_server::{Client, Server, Settings};

#[tokio::test(flavor = "multi_thread")]
async fn client_connects_and_exchanges_one_message() {
    let keypair = KeyPair::generate().unwrap();
    let server_pub = *keypair.public();

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (server, mut inbound) = Server::bind(bind_addr, keypair, Settings::default()).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client = Client::connect(server_addr, server_pub, Vec::new()).await.unwrap();
    assert!(client.is_alive());

    client.write_reliable(0, b"hello from client".to_vec()).unwrap();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut received = None;
    for _ in 0..50 {
        client.run_one_tick(Duration::from_millis(20), &tx).await;
        if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(5), inbound.recv()).await {
            received = Some(msg.payload);
            break;
        }
    }

    assert_eq!(received.as_deref(), Some(&b"hello from client"[..]));
    assert_eq!(server.connexion_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_echoes_back_to_client() {
    let keypair = KeyPair::generate().unwrap();
    let server_pub = *keypair.public();

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (server, mut inbound) = Server::bind(bind_addr, keypair, Settings::default()).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client = Client::connect(server_addr, server_pub, Vec::new()).await.unwrap();
    client.write_unreliable(b"ping".to_vec());

    let msg = tokio::time::timeout(Duration::from_secs(2), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload, b"ping");

    server.send_reliable(&msg.from, 0, b"pong".to_vec()).unwrap();

    let mut reply = None;
    for _ in 0..50 {
        if let Some(payload) = drain_one(&mut client, Duration::from_millis(20)).await {
            reply = Some(payload);
            break;
        }
    }
    assert_eq!(reply.as_deref(), Some(&b"pong"[..]));
}

async fn drain_one(client: &mut Client, wait: Duration) -> Option<Vec<u8>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.run_one_tick(wait, &tx).await;
    rx.try_recv().ok()
}
