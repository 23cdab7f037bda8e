//! Proxy splice behavior: bidirectional forwarding, guild-card capture,
//! and the home-server redirect when the upstream is lost.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crossplay_gateway::channel::Channel;
use crossplay_gateway::config::GatewayConfig;
use crossplay_gateway::core::types::Version;
use crossplay_gateway::proxy::session::{
    build_console_login, splice, CapturedLogin, DisconnectAction, LinkedSession,
};

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let a = TcpStream::connect(addr).await.unwrap();
    let (b, _) = listener.accept().await.unwrap();
    (a, b)
}

fn test_session(substitution: bool) -> Arc<LinkedSession> {
    let config = GatewayConfig::default_with_overrides(|c| {
        c.proxy.remote_guild_card_substitution = substitution;
    });
    Arc::new(LinkedSession::new(
        0x42,
        Version::V3Box,
        "127.0.0.1:1".parse().unwrap(),
        CapturedLogin {
            serial_number: 0x42,
            access_key: "key".into(),
            character_name: "Momo".into(),
            sub_version: 0x41,
            language: 1,
        },
        &config,
    ))
}

/// Scenario: a linked session loses its upstream mid-lobby. The client
/// must receive an info box naming the server plus a reconnect directive,
/// and the session closes with the immediate disposition.
#[tokio::test]
async fn upstream_loss_redirects_the_client_home() {
    let (client_side, proxy_client_side) = tcp_pair().await;
    let (proxy_server_side, upstream_side) = tcp_pair().await;

    let mut proxy_client = Channel::with_stream(proxy_client_side, Version::V3Box, "proxy:client");
    let mut proxy_server = Channel::with_stream(proxy_server_side, Version::V3Box, "proxy:server");
    let mut real_client = Channel::with_stream(client_side, Version::V3Box, "client");
    let upstream = Channel::with_stream(upstream_side, Version::V3Box, "upstream");

    let session = test_session(false);
    let splice_task = {
        let session = session.clone();
        tokio::spawn(async move {
            splice(&session, &mut proxy_client, &mut proxy_server, "home-gateway", 5100).await
        })
    };

    // Upstream dies.
    let mut upstream = upstream;
    upstream.disconnect().await;

    // The client sees the info box, then the reconnect directive.
    let info = real_client.recv().await.unwrap();
    assert_eq!(info.command, 0x11);
    let text: Vec<u16> = info
        .data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    let text = String::from_utf16_lossy(&text);
    assert!(text.contains("home-gateway"), "info box names the server: {text}");

    let reconnect = real_client.recv().await.unwrap();
    assert_eq!(reconnect.command, 0x19);
    let port = u16::from_le_bytes([reconnect.data[4], reconnect.data[5]]);
    assert_eq!(port, 5100);

    let action = splice_task.await.unwrap();
    assert_eq!(action, DisconnectAction::CloseImmediately);
}

#[tokio::test]
async fn splice_forwards_both_directions_and_captures_identity() {
    let (client_side, proxy_client_side) = tcp_pair().await;
    let (proxy_server_side, upstream_side) = tcp_pair().await;

    let mut proxy_client = Channel::with_stream(proxy_client_side, Version::V3Box, "proxy:client");
    let mut proxy_server = Channel::with_stream(proxy_server_side, Version::V3Box, "proxy:server");
    let mut real_client = Channel::with_stream(client_side, Version::V3Box, "client");
    let mut upstream = Channel::with_stream(upstream_side, Version::V3Box, "upstream");

    let session = test_session(true);
    let splice_task = {
        let session = session.clone();
        tokio::spawn(async move {
            splice(&session, &mut proxy_client, &mut proxy_server, "home", 5100).await
        })
    };

    // Upstream assigns an identity via the set-guild-card command.
    let mut assign = vec![0u8; 8];
    assign[..4].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    assign[4..].copy_from_slice(&0x00BE_EF01u32.to_le_bytes());
    upstream.send(0x04, 0, &assign).await.unwrap();
    let got = real_client.recv().await.unwrap();
    assert_eq!(got.command, 0x04);
    assert_eq!(
        session.remote_guild_card_number.load(std::sync::atomic::Ordering::Relaxed),
        0x00BE_EF01
    );

    // A client guild-card send is rewritten to the upstream identity.
    let mut card = vec![0u8; 12];
    card[0] = 0x06;
    card[1] = 3;
    card[4..8].copy_from_slice(&0x42u32.to_le_bytes());
    real_client.send(0x06, 0, &card).await.unwrap();
    let got = upstream.recv().await.unwrap();
    assert_eq!(got.command, 0x06);
    assert_eq!(
        u32::from_le_bytes([got.data[4], got.data[5], got.data[6], got.data[7]]),
        0x00BE_EF01
    );

    real_client.disconnect().await;
    let action = splice_task.await.unwrap();
    assert_eq!(action, DisconnectAction::LongTimeout);
}

#[test]
fn console_login_payload_is_stable() {
    let login = CapturedLogin {
        serial_number: 0x1357_9BDF,
        access_key: "abc".into(),
        character_name: "Nei".into(),
        sub_version: 0x30,
        language: 0,
    };
    let payload = build_console_login(&login, login.serial_number);
    assert_eq!(payload.len(), 68);
    assert_eq!(&payload[4..8], &0x1357_9BDFu32.to_le_bytes());
}
