//! TCP 路径端到端：入站 → 规则 → 出站 → 双向转发 → 流量计数

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use switchyard::dns::SystemResolver;
use switchyard::proxy::direct::DirectOutbound;
use switchyard::proxy::reject::RejectOutbound;
use switchyard::proxy::{InboundKind, Metadata, Network, OutboundHandler};
use switchyard::rule::parse_rules;
use switchyard::tunnel::{TcpSession, Tunnel};

async fn spawn_echo_listener() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn make_tunnel() -> Arc<Tunnel> {
    Tunnel::new(
        Arc::new(SystemResolver),
        None,
        None,
        &CancellationToken::new(),
    )
}

fn metadata_to(addr: std::net::SocketAddr) -> Metadata {
    Metadata {
        network: Network::Tcp,
        inbound: InboundKind::Socks,
        src_ip: "127.0.0.1".parse().unwrap(),
        src_port: 33333,
        dst_ip: Some(addr.ip()),
        host: String::new(),
        dst_port: addr.port(),
        process: None,
    }
}

#[tokio::test]
async fn tcp_session_relays_bytes_and_counts_traffic() {
    let echo_addr = spawn_echo_listener().await;
    let tunnel = make_tunnel();

    let mut proxies: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
    proxies.insert("DIRECT".to_string(), Arc::new(DirectOutbound::new("DIRECT")));
    tunnel
        .install(parse_rules(&["MATCH,DIRECT".to_string()]).unwrap(), proxies)
        .await;

    let (mut client, server_side) = tokio::io::duplex(4096);
    tunnel.submit_tcp(TcpSession {
        metadata: metadata_to(echo_addr),
        stream: Box::new(server_side),
    });

    client.write_all(b"ping through the yard").await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"ping through the yard");

    // 关闭客户端侧，等转发收尾后校验计数
    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let traffic = tunnel.traffic();
    assert_eq!(traffic.upload(), 21);
    assert_eq!(traffic.download(), 21);
}

#[tokio::test]
async fn rejected_connection_is_dropped() {
    let tunnel = make_tunnel();
    let mut proxies: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
    proxies.insert("DIRECT".to_string(), Arc::new(DirectOutbound::new("DIRECT")));
    proxies.insert("REJECT".to_string(), Arc::new(RejectOutbound::new("REJECT")));
    tunnel
        .install(
            parse_rules(&["DOMAIN-SUFFIX,blocked.example,REJECT".to_string()]).unwrap(),
            proxies,
        )
        .await;

    let (mut client, server_side) = tokio::io::duplex(4096);
    let mut metadata = metadata_to("127.0.0.1:1".parse().unwrap());
    metadata.host = "ads.blocked.example".to_string();
    metadata.dst_ip = None;
    tunnel.submit_tcp(TcpSession {
        metadata,
        stream: Box::new(server_side),
    });

    // 拨号被拒，连接应被丢弃（对端关闭）
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn invalid_metadata_connection_is_dropped() {
    let tunnel = make_tunnel();
    let mut proxies: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
    proxies.insert("DIRECT".to_string(), Arc::new(DirectOutbound::new("DIRECT")));
    tunnel
        .install(parse_rules(&["MATCH,DIRECT".to_string()]).unwrap(), proxies)
        .await;

    let (mut client, server_side) = tokio::io::duplex(1024);
    let mut metadata = metadata_to("127.0.0.1:1".parse().unwrap());
    metadata.host = String::new();
    metadata.dst_ip = None;
    tunnel.submit_tcp(TcpSession {
        metadata,
        stream: Box::new(server_side),
    });

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn shutdown_stops_intake() {
    let echo_addr = spawn_echo_listener().await;
    let tunnel = make_tunnel();
    let mut proxies: HashMap<String, Arc<dyn OutboundHandler>> = HashMap::new();
    proxies.insert("DIRECT".to_string(), Arc::new(DirectOutbound::new("DIRECT")));
    tunnel
        .install(parse_rules(&["MATCH,DIRECT".to_string()]).unwrap(), proxies)
        .await;

    tunnel.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut client, server_side) = tokio::io::duplex(1024);
    tunnel.submit_tcp(TcpSession {
        metadata: metadata_to(echo_addr),
        stream: Box::new(server_side),
    });

    // 消费者已停，连接不会被接起
    client.write_all(b"hello?").await.unwrap();
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_millis(500), client.read(&mut buf)).await;
    match result {
        Err(_) => {}
        Ok(Ok(0)) => {}
        Ok(other) => panic!("unexpected read result: {:?}", other),
    }
}
