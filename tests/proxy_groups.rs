//! 代理组行为测试：fallback / load-balance / selector / relay / DAG

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use switchyard::common::RouteError;
use switchyard::config::types::ProxyGroupConfig;
use switchyard::proxy::direct::DirectOutbound;
use switchyard::proxy::group::fallback::FallbackGroup;
use switchyard::proxy::group::health::HealthCheckHub;
use switchyard::proxy::group::loadbalance::{jump_hash, LoadBalanceGroup};
use switchyard::proxy::group::selector::SelectorGroup;
use switchyard::proxy::group::{build_groups, dag};
use switchyard::proxy::{InboundKind, Metadata, Network, OutboundHandler};

fn members(n: usize) -> Vec<Arc<dyn OutboundHandler>> {
    (0..n)
        .map(|i| Arc::new(DirectOutbound::new(format!("node-{}", i))) as Arc<dyn OutboundHandler>)
        .collect()
}

fn meta(host: &str) -> Metadata {
    Metadata {
        network: Network::Tcp,
        inbound: InboundKind::Socks,
        src_ip: "10.1.1.1".parse().unwrap(),
        src_port: 7000,
        dst_ip: None,
        host: host.to_string(),
        dst_port: 443,
        process: None,
    }
}

fn group_cfg(name: &str, kind: &str, proxies: &[&str]) -> ProxyGroupConfig {
    ProxyGroupConfig {
        name: name.to_string(),
        group_type: kind.to_string(),
        proxies: proxies.iter().map(|s| s.to_string()).collect(),
        url: None,
        interval: 3600,
    }
}

// --- Fallback ---

#[tokio::test]
async fn fallback_prefers_first_alive_in_order() {
    let members = members(4);
    let group = FallbackGroup::new(
        "fb".to_string(),
        members.clone(),
        "http://127.0.0.1:1/x".to_string(),
        Duration::from_secs(3600),
        Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(group.now(), "node-0");

    members[0].health().record_failure();
    members[1].health().record_failure();
    assert_eq!(group.now(), "node-2");

    // 前面的恢复后立即切回
    members[0].health().record_delay(30);
    assert_eq!(group.now(), "node-0");
}

#[tokio::test]
async fn fallback_with_everything_dead_uses_member_zero() {
    let members = members(3);
    let group = FallbackGroup::new(
        "fb".to_string(),
        members.clone(),
        "http://127.0.0.1:1/x".to_string(),
        Duration::from_secs(3600),
        Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();
    for m in &members {
        m.health().record_failure();
    }
    assert_eq!(group.now(), "node-0");
}

// --- LoadBalance ---

#[tokio::test]
async fn loadbalance_sticky_key_avoids_dead_member() {
    let members = members(3);
    let group = LoadBalanceGroup::new(
        "lb".to_string(),
        members.clone(),
        None,
        Duration::from_secs(3600),
        Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();
    members[1].health().record_failure();

    // 同一粘滞键的反复选择始终避开 node-1
    for i in 0..300 {
        let m = meta(&format!("site-{}.example.net", i % 20));
        let picked = group.unwrap_member(&m).unwrap();
        assert_ne!(picked.name(), "node-1");
    }
}

#[tokio::test]
async fn loadbalance_same_key_is_sticky() {
    let group = LoadBalanceGroup::new(
        "lb".to_string(),
        members(5),
        None,
        Duration::from_secs(3600),
        Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();

    let m = meta("sticky.example.com");
    let first = group.unwrap_member(&m).unwrap().name().to_string();
    for _ in 0..20 {
        assert_eq!(group.unwrap_member(&m).unwrap().name(), first);
    }

    // 子域名共享有效顶级域，命中同一上游
    let sub = meta("cdn.sticky.example.com");
    assert_eq!(group.unwrap_member(&sub).unwrap().name(), first);
}

#[tokio::test]
async fn loadbalance_all_dead_falls_back_to_member_zero() {
    let members = members(4);
    let group = LoadBalanceGroup::new(
        "lb".to_string(),
        members.clone(),
        None,
        Duration::from_secs(3600),
        Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();
    for m in &members {
        m.health().record_failure();
    }
    // 最多 3 次重试后退回成员 0
    let picked = group.unwrap_member(&meta("any.example.com")).unwrap();
    assert_eq!(picked.name(), "node-0");
}

#[test]
fn jump_hash_distribution_and_stability() {
    let mut counts = [0u32; 5];
    for key in 0..5_000u64 {
        let bucket = jump_hash(key, 5);
        assert!((0..5).contains(&bucket));
        counts[bucket as usize] += 1;
    }
    for count in counts {
        assert!(count > 500, "uneven distribution: {:?}", counts);
    }

    // 桶数 +1 时大多数键不迁移
    let mut moved = 0;
    for key in 0..5_000u64 {
        if jump_hash(key, 5) != jump_hash(key, 6) {
            moved += 1;
        }
    }
    assert!(moved < 1_500, "too many keys moved: {}", moved);
}

// --- Selector ---

#[tokio::test]
async fn selector_switch_and_describe() {
    let group = SelectorGroup::new("sel".to_string(), members(3)).unwrap();
    assert_eq!(group.now(), "node-0");
    assert!(group.select("node-1"));
    assert_eq!(group.now(), "node-1");
    assert!(!group.select("ghost"));

    let state = group.describe();
    assert_eq!(state["now"], "node-1");
    assert_eq!(state["type"], "Selector");
}

// --- DAG ---

#[test]
fn dag_orders_leaves_first() {
    let configs = vec![
        group_cfg("relay-out", "selector", &["mid", "DIRECT"]),
        group_cfg("mid", "selector", &["base"]),
        group_cfg("base", "selector", &["DIRECT"]),
    ];
    let order: Vec<&str> = dag::sort_groups(&configs)
        .unwrap()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(order, vec!["base", "mid", "relay-out"]);
}

#[test]
fn dag_cycle_reports_exact_participants() {
    // A->B->A 成环，C 只是引用了 A
    let configs = vec![
        group_cfg("A", "selector", &["B"]),
        group_cfg("B", "selector", &["A"]),
        group_cfg("C", "selector", &["A", "DIRECT"]),
    ];
    let err = dag::sort_groups(&configs).unwrap_err();
    match err.downcast_ref::<RouteError>() {
        Some(RouteError::CycleDetected(names)) => {
            assert_eq!(names, &["A", "B"]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

// --- 构建器集成 ---

#[tokio::test]
async fn build_groups_wires_nested_members() {
    let mut existing = std::collections::HashMap::new();
    existing.insert(
        "DIRECT".to_string(),
        Arc::new(DirectOutbound::new("DIRECT")) as Arc<dyn OutboundHandler>,
    );

    let configs = vec![
        group_cfg("outer", "fallback", &["inner", "DIRECT"]),
        group_cfg("inner", "selector", &["DIRECT"]),
    ];
    let built = build_groups(
        &configs,
        &existing,
        &Arc::new(HealthCheckHub::new()),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(built.len(), 2);
    assert_eq!(built[0].0, "inner");
    assert_eq!(built[1].0, "outer");

    for (_, handler) in &built {
        handler.destroy();
    }
}

#[tokio::test]
async fn group_health_check_deduplicates_concurrent_calls() {
    // 两个并发的同组检查合并为一次执行（单飞），结果一致
    let hub = Arc::new(HealthCheckHub::new());
    let token = CancellationToken::new();
    let members = members(2);

    let h1 = {
        let hub = hub.clone();
        let members = members.clone();
        let token = token.clone();
        tokio::spawn(async move {
            hub.check_group(
                "g",
                &members,
                "http://127.0.0.1:1/unreachable",
                Duration::from_millis(300),
                false,
                &token,
            )
            .await
        })
    };
    let h2 = {
        let hub = hub.clone();
        let members = members.clone();
        let token = token.clone();
        tokio::spawn(async move {
            hub.check_group(
                "g",
                &members,
                "http://127.0.0.1:1/unreachable",
                Duration::from_millis(300),
                false,
                &token,
            )
            .await
        })
    };

    // 两个调用都应返回（失败也共享），且不互相悬死
    let r1 = h1.await.unwrap();
    let r2 = h2.await.unwrap();
    assert!(r1.is_err());
    assert!(r2.is_err());
}

#[tokio::test]
async fn group_check_updates_member_state() {
    // 本地 204 服务器让成员探测成功
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });

    let hub = Arc::new(HealthCheckHub::new());
    let members = members(2);
    // 先标记为挂，检查成功后应恢复
    members[0].health().record_failure();
    members[1].health().record_failure();

    let url = format!("http://127.0.0.1:{}/generate_204", addr.port());
    let delay = hub
        .check_group(
            "g",
            &members,
            &url,
            Duration::from_secs(5),
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(delay < 5_000);

    // check_all 模式下所有成员都被刷新
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(members[0].alive());
    assert!(members[1].alive());
}
