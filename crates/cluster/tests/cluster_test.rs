//! Topology discovery and routing against in-memory store nodes

use std::sync::Arc;
use std::time::Duration;

use cluster::{
    key_slot, ClientError, ClusterRouter, Cmd, ConnectionPool, PoolConfig, RouteError,
    TopologyError, TopologyManager, TopologyState, TOTAL_SLOTS,
};
use memstore::{start_cluster, MemStore, SlotTable};
use resp::RespValue;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn addrs(nodes: &[MemStore]) -> Vec<String> {
    nodes.iter().map(MemStore::addr).collect()
}

async fn cluster_router(nodes: &[MemStore]) -> (ClusterRouter, Arc<TopologyManager>) {
    let pool = ConnectionPool::new(PoolConfig::default());
    let topology = TopologyManager::new(addrs(nodes), pool.clone());
    topology.refresh_mapping().await.unwrap();
    (
        ClusterRouter::cluster(pool, topology.clone(), false),
        topology,
    )
}

#[tokio::test]
async fn test_refresh_covers_every_slot_once() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());
    let topology = TopologyManager::new(addrs(&nodes), pool);
    assert_eq!(topology.state(), TopologyState::Unrefreshed);

    topology.refresh_mapping().await.unwrap();
    assert_eq!(topology.state(), TopologyState::Refreshed);

    let mapping = topology.mapping().unwrap();
    let mut next = 0;
    for assignment in mapping.assignments() {
        assert_eq!(assignment.range.start, next);
        assert!(assignment.range.end > assignment.range.start);
        next = assignment.range.end;
    }
    assert_eq!(next, TOTAL_SLOTS);

    let mut discovered = topology.nodes();
    discovered.sort();
    let mut expected = addrs(&nodes);
    expected.sort();
    assert_eq!(discovered, expected);

    assert_eq!(topology.node_for_key(b"foo"), Some(nodes[2].addr()));
    assert_eq!(topology.node_for_key(b"bar"), Some(nodes[0].addr()));
}

#[tokio::test]
async fn test_refresh_skips_unreachable_startup_node() {
    init_tracing();
    let nodes = start_cluster(2).await.unwrap();
    let dead = MemStore::start().await.unwrap();
    let dead_addr = dead.addr();
    drop(dead);
    // let the accept loop observe shutdown and close the listener
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut startup = vec![dead_addr];
    startup.extend(addrs(&nodes));
    let topology = TopologyManager::new(startup, ConnectionPool::new(PoolConfig::default()));
    topology.refresh_mapping().await.unwrap();
    assert_eq!(topology.state(), TopologyState::Refreshed);
}

#[tokio::test]
async fn test_refresh_against_standalone_node_fails() {
    init_tracing();
    let store = MemStore::start().await.unwrap();
    let topology = TopologyManager::new(
        vec![store.addr()],
        ConnectionPool::new(PoolConfig::default()),
    );

    let err = topology.refresh_mapping().await.unwrap_err();
    assert!(matches!(err, TopologyError::AllNodesFailed(ref f) if f.len() == 1));
    let msg = err.to_string();
    assert!(msg.contains("all nodes failed"), "{}", msg);
    assert!(msg.contains(&store.addr()), "{}", msg);
    assert_eq!(topology.state(), TopologyState::Failed);
    assert!(topology.mapping().is_none());
}

#[tokio::test]
async fn test_refresh_without_startup_nodes() {
    let topology = TopologyManager::new(Vec::new(), ConnectionPool::new(PoolConfig::default()));
    assert!(matches!(
        topology.refresh_mapping().await,
        Err(TopologyError::NoStartupNodes)
    ));
}

#[tokio::test]
async fn test_route_rebinds_to_owner() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let (router, _) = cluster_router(&nodes).await;

    let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
    assert_eq!(conn.addr(), nodes[2].addr());
    let reply = conn
        .execute(Cmd::new("LPUSH").arg("foo").arg("x"))
        .await
        .unwrap();
    assert_eq!(reply, RespValue::Integer(1));
    assert_eq!(nodes[2].llen("foo"), 1);
}

#[tokio::test]
async fn test_route_rejects_cross_slot_keys() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let (router, _) = cluster_router(&nodes).await;

    let result = router.connect_for_keys(&[b"foo", b"bar"]).await;
    match result {
        Err(RouteError::CrossSlot { first, other }) => {
            assert_eq!(first, key_slot(b"foo"));
            assert_eq!(other, key_slot(b"bar"));
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("cross-slot keys were routed"),
    }

    // hash tags pin both keys to one slot
    assert!(router
        .connect_for_keys(&[b"{user}:a", b"{user}:b"])
        .await
        .is_ok());
}

#[tokio::test]
async fn test_standalone_routing_is_identity() {
    let store = MemStore::start().await.unwrap();
    let router = ClusterRouter::standalone(ConnectionPool::new(PoolConfig::default()), store.addr());
    assert!(!router.is_cluster());

    let conn = router.connect_for_keys(&[b"foo", b"bar"]).await.unwrap();
    assert_eq!(conn.addr(), store.addr());
}

#[tokio::test]
async fn test_moved_before_first_refresh() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());
    let topology = TopologyManager::new(vec![nodes[0].addr()], pool.clone());
    let router = ClusterRouter::cluster(pool, topology, false);

    let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
    assert_eq!(conn.addr(), nodes[0].addr());

    conn.execute(Cmd::new("LPUSH").arg("foo").arg("x"))
        .await
        .unwrap();
    assert_eq!(conn.addr(), nodes[2].addr());
    assert_eq!(nodes[2].llen("foo"), 1);
}

#[tokio::test]
async fn test_moved_schedules_refresh() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());
    let topology = TopologyManager::new(vec![nodes[0].addr()], pool.clone());
    let router = ClusterRouter::cluster(pool, topology.clone(), true);

    let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
    conn.execute(Cmd::new("LPUSH").arg("foo").arg("x"))
        .await
        .unwrap();

    for _ in 0..50 {
        if topology.state() == TopologyState::Refreshed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(topology.state(), TopologyState::Refreshed);
}

#[tokio::test]
async fn test_ask_is_one_shot() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let (router, _) = cluster_router(&nodes).await;

    let mut table = SlotTable::even(&addrs(&nodes));
    table.migrating.insert(key_slot(b"foo"), nodes[1].addr());
    for node in &nodes {
        node.set_slots(Some(table.clone()));
    }

    let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
    conn.execute(Cmd::new("LPUSH").arg("foo").arg("x"))
        .await
        .unwrap();
    assert_eq!(nodes[1].llen("foo"), 1);
    assert_eq!(nodes[2].llen("foo"), 0);
    // the connection stays bound to the slot owner
    assert_eq!(conn.addr(), nodes[2].addr());
}

#[tokio::test]
async fn test_unreachable_redirect_target_surfaces() {
    init_tracing();
    let nodes = start_cluster(2).await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());
    let router = ClusterRouter::cluster(
        pool.clone(),
        TopologyManager::new(vec![nodes[0].addr()], pool),
        false,
    );

    let gone = MemStore::start().await.unwrap();
    let gone_addr = gone.addr();
    drop(gone);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut table = SlotTable::even(&addrs(&nodes));
    table.owners[1].addr = gone_addr;
    nodes[0].set_slots(Some(table));

    // "foo" hashes into the second half, now owned by a closed port
    let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
    let err = conn
        .execute(Cmd::new("LPUSH").arg("foo").arg("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Client(ClientError::Io(_))), "{}", err);
}

#[tokio::test]
async fn test_pool_reuses_released_connections() {
    let store = MemStore::start().await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());

    let mut conn = pool.get(&store.addr()).await.unwrap();
    conn.execute(Cmd::new("PING")).await.unwrap();
    drop(conn);
    assert_eq!(pool.idle_count(&store.addr()), 1);

    let conn = pool.get(&store.addr()).await.unwrap();
    assert_eq!(pool.idle_count(&store.addr()), 0);
    conn.discard();
    assert_eq!(pool.idle_count(&store.addr()), 0);
}

#[tokio::test]
async fn test_redirects_within_single_connection_budget() {
    init_tracing();
    let nodes = start_cluster(3).await.unwrap();
    let pool = ConnectionPool::new(PoolConfig {
        max_active: 1,
        ..Default::default()
    });
    let topology = TopologyManager::new(vec![nodes[0].addr()], pool.clone());
    let router = ClusterRouter::cluster(pool, topology, false);

    // MOVED from the startup node to the owner of "foo"
    let mut conn = tokio::time::timeout(Duration::from_secs(3), async {
        let mut conn = router.connect_for_keys(&[b"foo"]).await.unwrap();
        conn.execute(Cmd::new("LPUSH").arg("foo").arg("x"))
            .await
            .unwrap();
        conn
    })
    .await
    .unwrap();
    assert_eq!(conn.addr(), nodes[2].addr());

    // ASK to the importing node
    let mut table = SlotTable::even(&addrs(&nodes));
    table.migrating.insert(key_slot(b"bar"), nodes[1].addr());
    for node in &nodes {
        node.set_slots(Some(table.clone()));
    }
    drop(conn);
    conn = router.connect_for_keys(&[b"bar"]).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(3),
        conn.execute(Cmd::new("LPUSH").arg("bar").arg("y")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(nodes[1].llen("bar"), 1);
}

#[tokio::test]
async fn test_dedicated_connections_bypass_active_limit() {
    let store = MemStore::start().await.unwrap();
    let pool = ConnectionPool::new(PoolConfig {
        max_active: 1,
        ..Default::default()
    });

    let dedicated = pool.dedicated(&store.addr()).await.unwrap();
    assert!(dedicated.is_dedicated());
    let mut borrowed = tokio::time::timeout(Duration::from_secs(1), pool.get(&store.addr()))
        .await
        .unwrap()
        .unwrap();
    assert!(!borrowed.is_dedicated());
    borrowed.execute(Cmd::new("PING")).await.unwrap();
}

#[tokio::test]
async fn test_broken_connection_purges_idle_peers() {
    let store = MemStore::start().await.unwrap();
    let pool = ConnectionPool::new(PoolConfig::default());

    let mut a = pool.get(&store.addr()).await.unwrap();
    let mut b = pool.get(&store.addr()).await.unwrap();
    a.execute(Cmd::new("PING")).await.unwrap();
    b.execute(Cmd::new("PING")).await.unwrap();
    drop(a);
    assert_eq!(pool.idle_count(&store.addr()), 1);

    store.disconnect_clients();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.execute(Cmd::new("PING")).await.is_err());
    drop(b);
    assert_eq!(pool.idle_count(&store.addr()), 0);
}
