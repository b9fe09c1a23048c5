//! Tests for the connection pool against local listeners

use super::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Barrier;

/// Accept connections forever, keeping them open
async fn spawn_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

fn test_config() -> PoolConfig {
    PoolConfig {
        max_connections: 10,
        per_host_limit: 5,
        keep_alive_ms: 60_000,
        connect_timeout_ms: 2_000,
        usage_ceiling: 100,
        cleanup_interval_secs: 300,
    }
}

#[tokio::test]
async fn test_connection_is_reused() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(test_config());

    for _ in 0..10 {
        let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.is_pooled());
        pool.return_connection(conn);
    }

    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 9);
    assert_eq!(stats.live_connections, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.host_pools, 1);
}

#[tokio::test]
async fn test_usage_ceiling_retires_connection() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        usage_ceiling: 3,
        ..test_config()
    });

    let mut counts = Vec::new();
    for _ in 0..4 {
        let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
        counts.push(conn.use_count());
        assert!(conn.use_count() <= 3);
        pool.return_connection(conn);
    }

    // Three leases of the first connection, then a fresh one
    assert_eq!(counts, vec![1, 2, 3, 1]);
    assert_eq!(pool.stats().created, 2);
    assert_eq!(pool.stats().live_connections, 1);
}

#[tokio::test]
async fn test_stale_connection_is_replaced() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        keep_alive_ms: 25,
        ..test_config()
    });

    let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    pool.return_connection(conn);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(conn.use_count(), 1);
    assert!(conn.age() < Duration::from_millis(50));

    let stats = pool.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.live_connections, 1);
}

#[tokio::test]
async fn test_global_ceiling_is_never_exceeded() {
    let addr = spawn_listener().await;
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_connections: 4,
        per_host_limit: 2,
        ..test_config()
    }));

    let tasks = 16;
    let barrier = Arc::new(Barrier::new(tasks));
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let result = pool.get_connection("127.0.0.1", addr.port()).await;
            assert!(pool.stats().live_connections <= 4);
            // Hold every lease until all requests have been answered
            barrier.wait().await;
            match result {
                Ok(_) => true,
                Err(EngineError::PoolExhausted { limit }) => {
                    assert_eq!(limit, 4);
                    false
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }

    assert_eq!(granted, 4);
    assert_eq!(pool.stats().exhausted, 12);
    // Dropped leases released their slots
    assert_eq!(pool.stats().live_connections, 0);
}

#[tokio::test]
async fn test_exhaustion_does_not_fall_back_to_direct() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 1,
        per_host_limit: 1,
        ..test_config()
    });

    let _held = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    let err = pool.get_connection("127.0.0.1", addr.port()).await.unwrap_err();

    assert!(matches!(err, EngineError::PoolExhausted { .. }));
    assert!(err.is_resource_exhaustion());
    assert_eq!(pool.stats().direct, 0);
}

#[tokio::test]
async fn test_host_pool_cap_dials_directly() {
    let a = spawn_listener().await;
    let b = spawn_listener().await;
    let c = spawn_listener().await;
    // Room for two host pools
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 2,
        per_host_limit: 1,
        ..test_config()
    });

    let first = pool.get_connection("127.0.0.1", a.port()).await.unwrap();
    let second = pool.get_connection("127.0.0.1", b.port()).await.unwrap();
    let third = pool.get_connection("127.0.0.1", c.port()).await.unwrap();

    assert!(first.is_pooled());
    assert!(second.is_pooled());
    assert!(!third.is_pooled());

    let stats = pool.stats();
    assert_eq!(stats.host_pools, 2);
    assert_eq!(stats.direct, 1);
    // Direct connections do not count against the ceiling
    assert_eq!(stats.live_connections, 2);

    // Returning a direct connection closes it
    pool.return_connection(third);
    assert_eq!(pool.stats().idle_connections, 0);
}

#[tokio::test]
async fn test_return_to_full_host_pool_closes_connection() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 4,
        per_host_limit: 1,
        ..test_config()
    });

    let first = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    let second = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(pool.stats().live_connections, 2);

    pool.return_connection(first);
    pool.return_connection(second);

    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.live_connections, 1);
}

#[tokio::test]
async fn test_cleanup_evicts_idle_host_pools() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        keep_alive_ms: 25,
        ..test_config()
    });

    let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    pool.return_connection(conn);
    assert_eq!(pool.cleanup(), CleanupReport::default());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let report = pool.cleanup();

    assert_eq!(report.evicted_pools, 1);
    assert_eq!(report.evicted_connections, 1);
    let stats = pool.stats();
    assert_eq!(stats.host_pools, 0);
    assert_eq!(stats.live_connections, 0);
}

#[tokio::test]
async fn test_cleanup_keeps_fresh_connections_in_live_host_pool() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(PoolConfig {
        keep_alive_ms: 100,
        ..test_config()
    });

    let old = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    pool.return_connection(old);
    tokio::time::sleep(Duration::from_millis(140)).await;

    // Reuses the aged connection and dials a second one alongside it
    let old = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    let fresh = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(old.use_count(), 2);
    assert_eq!(fresh.use_count(), 1);
    pool.return_connection(old);
    pool.return_connection(fresh);
    assert_eq!(pool.stats().idle_connections, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = pool.cleanup();

    assert_eq!(report.evicted_pools, 0);
    assert_eq!(report.evicted_connections, 1);
    let stats = pool.stats();
    assert_eq!(stats.host_pools, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.live_connections, 1);

    let conn = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(conn.use_count(), 2);
}

#[tokio::test]
async fn test_failed_dial_releases_slot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pool = ConnectionPool::new(test_config());
    let err = pool.get_connection("127.0.0.1", port).await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(pool.stats().live_connections, 0);
    assert_eq!(pool.stats().created, 0);
}

#[tokio::test]
async fn test_shed_idle_relieves_pressure() {
    let addr = spawn_listener().await;
    let pool = ConnectionPool::new(test_config());

    let a = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    let b = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    pool.return_connection(a);
    pool.return_connection(b);
    assert_eq!(pool.stats().idle_connections, 2);

    assert_eq!(pool.relieve(), 2);
    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(stats.live_connections, 0);
    // Host pools survive shedding
    assert_eq!(stats.host_pools, 1);
}

#[tokio::test]
async fn test_close_releases_everything() {
    let addr = spawn_listener().await;
    let pool = Arc::new(ConnectionPool::new(test_config()));
    pool.start();

    let idle = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    let leased = pool.get_connection("127.0.0.1", addr.port()).await.unwrap();
    pool.return_connection(idle);

    pool.close();
    pool.close();
    assert!(pool.is_closed());
    assert_eq!(pool.stats().host_pools, 0);
    assert_eq!(pool.stats().live_connections, 1);

    // A lease returned after close is closed, not pooled
    pool.return_connection(leased);
    assert_eq!(pool.stats().live_connections, 0);

    let err = pool.get_connection("127.0.0.1", addr.port()).await.unwrap_err();
    assert!(matches!(err, EngineError::PoolClosed));
}
