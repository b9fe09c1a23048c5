//! Default units of work: DNS lookups and pooled TCP banner reads

use super::task::{Task, UnitOfWork};
use crate::error::EngineError;
use crate::pool::ConnectionPool;
use crate::schedule::Scheduler;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::debug;

/// Bytes read when looking for a banner
const BANNER_BUFFER: usize = 512;

/// Resolves a hostname through the system resolver
pub struct DnsLookup {
    timeout: Duration,
    scheduler: Option<Arc<Scheduler>>,
}

impl DnsLookup {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            scheduler: None,
        }
    }

    /// Take the lookup timeout from the active profile on every task
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    fn timeout(&self) -> Duration {
        profile_timeout(self.scheduler.as_deref(), self.timeout)
    }
}

fn profile_timeout(scheduler: Option<&Scheduler>, fallback: Duration) -> Duration {
    scheduler.map_or(fallback, |s| s.current_profile().timeout())
}

#[async_trait]
impl UnitOfWork for DnsLookup {
    async fn execute(&self, task: &Task) -> Result<Value> {
        let host = task
            .payload
            .as_str()
            .or_else(|| task.payload.get("host").and_then(Value::as_str))
            .ok_or_else(|| anyhow!("DNS task {} has no hostname", task.id))?;

        let limit = self.timeout();
        let addrs = timeout(limit, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| anyhow!("DNS lookup for {} timed out after {:?}", host, limit))?
            .with_context(|| format!("DNS lookup for {} failed", host))?;

        let mut addresses: Vec<String> = addrs.map(|addr| addr.ip().to_string()).collect();
        addresses.sort();
        addresses.dedup();

        Ok(json!({
            "key": host,
            "addresses": addresses,
        }))
    }
}

/// Connects through the pool and reads whatever the service says first
pub struct TcpBannerProbe {
    pool: Arc<ConnectionPool>,
    read_timeout: Duration,
    scheduler: Option<Arc<Scheduler>>,
}

impl TcpBannerProbe {
    pub fn new(pool: Arc<ConnectionPool>, read_timeout: Duration) -> Self {
        Self {
            pool,
            read_timeout,
            scheduler: None,
        }
    }

    /// Take the banner read timeout from the active profile on every task
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

/// Split a `host:port` string or `{"host", "port"}` object
fn parse_target(payload: &Value) -> Option<(String, u16)> {
    if let Some(target) = payload.as_str() {
        let (host, port) = target.rsplit_once(':')?;
        return Some((host.trim_matches(['[', ']']).to_string(), port.parse().ok()?));
    }
    let host = payload.get("host")?.as_str()?;
    let port = u16::try_from(payload.get("port")?.as_u64()?).ok()?;
    Some((host.to_string(), port))
}

#[async_trait]
impl UnitOfWork for TcpBannerProbe {
    async fn execute(&self, task: &Task) -> Result<Value> {
        let (host, port) = parse_target(&task.payload)
            .ok_or_else(|| anyhow!("Probe task {} has no host:port target", task.id))?;
        let key = format!("{}:{}", host, port);

        let mut conn = match self.pool.get_connection(&host, port).await {
            Ok(conn) => conn,
            Err(EngineError::Dial { source, .. }) if source.kind() == ErrorKind::ConnectionRefused => {
                return Ok(json!({ "key": key, "open": false }));
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = vec![0u8; BANNER_BUFFER];
        let read_timeout = profile_timeout(self.scheduler.as_deref(), self.read_timeout);
        let banner = match timeout(read_timeout, conn.stream_mut().read(&mut buf)).await {
            Ok(Ok(0)) => {
                // Peer closed, the connection is spent
                None
            }
            Ok(Ok(n)) => {
                let banner = String::from_utf8_lossy(&buf[..n]).trim().to_string();
                self.pool.return_connection(conn);
                Some(banner)
            }
            Ok(Err(e)) => {
                debug!(target = %key, error = %e, "Banner read failed");
                None
            }
            Err(_) => {
                // Silent service, the socket is still good
                self.pool.return_connection(conn);
                None
            }
        };

        Ok(json!({
            "key": key,
            "open": true,
            "banner": banner,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig};
    use crate::health::{HealthMonitor, StaticSampler};
    use crate::schedule::ManualClock;
    use chrono::DateTime;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(
            parse_target(&json!("10.0.0.1:22")),
            Some(("10.0.0.1".to_string(), 22))
        );
        assert_eq!(parse_target(&json!("[::1]:443")), Some(("::1".to_string(), 443)));
        assert_eq!(
            parse_target(&json!({"host": "example.com", "port": 80})),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(parse_target(&json!("no-port")), None);
        assert_eq!(parse_target(&json!({"host": "h", "port": 70000})), None);
    }

    #[tokio::test]
    async fn test_banner_probe_reads_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
                held.push(stream);
            }
        });

        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let probe = TcpBannerProbe::new(Arc::clone(&pool), Duration::from_secs(2));
        let task = Task::new("p1", "banner", json!(format!("127.0.0.1:{}", port)));

        let result = probe.execute(&task).await.unwrap();
        assert_eq!(result["open"], json!(true));
        assert_eq!(result["banner"], json!("SSH-2.0-OpenSSH_9.6"));
        assert_eq!(result["key"], json!(format!("127.0.0.1:{}", port)));
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_banner_probe_silent_service_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let probe = TcpBannerProbe::new(Arc::clone(&pool), Duration::from_millis(50));
        let task = Task::new("p2", "banner", json!({"host": "127.0.0.1", "port": port}));

        let result = probe.execute(&task).await.unwrap();
        assert_eq!(result["open"], json!(true));
        assert!(result["banner"].is_null());
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_banner_read_follows_active_profile_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        // Noon without high performance is conservation mode
        let mut config = EngineConfig::default();
        config.profiles.conservation.timeout_ms = 50;
        let monitor = Arc::new(HealthMonitor::new(
            config.monitor.clone(),
            config.thresholds.clone(),
            Arc::new(StaticSampler::new(100, None)),
        ));
        let noon = DateTime::parse_from_rfc3339("2024-06-15T12:00:00+00:00").unwrap();
        let scheduler = Arc::new(
            Scheduler::with_clock(&config, monitor, Arc::new(ManualClock::new(noon))).unwrap(),
        );

        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let probe = TcpBannerProbe::new(Arc::clone(&pool), Duration::from_secs(60))
            .with_scheduler(scheduler);
        let task = Task::new("p4", "banner", json!({"host": "127.0.0.1", "port": port}));

        let result = tokio::time::timeout(Duration::from_secs(5), probe.execute(&task))
            .await
            .expect("read bounded by the profile timeout")
            .unwrap();
        assert!(result["banner"].is_null());
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_banner_probe_reports_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let probe = TcpBannerProbe::new(pool, Duration::from_millis(50));
        let task = Task::new("p3", "banner", json!(format!("127.0.0.1:{}", port)));

        let result = probe.execute(&task).await.unwrap();
        assert_eq!(result["open"], json!(false));
    }

    #[tokio::test]
    async fn test_dns_lookup_resolves_literal_address() {
        let lookup = DnsLookup::new(Duration::from_secs(5));
        let task = Task::new("d1", "dns", json!("127.0.0.1"));

        let result = lookup.execute(&task).await.unwrap();
        assert_eq!(result["key"], json!("127.0.0.1"));
        assert_eq!(result["addresses"], json!(["127.0.0.1"]));
    }

    #[tokio::test]
    async fn test_dns_lookup_rejects_missing_hostname() {
        let lookup = DnsLookup::new(Duration::from_secs(1));
        let task = Task::new("d2", "dns", json!(42));

        assert!(lookup.execute(&task).await.is_err());
    }
}
