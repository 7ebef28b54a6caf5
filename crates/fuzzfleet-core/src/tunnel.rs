//! Tunnel manager.
//!
//! The orchestration process reaches each location's private management
//! network through a SOCKS forwarder running on that location's jump
//! host. The manager owns exactly one such tunnel per location: it
//! probes the forwarding port with a short-timeout raw connect and,
//! when the probe fails, kills whatever holds the port, starts a fresh
//! background forwarder over the jump host's shell client, waits a
//! settle delay and probes again.
//!
//! There is deliberately no retry bound here. A missing tunnel is fatal
//! to every higher operation, so the manager repairs indefinitely;
//! supervision of a truly dead jump host belongs to the process level.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, time};
use tracing::{debug, warn};

use crate::{config::TunnelConfig, error::Result, ssh::ShellClient};

/// Liveness check for the forwarding port.
#[async_trait]
pub trait Probe: Send + Sync {
    /// True if `addr` is currently accepting connections.
    async fn probe(&self, addr: &str) -> bool;
}

/// Default probe: raw TCP connect with a short timeout.
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Create a probe with the given connect timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, addr: &str) -> bool {
        matches!(
            time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Owns the one tunnel of a location and keeps it alive.
pub struct TunnelManager {
    location: String,
    jump: Arc<ShellClient>,
    addr: String,
    port: u16,
    settle: Duration,
    probe: Box<dyn Probe>,
}

impl TunnelManager {
    /// Create a manager probing `<jump address>:<port>` over TCP.
    #[must_use]
    pub fn new(
        location: &str,
        jump: Arc<ShellClient>,
        jump_address: &str,
        config: &TunnelConfig,
    ) -> Self {
        let probe = TcpProbe::new(Duration::from_millis(config.probe_timeout_ms));
        Self::with_probe(location, jump, jump_address, config, Box::new(probe))
    }

    /// Create a manager with a custom probe.
    #[must_use]
    pub fn with_probe(
        location: &str,
        jump: Arc<ShellClient>,
        jump_address: &str,
        config: &TunnelConfig,
        probe: Box<dyn Probe>,
    ) -> Self {
        Self {
            location: location.into(),
            jump,
            addr: format!("{jump_address}:{}", config.port),
            port: config.port,
            settle: Duration::from_millis(config.settle_ms),
            probe,
        }
    }

    /// Address clients should use as their SOCKS proxy.
    #[must_use]
    pub fn proxy_addr(&self) -> &str {
        &self.addr
    }

    /// Idempotent: returns as soon as the forwarding port accepts
    /// connections, repairing the tunnel as many times as it takes.
    ///
    /// # Errors
    ///
    /// Only fatal local errors from the jump host's shell client
    /// propagate; probe and repair failures are absorbed by the loop.
    pub async fn ensure_healthy(&self) -> Result<()> {
        loop {
            if self.probe.probe(&self.addr).await {
                debug!(location = %self.location, addr = %self.addr, "tunnel healthy");
                return Ok(());
            }
            warn!(location = %self.location, addr = %self.addr, "tunnel down, repairing");
            self.repair().await?;
            time::sleep(self.settle).await;
        }
    }

    async fn repair(&self) -> Result<()> {
        // Clear whatever holds the port, then start a fresh forwarder.
        // The kill is allowed to find nothing.
        self.jump
            .exec(
                &format!("fuser -k {}/tcp >/dev/null 2>&1 || true", self.port),
                false,
            )
            .await?;
        self.jump
            .exec(
                &format!("ssh localhost -D 0.0.0.0:{} -N -f", self.port),
                true,
            )
            .await?;
        debug!(location = %self.location, port = self.port, "forwarder started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        retry::RetryPolicy,
        ssh::tests::{endpoint, ScriptedConnector},
    };

    /// Probe that fails a preset number of times before reporting the
    /// port open.
    struct FlakyProbe {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyProbe {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Probe for FlakyProbe {
        async fn probe(&self, _addr: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            port: 6969,
            probe_timeout_ms: 10,
            settle_ms: 0,
        }
    }

    fn manager(probe_failures: usize) -> (TunnelManager, Arc<tokio::sync::Mutex<Vec<String>>>) {
        let connector = ScriptedConnector::new(0);
        let commands = Arc::clone(&connector.commands);
        let jump = Arc::new(ShellClient::with_connector(
            endpoint(),
            RetryPolicy::immediate(),
            Box::new(connector),
        ));
        let manager = TunnelManager::with_probe(
            "1021-5",
            jump,
            "10.0.0.5",
            &config(),
            Box::new(FlakyProbe::new(probe_failures)),
        );
        (manager, commands)
    }

    #[tokio::test]
    async fn test_healthy_tunnel_issues_no_repair() {
        let (manager, commands) = manager(0);
        manager.ensure_healthy().await.expect("ensure");
        assert!(commands.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_probe_triggers_one_repair_sequence() {
        let (manager, commands) = manager(1);
        manager.ensure_healthy().await.expect("ensure");
        let commands = commands.lock().await;
        // Exactly one kill + one forwarder start, in that order.
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("fuser -k 6969/tcp"));
        assert!(commands[1].contains("ssh localhost -D 0.0.0.0:6969 -N -f"));
    }

    #[tokio::test]
    async fn test_repeated_failures_repair_until_healthy() {
        let (manager, commands) = manager(3);
        manager.ensure_healthy().await.expect("ensure");
        assert_eq!(commands.lock().await.len(), 6);
    }

    #[tokio::test]
    async fn test_proxy_addr_includes_port() {
        let (manager, _) = manager(0);
        assert_eq!(manager.proxy_addr(), "10.0.0.5:6969");
    }

    #[tokio::test]
    async fn test_tcp_probe_rejects_closed_port() {
        let probe = TcpProbe::new(Duration::from_millis(50));
        // Reserved port on localhost that nothing listens on.
        assert!(!probe.probe("127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_tcp_probe_accepts_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(probe.probe(&addr.to_string()).await);
    }
}
