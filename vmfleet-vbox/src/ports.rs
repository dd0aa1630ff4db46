//! Process-wide registry of host ports handed out for NAT forwarding.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::VboxError;

/// How long a loopback liveness probe may take before the port counts as free.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Hands out free TCP ports above a floor.
///
/// The in-process reservation set is the source of truth: a port is never
/// handed out twice during the process lifetime, even after whatever bound
/// it goes away. The loopback probe only skips ports something else already
/// listens on. The lock is held across the whole scan, so concurrent callers
/// always receive distinct ports.
#[derive(Debug)]
pub struct PortAllocator {
    floor: u16,
    given: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator whose default floor is `floor`.
    #[must_use]
    pub fn new(floor: u16) -> Self {
        Self {
            floor,
            given: Mutex::new(BTreeSet::new()),
        }
    }

    /// Return the first free port at or above `starting_from` (default floor when `None`).
    ///
    /// # Errors
    /// Returns [`VboxError::PortsExhausted`] if every port up to 65535 is taken.
    pub async fn next_free_port(&self, starting_from: Option<u16>) -> Result<u16, VboxError> {
        let floor = starting_from.unwrap_or(self.floor);
        let mut given = self.given.lock().await;
        for port in floor..=u16::MAX {
            if given.contains(&port) || is_accepting(port).await {
                continue;
            }
            given.insert(port);
            tracing::debug!(port, floor, "allocated host port");
            return Ok(port);
        }
        Err(VboxError::PortsExhausted { floor })
    }

    /// Same as [`Self::next_free_port`] with the floor given as text.
    ///
    /// An empty string selects the default floor.
    ///
    /// # Errors
    /// Returns [`VboxError::PortsExhausted`] if no port is free.
    ///
    /// # Panics
    /// Panics if `first_port` is not a valid port number. Callers pass
    /// literals or values they already validated, so this is a caller bug.
    pub async fn next_free_port_from(&self, first_port: &str) -> Result<u16, VboxError> {
        if first_port.is_empty() {
            return self.next_free_port(None).await;
        }
        let Ok(floor) = first_port.parse::<u16>() else {
            panic!("port floor '{first_port}' cannot be converted to a port number");
        };
        self.next_free_port(Some(floor)).await
    }

    /// Mark `port` as taken without probing it. Returns `false` if it already was.
    pub async fn reserve(&self, port: u16) -> bool {
        self.given.lock().await.insert(port)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(1025)
    }
}

/// Best-effort check whether something accepts connections on loopback `port`.
async fn is_accepting(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test]
    async fn same_port_is_never_handed_out_twice() {
        let ports = PortAllocator::new(41_000);
        let first = ports.next_free_port(None).await;
        let second = ports.next_free_port(None).await;
        match (first, second) {
            (Ok(a), Ok(b)) => {
                assert_ne!(a, b, "a given port must not be reissued");
                assert!(a >= 41_000 && b >= 41_000);
            }
            other => panic!("allocation failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ports() {
        let ports = Arc::new(PortAllocator::new(42_000));
        let mut tasks = JoinSet::new();
        for _ in 0..32 {
            let ports = Arc::clone(&ports);
            tasks.spawn(async move { ports.next_free_port(None).await });
        }
        let mut seen = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let port = match joined {
                Ok(Ok(p)) => p,
                other => panic!("allocation task failed: {other:?}"),
            };
            assert!(seen.insert(port), "port {port} issued twice");
        }
        assert_eq!(seen.len(), 32);
    }

    #[tokio::test]
    async fn listening_port_is_skipped() {
        let listener = match tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        let busy = match listener.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("no local addr: {e}"),
        };
        let ports = PortAllocator::default();
        let got = ports.next_free_port(Some(busy)).await;
        assert!(matches!(got, Ok(p) if p != busy), "busy port {busy} must be skipped, got {got:?}");
    }

    #[tokio::test]
    async fn reserved_port_is_skipped() {
        let ports = PortAllocator::new(43_000);
        assert!(ports.reserve(43_000).await);
        assert!(!ports.reserve(43_000).await, "second reserve reports existing");
        let got = ports.next_free_port(None).await;
        assert!(matches!(got, Ok(p) if p > 43_000), "got {got:?}");
    }

    #[tokio::test]
    async fn empty_floor_string_uses_default() {
        let ports = PortAllocator::new(44_000);
        let got = ports.next_free_port_from("").await;
        assert!(matches!(got, Ok(p) if p >= 44_000), "got {got:?}");
    }

    #[tokio::test]
    #[should_panic(expected = "cannot be converted")]
    async fn unparsable_floor_is_a_contract_violation() {
        let ports = PortAllocator::default();
        let _ = ports.next_free_port_from("ssh").await;
    }
}
