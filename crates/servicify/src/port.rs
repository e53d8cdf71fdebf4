//! Port resolution for the local endpoint.

use std::sync::Arc;

use tokio::net::TcpListener;

#[derive(Debug, Clone, thiserror::Error)]
#[error("no port available on {host}: {reason}")]
pub struct Error {
    pub host: String,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hands out a port the endpoint can bind on `host`.
#[async_trait::async_trait]
pub trait PortAllocator: Send + Sync + 'static {
    async fn allocate(&self, host: &str) -> Result<u16>;
}

/// Asks the OS for an ephemeral port by binding port 0 and releasing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralPorts;

#[async_trait::async_trait]
impl PortAllocator for EphemeralPorts {
    async fn allocate(&self, host: &str) -> Result<u16> {
        let fail = |e: std::io::Error| Error {
            host: host.to_string(),
            reason: e.to_string(),
        };
        let listener = TcpListener::bind((host, 0)).await.map_err(fail)?;
        let port = listener.local_addr().map_err(fail)?.port();
        Ok(port)
    }
}

/// The explicit port if there is one; otherwise whatever the allocator gives.
///
/// An explicit port 0 counts as none: the registry must be told a real port.
pub async fn resolve(explicit: Option<u16>, host: &str, allocator: &Arc<dyn PortAllocator>) -> Result<u16> {
    match explicit {
        Some(port) if port != 0 => Ok(port),
        _ => allocator.allocate(host).await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[derive(Default)]
    struct CountingPorts {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PortAllocator for CountingPorts {
        async fn allocate(&self, _host: &str) -> Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(40000)
        }
    }

    #[tokio::test]
    async fn test_explicit_port_skips_allocator() {
        let counting = Arc::new(CountingPorts::default());
        let allocator: Arc<dyn PortAllocator> = counting.clone();

        assert_eq!(resolve(Some(5050), "127.0.0.1", &allocator).await.unwrap(), 5050);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);

        assert_eq!(resolve(None, "127.0.0.1", &allocator).await.unwrap(), 40000);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_zero_asks_allocator() {
        let counting = Arc::new(CountingPorts::default());
        let allocator: Arc<dyn PortAllocator> = counting.clone();

        assert_eq!(resolve(Some(0), "127.0.0.1", &allocator).await.unwrap(), 40000);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_port_is_bindable() {
        let port = EphemeralPorts.allocate("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let err = EphemeralPorts.allocate("no-such-host.invalid").await.unwrap_err();
        assert_eq!(err.host, "no-such-host.invalid");
    }
}
