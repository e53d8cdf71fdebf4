//! # Offering Lifecycle
//!
//! `OfferingManager` takes one target from `Idle` to a registered, heartbeating
//! offering and hands back a [`ServiceHandle`]; the handle's `stop` takes it
//! down again.
//!
//! ```text
//! Idle ─offer─▶ Starting ─registered─▶ Offering ⟲ tick ─stop─▶ Stopping ─▶ Stopped
//!   ▲              │
//!   └──failure─────┘
//! ```
//!
//! ## Invariants
//! - **One offering per manager**: `offer` only succeeds from `Idle`, and
//!   `Stopped` is terminal.
//! - **No orphans**: a failed start leaves neither a listening endpoint nor a
//!   registry entry behind.
//! - **Quiet after stop**: once `stop` returns, no further `offer` for the
//!   offering's id leaves this process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::config;
use crate::config::Config;
use crate::endpoint;
use crate::endpoint::Endpoint;
use crate::endpoint::InvokeHandler;
use crate::load::InvocationCounter;
use crate::offering::OfferSpec;
use crate::offering::Offering;
use crate::offering::ServiceSpec;
use crate::offering::expires_at;
use crate::package;
use crate::package::PackageResolver;
use crate::port;
use crate::port::EphemeralPorts;
use crate::port::PortAllocator;
use crate::registry;
use crate::registry::Registry;
use crate::registry::RpcRegistry;
use crate::target;
use crate::target::Export;
use crate::target::Target;
use crate::target::TargetKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("manager is {0}, not idle")]
    NotIdle(State),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("{0}")]
    UnsupportedTarget(target::Error),
    #[error("port resolution failed: {0}")]
    PortResolution(#[from] port::Error),
    #[error("endpoint failed to start: {0}")]
    EndpointStart(#[from] endpoint::Error),
    #[error("registration failed: {0}")]
    Registration(#[source] registry::Error),
    #[error("package resolution failed: {0}")]
    Package(#[from] package::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Starting,
    Offering,
    Stopping,
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Offering => "offering",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle state shared between a manager and the handle it produced.
#[derive(Clone)]
struct StateCell(Arc<Mutex<State>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(State::Idle)))
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn get(&self) -> State {
        self.with(|s| *s)
    }

    fn set(&self, next: State) {
        self.with(|s| *s = next)
    }

    /// Moves `from → to` atomically, or reports the state it found instead.
    fn transition(&self, from: State, to: State) -> std::result::Result<(), State> {
        self.with(|s| {
            if *s == from {
                *s = to;
                Ok(())
            } else {
                Err(*s)
            }
        })
    }
}

/// Puts the manager back to `Idle` unless the start completed.
///
/// Covers early returns and a caller dropping the `offer` future mid-way.
struct StartGuard {
    state: StateCell,
    armed: bool,
}

impl StartGuard {
    fn complete(mut self) {
        self.armed = false;
        self.state.set(State::Offering);
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.set(State::Idle);
        }
    }
}

/// Offers one target to a registry and keeps the offer alive.
pub struct OfferingManager {
    config: Config,
    registry: Arc<dyn Registry>,
    ports: Arc<dyn PortAllocator>,
    state: StateCell,
}

impl OfferingManager {
    /// A manager talking to the registry named in `config`.
    ///
    /// Nothing connects until the first `offer`.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(RpcRegistry::from_config(&config));
        Self {
            config,
            registry,
            ports: Arc::new(EphemeralPorts),
            state: StateCell::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Classifies a resolved export by its parameter names, then offers it.
    pub async fn offer_export(&self, export: Export, spec: OfferSpec) -> Result<ServiceHandle> {
        let target = Target::from_export(export).map_err(Error::UnsupportedTarget)?;
        self.offer(target, spec).await
    }

    /// Resolves a package and offers its export under the package's own
    /// name and version. Only `host` and `port` are taken from `placement`.
    pub async fn offer_package(
        &self,
        resolver: &dyn PackageResolver,
        identifier: &str,
        placement: OfferSpec,
    ) -> Result<ServiceHandle> {
        let resolved = package::resolve(resolver, identifier)?;
        tracing::debug!(identifier, name = %resolved.name, version = %resolved.version, "package resolved");

        let spec = OfferSpec {
            name: resolved.name,
            version: resolved.version,
            ..placement
        };
        self.offer_export(resolved.export, spec).await
    }

    /// Starts the endpoint, registers it, and begins heartbeating.
    pub async fn offer(&self, target: Target, spec: OfferSpec) -> Result<ServiceHandle> {
        // a zero interval would panic the heartbeat task after a successful start
        self.config.validate()?;

        self.state
            .transition(State::Idle, State::Starting)
            .map_err(Error::NotIdle)?;
        let guard = StartGuard {
            state: self.state.clone(),
            armed: true,
        };

        let handle = self.start(target, spec).await?;
        guard.complete();

        tracing::info!(
            id = %handle.id,
            name = %handle.spec.name,
            version = %handle.spec.version,
            addr = %handle.local_addr,
            kind = %handle.spec.kind,
            "offering"
        );
        Ok(handle)
    }

    async fn start(&self, target: Target, spec: OfferSpec) -> Result<ServiceHandle> {
        let host = spec.host().to_string();
        let port = port::resolve(spec.port, &host, &self.ports).await?;

        let service = ServiceSpec {
            name: spec.name,
            version: spec.version,
            host,
            port,
            kind: target.kind(),
        };

        let handler = Arc::new(InvokeHandler::new(target.clone()));
        let endpoint = Endpoint::start(&service.host, service.port, handler).await?;
        let local_addr = endpoint.local_addr();

        let interval = self.config.heartbeat_interval();
        let mut offering = Offering::new(service.clone());
        offering.expires = expires_at(SystemTime::now(), interval);

        let registered = match self.registry.offer(&offering).await {
            Ok(registered) => registered,
            Err(e) => {
                endpoint.stop().await;
                return Err(Error::Registration(e));
            }
        };
        let Some(id) = registered.id else {
            endpoint.stop().await;
            return Err(Error::Registration(registry::Error::BadReply("offer reply carried no id".into())));
        };
        offering.id = Some(id.clone());

        // the first load window opens now, not when the target was built
        target.counter().sample(Instant::now());

        let (published, offering_rx) = watch::channel(offering.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = Heartbeat {
            registry: self.registry.clone(),
            counter: target.counter().clone(),
            interval,
            offering,
            published,
        };
        let heartbeat = tokio::spawn(heartbeat.run(stop_rx));

        Ok(ServiceHandle {
            spec: service,
            id,
            server: (self.config.host.clone(), self.config.port),
            local_addr,
            target,
            offering: offering_rx,
            registry: self.registry.clone(),
            endpoint: Some(endpoint),
            heartbeat: Some(heartbeat),
            stop_tx: Some(stop_tx),
            state: self.state.clone(),
        })
    }
}

/// The per-offering heartbeat task.
struct Heartbeat {
    registry: Arc<dyn Registry>,
    counter: Arc<InvocationCounter>,
    interval: Duration,
    offering: Offering,
    published: watch::Sender<Offering>,
}

type Beat = (Offering, registry::Result<Offering>);

impl Heartbeat {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // each beat is its own call, so a slow registry never delays the next tick
        let mut in_flight: JoinSet<Beat> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                // fires on stop() and on the handle being dropped
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let load = self.counter.sample(Instant::now());
                    self.offering.refresh(load, SystemTime::now(), self.interval);

                    let snapshot = self.offering.clone();
                    let registry = self.registry.clone();
                    tracing::debug!(seq = snapshot.seq, load, "heartbeat");
                    in_flight.spawn(async move {
                        let result = registry.offer(&snapshot).await;
                        (snapshot, result)
                    });
                }
                Some(beat) = in_flight.join_next() => self.acknowledge(beat),
            }
        }

        in_flight.shutdown().await;
    }

    /// Publishes an acknowledged beat unless a newer one already landed.
    fn acknowledge(&self, beat: std::result::Result<Beat, JoinError>) {
        match beat {
            Ok((sent, Ok(_))) => {
                let seq = sent.seq;
                let applied = self.published.send_if_modified(|current| {
                    if sent.seq > current.seq {
                        *current = sent;
                        true
                    } else {
                        false
                    }
                });
                if !applied {
                    tracing::debug!(seq, "stale heartbeat ack ignored");
                }
            }
            Ok((sent, Err(e))) => {
                tracing::warn!(seq = sent.seq, error = %e, "heartbeat failed");
            }
            Err(e) if e.is_panic() => tracing::warn!(error = %e, "heartbeat task panicked"),
            Err(_) => {}
        }
    }
}

/// A live offering: where it is, how busy it is, and how to stop it.
///
/// Dropping a handle without `stop` ends the heartbeat and the endpoint but
/// sends no rescind; the registry lets the offering expire on its own.
pub struct ServiceHandle {
    spec: ServiceSpec,
    id: String,
    server: (String, u16),
    local_addr: SocketAddr,
    target: Target,
    offering: watch::Receiver<Offering>,
    registry: Arc<dyn Registry>,
    endpoint: Option<Endpoint>,
    heartbeat: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
    state: StateCell,
}

impl ServiceHandle {
    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn kind(&self) -> TargetKind {
        self.spec.kind
    }

    /// The id the registry assigned.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registry host and port this offering reports to.
    pub fn server(&self) -> (&str, u16) {
        (&self.server.0, self.server.1)
    }

    /// The address the endpoint actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Load as of the latest acknowledged heartbeat.
    pub fn load(&self) -> u64 {
        self.offering.borrow().load
    }

    pub fn expires(&self) -> u64 {
        self.offering.borrow().expires
    }

    /// Snapshot of the offering as last acknowledged by the registry.
    pub fn offering(&self) -> Offering {
        self.offering.borrow().clone()
    }

    /// A receiver that changes whenever a newer heartbeat is acknowledged.
    pub fn subscribe(&self) -> watch::Receiver<Offering> {
        self.offering.clone()
    }

    /// Calls the target in-process; counts toward load like a remote call.
    pub async fn invoke(&self, args: Vec<Value>) -> target::Result<Value> {
        self.target.invoke(args).await
    }

    /// Cancels the heartbeat, rescinds the offer, then stops the endpoint.
    ///
    /// Rescind failures are logged; the endpoint comes down regardless.
    pub async fn stop(mut self) {
        self.state.set(State::Stopping);

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }

        // an aborted beat may already sit in the connection's write queue; it
        // still reaches the registry before the rescind on the same connection
        match self.registry.rescind(&self.id).await {
            Ok(()) => tracing::debug!(id = %self.id, "rescinded"),
            Err(e) => tracing::warn!(id = %self.id, error = %e, "rescind failed"),
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.stop().await;
        }

        self.state.set(State::Stopped);
        tracing::info!(id = %self.id, name = %self.spec.name, "stopped");
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.state.set(State::Stopped);
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("local_addr", &self.local_addr)
            .field("load", &self.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::package::ResolvedPackage;
    use crate::package::StaticPackages;
    use crate::target::Returned;

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Records every call and assigns `svc-1` on offer.
    #[derive(Default)]
    struct MockRegistry {
        offers: Mutex<Vec<Offering>>,
        rescinds: Mutex<Vec<String>>,
        reject_offers: AtomicBool,
        omit_id: AtomicBool,
    }

    impl MockRegistry {
        fn offers(&self) -> Vec<Offering> {
            self.offers.lock().unwrap().clone()
        }

        fn rescinds(&self) -> Vec<String> {
            self.rescinds.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Registry for MockRegistry {
        async fn offer(&self, offering: &Offering) -> registry::Result<Offering> {
            self.offers.lock().unwrap().push(offering.clone());
            if self.reject_offers.load(Ordering::SeqCst) {
                return Err(registry::Error::BadReply("rejected".into()));
            }
            let mut reply = offering.clone();
            if !self.omit_id.load(Ordering::SeqCst) {
                reply.id = Some("svc-1".into());
            }
            Ok(reply)
        }

        async fn rescind(&self, id: &str) -> registry::Result<()> {
            self.rescinds.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn manager(registry: &Arc<MockRegistry>, interval_ms: u64) -> OfferingManager {
        let config = Config::default().with_heartbeat_interval(Duration::from_millis(interval_ms));
        OfferingManager::new(config).with_registry(registry.clone())
    }

    fn identity() -> Target {
        Target::promised(|args: Vec<Value>| async move { Ok::<_, Value>(args.into_iter().next().unwrap_or_default()) })
    }

    // ========================================================================
    // Load
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_load_follows_invocations() {
        let registry = Arc::new(MockRegistry::default());
        let handle = manager(&registry, 10)
            .offer(identity(), OfferSpec::new("identity", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(handle.load(), 0);

        tokio::time::sleep(Duration::from_millis(6)).await;
        for i in 0..3 {
            assert_eq!(handle.invoke(vec![json!(i)]).await.unwrap(), json!(i));
        }

        // first tick at 10ms: three calls over a 10ms window
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(handle.load(), 300);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.load(), 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeats_leave_load_alone() {
        let registry = Arc::new(MockRegistry::default());
        let handle = manager(&registry, 10)
            .offer(identity(), OfferSpec::new("identity", "1.0.0"))
            .await
            .unwrap();

        registry.reject_offers.store(true, Ordering::SeqCst);
        handle.invoke(vec![json!(1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;

        // every tick still went out
        assert_eq!(registry.offers().len(), 4);
        assert_eq!(handle.load(), 0);
        assert_eq!(handle.offering().seq, 0);

        handle.stop().await;
        assert_eq!(registry.rescinds(), vec!["svc-1".to_string()]);
    }

    #[tokio::test]
    async fn test_out_of_order_acks_keep_the_newest() {
        let base = Offering::new(ServiceSpec {
            name: "identity".into(),
            version: "1.0.0".into(),
            host: "127.0.0.1".into(),
            port: 4000,
            kind: TargetKind::Promised,
        });
        let (published, offering) = watch::channel(base.clone());
        let heartbeat = Heartbeat {
            registry: Arc::new(MockRegistry::default()),
            counter: Arc::new(InvocationCounter::new()),
            interval: Duration::from_millis(10),
            offering: base.clone(),
            published,
        };

        let beat = |seq: u64, load: u64| -> std::result::Result<Beat, JoinError> {
            let mut sent = base.clone();
            sent.seq = seq;
            sent.load = load;
            Ok((sent.clone(), Ok(sent)))
        };

        heartbeat.acknowledge(beat(2, 20));
        heartbeat.acknowledge(beat(1, 10));
        assert_eq!(offering.borrow().seq, 2);
        assert_eq!(offering.borrow().load, 20);

        let mut failed = base.clone();
        failed.seq = 3;
        heartbeat.acknowledge(Ok((failed, Err(registry::Error::BadReply("down".into())))));
        assert_eq!(offering.borrow().seq, 2);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_stop_rescinds_once_then_goes_quiet() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10);
        let handle = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(manager.state(), State::Offering);
        assert_eq!(handle.id(), "svc-1");
        assert_eq!(handle.server(), ("127.0.0.1", 2020));

        tokio::time::sleep(Duration::from_millis(35)).await;
        let offers = registry.offers();
        assert_eq!(offers.len(), 4, "registration plus three heartbeats");
        assert!(offers[0].id.is_none());
        assert!(offers[1..].iter().all(|o| o.id.as_deref() == Some("svc-1")));
        assert_eq!(offers.iter().map(|o| o.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        handle.stop().await;
        assert_eq!(manager.state(), State::Stopped);
        assert_eq!(registry.rescinds(), vec!["svc-1".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.offers().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_heartbeats_without_rescind() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10);
        let handle = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0"))
            .await
            .unwrap();

        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.offers().len(), 1);
        assert!(registry.rescinds().is_empty());
        assert_eq!(manager.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_second_offer_is_refused() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let handle = manager.offer(identity(), OfferSpec::new("a", "1")).await.unwrap();
        let err = manager.offer(identity(), OfferSpec::new("b", "1")).await.unwrap_err();
        assert!(matches!(err, Error::NotIdle(State::Offering)));

        handle.stop().await;
        let err = manager.offer(identity(), OfferSpec::new("b", "1")).await.unwrap_err();
        assert!(matches!(err, Error::NotIdle(State::Stopped)));

        assert_eq!(registry.offers().len(), 1);
    }

    // ========================================================================
    // Start failures
    // ========================================================================

    #[tokio::test]
    async fn test_failed_registration_frees_the_port() {
        let registry = Arc::new(MockRegistry::default());
        registry.reject_offers.store(true, Ordering::SeqCst);
        let manager = manager(&registry, 10_000);

        let port = EphemeralPorts.allocate("127.0.0.1").await.unwrap();
        let err = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0").with_port(port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
        assert_eq!(manager.state(), State::Idle);

        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_never_reaches_the_registry() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let err = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0").with_port(port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EndpointStart(_)));
        assert_eq!(manager.state(), State::Idle);
        assert!(registry.offers().is_empty());

        drop(held);
        let handle = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0").with_port(port))
            .await
            .unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_refused_before_start() {
        let registry = Arc::new(MockRegistry::default());
        let config = Config {
            heartbeat_interval_ms: 0,
            ..Config::default()
        };
        let manager = OfferingManager::new(config).with_registry(registry.clone());

        let err = manager.offer(identity(), OfferSpec::new("identity", "1.0.0")).await.unwrap_err();
        assert!(matches!(err, Error::Config(config::Error::ZeroInterval)));
        assert_eq!(manager.state(), State::Idle);
        assert!(registry.offers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_interval_still_heartbeats() {
        let registry = Arc::new(MockRegistry::default());
        let config = Config::default().with_heartbeat_interval(Duration::from_micros(500));
        let manager = OfferingManager::new(config).with_registry(registry.clone());

        let handle = manager.offer(identity(), OfferSpec::new("identity", "1.0.0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.offers().len() > 1, "heartbeats never went out");
        assert_eq!(manager.state(), State::Offering);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_port_zero_advertises_the_bound_port() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let handle = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0").with_port(0))
            .await
            .unwrap();
        assert_ne!(handle.port(), 0);
        assert_eq!(handle.port(), handle.local_addr().port());
        assert_eq!(registry.offers()[0].spec.port, handle.port());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_reply_without_id_is_a_registration_failure() {
        let registry = Arc::new(MockRegistry::default());
        registry.omit_id.store(true, Ordering::SeqCst);
        let manager = manager(&registry, 10_000);

        let err = manager.offer(identity(), OfferSpec::new("identity", "1.0.0")).await.unwrap_err();
        assert!(matches!(err, Error::Registration(registry::Error::BadReply(_))));
        assert_eq!(manager.state(), State::Idle);

        // back to idle, so a retry is allowed
        registry.omit_id.store(false, Ordering::SeqCst);
        let handle = manager.offer(identity(), OfferSpec::new("identity", "1.0.0")).await.unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_explicit_port_skips_the_allocator() {
        struct NoPorts(AtomicUsize);

        #[async_trait::async_trait]
        impl PortAllocator for NoPorts {
            async fn allocate(&self, host: &str) -> port::Result<u16> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(port::Error {
                    host: host.to_string(),
                    reason: "exhausted".into(),
                })
            }
        }

        let registry = Arc::new(MockRegistry::default());
        let ports = Arc::new(NoPorts(AtomicUsize::new(0)));

        let port = EphemeralPorts.allocate("127.0.0.1").await.unwrap();
        let manager = manager(&registry, 10_000).with_port_allocator(ports.clone());
        let handle = manager
            .offer(identity(), OfferSpec::new("identity", "1.0.0").with_port(port))
            .await
            .unwrap();
        assert_eq!(handle.port(), port);
        assert_eq!(handle.local_addr().port(), port);
        assert_eq!(registry.offers()[0].spec.port, port);
        assert_eq!(ports.0.load(Ordering::SeqCst), 0);
        handle.stop().await;

        let manager = self::manager(&registry, 10_000).with_port_allocator(ports.clone());
        let err = manager.offer(identity(), OfferSpec::new("identity", "1.0.0")).await.unwrap_err();
        assert!(matches!(err, Error::PortResolution(_)));
        assert_eq!(manager.state(), State::Idle);
        assert_eq!(ports.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_export_is_refused_up_front() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let err = manager
            .offer_export(Export::Value(json!(42)), OfferSpec::new("answer", "1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedTarget(target::Error::UnsupportedTarget("a number"))));
        assert_eq!(manager.state(), State::Idle);
        assert!(registry.offers().is_empty());
    }

    // ========================================================================
    // Packages
    // ========================================================================

    fn packages() -> StaticPackages {
        StaticPackages::new().with(
            "async-identity",
            ResolvedPackage {
                name: "async-identity".into(),
                version: "2.3.1".into(),
                export: Export::function(&["x", "cb"], |args, done| {
                    if let Some(done) = done {
                        done.ok(args.into_iter().next().unwrap_or_default());
                    }
                    Returned::Value(Value::Null)
                }),
            },
        )
    }

    #[tokio::test]
    async fn test_package_supplies_name_and_version() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let placement = OfferSpec::new("ignored", "0.0.0");
        let handle = manager
            .offer_package(&packages(), "async-identity", placement)
            .await
            .unwrap();
        assert_eq!(handle.name(), "async-identity");
        assert_eq!(handle.version(), "2.3.1");
        assert_eq!(handle.kind(), TargetKind::Callback);
        assert_eq!(registry.offers()[0].spec.name, "async-identity");
        assert_eq!(handle.invoke(vec![json!(10)]).await.unwrap(), json!(10));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_relative_package_path_is_refused() {
        let registry = Arc::new(MockRegistry::default());
        let manager = manager(&registry, 10_000);

        let err = manager
            .offer_package(&packages(), "./async-identity", OfferSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Package(package::Error::RelativePath(_))));
        assert_eq!(manager.state(), State::Idle);
        assert!(registry.offers().is_empty());
    }
}
