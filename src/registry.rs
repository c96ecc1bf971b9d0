//! Consumer-side provider registry.
//!
//! Converges, from an unordered stream of announcements, to a deduplicated
//! view of live provider instances keyed by `instanceId`. The collection only
//! grows (re-announcements overwrite in place) until the consumer explicitly
//! clears it; the protocol has no retraction message.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use wallet_discovery::{Announcer, Capability, LocalMedium, ProviderInfo, ProviderRegistry};
//!
//! # fn main() -> wallet_discovery::Result<()> {
//! let medium = Arc::new(LocalMedium::new());
//!
//! // A wallet that loaded before the consumer: its first announcement is lost.
//! let info = ProviderInfo::new("io.example", "Example", "data:image/png;base64,AA==");
//! let _wallet = Announcer::initialize(medium.clone(), info, Capability::new(()))?;
//!
//! // The registry's request brings it back.
//! let registry = ProviderRegistry::initialize(medium.clone())?;
//! assert_eq!(registry.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{Stream, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::medium::{Medium, Subscription};
use crate::message::{Event, Message, Namespace};
use crate::record::ProviderRecord;
use crate::Result;

/// Configuration for a [`ProviderRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Event namespace to discover under. Default: `eip6963`.
    pub namespace: Namespace,
    /// Buffered changes per [`changes()`](ProviderRegistry::changes) stream
    /// before a slow reader starts skipping. Default: 64.
    pub change_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: Namespace::default(),
            change_capacity: 64,
        }
    }
}

impl RegistryConfig {
    /// Set the event namespace.
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Set the change stream buffer size (minimum 1).
    pub fn change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity;
        self
    }
}

/// What happened to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new instance id was announced.
    Added,
    /// A known instance id re-announced; its entry was overwritten.
    Updated,
    /// The consumer cleared the collection.
    Cleared,
}

/// Notification delivered after every mutation of the collection.
#[derive(Debug, Clone)]
pub struct RegistryChange {
    /// Kind of mutation.
    pub kind: ChangeKind,
    /// The upserted record; `None` for [`ChangeKind::Cleared`].
    pub record: Option<ProviderRecord>,
    /// The full collection after the mutation, in first-seen order.
    pub providers: Vec<ProviderRecord>,
}

/// Handle for removing an [`on_change`](ProviderRegistry::on_change) callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&RegistryChange) + Send + Sync>;

struct Shared {
    namespace: Namespace,
    providers: Mutex<IndexMap<Uuid, ProviderRecord>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    dropped: AtomicU64,
    changes: broadcast::Sender<RegistryChange>,
    snapshot: watch::Sender<Vec<ProviderRecord>>,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<RegistryChange>,
    delivering: bool,
}

/// Hands delivery back if a listener panics.
struct Delivering<'a>(&'a Mutex<Pending>);

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

impl Shared {
    fn handle(&self, event: &Event) {
        match Message::from_event(event, &self.namespace) {
            Ok(Some(Message::AnnounceProvider(record))) => self.upsert(record),
            Ok(Some(Message::RequestProvider)) | Ok(None) => {
                trace!(kind = %event.kind, "ignoring non-announce event");
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropping malformed announcement");
            }
        }
    }

    fn upsert(&self, record: ProviderRecord) {
        {
            let mut map = self.providers.lock();
            let kind = match map.insert(record.instance_id(), record.clone()) {
                Some(_) => ChangeKind::Updated,
                None => ChangeKind::Added,
            };
            let providers: Vec<ProviderRecord> = map.values().cloned().collect();
            debug!(
                instance = %record.instance_id(),
                wallet = %record.info().wallet_id,
                ?kind,
                total = providers.len(),
                "provider announced"
            );
            self.publish_locked(RegistryChange {
                kind,
                record: Some(record),
                providers,
            });
        }
        self.deliver();
    }

    fn clear(&self) -> usize {
        let removed = {
            let mut map = self.providers.lock();
            let removed = std::mem::take(&mut *map);
            if !removed.is_empty() {
                self.publish_locked(RegistryChange {
                    kind: ChangeKind::Cleared,
                    record: None,
                    providers: Vec::new(),
                });
            }
            removed
        };
        self.deliver();
        removed.len()
    }

    /// Must be called with `providers` held so snapshots, stream items and
    /// queued listener calls follow mutation order.
    fn publish_locked(&self, change: RegistryChange) {
        self.snapshot.send_replace(change.providers.clone());
        // No receivers is fine; streams are optional.
        let _ = self.changes.send(change.clone());
        self.pending.lock().queue.push_back(change);
    }

    /// Run listeners for queued changes, outside the `providers` lock.
    ///
    /// One thread delivers at a time. A caller that finds delivery already
    /// in progress returns at once; its change is picked up by the thread
    /// already delivering, in order.
    fn deliver(&self) {
        {
            let mut pending = self.pending.lock();
            if pending.delivering {
                return;
            }
            pending.delivering = true;
        }
        let _guard = Delivering(&self.pending);

        loop {
            let change = {
                let mut pending = self.pending.lock();
                match pending.queue.pop_front() {
                    Some(change) => change,
                    None => {
                        // Released under the same lock that saw the queue empty.
                        pending.delivering = false;
                        return;
                    }
                }
            };
            let listeners: Vec<Listener> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            for listener in listeners {
                listener(&change);
            }
        }
    }

    fn records(&self) -> Vec<ProviderRecord> {
        self.providers.lock().values().cloned().collect()
    }
}

/// Discovers and deduplicates announced providers.
///
/// Each registry owns its collection; several registries on one medium see
/// the same announcements but never share state. Dropping the registry
/// unsubscribes it and ends its streams.
pub struct ProviderRegistry {
    shared: Arc<Shared>,
    medium: Arc<dyn Medium>,
    _subscription: Subscription,
}

impl ProviderRegistry {
    /// Start discovering with the default configuration.
    pub fn initialize(medium: Arc<dyn Medium>) -> Result<Self> {
        Self::with_config(medium, RegistryConfig::default())
    }

    /// Subscribe to announcements, then request them.
    ///
    /// The subscription is installed before the request goes out, so
    /// announcers answering synchronously from their request handler are
    /// never missed.
    pub fn with_config(medium: Arc<dyn Medium>, config: RegistryConfig) -> Result<Self> {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        let (snapshot, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            namespace: config.namespace,
            providers: Mutex::new(IndexMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            changes,
            snapshot,
            pending: Mutex::new(Pending::default()),
        });

        let handler_shared = Arc::clone(&shared);
        let subscription = medium.subscribe(
            &shared.namespace.announce_event(),
            Arc::new(move |event: &Event| handler_shared.handle(event)),
        )?;

        let registry = Self {
            shared,
            medium,
            _subscription: subscription,
        };
        registry.refresh()?;
        info!(
            namespace = %registry.shared.namespace,
            providers = registry.len(),
            "registry ready"
        );
        Ok(registry)
    }

    /// Ask every announcer to announce again. Existing entries are kept.
    pub fn refresh(&self) -> Result<()> {
        debug!(namespace = %self.shared.namespace, "requesting providers");
        self.medium
            .publish(Message::RequestProvider.to_event(&self.shared.namespace))
    }

    /// Forget every known provider. Returns how many were removed.
    ///
    /// Listeners see a [`ChangeKind::Cleared`] change if anything was removed.
    pub fn clear(&self) -> usize {
        let removed = self.shared.clear();
        debug!(removed, "registry cleared");
        removed
    }

    /// Clear, then request providers again.
    pub fn reset(&self) -> Result<()> {
        self.clear();
        self.refresh()
    }

    /// Snapshot of known providers in first-seen order.
    ///
    /// The returned vector is detached from the registry.
    pub fn providers(&self) -> Vec<ProviderRecord> {
        self.shared.records()
    }

    /// Look up one instance.
    pub fn get(&self, instance_id: &Uuid) -> Option<ProviderRecord> {
        self.shared.providers.lock().get(instance_id).cloned()
    }

    /// All known instances of one wallet product.
    pub fn find_by_wallet_id(&self, wallet_id: &str) -> Vec<ProviderRecord> {
        self.shared
            .providers
            .lock()
            .values()
            .filter(|record| record.info().wallet_id == wallet_id)
            .cloned()
            .collect()
    }

    /// Number of known instances.
    pub fn len(&self) -> usize {
        self.shared.providers.lock().len()
    }

    /// Whether no provider is known (yet, or ever; the two are indistinguishable).
    pub fn is_empty(&self) -> bool {
        self.shared.providers.lock().is_empty()
    }

    /// Announcements rejected as malformed so far.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// The namespace this registry listens on.
    pub fn namespace(&self) -> &Namespace {
        &self.shared.namespace
    }

    /// Call `listener` after every change to the collection.
    ///
    /// Listeners see changes one at a time, in the order the collection
    /// changed. They run on the thread that made the change, or, when
    /// another thread is already delivering, on that thread. A listener may
    /// call back into the registry; changes it causes are delivered after it
    /// returns.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RegistryChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Stream of every change from now on.
    ///
    /// A reader more than `change_capacity` changes behind skips the
    /// oldest ones.
    pub fn changes(&self) -> impl Stream<Item = RegistryChange> + Send + 'static {
        BroadcastStream::new(self.shared.changes.subscribe()).filter_map(|msg| async move {
            match msg {
                Ok(change) => Some(change),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry change stream lagged");
                    None
                }
            }
        })
    }

    /// Stream of collection snapshots, starting with the current one.
    ///
    /// Intermediate snapshots may be coalesced; the latest is never missed.
    pub fn watch(&self) -> impl Stream<Item = Vec<ProviderRecord>> + Send + 'static {
        WatchStream::new(self.shared.snapshot.subscribe())
    }

    /// Stream yielding each distinct instance once: known ones first, then
    /// newcomers as they are announced.
    pub fn discover(&self) -> impl Stream<Item = ProviderRecord> + Send + 'static {
        let mut changes = self.shared.changes.subscribe();
        let initial = self.shared.records();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        async_stream::stream! {
            let mut seen = HashSet::new();

            for record in initial {
                if seen.insert(record.instance_id()) {
                    yield record;
                }
            }

            loop {
                match changes.recv().await {
                    Ok(RegistryChange { kind: ChangeKind::Added, record: Some(record), .. }) => {
                        if seen.insert(record.instance_id()) {
                            trace!(instance = %record.instance_id(), "discovered provider");
                            yield record;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "discover stream lagged, resyncing from snapshot");
                        let current = match weak.upgrade() {
                            Some(shared) => shared.records(),
                            None => break,
                        };
                        for record in current {
                            if seen.insert(record.instance_id()) {
                                yield record;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Wait for the first known or newly announced provider.
    ///
    /// Discovery never completes on its own; bound this with a timeout.
    pub async fn first(&self) -> Option<ProviderRecord> {
        let stream = self.discover();
        futures_util::pin_mut!(stream);
        stream.next().await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("namespace", &self.shared.namespace)
            .field("providers", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::medium::LocalMedium;
    use crate::message::EventDetail;
    use crate::record::{Capability, ProviderInfo};
    use crate::Announcer;

    fn info(wallet: &str) -> ProviderInfo {
        ProviderInfo::new(wallet, "Wallet", "data:image/png;base64,AA==")
    }

    fn announce(medium: &LocalMedium, info: &ProviderInfo) {
        let record = ProviderRecord::new(info.clone(), Capability::new(()));
        medium
            .publish(Message::AnnounceProvider(record).to_event(&Namespace::default()))
            .unwrap();
    }

    #[test]
    fn starts_empty_and_requests_once() {
        let medium = Arc::new(LocalMedium::new());
        let requests = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&requests);
        let _sub = medium
            .subscribe(
                &Namespace::default().request_event(),
                Arc::new(move |_: &Event| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        assert!(registry.is_empty());
        assert!(registry.providers().is_empty());
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        registry.refresh().unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn synchronous_answer_to_own_request_is_captured() {
        let medium = Arc::new(LocalMedium::new());
        let wallet = Announcer::initialize(medium.clone(), info("io.a"), Capability::new(())).unwrap();

        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&wallet.instance_id()).as_ref(),
            Some(wallet.record())
        );
    }

    #[test]
    fn reannounce_updates_in_place() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();

        let first = info("io.a");
        let second = info("io.b");
        announce(&medium, &first);
        announce(&medium, &second);

        let mut renamed = first.clone();
        renamed.name = "Renamed".into();
        announce(&medium, &renamed);

        let providers = registry.providers();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].info(), &renamed);
        assert_eq!(providers[1].info(), &second);
    }

    #[test]
    fn wallet_id_is_not_a_dedup_key() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();

        announce(&medium, &info("io.same"));
        announce(&medium, &info("io.same"));
        announce(&medium, &info("io.other"));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.find_by_wallet_id("io.same").len(), 2);
        assert!(registry.find_by_wallet_id("io.missing").is_empty());
    }

    #[test]
    fn malformed_announcements_are_counted_and_dropped() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let kind = Namespace::default().announce_event();

        medium.publish(Event::signal(kind.clone())).unwrap();
        medium
            .publish(Event::with_detail(
                kind.clone(),
                EventDetail {
                    info: json!({ "name": "anonymous" }),
                    capability: Some(Capability::new(())),
                },
            ))
            .unwrap();
        medium
            .publish(Event::with_detail(
                kind,
                EventDetail {
                    info: json!(42),
                    capability: None,
                },
            ))
            .unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.dropped_count(), 3);
    }

    #[test]
    fn listeners_receive_delta_and_full_collection() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = registry.on_change(move |change| {
            sink.lock().push((change.kind, change.providers.len()));
        });

        let a = info("io.a");
        announce(&medium, &a);
        announce(&medium, &a);
        announce(&medium, &info("io.b"));
        registry.clear();
        registry.clear();

        assert_eq!(
            *seen.lock(),
            vec![
                (ChangeKind::Added, 1),
                (ChangeKind::Updated, 1),
                (ChangeKind::Added, 2),
                (ChangeKind::Cleared, 0),
            ]
        );

        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        announce(&medium, &a);
        assert_eq!(seen.lock().len(), 4);
    }

    #[test]
    fn listener_may_read_registry() {
        let medium = Arc::new(LocalMedium::new());
        let registry = Arc::new(ProviderRegistry::initialize(medium.clone()).unwrap());
        let observed = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&registry);
        let out = Arc::clone(&observed);
        registry.on_change(move |_| {
            if let Some(registry) = weak.upgrade() {
                out.store(registry.len(), Ordering::SeqCst);
            }
        });

        announce(&medium, &info("io.a"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn change_made_by_listener_is_delivered_after_it() {
        let medium = Arc::new(LocalMedium::new());
        let registry = Arc::new(ProviderRegistry::initialize(medium.clone()).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&registry);
        let sink = Arc::clone(&seen);
        registry.on_change(move |change| {
            sink.lock().push((change.kind, change.providers.len()));
            if change.kind == ChangeKind::Added {
                if let Some(registry) = weak.upgrade() {
                    registry.clear();
                }
            }
        });

        announce(&medium, &info("io.a"));
        assert_eq!(
            *seen.lock(),
            vec![(ChangeKind::Added, 1), (ChangeKind::Cleared, 0)]
        );
        assert!(registry.is_empty());
        assert!(registry.shared.snapshot.borrow().is_empty());
    }

    #[test]
    fn reset_clears_then_rediscovers_live_announcers() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let _live = Announcer::initialize(medium.clone(), info("io.live"), Capability::new(())).unwrap();
        announce(&medium, &info("io.gone"));
        assert_eq!(registry.len(), 2);

        registry.reset().unwrap();
        let providers = registry.providers();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].info().wallet_id, "io.live");
    }

    #[test]
    fn other_namespaces_are_invisible() {
        let medium = Arc::new(LocalMedium::new());
        let config = RegistryConfig::default().namespace(Namespace::new("acme"));
        let registry = ProviderRegistry::with_config(medium.clone(), config).unwrap();

        announce(&medium, &info("io.a"));
        assert!(registry.is_empty());
        assert_eq!(registry.dropped_count(), 0);
        assert_eq!(registry.namespace().as_str(), "acme");
    }

    #[test]
    fn drop_unsubscribes() {
        let medium = Arc::new(LocalMedium::new());
        let kind = Namespace::default().announce_event();
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        assert_eq!(medium.subscriber_count(&kind), 1);
        drop(registry);
        assert_eq!(medium.subscriber_count(&kind), 0);
    }

    #[test]
    fn unavailable_medium_fails_initialize() {
        let medium = Arc::new(LocalMedium::new());
        medium.close();
        let err = ProviderRegistry::initialize(medium).unwrap_err();
        assert!(err.is_medium_unavailable());
    }

    #[test]
    fn discover_is_pending_until_announced() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let mut stream = tokio_test::task::spawn(registry.discover());
        tokio_test::assert_pending!(stream.poll_next());

        let a = info("io.a");
        announce(&medium, &a);
        assert!(stream.is_woken());
        match stream.poll_next() {
            std::task::Poll::Ready(Some(record)) => assert_eq!(record.info(), &a),
            other => panic!("expected a provider, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_yields_known_then_new_once_each() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let a = info("io.a");
        announce(&medium, &a);

        let stream = registry.discover();
        futures_util::pin_mut!(stream);

        let b = info("io.b");
        announce(&medium, &a);
        announce(&medium, &b);

        assert_eq!(stream.next().await.unwrap().info(), &a);
        assert_eq!(stream.next().await.unwrap().info(), &b);
    }

    #[tokio::test]
    async fn streams_end_when_registry_dropped() {
        let medium = Arc::new(LocalMedium::new());
        let registry = ProviderRegistry::initialize(medium.clone()).unwrap();
        let changes = registry.changes();
        let discover = registry.discover();
        drop(registry);

        futures_util::pin_mut!(changes);
        futures_util::pin_mut!(discover);
        assert!(changes.next().await.is_none());
        assert!(discover.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_discover_resyncs_from_snapshot() {
        let medium = Arc::new(LocalMedium::new());
        let config = RegistryConfig::default().change_capacity(1);
        let registry = ProviderRegistry::with_config(medium.clone(), config).unwrap();

        let stream = registry.discover();
        futures_util::pin_mut!(stream);
        for wallet in ["io.a", "io.b", "io.c"] {
            announce(&medium, &info(wallet));
        }

        let mut wallets = Vec::new();
        for _ in 0..3 {
            wallets.push(stream.next().await.unwrap().info().wallet_id.clone());
        }
        wallets.sort();
        assert_eq!(wallets, ["io.a", "io.b", "io.c"]);
    }
}
