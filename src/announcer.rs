//! Wallet-side announcer.
//!
//! Makes one [`ProviderRecord`] discoverable to any number of registries
//! regardless of load order: it announces once on startup (for registries
//! that already exist) and again on every request (for registries created
//! later).

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::medium::{Medium, Subscription};
use crate::message::{Event, Message, Namespace};
use crate::record::{Capability, ProviderInfo, ProviderRecord};
use crate::Result;

/// Configuration for an [`Announcer`].
#[derive(Debug, Clone, Default)]
pub struct AnnouncerConfig {
    /// Event namespace to announce under. Default: `eip6963`.
    pub namespace: Namespace,
}

impl AnnouncerConfig {
    /// Set the event namespace.
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }
}

/// Publishes one immutable provider record on the medium.
///
/// Dropping the announcer stops it answering requests. No retraction is
/// published; registries that already hold the record keep it.
pub struct Announcer {
    record: ProviderRecord,
    announcement: Event,
    medium: Arc<dyn Medium>,
    _subscription: Subscription,
}

impl Announcer {
    /// Announce `info` with the default configuration.
    pub fn initialize(
        medium: Arc<dyn Medium>,
        info: ProviderInfo,
        capability: Capability,
    ) -> Result<Self> {
        Self::with_config(medium, info, capability, AnnouncerConfig::default())
    }

    /// Start answering requests, announce `info`, and keep answering until
    /// dropped.
    ///
    /// Fails only if `info` is invalid or the medium is unavailable.
    pub fn with_config(
        medium: Arc<dyn Medium>,
        info: ProviderInfo,
        capability: Capability,
        config: AnnouncerConfig,
    ) -> Result<Self> {
        info.validate()?;
        let record = ProviderRecord::new(info, capability);
        let announcement = Message::AnnounceProvider(record.clone()).to_event(&config.namespace);
        let instance_id = record.instance_id();

        let _span = tracing::debug_span!(
            "announcer",
            wallet = %record.info().wallet_id,
            instance = %instance_id,
        )
        .entered();

        // Requests must be answered from the moment the announcement is
        // visible to anyone.
        let responder = Arc::clone(&medium);
        let reply = announcement.clone();
        let subscription = medium.subscribe(
            &config.namespace.request_event(),
            Arc::new(move |_: &Event| answer_request(&*responder, &reply, instance_id)),
        )?;

        medium.publish(announcement.clone())?;
        debug!("announced provider");

        info!(
            namespace = %config.namespace,
            name = %record.info().name,
            "announcer ready"
        );
        Ok(Self {
            record,
            announcement,
            medium,
            _subscription: subscription,
        })
    }

    /// Publish the announcement again outside of any request.
    pub fn announce(&self) -> Result<()> {
        self.medium.publish(self.announcement.clone())
    }

    /// The announced record.
    pub fn record(&self) -> &ProviderRecord {
        &self.record
    }

    /// The announced descriptor.
    pub fn info(&self) -> &ProviderInfo {
        self.record.info()
    }

    /// This instance's dedup key.
    pub fn instance_id(&self) -> Uuid {
        self.record.instance_id()
    }

    /// Stop answering requests.
    pub fn shutdown(self) {
        debug!(instance = %self.instance_id(), "announcer shut down");
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

fn answer_request(medium: &dyn Medium, announcement: &Event, instance_id: Uuid) {
    match medium.publish(announcement.clone()) {
        Ok(()) => debug!(instance = %instance_id, "answered provider request"),
        Err(e) => warn!(instance = %instance_id, error = %e, "failed to answer provider request"),
    }
}
