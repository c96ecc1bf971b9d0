//! Provider descriptors and the announced record.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::DecodeError;

/// Display and identification data for one announced provider instance.
///
/// Serialized on the wire with camelCase keys (`walletId`, `instanceId`,
/// `name`, `icon`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Stable identifier of the wallet product (e.g. `io.metamask`).
    /// Advisory only, never a dedup key.
    pub wallet_id: String,
    /// Unique per announcer instance for the page lifetime.
    pub instance_id: Uuid,
    /// Human-readable display name.
    pub name: String,
    /// URI of a square image, at least 96x96.
    pub icon: String,
}

impl ProviderInfo {
    /// Create a descriptor with a freshly generated v4 instance id.
    pub fn new(
        wallet_id: impl Into<String>,
        name: impl Into<String>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            instance_id: Uuid::new_v4(),
            name: name.into(),
            icon: icon.into(),
        }
    }

    /// Replace the generated instance id with a caller-supplied one.
    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// The wire form of this descriptor as a JSON object.
    ///
    /// Same keys as the serde encoding, built directly so it cannot fail.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::with_capacity(4);
        object.insert("walletId".into(), self.wallet_id.clone().into());
        object.insert("instanceId".into(), self.instance_id.to_string().into());
        object.insert("name".into(), self.name.clone().into());
        object.insert("icon".into(), self.icon.clone().into());
        serde_json::Value::Object(object)
    }

    /// Check the fields every registry requires.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.wallet_id.trim().is_empty() {
            return Err(DecodeError::invalid("walletId", "must not be empty"));
        }
        if self.instance_id.is_nil() {
            return Err(DecodeError::invalid("instanceId", "must not be the nil uuid"));
        }
        if self.name.trim().is_empty() {
            return Err(DecodeError::invalid("name", "must not be empty"));
        }
        if uri_scheme(&self.icon).is_none() {
            return Err(DecodeError::invalid("icon", "must be a URI"));
        }
        Ok(())
    }

    /// Whether the icon is vector markup.
    ///
    /// SVG icons can carry script and must only be rendered on an isolated,
    /// image-only surface.
    pub fn icon_is_vector(&self) -> bool {
        let icon = self.icon.trim_start();
        match uri_scheme(icon) {
            Some(scheme) if scheme.eq_ignore_ascii_case("data") => {
                let media_type = &icon[scheme.len() + 1..];
                media_type
                    .get(..13)
                    .is_some_and(|m| m.eq_ignore_ascii_case("image/svg+xml"))
            }
            Some(_) => {
                let path = icon.split(['?', '#']).next().unwrap_or(icon);
                path.to_ascii_lowercase().ends_with(".svg")
            }
            None => false,
        }
    }
}

/// Return the scheme of `uri` if it starts with `scheme:` (RFC 3986 syntax).
fn uri_scheme(uri: &str) -> Option<&str> {
    let (scheme, rest) = uri.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() || rest.is_empty() {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        .then_some(scheme)
}

/// Opaque handle to the wallet's account/transaction provider.
///
/// The protocol only stores and forwards it. Consumers recover the concrete
/// provider type with [`downcast_ref`](Capability::downcast_ref).
#[derive(Clone)]
pub struct Capability {
    inner: Arc<dyn Any + Send + Sync>,
}

impl Capability {
    /// Wrap a provider object.
    pub fn new<T: Any + Send + Sync>(provider: T) -> Self {
        Self {
            inner: Arc::new(provider),
        }
    }

    /// Wrap an already shared provider object without re-allocating.
    pub fn from_arc<T: Any + Send + Sync>(provider: Arc<T>) -> Self {
        Self { inner: provider }
    }

    /// Borrow the provider as `T`, if that is what it is.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether two handles point at the same provider object.
    pub fn ptr_eq(&self, other: &Capability) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Capability(..)")
    }
}

/// What an announcer makes discoverable: display info plus the provider handle.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    info: ProviderInfo,
    capability: Capability,
}

impl ProviderRecord {
    /// Pair a descriptor with its provider handle.
    pub fn new(info: ProviderInfo, capability: Capability) -> Self {
        Self { info, capability }
    }

    /// The display/identification descriptor.
    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    /// The opaque provider handle.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Shorthand for `info().instance_id`.
    pub fn instance_id(&self) -> Uuid {
        self.info.instance_id
    }

    /// Split into its parts.
    pub fn into_parts(self) -> (ProviderInfo, Capability) {
        (self.info, self.capability)
    }
}

/// Records are equal when their info matches and they share the same provider object.
impl PartialEq for ProviderRecord {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info && self.capability.ptr_eq(&other.capability)
    }
}

impl Eq for ProviderRecord {}
