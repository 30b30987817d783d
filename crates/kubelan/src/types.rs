//! Core data types shared by the reconciler, watch sources and configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Owner reference kind that identifies the service backing an endpoint slice
pub const SERVICE_OWNER_KIND: &str = "Service";

/// A (namespace, name) pair identifying a watched service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    namespace: String,
    name: String,
}

impl ServiceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A service as written in configuration: `<namespace>/<name>` or a bare name.
///
/// # Examples
///
/// ```
/// use kubelan::ServiceRef;
///
/// let qualified: ServiceRef = "ns1/svcA".parse().unwrap();
/// assert_eq!(qualified.namespace(), Some("ns1"));
///
/// let bare: ServiceRef = "svcB".parse().unwrap();
/// assert_eq!(bare.namespace(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceRef {
    namespace: Option<String>,
    name: String,
}

impl ServiceRef {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves against a default namespace. Returns None when neither is set.
    pub fn resolve(&self, default_namespace: Option<&str>) -> Option<ServiceIdentity> {
        let namespace = self
            .namespace
            .as_deref()
            .or(default_namespace)
            .filter(|ns| !ns.is_empty())?;
        Some(ServiceIdentity::new(namespace, self.name.clone()))
    }
}

impl FromStr for ServiceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(format!("Invalid service reference: '{}'", s));
        }

        match s.rsplit_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(Some(namespace.to_string()), name))
            }
            Some(_) => Err(format!("Invalid service reference: '{}'", s)),
            None => Ok(Self::new(None, s)),
        }
    }
}

impl TryFrom<String> for ServiceRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceRef> for String {
    fn from(value: ServiceRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The immutable set of services whose endpoints become overlay peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    services: BTreeSet<ServiceIdentity>,
}

impl WatchSet {
    /// Builds the watch-set, dropping services that have no namespace.
    pub fn build<'a>(
        services: impl IntoIterator<Item = &'a ServiceRef>,
        default_namespace: Option<&str>,
    ) -> Self {
        let mut set = BTreeSet::new();
        for service in services {
            match service.resolve(default_namespace) {
                Some(identity) => {
                    set.insert(identity);
                }
                None => {
                    warn!(
                        service = %service,
                        "Default namespace unset, skipping service without namespace"
                    );
                }
            }
        }
        Self { services: set }
    }

    pub fn contains(&self, service: &ServiceIdentity) -> bool {
        self.services.contains(service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceIdentity> {
        self.services.iter()
    }
}

impl FromIterator<ServiceIdentity> for WatchSet {
    fn from_iter<T: IntoIterator<Item = ServiceIdentity>>(iter: T) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}

/// Opaque key of one endpoint slice resource (`<namespace>/<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey(String);

impl SliceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner reference of an endpoint slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Watch-source independent view of one endpoint slice resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SliceResource {
    pub namespace: String,
    pub name: String,
    pub owners: Vec<OwnerRef>,
    /// Raw endpoint addresses as advertised; parsed by the reconciler.
    pub addresses: Vec<String>,
}

impl SliceResource {
    pub fn key(&self) -> SliceKey {
        SliceKey::new(format!("{}/{}", self.namespace, self.name))
    }

    /// The service owning this slice, taken from the first `Service` owner.
    pub fn owning_service(&self) -> Option<ServiceIdentity> {
        self.owners
            .iter()
            .find(|owner| owner.kind == SERVICE_OWNER_KIND)
            .map(|owner| ServiceIdentity::new(self.namespace.clone(), owner.name.clone()))
    }
}

/// Kind of change carried by an [`EndpointChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Payload shared by every endpoint change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceChange {
    pub service: ServiceIdentity,
    pub slice: SliceKey,
    pub addresses: Vec<String>,
}

/// A change to one endpoint slice of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointChangeEvent {
    Added(SliceChange),
    Updated(SliceChange),
    Deleted(SliceChange),
}

impl EndpointChangeEvent {
    /// Builds an event from a slice resource.
    ///
    /// Returns None when the slice has no owning service.
    pub fn from_resource(kind: ChangeKind, resource: &SliceResource) -> Option<Self> {
        let Some(service) = resource.owning_service() else {
            debug!(slice = %resource.key(), "No service found for EndpointSlice");
            return None;
        };

        let change = SliceChange {
            service,
            slice: resource.key(),
            addresses: resource.addresses.clone(),
        };

        Some(match kind {
            ChangeKind::Added => Self::Added(change),
            ChangeKind::Updated => Self::Updated(change),
            ChangeKind::Deleted => Self::Deleted(change),
        })
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Added(_) => ChangeKind::Added,
            Self::Updated(_) => ChangeKind::Updated,
            Self::Deleted(_) => ChangeKind::Deleted,
        }
    }

    pub fn change(&self) -> &SliceChange {
        match self {
            Self::Added(change) | Self::Updated(change) | Self::Deleted(change) => change,
        }
    }

    pub fn service(&self) -> &ServiceIdentity {
        &self.change().service
    }

    pub fn slice(&self) -> &SliceKey {
        &self.change().slice
    }
}
