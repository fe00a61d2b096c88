//! Typed change notifications delivered by a dispatcher to its listeners

use kube::ResourceExt;

/// A change observed for one resource
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent<K> {
    /// The resource appeared
    Addition(K),
    /// The resource changed from `prior` to `current`
    Modification {
        /// Snapshot held by the store before this change
        prior: K,
        /// Snapshot after this change
        current: K,
    },
    /// The resource disappeared; carries its last known state
    Deletion(K),
}

impl<K> ChangeEvent<K> {
    /// The resource as of this event
    pub fn resource(&self) -> &K {
        match self {
            Self::Addition(k) | Self::Deletion(k) => k,
            Self::Modification { current, .. } => current,
        }
    }

    /// Short label used in logs (`ADD`, `MOD`, `DEL`)
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Addition(_) => "ADD",
            Self::Modification { .. } => "MOD",
            Self::Deletion(_) => "DEL",
        }
    }
}

impl<K: ResourceExt> ChangeEvent<K> {
    /// Name of the resource this event concerns
    pub fn name(&self) -> String {
        self.resource().name_any()
    }
}
