// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifiers and value types shared by drivers and the dispatcher.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key/value metadata stored on a cloud instance.
pub type InstanceTags = BTreeMap<String, String>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Provider-assigned identifier of a cloud instance.
    InstanceId
);

string_id!(
    /// Identifier of the set of resources owned by one dispatcher identity.
    ///
    /// Drivers tag everything they create with it, so a restarted
    /// dispatcher can re-adopt its instances.
    InstanceSetId
);

string_id!(
    /// Provider image used to boot new instances.
    ImageId
);

/// Shell command an instance runs once on first boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitCommand(pub String);

impl fmt::Display for InitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured VM size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Name used in configuration and in the `InstanceType` tag.
    pub name: String,
    /// The provider's own name for this size.
    pub provider_type: String,
    /// Number of virtual CPUs.
    pub vcpus: i64,
    /// Memory in bytes.
    pub ram: i64,
    /// Scratch disk in bytes.
    #[serde(default)]
    pub scratch: i64,
    /// Hourly price, used to pick the cheapest adequate type.
    #[serde(default)]
    pub price: f64,
    /// Whether this is a preemptible (spot) offering.
    #[serde(default)]
    pub preemptible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_type_deserialize_defaults() {
        let it: InstanceType = serde_json::from_str(
            r#"{"name":"small","provider_type":"t3.small","vcpus":2,"ram":2147483648}"#,
        )
        .unwrap();
        assert_eq!(it.name, "small");
        assert_eq!(it.scratch, 0);
        assert_eq!(it.price, 0.0);
        assert!(!it.preemptible);
    }

    #[test]
    fn test_ids_display_and_serialize_transparently() {
        let id = InstanceId::from("i-123");
        assert_eq!(id.to_string(), "i-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"i-123\"");
        assert_eq!(InstanceSetId::from("abc".to_string()).as_str(), "abc");
    }
}
