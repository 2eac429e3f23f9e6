//! Identifier types shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from an existing string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique id using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type! {
    /// Unique identifier for a deployment.
    DeploymentId
}

id_type! {
    /// Unique identifier for a service.
    ServiceId
}

id_type! {
    /// Unique identifier for a server (the host an agent runs on).
    ServerId
}

id_type! {
    /// Unique identifier for an agent command.
    CommandId
}

id_type! {
    /// Unique identifier for an uptime monitor.
    MonitorId
}

id_type! {
    /// Unique identifier for an alerting or autoscaling rule.
    RuleId
}
