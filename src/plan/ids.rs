//! Typed identifiers for graph elements

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

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
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifies an execution stage within one graph
    StageId
);
string_id!(
    /// Identifies an operator-level task
    TaskId
);
string_id!(
    /// Identifies a data channel between tasks
    ConduitId
);
string_id!(
    /// Identifies a set of stages sharing one executor instance
    GroupId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversions() {
        let stage = StageId::from("scan");
        assert_eq!(stage.to_string(), "scan");
        assert_eq!(stage, StageId::new(String::from("scan")));
        assert_eq!(stage.as_str(), "scan");
    }

    #[test]
    fn test_serde_is_transparent() {
        let conduit = ConduitId::from("c1");
        assert_eq!(serde_json::to_string(&conduit).unwrap(), "\"c1\"");
        let back: ConduitId = serde_json::from_str("\"c1\"").unwrap();
        assert_eq!(back, conduit);
    }
}
