use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Action parameters, ordered by key so serialization is canonical.
pub type Parameters = BTreeMap<String, String>;

/// Parameter naming the column an action targets.
pub const COLUMN_ID: &str = "column_id";

/// A named transformation together with its parameters.
///
/// The engine never interprets the name; it is resolved against an action
/// registry when a pipeline is built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Parameters::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Shorthand for `with_parameter("column_id", ..)`.
    pub fn on_column(self, column_id: impl Into<String>) -> Self {
        self.with_parameter(COLUMN_ID, column_id)
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn column_id(&self) -> Option<&str> {
        self.parameter(COLUMN_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_serialize_in_key_order() {
        let action = Action::new("replace")
            .with_parameter("to", "b")
            .with_parameter("from", "a");
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(
            json,
            r#"{"name":"replace","parameters":{"from":"a","to":"b"}}"#
        );
    }

    #[test]
    fn missing_parameters_default_to_empty() {
        let action: Action = serde_json::from_str(r#"{"name":"noop"}"#).unwrap();
        assert!(action.parameters.is_empty());
        assert_eq!(action.column_id(), None);
    }
}
