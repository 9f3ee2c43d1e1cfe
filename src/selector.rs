use serde::{Deserialize, Serialize};

/// Identifies a particular snapshot of the remote data set.
///
/// Selectors are opaque to the SDK: the server defines their ordering, so they are only ever
/// compared for equality. An empty selector ([`Selector::none`]) means "no known snapshot" and
/// asks the server for a full transfer.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    state: String,
    version: u64,
}

impl Selector {
    /// Create a selector from a server-assigned state token and version.
    pub fn new(state: impl Into<String>, version: u64) -> Selector {
        Selector {
            state: state.into(),
            version,
        }
    }

    /// The empty selector.
    pub fn none() -> Selector {
        Selector::default()
    }

    /// Returns `true` if the selector identifies a snapshot.
    pub fn is_defined(&self) -> bool {
        *self != Selector::none()
    }

    /// Server-assigned state token, sent back as the `basis` when resuming.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::Selector;

    #[test]
    fn empty_selector_is_not_defined() {
        assert!(!Selector::none().is_defined());
        assert!(!Selector::default().is_defined());
        assert!(Selector::new("p:abc:1", 1).is_defined());
        assert!(Selector::new("", 3).is_defined());
    }

    #[test]
    fn decodes_from_payload_transferred_body() {
        let selector: Selector =
            serde_json::from_str(r#"{"state":"(p:ABC:42)","version":42}"#).unwrap();

        assert_eq!(selector, Selector::new("(p:ABC:42)", 42));
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(serde_json::from_str::<Selector>(r#"{"version":1}"#).is_err());
        assert!(serde_json::from_str::<Selector>(r#"{"state":"s"}"#).is_err());
        assert!(serde_json::from_str::<Selector>(r#"{"state":1,"version":1}"#).is_err());
    }
}
