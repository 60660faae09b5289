//! Structured change records
//!
//! Derived views consume records that carry both the previous and the new
//! state of an entity, so the view can move the key between index buckets
//! without reading its own history.

use serde::{Deserialize, Serialize};

/// Old/new state pair carried by a change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange<T> {
    /// State before the change, `None` for a creation
    #[serde(default)]
    pub old: Option<T>,
    /// State after the change, `None` for a deletion
    #[serde(default)]
    pub new: Option<T>,
}

impl<T> StateChange<T> {
    /// A creation
    pub fn created(new: T) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    /// An update from `old` to `new`
    pub fn updated(old: T, new: T) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    /// A deletion
    pub fn deleted(old: T) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// Whether this change removes the entity
    pub fn is_deletion(&self) -> bool {
        self.new.is_none()
    }
}

impl<T: Serialize> StateChange<T> {
    /// Encode as JSON
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_with_missing_old() {
        let change: StateChange<serde_json::Value> =
            serde_json::from_str(r#"{"new": {"category": "shoes"}}"#).unwrap();

        assert!(change.old.is_none());
        assert_eq!(change.new, Some(json!({"category": "shoes"})));
        assert!(!change.is_deletion());
    }

    #[test]
    fn test_deletion() {
        let change = StateChange::deleted(json!({"category": "shoes"}));
        assert!(change.is_deletion());
    }
}
