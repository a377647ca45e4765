//! Ordered field-name aliases per logical attribute.
//!
//! The advancement API spells several attributes differently across endpoints
//! and API versions. Each list is tried front to back and the first present
//! value wins. A value is present when it is not null, not an empty string and
//! not an empty list.

use serde_json::Value as JsonValue;

/// Keys holding a node's nested child requirements.
pub const CHILD_LIST: &[&str] = &["requirements", "children"];
/// Keys holding the root list when a tree payload arrives wrapped in an object.
pub const TREE_ROOT: &[&str] = &["requirements", "value"];
pub const NODE_ID: &[&str] = &["id"];
pub const DATE_COMPLETED: &[&str] = &["dateCompleted", "dateEarned"];
pub const DATE_EARNED: &[&str] = &["dateEarned", "dateCompleted"];
pub const DATE_STARTED: &[&str] = &["dateStarted"];
pub const COMPLETED_FLAG: &[&str] = &["completed", "isCompleted"];

pub const RANK_CATALOG: &[&str] = &["value", "ranks"];
pub const RANK_IMAGE: &[&str] = &["imageUrl200", "imageUrl100"];
pub const PROGRAM_LIST: &[&str] = &["program", "programs"];
pub const PROGRAM_ID: &[&str] = &["programId"];
pub const PROGRAM_NAME: &[&str] = &["program", "programName"];

pub const MERIT_BADGE_LIST: &[&str] = &["value", "meritBadges"];
pub const MERIT_BADGE_NAME: &[&str] = &["name", "short"];
pub const MERIT_BADGE_VERSION: &[&str] = &["versionId", "version"];
pub const MERIT_BADGE_IMAGE: &[&str] = &["imageUrl200", "imageUrl100", "imageUrl"];
pub const EAGLE_FLAG: &[&str] = &["isEagleRequired", "eagleRequired"];

pub const LEADERSHIP_LIST: &[&str] = &["value", "positions"];
pub const POSITION_TITLE: &[&str] = &["positionTitle", "position", "title"];
pub const POSITION_START: &[&str] = &["dateStarted", "startDate"];
pub const POSITION_END: &[&str] = &["dateEnded", "endDate"];
pub const POSITION_DAYS: &[&str] = &["numberOfDaysInPosition", "daysInPosition"];
pub const POSITION_APPROVED: &[&str] = &["approvalStatus", "approved"];

pub const BIRTHDATE: &[&str] = &["dateOfBirth", "birthDate", "dob"];
pub const NESTED_PROFILE: &[&str] = &["profile"];

pub fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        _ => true,
    }
}

pub fn first<'a>(node: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| node.get(*key))
        .find(|value| is_present(value))
}

pub fn text(node: &JsonValue, keys: &[&str]) -> Option<String> {
    match first(node, keys)? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integers arrive as JSON numbers or as numeric strings ("12").
pub fn integer(node: &JsonValue, keys: &[&str]) -> Option<i64> {
    match first(node, keys)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flags arrive as booleans, as "True"/"False" strings, or as status words.
pub fn flag(node: &JsonValue, keys: &[&str], default: bool) -> bool {
    match first(node, keys) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            ["true", "yes", "1", "approved"]
                .iter()
                .any(|word| s.eq_ignore_ascii_case(word))
        }
        _ => default,
    }
}

pub fn array<'a>(node: &'a JsonValue, keys: &[&str]) -> Option<&'a [JsonValue]> {
    first(node, keys)?.as_array().map(Vec::as_slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_alias_with_a_value_wins() {
        let node = json!({"dateCompleted": "", "dateEarned": "2024-01-02"});
        assert_eq!(text(&node, DATE_COMPLETED).as_deref(), Some("2024-01-02"));

        let node = json!({"dateCompleted": "2023-05-05", "dateEarned": "2024-01-02"});
        assert_eq!(text(&node, DATE_COMPLETED).as_deref(), Some("2023-05-05"));

        assert_eq!(text(&json!({"dateEarned": null}), DATE_COMPLETED), None);
    }

    #[test]
    fn integers_accept_numeric_strings() {
        assert_eq!(integer(&json!({"id": "2077"}), NODE_ID), Some(2077));
        assert_eq!(integer(&json!({"id": 12}), NODE_ID), Some(12));
        assert_eq!(integer(&json!({"id": "abc"}), NODE_ID), None);
    }

    #[test]
    fn flags_parse_the_api_spellings() {
        assert!(flag(&json!({"required": "True"}), &["required"], false));
        assert!(!flag(&json!({"required": "False"}), &["required"], true));
        assert!(flag(&json!({}), &["required"], true));
        assert!(flag(&json!({"approvalStatus": "Approved"}), POSITION_APPROVED, false));
        assert!(!flag(&json!({"approved": false}), POSITION_APPROVED, true));
    }

    #[test]
    fn empty_child_list_falls_through_to_next_key() {
        let node = json!({"requirements": [], "children": [{"id": 1}]});
        assert_eq!(array(&node, CHILD_LIST).map(<[JsonValue]>::len), Some(1));
    }
}
