//! Requirement tree flattening.
//!
//! Rank and merit badge requirements arrive as nested trees, both as catalog
//! definitions and as per-scout completion records. All four shapes share one
//! depth-first walk; a [`TreeShape`] decides which fields are copied into the
//! emitted row and which scoping key the rows belong to.

use serde_json::Value as JsonValue;
use tracing::debug;
use troop_core::{
    RequirementCompletion, RequirementDefinition, RequirementScope, RequirementThresholds,
};

use crate::fields;

pub trait TreeShape {
    type Row;

    fn scope(&self) -> RequirementScope;

    fn row(&self, node: &JsonValue, id: i64, parent_id: Option<i64>) -> Self::Row;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankDefinitionShape {
    pub rank_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankCompletionShape {
    pub rank_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeritBadgeDefinitionShape {
    pub mb_api_id: i64,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeritBadgeCompletionShape {
    pub mb_api_id: i64,
    pub version_id: String,
}

impl TreeShape for RankDefinitionShape {
    type Row = RequirementDefinition;

    fn scope(&self) -> RequirementScope {
        RequirementScope::Rank {
            rank_id: self.rank_id,
        }
    }

    fn row(&self, node: &JsonValue, id: i64, parent_id: Option<i64>) -> Self::Row {
        definition_row(node, id, parent_id, true)
    }
}

impl TreeShape for MeritBadgeDefinitionShape {
    type Row = RequirementDefinition;

    fn scope(&self) -> RequirementScope {
        RequirementScope::MeritBadge {
            mb_api_id: self.mb_api_id,
            version_id: self.version_id.clone(),
        }
    }

    fn row(&self, node: &JsonValue, id: i64, parent_id: Option<i64>) -> Self::Row {
        definition_row(node, id, parent_id, false)
    }
}

impl TreeShape for RankCompletionShape {
    type Row = RequirementCompletion;

    fn scope(&self) -> RequirementScope {
        RequirementScope::Rank {
            rank_id: self.rank_id,
        }
    }

    fn row(&self, node: &JsonValue, id: i64, parent_id: Option<i64>) -> Self::Row {
        completion_row(node, id, parent_id)
    }
}

impl TreeShape for MeritBadgeCompletionShape {
    type Row = RequirementCompletion;

    fn scope(&self) -> RequirementScope {
        RequirementScope::MeritBadge {
            mb_api_id: self.mb_api_id,
            version_id: self.version_id.clone(),
        }
    }

    fn row(&self, node: &JsonValue, id: i64, parent_id: Option<i64>) -> Self::Row {
        completion_row(node, id, parent_id)
    }
}

/// Parent-before-children rows for one tree, siblings in received order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flattened<R> {
    pub scope: RequirementScope,
    pub rows: Vec<R>,
    /// Nodes skipped because they carried no identifier, including their subtrees.
    pub dropped: usize,
}

impl<R> Flattened<R> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Locate the root node list of a tree payload.
///
/// Accepts a bare list, or an object wrapping the list under one of
/// [`fields::TREE_ROOT`]; a wrapper object nested inside the wrapper is
/// unwrapped as well.
pub fn requirement_roots(payload: &JsonValue) -> &[JsonValue] {
    match payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(_) => match fields::first(payload, fields::TREE_ROOT) {
            Some(JsonValue::Array(items)) => items,
            Some(inner @ JsonValue::Object(_)) => match fields::first(inner, fields::TREE_ROOT) {
                Some(JsonValue::Array(items)) => items,
                _ => &[],
            },
            _ => &[],
        },
        _ => &[],
    }
}

pub fn flatten_requirements<S: TreeShape>(shape: &S, payload: &JsonValue) -> Flattened<S::Row> {
    let mut out = Flattened {
        scope: shape.scope(),
        rows: Vec::new(),
        dropped: 0,
    };
    walk(shape, requirement_roots(payload), None, &mut out);
    out
}

fn walk<S: TreeShape>(
    shape: &S,
    nodes: &[JsonValue],
    parent_id: Option<i64>,
    out: &mut Flattened<S::Row>,
) {
    for node in nodes {
        let Some(id) = fields::integer(node, fields::NODE_ID).filter(|id| *id != 0) else {
            let skipped = subtree_size(node);
            debug!(scope = %out.scope, skipped, "dropping requirement node without id");
            out.dropped += skipped;
            continue;
        };
        out.rows.push(shape.row(node, id, parent_id));
        if let Some(children) = fields::array(node, fields::CHILD_LIST) {
            walk(shape, children, Some(id), out);
        }
    }
}

fn subtree_size(node: &JsonValue) -> usize {
    1 + fields::array(node, fields::CHILD_LIST)
        .map(|children| children.iter().map(subtree_size).sum::<usize>())
        .unwrap_or(0)
}

fn definition_row(
    node: &JsonValue,
    id: i64,
    parent_id: Option<i64>,
    with_thresholds: bool,
) -> RequirementDefinition {
    let thresholds = if with_thresholds {
        RequirementThresholds {
            eagle_mb_required: positive(node, "eagleMBRequired"),
            total_mb_required: positive(node, "totalMBRequired"),
            service_hours_required: positive(node, "serviceHoursRequired"),
            months_since_last_rank: positive(node, "monthsSinceLastRankRequired"),
        }
    } else {
        RequirementThresholds::default()
    };

    RequirementDefinition {
        id,
        parent_id,
        requirement_number: fields::text(node, &["requirementNumber"]),
        list_number: fields::text(node, &["listNumber"]),
        short: fields::text(node, &["short"]),
        name: fields::text(node, &["name"]),
        required: fields::flag(node, &["required"], true),
        children_required: positive(node, "childrenRequired"),
        sort_order: fields::text(node, &["sortOrder"]),
        thresholds,
        raw_json: node_json(node),
    }
}

fn completion_row(node: &JsonValue, id: i64, parent_id: Option<i64>) -> RequirementCompletion {
    let date_completed = fields::text(node, fields::DATE_COMPLETED);
    let completed = date_completed.is_some() || fields::flag(node, fields::COMPLETED_FLAG, false);
    RequirementCompletion {
        requirement_id: id,
        parent_id,
        completed,
        date_completed,
        raw_json: node_json(node),
    }
}

/// Zero means "not applicable" in the catalog payloads.
fn positive(node: &JsonValue, key: &str) -> Option<i64> {
    fields::integer(node, &[key]).filter(|v| *v != 0)
}

/// The node without its nested child lists; children are stored as rows of their own.
fn node_json(node: &JsonValue) -> String {
    let mut shallow = node.clone();
    if let Some(map) = shallow.as_object_mut() {
        for key in fields::CHILD_LIST {
            map.remove(*key);
        }
    }
    shallow.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rank_tree() -> JsonValue {
        json!({
            "requirements": [
                {
                    "id": "10", "requirementNumber": "1", "name": "Camp", "sortOrder": "01",
                    "childrenRequired": "2",
                    "requirements": [
                        {"id": 11, "requirementNumber": "1a", "sortOrder": "02"},
                        {"requirementNumber": "1b", "children": [{"id": 99}]},
                        {"id": 12, "requirementNumber": "1c", "required": "False", "sortOrder": "03"}
                    ]
                },
                {"id": 20, "requirementNumber": "2", "eagleMBRequired": 13, "totalMBRequired": "21",
                 "serviceHoursRequired": 0, "children": [{"id": 21}]}
            ]
        })
    }

    #[test]
    fn flattens_parent_before_children_in_received_order() {
        let flat = flatten_requirements(&RankDefinitionShape { rank_id: 2 }, &rank_tree());
        let ids: Vec<_> = flat.rows.iter().map(|r| (r.id, r.parent_id)).collect();
        assert_eq!(
            ids,
            vec![(10, None), (11, Some(10)), (12, Some(10)), (20, None), (21, Some(20))]
        );
        assert_eq!(flat.scope, RequirementScope::Rank { rank_id: 2 });
    }

    #[test]
    fn node_without_id_is_dropped_with_its_subtree() {
        let flat = flatten_requirements(&RankDefinitionShape { rank_id: 2 }, &rank_tree());
        assert_eq!(flat.dropped, 2);
        assert!(flat.rows.iter().all(|r| r.id != 99));
    }

    #[test]
    fn rank_definitions_carry_thresholds_only_where_present() {
        let flat = flatten_requirements(&RankDefinitionShape { rank_id: 2 }, &rank_tree());
        let camp = &flat.rows[0];
        assert_eq!(camp.children_required, Some(2));
        assert!(camp.thresholds.is_empty());
        assert!(!flat.rows[2].required);

        let mbs = flat.rows.iter().find(|r| r.id == 20).unwrap();
        assert_eq!(mbs.thresholds.eagle_mb_required, Some(13));
        assert_eq!(mbs.thresholds.total_mb_required, Some(21));
        assert_eq!(mbs.thresholds.service_hours_required, None);
        assert!(!mbs.raw_json.contains("children"));
    }

    #[test]
    fn merit_badge_definitions_ignore_rank_thresholds() {
        let shape = MeritBadgeDefinitionShape {
            mb_api_id: 7,
            version_id: "2023".into(),
        };
        let flat = flatten_requirements(&shape, &rank_tree());
        assert!(flat.rows.iter().all(|r| r.thresholds.is_empty()));
        assert_eq!(
            flat.scope,
            RequirementScope::MeritBadge {
                mb_api_id: 7,
                version_id: "2023".into()
            }
        );
    }

    #[test]
    fn completion_rows_use_date_aliases() {
        let payload = json!([
            {"id": 10, "dateCompleted": "2024-02-01", "requirements": [
                {"id": 11, "dateEarned": "2024-01-15"},
                {"id": 12}
            ]},
            {"id": 20, "completed": true}
        ]);
        let flat = flatten_requirements(&RankCompletionShape { rank_id: 2 }, &payload);
        let got: Vec<_> = flat
            .rows
            .iter()
            .map(|r| (r.requirement_id, r.completed, r.date_completed.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (10, true, Some("2024-02-01".to_string())),
                (11, true, Some("2024-01-15".to_string())),
                (12, false, None),
                (20, true, None),
            ]
        );
    }

    #[test]
    fn wrapped_roots_are_unwrapped() {
        let payload = json!({"value": {"requirements": [{"id": 5}]}});
        assert_eq!(requirement_roots(&payload).len(), 1);
        assert!(requirement_roots(&json!("nope")).is_empty());
        assert!(requirement_roots(&json!({"other": []})).is_empty());
    }
}
