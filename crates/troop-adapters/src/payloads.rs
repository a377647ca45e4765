//! Mapping of flat (non-tree) endpoint payloads into core records.

use serde_json::Value as JsonValue;
use tracing::debug;
use troop_core::{is_eagle_required_name, LeadershipPosition, Rank, YouthMeritBadge, YouthRank};

use crate::{fields, PayloadError};

/// Rank catalog: a list, or an object wrapping the list under `value`/`ranks`.
pub fn parse_rank_catalog(payload: &JsonValue) -> Result<Vec<Rank>, PayloadError> {
    let items = list_or_wrapped(payload, fields::RANK_CATALOG, "rank catalog")?;
    Ok(items
        .iter()
        .filter_map(|item| rank_from_node(item, None))
        .collect())
}

/// Per-scout rank summary: `{"program": [{"programId": 2, "ranks": [...]}]}`.
pub fn parse_youth_ranks(payload: &JsonValue) -> Result<Vec<YouthRank>, PayloadError> {
    if !payload.is_object() {
        return Err(PayloadError::UnexpectedShape {
            what: "youth ranks",
            found: kind_of(payload),
        });
    }
    let mut out = Vec::new();
    for program in fields::array(payload, fields::PROGRAM_LIST).unwrap_or_default() {
        let program_id = fields::integer(program, fields::PROGRAM_ID).unwrap_or(0);
        let program_name = fields::text(program, fields::PROGRAM_NAME);
        for node in fields::array(program, &["ranks"]).unwrap_or_default() {
            let Some(mut rank) = rank_from_node(node, Some(program_id)) else {
                continue;
            };
            if rank.program.is_none() {
                rank.program = program_name.clone();
            }
            out.push(YouthRank {
                rank,
                date_earned: fields::text(node, fields::DATE_EARNED),
                raw_json: node.to_string(),
            });
        }
    }
    Ok(out)
}

pub fn parse_youth_merit_badges(payload: &JsonValue) -> Result<Vec<YouthMeritBadge>, PayloadError> {
    let items = list_or_wrapped(payload, fields::MERIT_BADGE_LIST, "youth merit badges")?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = fields::text(item, fields::MERIT_BADGE_NAME) else {
            debug!("skipping merit badge entry without a name");
            continue;
        };
        let is_eagle_required =
            fields::flag(item, fields::EAGLE_FLAG, false) || is_eagle_required_name(&name);
        out.push(YouthMeritBadge {
            mb_api_id: fields::integer(item, fields::NODE_ID),
            version_id: fields::text(item, fields::MERIT_BADGE_VERSION),
            is_eagle_required,
            image_url: fields::text(item, fields::MERIT_BADGE_IMAGE),
            date_completed: fields::text(item, fields::DATE_COMPLETED),
            date_started: fields::text(item, fields::DATE_STARTED),
            raw_json: item.to_string(),
            name,
        });
    }
    Ok(out)
}

/// Version a merit badge definition tree is stored under.
///
/// The definition payload's own version wins over the version reported in the
/// scout's badge summary; an empty string stands in when neither has one.
pub fn merit_badge_definition_version(definition: &JsonValue, fallback: Option<&str>) -> String {
    fields::text(definition, fields::MERIT_BADGE_VERSION)
        .or_else(|| fallback.map(str::to_string))
        .unwrap_or_default()
}

pub fn parse_leadership(payload: &JsonValue) -> Result<Vec<LeadershipPosition>, PayloadError> {
    let items = list_or_wrapped(payload, fields::LEADERSHIP_LIST, "leadership history")?;
    Ok(items
        .iter()
        .map(|item| LeadershipPosition {
            position: fields::text(item, fields::POSITION_TITLE)
                .unwrap_or_else(|| "Unknown".to_string()),
            start_date: fields::text(item, fields::POSITION_START),
            end_date: fields::text(item, fields::POSITION_END),
            unit: fields::text(item, &["unit"]),
            patrol: fields::text(item, &["patrol"]),
            days_in_position: fields::integer(item, fields::POSITION_DAYS),
            approved: fields::flag(item, fields::POSITION_APPROVED, false),
            raw_json: item.to_string(),
        })
        .collect())
}

/// Birthdate from a person profile, looking inside a nested `profile` object last.
///
/// A profile without a birthdate is fine; a profile that is not an object is not.
pub fn profile_birthdate(profile: &JsonValue) -> Result<Option<String>, PayloadError> {
    if !profile.is_object() {
        return Err(PayloadError::UnexpectedShape {
            what: "person profile",
            found: kind_of(profile),
        });
    }
    Ok(fields::text(profile, fields::BIRTHDATE).or_else(|| {
        fields::first(profile, fields::NESTED_PROFILE)
            .and_then(|inner| fields::text(inner, fields::BIRTHDATE))
    }))
}

fn rank_from_node(node: &JsonValue, program_id: Option<i64>) -> Option<Rank> {
    let Some(id) = fields::integer(node, fields::NODE_ID).filter(|id| *id != 0) else {
        debug!("skipping rank entry without an id");
        return None;
    };
    Some(Rank {
        id,
        name: fields::text(node, &["name"]).unwrap_or_default(),
        // Summaries omit the level; rank ids follow ladder order there.
        level: fields::integer(node, &["level"]).unwrap_or(if program_id.is_some() { id } else { 0 }),
        program_id: fields::integer(node, fields::PROGRAM_ID)
            .or(program_id)
            .unwrap_or(0),
        program: fields::text(node, &["program"]),
        image_url: fields::text(node, fields::RANK_IMAGE),
        version: fields::text(node, &["version"]),
        active: fields::flag(node, &["active"], true),
        raw_json: Some(node.to_string()),
    })
}

fn list_or_wrapped<'a>(
    payload: &'a JsonValue,
    keys: &'static [&'static str],
    what: &'static str,
) -> Result<&'a [JsonValue], PayloadError> {
    match payload {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(_) => fields::array(payload, keys)
            .or_else(|| {
                // An empty list under a known key is still a list.
                keys.iter()
                    .filter_map(|key| payload.get(*key)?.as_array())
                    .map(Vec::as_slice)
                    .next()
            })
            .ok_or(PayloadError::MissingList { what, keys }),
        other => Err(PayloadError::UnexpectedShape {
            what,
            found: kind_of(other),
        }),
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use troop_core::AdvancementStatus;

    #[test]
    fn rank_catalog_accepts_wrapped_list() {
        let payload = json!({"value": [
            {"id": "1", "name": "Scout", "level": "1", "programId": 2, "program": "Scouts BSA",
             "imageUrl100": "scout.png", "active": "True"},
            {"name": "No id"}
        ]});
        let ranks = parse_rank_catalog(&payload).unwrap();
        assert_eq!(ranks.len(), 1);
        assert_eq!(ranks[0].id, 1);
        assert_eq!(ranks[0].level, 1);
        assert_eq!(ranks[0].image_url.as_deref(), Some("scout.png"));
        assert!(ranks[0].active);
    }

    #[test]
    fn rank_catalog_rejects_scalars() {
        assert!(parse_rank_catalog(&json!("oops")).is_err());
    }

    #[test]
    fn youth_ranks_thread_program_through() {
        let payload = json!({"status": "All", "program": [
            {"programId": 2, "program": "Scouts BSA", "ranks": [
                {"id": 1, "name": "Scout", "dateEarned": "2023-09-01"},
                {"id": 2, "name": "Tenderfoot", "level": 2}
            ]},
            {"programId": 1, "program": "Cub Scouting", "ranks": [{"id": 14, "name": "Arrow of Light",
             "dateEarned": "2023-02-01"}]}
        ]});
        let ranks = parse_youth_ranks(&payload).unwrap();
        assert_eq!(ranks.len(), 3);
        assert_eq!(ranks[0].rank.program_id, 2);
        assert_eq!(ranks[0].rank.program.as_deref(), Some("Scouts BSA"));
        assert_eq!(ranks[0].status(), AdvancementStatus::Completed);
        assert_eq!(ranks[1].status(), AdvancementStatus::InProgress);
        assert_eq!(ranks[1].rank.level, 2);
        assert_eq!(ranks[2].rank.program_id, 1);
    }

    #[test]
    fn merit_badges_fill_eagle_flag_from_seed_list() {
        let payload = json!([
            {"id": 42, "name": "Cooking", "versionId": "2021", "dateStarted": "2024-01-01"},
            {"id": 43, "short": "Archery", "dateEarned": "2023-06-10", "isEagleRequired": false},
            {"id": 44}
        ]);
        let badges = parse_youth_merit_badges(&payload).unwrap();
        assert_eq!(badges.len(), 2);
        assert!(badges[0].is_eagle_required);
        assert_eq!(badges[0].status(), AdvancementStatus::InProgress);
        assert_eq!(badges[0].version_id.as_deref(), Some("2021"));
        assert_eq!(badges[1].name, "Archery");
        assert!(!badges[1].is_eagle_required);
        assert_eq!(badges[1].status(), AdvancementStatus::Completed);
    }

    #[test]
    fn definition_version_prefers_definition_payload() {
        let defn = json!({"versionId": "2024", "requirements": []});
        assert_eq!(merit_badge_definition_version(&defn, Some("2019")), "2024");
        assert_eq!(merit_badge_definition_version(&json!({}), Some("2019")), "2019");
        assert_eq!(merit_badge_definition_version(&json!({}), None), "");
    }

    #[test]
    fn leadership_uses_title_aliases() {
        let payload = json!({"positions": [
            {"position": "Patrol Leader", "startDate": "2024-01-01", "numberOfDaysInPosition": "120",
             "approvalStatus": "Approved", "unit": "Troop 42"},
            {}
        ]});
        let rows = parse_leadership(&payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].position, "Patrol Leader");
        assert_eq!(rows[0].days_in_position, Some(120));
        assert!(rows[0].approved);
        assert_eq!(rows[1].position, "Unknown");
        assert!(!rows[1].approved);
    }

    #[test]
    fn birthdate_falls_back_to_nested_profile() {
        assert_eq!(
            profile_birthdate(&json!({"dob": "2011-04-02"})),
            Ok(Some("2011-04-02".to_string()))
        );
        assert_eq!(
            profile_birthdate(&json!({"profile": {"dateOfBirth": "2010-12-24"}})),
            Ok(Some("2010-12-24".to_string()))
        );
        assert_eq!(profile_birthdate(&json!({"profile": {}})), Ok(None));
    }

    #[test]
    fn profile_must_be_an_object() {
        assert_eq!(
            profile_birthdate(&json!("not an object")),
            Err(PayloadError::UnexpectedShape {
                what: "person profile",
                found: "string",
            })
        );
    }

    #[test]
    fn wrapped_lists_must_be_present() {
        assert!(parse_leadership(&json!({"positions": []})).unwrap().is_empty());
        let err = parse_leadership(&json!({"message": "no data"})).unwrap_err();
        assert!(matches!(err, PayloadError::MissingList { what: "leadership history", .. }));
        assert_eq!(
            err.to_string(),
            "leadership history: object carries none of value, positions"
        );
        assert!(parse_youth_merit_badges(&json!({})).is_err());
        assert!(parse_rank_catalog(&json!({"ranks": null})).is_err());
    }
}
