//! Core funding record model and requirement arithmetic for the FTS collector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "fts-core";

/// Raw upstream entity as decoded from the source.
pub type RawEntity = Map<String, JsonValue>;

/// Requirement keys in lookup order. Upstream spells this field both ways
/// depending on the entity level; the plural form wins when both exist.
pub const REQUIREMENT_KEYS: [&str; 2] = ["current_requirements", "current_requirement"];

/// Entity level a pipeline run produces records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    Emergency,
    Appeal,
    Cluster,
}

impl DataMode {
    pub const ALL: [DataMode; 3] = [DataMode::Emergency, DataMode::Appeal, DataMode::Cluster];

    pub fn as_str(self) -> &'static str {
        match self {
            DataMode::Emergency => "emergency",
            DataMode::Appeal => "appeal",
            DataMode::Cluster => "cluster",
        }
    }

    pub fn table_name(self) -> &'static str {
        self.as_str()
    }

    /// Column used to match existing rows during an idempotent refresh.
    pub fn key_column(self) -> &'static str {
        match self {
            DataMode::Emergency => "emergency_id",
            DataMode::Appeal | DataMode::Cluster => "appeal_id",
        }
    }

    /// Year-partitioned collection streamed for this mode. Cluster records are
    /// derived from appeals, so cluster mode walks the appeal collection.
    pub fn collection_level(self) -> CollectionLevel {
        match self {
            DataMode::Emergency => CollectionLevel::Emergency,
            DataMode::Appeal | DataMode::Cluster => CollectionLevel::Appeal,
        }
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(DataMode::Emergency),
            "appeal" => Ok(DataMode::Appeal),
            "cluster" => Ok(DataMode::Cluster),
            other => Err(format!(
                "unknown data mode `{other}` (expected emergency, appeal or cluster)"
            )),
        }
    }
}

/// Upstream collections that are partitioned by year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionLevel {
    Emergency,
    Appeal,
}

impl CollectionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionLevel::Emergency => "emergency",
            CollectionLevel::Appeal => "appeal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
    #[error("missing required field `{field}`")]
    Missing { field: &'static str },
    #[error("field `{field}` has unexpected type: expected {expected}, found {found}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

pub fn as_entity(value: &JsonValue) -> Result<&RawEntity, ShapeError> {
    value.as_object().ok_or(ShapeError::NotAnObject {
        found: json_kind(value),
    })
}

/// Text field that may arrive as a JSON string or number. `null` and absent
/// both read as `None`.
pub fn optional_text(raw: &RawEntity, field: &'static str) -> Result<Option<String>, ShapeError> {
    match raw.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ShapeError::UnexpectedType {
            field,
            expected: "string or number",
            found: json_kind(other),
        }),
    }
}

pub fn required_text(raw: &RawEntity, field: &'static str) -> Result<String, ShapeError> {
    optional_text(raw, field)?.ok_or(ShapeError::Missing { field })
}

/// Numeric field that may arrive as a JSON number or a numeric string.
pub fn optional_number(raw: &RawEntity, field: &'static str) -> Result<Option<f64>, ShapeError> {
    match raw.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n.as_f64().map(Some).ok_or(ShapeError::UnexpectedType {
            field,
            expected: "finite number",
            found: "number",
        }),
        Some(JsonValue::String(s)) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Some(n)),
            Ok(_) => Err(ShapeError::UnexpectedType {
                field,
                expected: "finite number",
                found: "non-finite string",
            }),
            Err(_) => Err(ShapeError::UnexpectedType {
                field,
                expected: "number",
                found: "non-numeric string",
            }),
        },
        Some(other) => Err(ShapeError::UnexpectedType {
            field,
            expected: "number",
            found: json_kind(other),
        }),
    }
}

pub fn required_number(raw: &RawEntity, field: &'static str) -> Result<f64, ShapeError> {
    optional_number(raw, field)?.ok_or(ShapeError::Missing { field })
}

/// Funding figures for one entity. Upstream omits the requirement for some
/// entities; those records carry no `requirement` or `coverage` columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequirementInfo {
    FundingWithRequirement {
        requirement: f64,
        funding: f64,
        coverage: f64,
    },
    FundingOnly {
        funding: f64,
    },
}

impl RequirementInfo {
    pub fn new(funding: f64, requirement: Option<f64>) -> Self {
        match requirement {
            Some(requirement) => {
                let coverage = if requirement == 0.0 {
                    0.0
                } else {
                    funding / requirement
                };
                RequirementInfo::FundingWithRequirement {
                    requirement,
                    funding,
                    coverage,
                }
            }
            None => RequirementInfo::FundingOnly { funding },
        }
    }

    /// Requirement calculator: reads `funding` and the first requirement key
    /// present in [`REQUIREMENT_KEYS`].
    pub fn compute(raw: &RawEntity) -> Result<Self, ShapeError> {
        let funding = required_number(raw, "funding")?;
        let mut requirement = None;
        for key in REQUIREMENT_KEYS {
            if let Some(value) = optional_number(raw, key)? {
                requirement = Some(value);
                break;
            }
        }
        Ok(Self::new(funding, requirement))
    }

    pub fn funding(&self) -> f64 {
        match *self {
            RequirementInfo::FundingWithRequirement { funding, .. }
            | RequirementInfo::FundingOnly { funding } => funding,
        }
    }

    pub fn requirement(&self) -> Option<f64> {
        match *self {
            RequirementInfo::FundingWithRequirement { requirement, .. } => Some(requirement),
            RequirementInfo::FundingOnly { .. } => None,
        }
    }

    pub fn coverage(&self) -> Option<f64> {
        match *self {
            RequirementInfo::FundingWithRequirement { coverage, .. } => Some(coverage),
            RequirementInfo::FundingOnly { .. } => None,
        }
    }

    fn to_fields(self) -> Map<String, JsonValue> {
        let mut fields = Map::new();
        if let Some(requirement) = self.requirement() {
            fields.insert("requirement".into(), requirement.into());
        }
        fields.insert("funding".into(), self.funding().into());
        if let Some(coverage) = self.coverage() {
            fields.insert("coverage".into(), coverage.into());
        }
        fields
    }
}

/// Identity and geography shared by every record level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordBase {
    pub emergency_id: String,
    pub emergency_name: String,
    pub countries: String,
    pub year: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppealIdentity {
    pub appeal_id: String,
    pub appeal_name: String,
    pub funding_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyRecord {
    #[serde(flatten)]
    pub base: RecordBase,
    #[serde(flatten)]
    pub requirement: RequirementInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppealRecord {
    #[serde(flatten)]
    pub base: RecordBase,
    #[serde(flatten)]
    pub appeal: AppealIdentity,
    #[serde(flatten)]
    pub requirement: RequirementInfo,
}

/// One sector breakdown of an appeal. Funding figures are the cluster's own,
/// not a share of the appeal total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterRecord {
    #[serde(flatten)]
    pub base: RecordBase,
    #[serde(flatten)]
    pub appeal: AppealIdentity,
    pub cluster: String,
    #[serde(flatten)]
    pub requirement: RequirementInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FundingRecord {
    Emergency(EmergencyRecord),
    Appeal(AppealRecord),
    Cluster(ClusterRecord),
}

/// Flat column view of a record plus any keys that collided while merging
/// its field groups.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    pub fields: Map<String, JsonValue>,
    pub conflicts: Vec<String>,
}

/// Last-write-wins merge. Returns the keys that were overwritten.
pub fn merge_fields(
    target: &mut Map<String, JsonValue>,
    additions: Map<String, JsonValue>,
) -> Vec<String> {
    let mut conflicts = Vec::new();
    for (key, value) in additions {
        if target.insert(key.clone(), value).is_some() {
            conflicts.push(key);
        }
    }
    conflicts
}

impl RecordBase {
    fn to_fields(&self) -> Map<String, JsonValue> {
        let mut fields = Map::new();
        fields.insert("emergency_id".into(), self.emergency_id.clone().into());
        fields.insert("emergency_name".into(), self.emergency_name.clone().into());
        fields.insert("countries".into(), self.countries.clone().into());
        fields.insert("year".into(), self.year.clone().into());
        fields
    }
}

impl AppealIdentity {
    fn to_fields(&self) -> Map<String, JsonValue> {
        let mut fields = Map::new();
        fields.insert("appeal_id".into(), self.appeal_id.clone().into());
        fields.insert("appeal_name".into(), self.appeal_name.clone().into());
        fields.insert("funding_type".into(), self.funding_type.clone().into());
        fields
    }
}

impl FundingRecord {
    pub fn mode(&self) -> DataMode {
        match self {
            FundingRecord::Emergency(_) => DataMode::Emergency,
            FundingRecord::Appeal(_) => DataMode::Appeal,
            FundingRecord::Cluster(_) => DataMode::Cluster,
        }
    }

    pub fn base(&self) -> &RecordBase {
        match self {
            FundingRecord::Emergency(r) => &r.base,
            FundingRecord::Appeal(r) => &r.base,
            FundingRecord::Cluster(r) => &r.base,
        }
    }

    pub fn appeal(&self) -> Option<&AppealIdentity> {
        match self {
            FundingRecord::Emergency(_) => None,
            FundingRecord::Appeal(r) => Some(&r.appeal),
            FundingRecord::Cluster(r) => Some(&r.appeal),
        }
    }

    pub fn cluster(&self) -> Option<&str> {
        match self {
            FundingRecord::Cluster(r) => Some(&r.cluster),
            _ => None,
        }
    }

    pub fn requirement(&self) -> RequirementInfo {
        match self {
            FundingRecord::Emergency(r) => r.requirement,
            FundingRecord::Appeal(r) => r.requirement,
            FundingRecord::Cluster(r) => r.requirement,
        }
    }

    /// Value of the mode's key column (see [`DataMode::key_column`]).
    pub fn identity_key(&self) -> &str {
        match self.appeal() {
            Some(appeal) => &appeal.appeal_id,
            None => &self.base().emergency_id,
        }
    }

    pub fn to_flat(&self) -> FlatRecord {
        let mut fields = self.base().to_fields();
        let mut conflicts = Vec::new();
        if let Some(appeal) = self.appeal() {
            conflicts.extend(merge_fields(&mut fields, appeal.to_fields()));
        }
        if let Some(cluster) = self.cluster() {
            let mut extra = Map::new();
            extra.insert("cluster".into(), cluster.into());
            conflicts.extend(merge_fields(&mut fields, extra));
        }
        conflicts.extend(merge_fields(&mut fields, self.requirement().to_fields()));
        FlatRecord { fields, conflicts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: JsonValue) -> RawEntity {
        value.as_object().cloned().expect("object")
    }

    fn base() -> RecordBase {
        RecordBase {
            emergency_id: "E1".into(),
            emergency_name: "Flood".into(),
            countries: "\"Kenya\"".into(),
            year: "2015".into(),
        }
    }

    #[test]
    fn coverage_is_funding_over_requirement() {
        let info = RequirementInfo::compute(&entity(json!({
            "funding": 50,
            "current_requirement": 100
        })))
        .expect("compute");
        assert_eq!(
            info,
            RequirementInfo::FundingWithRequirement {
                requirement: 100.0,
                funding: 50.0,
                coverage: 0.5
            }
        );
    }

    #[test]
    fn zero_requirement_yields_zero_coverage() {
        let info = RequirementInfo::compute(&entity(json!({
            "funding": 1234.5,
            "current_requirements": 0
        })))
        .expect("compute");
        assert_eq!(info.coverage(), Some(0.0));
        assert_eq!(info.requirement(), Some(0.0));
    }

    #[test]
    fn plural_requirement_key_takes_precedence() {
        let info = RequirementInfo::compute(&entity(json!({
            "funding": 10,
            "current_requirement": 20,
            "current_requirements": 40
        })))
        .expect("compute");
        assert_eq!(info.requirement(), Some(40.0));
        assert_eq!(info.coverage(), Some(0.25));
    }

    #[test]
    fn null_plural_falls_back_to_singular() {
        let info = RequirementInfo::compute(&entity(json!({
            "funding": 10,
            "current_requirements": null,
            "current_requirement": 20
        })))
        .expect("compute");
        assert_eq!(info.requirement(), Some(20.0));
    }

    #[test]
    fn missing_requirement_yields_funding_only() {
        let info =
            RequirementInfo::compute(&entity(json!({ "funding": "75.5" }))).expect("compute");
        assert_eq!(info, RequirementInfo::FundingOnly { funding: 75.5 });
        assert_eq!(info.coverage(), None);
    }

    #[test]
    fn missing_funding_is_a_shape_error() {
        let err = RequirementInfo::compute(&entity(json!({ "current_requirement": 5 })))
            .expect_err("funding is required");
        assert_eq!(err, ShapeError::Missing { field: "funding" });
    }

    #[test]
    fn non_numeric_funding_is_a_shape_error() {
        let err = RequirementInfo::compute(&entity(json!({ "funding": [1] }))).expect_err("array");
        assert!(matches!(err, ShapeError::UnexpectedType { field: "funding", .. }));
    }

    #[test]
    fn non_finite_numeric_strings_are_shape_errors() {
        for text in ["NaN", "inf", "-Infinity", " infinity "] {
            let err = RequirementInfo::compute(&entity(json!({ "funding": text })))
                .expect_err("non-finite funding");
            assert!(
                matches!(
                    err,
                    ShapeError::UnexpectedType {
                        field: "funding",
                        expected: "finite number",
                        ..
                    }
                ),
                "{text}: {err:?}"
            );
        }

        let err = RequirementInfo::compute(&entity(json!({
            "funding": 10,
            "current_requirements": "NaN"
        })))
        .expect_err("non-finite requirement");
        assert!(matches!(
            err,
            ShapeError::UnexpectedType {
                field: "current_requirements",
                ..
            }
        ));
    }

    #[test]
    fn numeric_ids_render_as_text() {
        let raw = entity(json!({ "id": 16506, "title": "Flood" }));
        assert_eq!(required_text(&raw, "id").expect("id"), "16506");
        assert_eq!(optional_text(&raw, "type").expect("type"), None);
    }

    #[test]
    fn funding_only_record_has_no_requirement_columns() {
        let record = FundingRecord::Emergency(EmergencyRecord {
            base: base(),
            requirement: RequirementInfo::FundingOnly { funding: 5.0 },
        });
        let flat = record.to_flat();
        assert!(flat.conflicts.is_empty());
        assert!(!flat.fields.contains_key("requirement"));
        assert!(!flat.fields.contains_key("coverage"));
        assert_eq!(flat.fields["funding"], json!(5.0));

        let serialized = serde_json::to_value(&record).expect("serialize");
        assert_eq!(JsonValue::Object(flat.fields), serialized);
    }

    #[test]
    fn cluster_record_flattens_every_field_group() {
        let record = FundingRecord::Cluster(ClusterRecord {
            base: base(),
            appeal: AppealIdentity {
                appeal_id: "A1".into(),
                appeal_name: "Flood response".into(),
                funding_type: "CAP".into(),
            },
            cluster: "HEALTH".into(),
            requirement: RequirementInfo::new(30.0, Some(60.0)),
        });
        let flat = record.to_flat();
        assert!(flat.conflicts.is_empty());
        assert_eq!(flat.fields.len(), 11);
        assert_eq!(flat.fields["cluster"], json!("HEALTH"));
        assert_eq!(flat.fields["coverage"], json!(0.5));
        assert_eq!(record.identity_key(), "A1");
        assert_eq!(record.mode(), DataMode::Cluster);
    }

    #[test]
    fn merge_reports_overwritten_keys() {
        let mut target = entity(json!({ "a": 1, "b": 2 }));
        let conflicts = merge_fields(&mut target, entity(json!({ "b": 3, "c": 4 })));
        assert_eq!(conflicts, vec!["b".to_string()]);
        assert_eq!(target["b"], json!(3));
    }

    #[test]
    fn data_mode_round_trips_through_text() {
        for mode in DataMode::ALL {
            assert_eq!(mode.to_string().parse::<DataMode>(), Ok(mode));
        }
        assert!("region".parse::<DataMode>().is_err());
        assert_eq!(DataMode::Cluster.key_column(), "appeal_id");
        assert_eq!(DataMode::Cluster.collection_level(), CollectionLevel::Appeal);
    }
}
