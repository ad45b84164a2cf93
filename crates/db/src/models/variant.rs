use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use strum_macros::{Display, EnumString};
use ts_rs::TS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WeightType {
    #[default]
    Variable,
    Fix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
pub struct VariantPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct VariantOverride {
    pub context_name: String,
    pub values: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    pub weight: i32,
    #[serde(default)]
    pub weight_type: WeightType,
    #[serde(default = "default_stickiness")]
    pub stickiness: String,
    pub payload: Option<VariantPayload>,
    #[serde(default)]
    pub overrides: Vec<VariantOverride>,
}

fn default_stickiness() -> String {
    "default".to_string()
}

impl Variant {
    pub fn new(name: impl Into<String>, weight: i32) -> Self {
        Self {
            name: name.into(),
            weight,
            weight_type: WeightType::Variable,
            stickiness: default_stickiness(),
            payload: None,
            overrides: Vec::new(),
        }
    }
}

/// Variants are persisted ordered by name so that two writes of the same set
/// produce identical JSON.
pub fn sort_variants(mut variants: Vec<Variant>) -> Vec<Variant> {
    variants.sort_by(|a, b| a.name.cmp(&b.name));
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_variants_serialize_identically() {
        let forward = sort_variants(vec![Variant::new("blue", 500), Variant::new("red", 500)]);
        let backward = sort_variants(vec![Variant::new("red", 500), Variant::new("blue", 500)]);

        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&backward).unwrap()
        );
        assert_eq!(forward[0].name, "blue");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let variant: Variant = serde_json::from_str(r#"{"name":"a","weight":1000}"#).unwrap();
        assert_eq!(variant.weight_type, WeightType::Variable);
        assert_eq!(variant.stickiness, "default");
        assert!(variant.payload.is_none());
    }
}
