use serde::{Deserialize, Serialize};

/// How much to trust a LocationGroup's capacity figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityConfidence {
    High,
    Medium,
    Low,
    None,
}

impl CapacityConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityConfidence::High => "high",
            CapacityConfidence::Medium => "medium",
            CapacityConfidence::Low => "low",
            CapacityConfidence::None => "none",
        }
    }
}

impl std::fmt::Display for CapacityConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapacityConfidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(CapacityConfidence::High),
            "medium" => Ok(CapacityConfidence::Medium),
            "low" => Ok(CapacityConfidence::Low),
            "none" => Ok(CapacityConfidence::None),
            other => Err(format!("unknown capacity confidence: {other}")),
        }
    }
}

/// CMU ids at a location. Small sets are stored whole; past the threshold
/// only the count and a sample survive, to bound row size.
///
/// Serialized form: the small variant is a bare JSON array, the large one
/// an object `{"count": n, "sample": [...]}`. Deserialization accepts both
/// shapes regardless of size, since historic rows carry either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmuIdSet {
    Small(Vec<String>),
    Large { count: i64, sample: Vec<String> },
}

/// Above this many distinct CMU ids the builder stores the large form.
pub const CMU_ID_INLINE_LIMIT: usize = 20;
/// Sample size kept in the large form.
pub const CMU_ID_SAMPLE_SIZE: usize = 5;

impl CmuIdSet {
    /// Build from a sorted, deduplicated id list, choosing the form by size.
    pub fn from_ids(ids: Vec<String>) -> Self {
        if ids.len() <= CMU_ID_INLINE_LIMIT {
            CmuIdSet::Small(ids)
        } else {
            CmuIdSet::Large {
                count: ids.len() as i64,
                sample: ids.into_iter().take(CMU_ID_SAMPLE_SIZE).collect(),
            }
        }
    }

    pub fn count(&self) -> i64 {
        match self {
            CmuIdSet::Small(ids) => ids.len() as i64,
            CmuIdSet::Large { count, .. } => *count,
        }
    }

    /// Ids we can enumerate: the full set for the small form, the sample
    /// for the large one.
    pub fn visible_ids(&self) -> &[String] {
        match self {
            CmuIdSet::Small(ids) => ids,
            CmuIdSet::Large { sample, .. } => sample,
        }
    }
}

impl Default for CmuIdSet {
    fn default() -> Self {
        CmuIdSet::Small(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("CMU{i:03}")).collect()
    }

    #[test]
    fn small_form_below_threshold() {
        let set = CmuIdSet::from_ids(ids(20));
        assert!(matches!(set, CmuIdSet::Small(_)));
        assert_eq!(set.count(), 20);
    }

    #[test]
    fn large_form_above_threshold() {
        let set = CmuIdSet::from_ids(ids(21));
        match &set {
            CmuIdSet::Large { count, sample } => {
                assert_eq!(*count, 21);
                assert_eq!(sample.len(), CMU_ID_SAMPLE_SIZE);
            }
            other => panic!("expected large form, got {other:?}"),
        }
    }

    #[test]
    fn small_form_serializes_as_bare_array() {
        let set = CmuIdSet::Small(vec!["VIT304".into(), "VIT305".into()]);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!(["VIT304", "VIT305"]));
    }

    #[test]
    fn deserializes_both_shapes() {
        let small: CmuIdSet = serde_json::from_value(serde_json::json!(["A1"])).unwrap();
        assert_eq!(small, CmuIdSet::Small(vec!["A1".into()]));

        let large: CmuIdSet =
            serde_json::from_value(serde_json::json!({"count": 40, "sample": ["A1"]})).unwrap();
        assert_eq!(
            large,
            CmuIdSet::Large {
                count: 40,
                sample: vec!["A1".into()]
            }
        );
    }

    #[test]
    fn confidence_round_trips_as_lowercase() {
        let json = serde_json::to_string(&CapacityConfidence::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        assert_eq!(
            "none".parse::<CapacityConfidence>().unwrap(),
            CapacityConfidence::None
        );
    }
}
