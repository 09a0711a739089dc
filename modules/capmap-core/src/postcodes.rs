//! Static postcode index plus the external postcodes.io client.
//!
//! The index answers "what outward codes cover this area?" and "what area
//! is this postcode in?" from prebuilt JSON files, memory-only after load.
//! Anything needing live data (validation, nearest, outcode details) goes
//! through the external provider and is cached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{ttl, CacheLayer};

/// Outward-code grammar: "SW11", "NG1", "EC1A".
pub fn outward_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{1,2}[0-9][0-9A-Z]?$").expect("outward regex"))
}

const AREA_RESULT_CAP: usize = 50;

/// Immutable in-memory maps built from the static index files.
#[derive(Debug, Default)]
pub struct PostcodeIndex {
    outward_locations: HashMap<String, Vec<String>>,
    location_counts: HashMap<String, i64>,
    search_index: HashMap<String, Vec<String>>,
    // lowercase location name -> outward codes
    location_to_outwards: HashMap<String, Vec<String>>,
}

impl PostcodeIndex {
    /// Load the three index files from `dir`. Any failure logs and falls
    /// back to an empty index whose lookups all return nothing.
    pub fn load(dir: &Path) -> Self {
        match Self::try_load(dir) {
            Ok(index) => {
                tracing::info!(
                    outwards = index.outward_locations.len(),
                    locations = index.location_to_outwards.len(),
                    "Postcode index loaded"
                );
                index
            }
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "Failed to load postcode index, lookups disabled");
                Self::default()
            }
        }
    }

    fn try_load(dir: &Path) -> anyhow::Result<Self> {
        let outward_locations: HashMap<String, Vec<String>> =
            serde_json::from_str(&std::fs::read_to_string(dir.join("outward_locations.json"))?)?;
        let location_counts: HashMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(dir.join("location_counts.json"))?)?;

        // The token index is optional
        let search_index: HashMap<String, Vec<String>> =
            match std::fs::read_to_string(dir.join("search_index.json")) {
                Ok(raw) => serde_json::from_str(&raw)?,
                Err(_) => HashMap::new(),
            };

        let mut location_to_outwards: HashMap<String, Vec<String>> = HashMap::new();
        let mut missing_counts = 0usize;
        for (outward, locations) in &outward_locations {
            for location in locations {
                if !location_counts.contains_key(location) {
                    missing_counts += 1;
                }
                location_to_outwards
                    .entry(location.to_lowercase())
                    .or_default()
                    .push(outward.clone());
            }
        }
        if missing_counts > 0 {
            tracing::warn!(
                missing_counts,
                "Locations present in outward_locations but absent from location_counts"
            );
        }

        Ok(Self {
            outward_locations,
            location_counts,
            search_index,
            location_to_outwards,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.outward_locations.is_empty()
    }

    /// Outward codes covering an area name. Exact lowercase match first;
    /// a query that is itself outward-code syntax maps to itself;
    /// otherwise substring match over location names, capped.
    pub fn postcodes_for_area(&self, name: &str) -> Vec<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let lower = trimmed.to_lowercase();
        if let Some(outwards) = self.location_to_outwards.get(&lower) {
            return outwards.clone();
        }

        let upper = trimmed.to_uppercase();
        if outward_code_re().is_match(&upper) {
            return vec![upper];
        }

        let mut matches: Vec<String> = Vec::new();
        for (location, outwards) in &self.location_to_outwards {
            if location.contains(&lower) {
                matches.extend(outwards.iter().cloned());
            }
        }
        matches.sort();
        matches.dedup();
        matches.truncate(AREA_RESULT_CAP);
        matches
    }

    /// The area a postcode (full or outward) belongs to.
    pub fn area_for_postcode(&self, postcode: &str) -> Option<&str> {
        let normalized = postcode.trim().to_uppercase();
        if normalized.is_empty() {
            return None;
        }

        let outward = outward_token(&normalized);

        self.outward_locations
            .get(&outward)
            .and_then(|locations| locations.first())
            .map(String::as_str)
    }

    /// Locations carrying a search token, from the optional token index.
    pub fn locations_for_token(&self, token: &str) -> &[String] {
        self.search_index
            .get(&token.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn location_count(&self, location: &str) -> Option<i64> {
        self.location_counts.get(&location.to_lowercase()).copied()
    }
}

/// Outward token of any postcode form: "SW11 1AA" → "SW11", "sw111aa" →
/// "SW11", "NG1" → "NG1".
pub fn outward_token(postcode: &str) -> String {
    let normalized = postcode.trim().to_uppercase();
    match normalized.split_once(' ') {
        Some((head, _)) => head.to_string(),
        None => extract_outward(&normalized),
    }
}

/// Extract the outward token from a spaceless postcode string. The inward
/// part of a full UK postcode is always three characters (digit + two
/// letters), so the outward token is everything before them, capped at 4.
fn extract_outward(postcode: &str) -> String {
    let len = postcode.len();
    if len < 5 {
        return postcode.to_string();
    }
    let outward_len = (len - 3).min(4);
    postcode[..outward_len].to_string()
}

/// Details for an outward code from the external provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcodeDetails {
    #[serde(default)]
    pub admin_district: Vec<String>,
    #[serde(default)]
    pub parliamentary_constituency: Vec<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Client for the external postcode provider. Best-effort: failures log,
/// return empty/false and leave a short negative cache entry.
#[derive(Clone)]
pub struct PostcodeClient {
    http: reqwest::Client,
    base_url: String,
    cache: CacheLayer,
}

impl PostcodeClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, cache: CacheLayer) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            cache,
        }
    }

    pub async fn validate(&self, postcode: &str) -> bool {
        let cleaned = postcode.trim().to_uppercase().replace(' ', "");
        if cleaned.is_empty() {
            return false;
        }

        let key = self.cache.postcode_key("validate", &cleaned);
        if let Some(valid) = self.cache.get::<bool>(&key).await {
            return valid;
        }

        let url = format!("{}/postcodes/{}/validate", self.base_url, cleaned);
        match self.fetch_result(&url).await {
            Ok(result) => {
                let valid = result.as_bool().unwrap_or(false);
                self.cache.set(&key, &valid, ttl::POSTCODE).await;
                valid
            }
            Err(e) => {
                tracing::warn!(postcode = %cleaned, error = %e, "Postcode validation failed");
                self.cache.set(&key, &false, ttl::NEGATIVE).await;
                false
            }
        }
    }

    pub async fn nearest(&self, postcode: &str, radius_m: u32, limit: u32) -> Vec<String> {
        let cleaned = postcode.trim().to_uppercase().replace(' ', "");
        if cleaned.is_empty() {
            return Vec::new();
        }

        let key = self
            .cache
            .postcode_key("nearest", &format!("{cleaned}:{limit}:{radius_m}"));
        if let Some(nearest) = self.cache.get::<Vec<String>>(&key).await {
            return nearest;
        }

        let url = format!(
            "{}/postcodes/{}/nearest?limit={}&radius={}",
            self.base_url, cleaned, limit, radius_m
        );
        match self.fetch_result(&url).await {
            Ok(result) => {
                let nearest: Vec<String> = result
                    .as_array()
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|e| e.get("postcode").and_then(|p| p.as_str()))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                self.cache.set(&key, &nearest, ttl::POSTCODE_NEAREST).await;
                nearest
            }
            Err(e) => {
                tracing::warn!(postcode = %cleaned, error = %e, "Nearest postcode lookup failed");
                self.cache
                    .set(&key, &Vec::<String>::new(), ttl::NEGATIVE)
                    .await;
                Vec::new()
            }
        }
    }

    pub async fn outcode_details(&self, outcode: &str) -> Option<OutcodeDetails> {
        let cleaned = outcode.trim().to_uppercase();
        if cleaned.is_empty() {
            return None;
        }

        let key = self.cache.postcode_key("outcode", &cleaned);
        if let Some(details) = self.cache.get::<Option<OutcodeDetails>>(&key).await {
            return details;
        }

        let url = format!("{}/outcodes/{}", self.base_url, cleaned);
        match self.fetch_result(&url).await {
            Ok(result) => {
                let details: Option<OutcodeDetails> = serde_json::from_value(result).ok();
                self.cache.set(&key, &details, ttl::POSTCODE).await;
                details
            }
            Err(e) => {
                tracing::warn!(outcode = %cleaned, error = %e, "Outcode lookup failed");
                self.cache
                    .set(&key, &None::<OutcodeDetails>, ttl::NEGATIVE)
                    .await;
                None
            }
        }
    }

    async fn fetch_result(&self, url: &str) -> anyhow::Result<serde_json::Value> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("outward_locations.json"),
            r#"{"SW11": ["battersea", "clapham junction"], "NG1": ["nottingham"], "EC1A": ["clerkenwell"]}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("location_counts.json"),
            r#"{"battersea": 12, "clapham junction": 4, "nottingham": 30, "clerkenwell": 2}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("search_index.json"),
            r#"{"junction": ["clapham junction"]}"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn area_lookup_exact_match() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        assert_eq!(index.postcodes_for_area("Battersea"), vec!["SW11"]);
    }

    #[test]
    fn outward_syntax_maps_to_itself() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        assert_eq!(index.postcodes_for_area("sw11"), vec!["SW11"]);
        assert_eq!(index.postcodes_for_area("ZZ99"), vec!["ZZ99"]);
    }

    #[test]
    fn substring_match_over_location_names() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        let result = index.postcodes_for_area("junction station");
        assert!(result.is_empty());
        let result = index.postcodes_for_area("junction");
        assert_eq!(result, vec!["SW11"]);
    }

    #[test]
    fn area_for_postcode_full_and_outward_forms() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        assert_eq!(index.area_for_postcode("SW11 1AA"), Some("battersea"));
        assert_eq!(index.area_for_postcode("sw111aa"), Some("battersea"));
        assert_eq!(index.area_for_postcode("EC1A1BB"), Some("clerkenwell"));
        assert_eq!(index.area_for_postcode("ZZ99 9ZZ"), None);
    }

    #[test]
    fn round_trip_area_contains_outward() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        for (outward, locations) in &index.outward_locations {
            for location in locations {
                assert!(
                    index.postcodes_for_area(location).contains(outward),
                    "area '{location}' should map back to outward '{outward}'"
                );
            }
        }
    }

    #[test]
    fn outward_token_handles_all_forms() {
        assert_eq!(outward_token("SW11 1AA"), "SW11");
        assert_eq!(outward_token("sw111aa"), "SW11");
        assert_eq!(outward_token("EC1A1BB"), "EC1A");
        assert_eq!(outward_token("S91AA"), "S9");
        assert_eq!(outward_token("NG1"), "NG1");
    }

    #[test]
    fn missing_files_fall_back_to_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = PostcodeIndex::load(dir.path());
        assert!(index.is_empty());
        assert!(index.postcodes_for_area("battersea").is_empty());
        assert_eq!(index.area_for_postcode("SW11 1AA"), None);
    }

    #[test]
    fn token_index_lookup() {
        let dir = fixture_dir();
        let index = PostcodeIndex::load(dir.path());
        assert_eq!(index.locations_for_token("JUNCTION"), ["clapham junction"]);
        assert!(index.locations_for_token("nowhere").is_empty());
    }
}
