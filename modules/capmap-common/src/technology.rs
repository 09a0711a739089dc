use std::collections::BTreeMap;

/// Display priority when a location hosts several technologies. Lower wins.
/// Specific technologies outrank catch-alls: a site with one Battery and
/// three DSR components is shown as Battery.
const TECH_PRIORITIES: &[(&str, u32)] = &[
    ("EV Charging", 1),
    ("Pumped Hydro", 2),
    ("Battery", 3),
    ("Nuclear", 4),
    ("Interconnector", 5),
    ("Solar", 6),
    ("Wind", 7),
    ("Hydro", 8),
    ("CHP", 9),
    ("OCGT", 10),
    ("Gas", 10),
    ("Biomass", 11),
    ("Coal", 12),
    ("DSR", 13),
];

fn priority_of(tech: &str) -> u32 {
    TECH_PRIORITIES
        .iter()
        .find(|(name, _)| *name == tech)
        .map(|(_, p)| *p)
        .unwrap_or(999)
}

/// Pick the technology to display for a location. Priority beats count;
/// ties break on higher count, then name for determinism.
pub fn primary_technology(technologies: &BTreeMap<String, i64>) -> Option<&str> {
    technologies
        .iter()
        .min_by(|(a_name, a_count), (b_name, b_count)| {
            priority_of(a_name)
                .cmp(&priority_of(b_name))
                .then(b_count.cmp(a_count))
                .then(a_name.cmp(b_name))
        })
        .map(|(name, _)| name.as_str())
}

/// Names a technology may carry in the raw auction data. The canonical
/// name (the map key) is what clients see.
pub fn variations(canonical: &str) -> Vec<&'static str> {
    match canonical {
        "CHP" => vec!["CHP", "Combined Heat and Power (CHP)", "CHP and autogeneration"],
        "DSR" => vec!["DSR", "Demand Side Response"],
        "Battery" => vec!["Battery", "Battery Storage", "Battery storage"],
        "OCGT" | "Gas" => vec![
            "Gas",
            "Gas - OCGTs and reciprocating engines",
            "Gas reciprocating engines",
            "OCGT",
            "Combined Cycle Gas Turbine (CCGT)",
        ],
        "Wind" => vec!["Wind", "Onshore Wind", "Offshore Wind"],
        "Solar" => vec!["Solar", "Solar Photovoltaics"],
        "Nuclear" => vec!["Nuclear"],
        "Hydro" => vec!["Hydro", "Hydro Power", "Pumped Storage Hydro"],
        "Biomass" => vec!["Biomass", "Biomass and waste"],
        "Interconnector" => vec!["Interconnector"],
        "Coal" => vec!["Coal"],
        _ => vec![],
    }
}

/// All names to match for a requested technology: its variations, or the
/// name itself when we know no variants.
pub fn match_set(requested: &str) -> Vec<String> {
    let vars = variations(requested);
    if vars.is_empty() {
        vec![requested.to_string()]
    } else {
        vars.into_iter().map(String::from).collect()
    }
}

/// Display name for a group given what the caller asked for: when the
/// requested technology (or one of its variants) is present the canonical
/// requested name wins, otherwise fall back to the priority pick.
pub fn display_technology(
    technologies: &BTreeMap<String, i64>,
    requested: Option<&str>,
) -> String {
    if let Some(req) = requested {
        if technologies.contains_key(req) {
            return req.to_string();
        }
        for variant in variations(req) {
            if technologies.contains_key(variant) {
                return req.to_string();
            }
        }
    }
    primary_technology(technologies)
        .unwrap_or("Unknown")
        .to_string()
}

/// Tokens that mark a free-text query as technology-biased.
pub const TECH_QUERY_TOKENS: &[&str] = &[
    "battery", "wind", "solar", "gas", "dsr", "chp", "hydro", "nuclear", "coal", "biomass",
];

/// Tokens that mark a free-text query as company-biased.
pub const COMPANY_QUERY_TOKENS: &[&str] = &[
    "ltd",
    "limited",
    "plc",
    "llc",
    "gmbh",
    "corporation",
    "energy",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn techs(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn priority_beats_count() {
        let t = techs(&[("DSR", 3), ("Battery", 1)]);
        assert_eq!(primary_technology(&t), Some("Battery"));
    }

    #[test]
    fn unknown_technologies_rank_last() {
        let t = techs(&[("Tidal Lagoon", 5), ("Coal", 1)]);
        assert_eq!(primary_technology(&t), Some("Coal"));
    }

    #[test]
    fn tie_on_priority_breaks_on_count() {
        let t = techs(&[("OCGT", 1), ("Gas", 4)]);
        assert_eq!(primary_technology(&t), Some("Gas"));
    }

    #[test]
    fn empty_map_has_no_primary() {
        assert_eq!(primary_technology(&BTreeMap::new()), None);
    }

    #[test]
    fn requested_variant_displays_canonical_name() {
        let t = techs(&[("Gas reciprocating engines", 2)]);
        assert_eq!(display_technology(&t, Some("OCGT")), "OCGT");
    }

    #[test]
    fn unrequested_falls_back_to_priority() {
        let t = techs(&[("DSR", 3), ("Solar", 1)]);
        assert_eq!(display_technology(&t, Some("Nuclear")), "Solar");
    }
}
