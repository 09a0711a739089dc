use std::sync::OnceLock;

use regex::Regex;

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})").expect("year regex"))
}

/// Extract the leading 4-digit year from an auction name such as
/// "T-4 2024-25". Returns None when the string carries no year.
pub fn leading_year(auction: &str) -> Option<i32> {
    year_re()
        .captures(auction)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Latest leading year across a set of auction names.
pub fn latest_year(auctions: &[String]) -> Option<i32> {
    auctions.iter().filter_map(|a| leading_year(a)).max()
}

/// Sort auction names newest first: by leading year descending, then
/// reverse-lexicographic so "T-4 2024-25" precedes "T-1 2024-25".
pub fn sort_newest_first(auctions: &mut [String]) {
    auctions.sort_by(|a, b| {
        let ya = leading_year(a).unwrap_or(0);
        let yb = leading_year(b).unwrap_or(0);
        yb.cmp(&ya).then_with(|| b.cmp(a))
    });
}

/// Active ⇔ at least one auction year at or past the cutoff.
pub fn is_active(auctions: &[String], cutoff: i32) -> bool {
    auctions
        .iter()
        .filter_map(|a| leading_year(a))
        .any(|y| y >= cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn years(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_leading_year() {
        assert_eq!(leading_year("T-4 2024-25"), Some(2024));
        assert_eq!(leading_year("2016/17 T-4"), Some(2016));
        assert_eq!(leading_year("no year here"), None);
    }

    #[test]
    fn sorts_newest_first() {
        let mut v = years(&["T-4 2019-20", "T-4 2026-27", "T-1 2024-25"]);
        sort_newest_first(&mut v);
        assert_eq!(v, years(&["T-4 2026-27", "T-1 2024-25", "T-4 2019-20"]));
    }

    #[test]
    fn active_iff_any_year_at_cutoff() {
        assert!(is_active(&years(&["T-4 2024-25"]), 2024));
        assert!(is_active(&years(&["T-4 2019-20", "T-1 2025-26"]), 2024));
        assert!(!is_active(&years(&["T-4 2023-24"]), 2024));
        assert!(!is_active(&[], 2024));
    }

    #[test]
    fn latest_year_picks_max() {
        assert_eq!(
            latest_year(&years(&["T-4 2019-20", "T-4 2026-27", "T-1 2024-25"])),
            Some(2026)
        );
        assert_eq!(latest_year(&[]), None);
    }
}
