//! Typed access into the untyped registry/additional-data bags that ride
//! along with components and CMU registry rows.

use serde_json::Value;

/// Placeholder strings the upstream CSVs use for "no value".
const ABSENT_MARKERS: &[&str] = &["None", "N/A", "-", ""];

/// A read-only view over an untyped key/value record.
#[derive(Debug, Clone, Copy)]
pub struct RegistryData<'a> {
    data: &'a Value,
}

impl<'a> RegistryData<'a> {
    pub fn new(data: &'a Value) -> Self {
        Self { data }
    }

    /// String field; placeholder markers coerce to absent.
    pub fn string(&self, key: &str) -> Option<&'a str> {
        let s = self.data.get(key)?.as_str()?;
        let trimmed = s.trim();
        if ABSENT_MARKERS.contains(&trimmed) {
            None
        } else {
            Some(s)
        }
    }

    /// Numeric field; accepts JSON numbers and numeric strings, since the
    /// registry mixes both.
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let trimmed = s.trim();
                if ABSENT_MARKERS.contains(&trimmed) {
                    None
                } else {
                    trimmed.replace(',', "").parse().ok()
                }
            }
            _ => None,
        }
    }

    pub fn applicant(&self) -> Option<&'a str> {
        self.string("Name of Applicant")
    }

    pub fn cmu_name(&self) -> Option<&'a str> {
        self.string("CMU Name")
    }

    pub fn parent_company(&self) -> Option<&'a str> {
        self.string("Parent Company")
    }

    pub fn derated_capacity(&self) -> Option<f64> {
        self.float("De-rated Capacity (MW)")
    }

    pub fn connection_capacity(&self) -> Option<f64> {
        self.float("Connection / DSR Capacity (MW)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_strings_coerce_to_absent() {
        let data = json!({
            "Name of Applicant": "None",
            "Parent Company": "N/A",
            "CMU Name": "-",
            "Secondary Trading": "",
            "De-rated Capacity (MW)": "12.5",
        });
        let reg = RegistryData::new(&data);
        assert_eq!(reg.applicant(), None);
        assert_eq!(reg.parent_company(), None);
        assert_eq!(reg.cmu_name(), None);
        assert_eq!(reg.string("Secondary Trading"), None);
        assert_eq!(reg.derated_capacity(), Some(12.5));
    }

    #[test]
    fn reads_real_values() {
        let data = json!({
            "Name of Applicant": "Flexitricity Limited",
            "De-rated Capacity (MW)": 48.0,
            "Connection / DSR Capacity (MW)": "1,250.00",
        });
        let reg = RegistryData::new(&data);
        assert_eq!(reg.applicant(), Some("Flexitricity Limited"));
        assert_eq!(reg.derated_capacity(), Some(48.0));
        assert_eq!(reg.connection_capacity(), Some(1250.0));
    }

    #[test]
    fn missing_keys_are_absent() {
        let data = json!({});
        let reg = RegistryData::new(&data);
        assert_eq!(reg.applicant(), None);
        assert_eq!(reg.derated_capacity(), None);
    }
}
