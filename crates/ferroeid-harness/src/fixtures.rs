//! Fixture loading and management.
//!
//! A fixture set is a JSON file of named APDU script cases, each in the
//! [`crate::script`] line grammar. Sets capture known-good command traces
//! so regressions show up as a failing case name rather than a raw byte
//! diff.

use serde::{Deserialize, Serialize};

/// A single scripted test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCase {
    /// Case identifier.
    pub name: String,
    /// Transport to run under: "T0" or "T1".
    pub protocol: String,
    /// Script lines (hex APDUs with optional `=>` expectations).
    pub script: Vec<String>,
}

/// A collection of cases for one functional area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSet {
    /// Schema version.
    pub version: String,
    /// Functional area ("pin", "filesystem", "pso", ...).
    pub family: String,
    /// Individual cases.
    pub cases: Vec<FixtureCase>,
}

impl FixtureSet {
    /// Parses a fixture set from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the set to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Loads a fixture set from a file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let set = FixtureSet {
            version: "1".into(),
            family: "pin".into(),
            cases: vec![FixtureCase {
                name: "verify-ok".into(),
                protocol: "T1".into(),
                script: vec!["00 20 00 01 08 31313131FFFFFFFF => 9000".into()],
            }],
        };
        let json = set.to_json().unwrap();
        let back = FixtureSet::from_json(&json).unwrap();
        assert_eq!(back.cases.len(), 1);
        assert_eq!(back.cases[0].name, "verify-ok");
    }
}
