use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

/// Post-merge quality scores for a promoted unit. Absence never blocks
/// progress; an unparseable review is stored raw with `parsed = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub unit_id: String,
    pub mission_id: String,
    pub alignment: u8,
    pub approach: u8,
    pub tests: u8,
    pub notes: String,
    pub parsed: bool,
    /// Raw reviewer stdout, kept when parsing failed so marker drift is
    /// diagnosable after the fact.
    #[serde(default)]
    pub raw_output: String,
    pub created_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn parsed(
        unit_id: impl Into<String>,
        mission_id: impl Into<String>,
        alignment: u8,
        approach: u8,
        tests: u8,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            unit_id: unit_id.into(),
            mission_id: mission_id.into(),
            alignment,
            approach,
            tests,
            notes: notes.into(),
            parsed: true,
            raw_output: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn unparsed(
        unit_id: impl Into<String>,
        mission_id: impl Into<String>,
        raw_output: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            unit_id: unit_id.into(),
            mission_id: mission_id.into(),
            alignment: 0,
            approach: 0,
            tests: 0,
            notes: String::new(),
            parsed: false,
            raw_output: raw_output.into(),
            created_at: Utc::now(),
        }
    }

    pub fn average(&self) -> f64 {
        (self.alignment as f64 + self.approach as f64 + self.tests as f64) / 3.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_over_three_dimensions() {
        let review = ReviewRecord::parsed("u1", "m1", 7, 8, 6, "solid");
        assert!((review.average() - 7.0).abs() < f64::EPSILON);
        assert!(review.parsed);
    }

    #[test]
    fn unparsed_keeps_raw_output() {
        let review = ReviewRecord::unparsed("u1", "m1", "garbled stdout");
        assert!(!review.parsed);
        assert_eq!(review.raw_output, "garbled stdout");
    }
}
