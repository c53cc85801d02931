//! Fetched attendance data and its projection into named fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::ids::EntityId;

/// One row of the portal's subject table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRow {
    /// Raw subject label as shown by the portal, e.g. `"CN : Computer Networks"`.
    pub subject_name: String,
    pub held: String,
    pub attended: String,
    pub percent: String,
}

impl SubjectRow {
    pub fn new(
        subject_name: impl Into<String>,
        held: impl Into<String>,
        attended: impl Into<String>,
        percent: impl Into<String>,
    ) -> Self {
        Self {
            subject_name: subject_name.into(),
            held: held.into(),
            attended: attended.into(),
            percent: percent.into(),
        }
    }
}

/// What a [`PortalSession`](crate::traits::PortalSession) returns for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub overall_percent: String,
    pub rows: Vec<SubjectRow>,
}

/// Result of fetching one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Failed { kind: FailureKind, reason: String },
}

/// Terminal outcome of one fetch task.
///
/// Failed outcomes always carry an empty field map.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub entity: EntityId,
    pub status: FetchStatus,
    pub fields: BTreeMap<String, String>,
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn success(entity: EntityId, fields: BTreeMap<String, String>, attempts: u32) -> Self {
        Self {
            entity,
            status: FetchStatus::Success,
            fields,
            attempts,
        }
    }

    pub fn failed(
        entity: EntityId,
        kind: FailureKind,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            entity,
            status: FetchStatus::Failed {
                kind,
                reason: reason.into(),
            },
            fields: BTreeMap::new(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FetchStatus::Success)
    }
}

/// Suffix of the attended-count field for a subject.
pub const ATTENDED_SUFFIX: &str = ".attended";
/// Suffix of the held-count field for a subject.
pub const HELD_SUFFIX: &str = ".held";

/// Rules for turning an [`AttendanceRecord`] into a flat field map.
///
/// Given a subject `CN`, the projection produces:
/// - `CN` with the percentage, e.g. `"87.5 %"`
/// - `CN.attended` and `CN.held` with the raw counts
///
/// and the overall percentage under [`overall_field`](Self::overall_field).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordProjection {
    pub overall_field: String,
    pub percent_suffix: String,
    /// Normalized subject label -> canonical subject name.
    pub aliases: BTreeMap<String, String>,
}

impl Default for RecordProjection {
    fn default() -> Self {
        let aliases = [
            ("CN", "CN"),
            ("DEVOPS", "DEVOPS"),
            ("PPL", "PPL"),
            ("NLP", "NLP"),
            ("DAA", "DAA"),
            ("CN LAB", "CN LAB"),
            ("DEVOPS LAB", "DEVOPS LAB"),
            ("ACS LAB", "ACS LAB"),
            ("IPR", "IPR"),
            ("SPORTS", "SPORTS"),
            ("MEN", "MENTORING"),
            ("ASSOC", "ASSOCIATION"),
            ("ASSOCIATION", "ASSOCIATION"),
            ("LIB", "LIBRARY"),
            ("LIBRARY", "LIBRARY"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            overall_field: "Overall %".to_string(),
            percent_suffix: " %".to_string(),
            aliases,
        }
    }
}

impl RecordProjection {
    /// Maps a raw portal label to its canonical subject, if known.
    ///
    /// `"men : Mentoring"` -> `Some("MENTORING")`
    pub fn canonical_subject(&self, raw: &str) -> Option<&str> {
        let label = raw.split(':').next().unwrap_or(raw).trim().to_uppercase();
        self.aliases.get(&label).map(String::as_str)
    }

    pub fn project(&self, record: &AttendanceRecord) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();

        let overall = record.overall_percent.trim();
        if !overall.is_empty() {
            fields.insert(self.overall_field.clone(), overall.to_string());
        }

        for row in &record.rows {
            let Some(subject) = self.canonical_subject(&row.subject_name) else {
                continue;
            };

            let percent = row.percent.trim();
            if !percent.is_empty() && percent != "&nbsp;" {
                fields.insert(
                    subject.to_string(),
                    format!("{}{}", percent, self.percent_suffix),
                );
            }
            if let Some(attended) = numeric(&row.attended) {
                fields.insert(format!("{}{}", subject, ATTENDED_SUFFIX), attended);
            }
            if let Some(held) = numeric(&row.held) {
                fields.insert(format!("{}{}", subject, HELD_SUFFIX), held);
            }
        }

        fields
    }
}

fn numeric(raw: &str) -> Option<String> {
    let s = raw.trim();
    (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())).then(|| s.to_string())
}
