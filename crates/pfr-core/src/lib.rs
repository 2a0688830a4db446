//! Core domain model for the Vi-Santé profile field reconciler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "pfr-core";

/// The fixed set of professional categories whose profile tables carry
/// semi-structured diploma and experience columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfessionKind {
    Medecin,
    Kine,
    Orthophoniste,
    Psychologue,
}

impl ProfessionKind {
    pub const ALL: [ProfessionKind; 4] = [
        ProfessionKind::Medecin,
        ProfessionKind::Kine,
        ProfessionKind::Orthophoniste,
        ProfessionKind::Psychologue,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            ProfessionKind::Medecin => "medecin",
            ProfessionKind::Kine => "kine",
            ProfessionKind::Orthophoniste => "orthophoniste",
            ProfessionKind::Psychologue => "psychologue",
        }
    }

    /// Column layout for this kind, resolved once at driver setup rather
    /// than probed per record.
    pub fn schema(self) -> TableSchema {
        let table = match self {
            ProfessionKind::Medecin => "medecins",
            ProfessionKind::Kine => "kines",
            ProfessionKind::Orthophoniste => "orthophonistes",
            ProfessionKind::Psychologue => "psychologues",
        };
        TableSchema {
            table,
            diploma_column: "diplomes",
            legacy_diploma_column: Some("diplome"),
            experience_column: "experiences",
        }
    }
}

impl fmt::Display for ProfessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown profession kind `{0}`, expected one of medecin|kine|orthophoniste|psychologue")]
pub struct UnknownProfessionKind(String);

impl FromStr for ProfessionKind {
    type Err = UnknownProfessionKind;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "medecin" => Ok(ProfessionKind::Medecin),
            "kine" => Ok(ProfessionKind::Kine),
            "orthophoniste" => Ok(ProfessionKind::Orthophoniste),
            "psychologue" => Ok(ProfessionKind::Psychologue),
            other => Err(UnknownProfessionKind(other.to_string())),
        }
    }
}

/// Per-kind storage descriptor for the semi-structured columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub table: &'static str,
    pub diploma_column: &'static str,
    /// Older rows kept their diplomas under a singular column name.
    pub legacy_diploma_column: Option<&'static str>,
    pub experience_column: &'static str,
}

impl TableSchema {
    pub fn has_column(&self, column: &str) -> bool {
        column == self.diploma_column
            || column == self.experience_column
            || self.legacy_diploma_column == Some(column)
    }
}

/// A semi-structured column value exactly as stored: absent, an already
/// decoded list, or free text that may or may not be JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum RawField {
    Absent,
    List(Vec<JsonValue>),
    Text(String),
}

impl RawField {
    pub fn from_text(value: Option<String>) -> Self {
        match value {
            Some(text) => RawField::Text(text),
            None => RawField::Absent,
        }
    }

    /// True when there is nothing to check: null, blank text, or an
    /// empty list.
    pub fn is_empty(&self) -> bool {
        match self {
            RawField::Absent => true,
            RawField::List(values) => values.is_empty(),
            RawField::Text(text) => text.trim().is_empty(),
        }
    }
}

/// Terminal classification of one semi-structured field after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOutcome {
    Ok,
    Empty,
    Failed,
    Fixed,
}

impl FieldOutcome {
    /// `Failed` only when the raw value held something and parsing
    /// produced nothing; a legitimately empty field is never flagged.
    pub fn classify(raw: &RawField, parsed_non_empty: bool) -> Self {
        if raw.is_empty() {
            FieldOutcome::Empty
        } else if parsed_non_empty {
            FieldOutcome::Ok
        } else {
            FieldOutcome::Failed
        }
    }

    pub fn is_flagged(self) -> bool {
        matches!(self, FieldOutcome::Failed | FieldOutcome::Fixed)
    }
}

/// One professional-profile row as read from storage, with enough user
/// identity to make report entries actionable.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub diplomas: RawField,
    /// Which of the two diploma columns the value was read from; fixes
    /// are written back to this exact column.
    pub diploma_column: &'static str,
    pub experiences: RawField,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_slug() {
        for kind in ProfessionKind::ALL {
            assert_eq!(kind.slug().parse::<ProfessionKind>().unwrap(), kind);
        }
        assert!("dentiste".parse::<ProfessionKind>().is_err());
    }

    #[test]
    fn schema_knows_its_columns() {
        let schema = ProfessionKind::Medecin.schema();
        assert_eq!(schema.table, "medecins");
        assert!(schema.has_column("diplomes"));
        assert!(schema.has_column("diplome"));
        assert!(schema.has_column("experiences"));
        assert!(!schema.has_column("id"));
    }

    #[test]
    fn blank_text_counts_as_empty() {
        assert!(RawField::Absent.is_empty());
        assert!(RawField::Text("   \t".to_string()).is_empty());
        assert!(RawField::List(Vec::new()).is_empty());
        assert!(!RawField::Text("x".to_string()).is_empty());
    }

    #[test]
    fn empty_raw_is_never_flagged_as_failed() {
        for raw in [RawField::Absent, RawField::Text(String::new()), RawField::List(Vec::new())] {
            assert_eq!(FieldOutcome::classify(&raw, false), FieldOutcome::Empty);
        }
    }

    #[test]
    fn non_empty_raw_with_empty_parse_fails() {
        let raw = RawField::Text("garbage".to_string());
        assert_eq!(FieldOutcome::classify(&raw, false), FieldOutcome::Failed);
        assert_eq!(FieldOutcome::classify(&raw, true), FieldOutcome::Ok);
    }
}
