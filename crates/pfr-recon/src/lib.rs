//! Reconciliation driver: scans profile records, classifies their
//! semi-structured fields, optionally writes back recovered values, and
//! aggregates a run report.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pfr_core::{FieldOutcome, ProfessionKind, ProfileRecord, RawField};
use pfr_parse::{parse_list, parse_object_list};
use pfr_storage::{ProfileStore, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pfr-recon";

/// Key used when wrapping a recovered flat string into a minimal
/// structured entry.
const DIPLOMA_WRAP_KEY: &str = "nom";
const EXPERIENCE_WRAP_KEY: &str = "description";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Table,
    Json,
    Log,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportFormat::Table => "table",
            ReportFormat::Json => "json",
            ReportFormat::Log => "log",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown report format `{0}`, expected table|json|log")]
pub struct UnknownReportFormat(String);

impl FromStr for ReportFormat {
    type Err = UnknownReportFormat;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(ReportFormat::Table),
            "json" => Ok(ReportFormat::Json),
            "log" => Ok(ReportFormat::Log),
            other => Err(UnknownReportFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub kinds: Vec<ProfessionKind>,
    /// Records fetched per kind; 0 means unbounded.
    pub limit: u32,
    pub apply_fixes: bool,
    pub format: ReportFormat,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            kinds: ProfessionKind::ALL.to_vec(),
            limit: 0,
            apply_fixes: false,
            format: ReportFormat::Table,
        }
    }
}

/// Outcome detail for one scanned record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub kind: ProfessionKind,
    pub table: &'static str,
    pub profile_id: i64,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub diplomas: FieldOutcome,
    pub experiences: FieldOutcome,
}

impl RecordOutcome {
    pub fn is_flagged(&self) -> bool {
        self.diplomas.is_flagged() || self.experiences.is_flagged()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fix_mode: bool,
    pub total_records: u64,
    /// Records where at least one raw field held something to check.
    pub checked_records: u64,
    pub failed_diplomas: u64,
    pub failed_experiences: u64,
    pub fixed_diplomas: u64,
    pub fixed_experiences: u64,
    pub records: Vec<RecordOutcome>,
}

impl Report {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, fix_mode: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            fix_mode,
            total_records: 0,
            checked_records: 0,
            failed_diplomas: 0,
            failed_experiences: 0,
            fixed_diplomas: 0,
            fixed_experiences: 0,
            records: Vec::new(),
        }
    }

    fn absorb(&mut self, outcome: RecordOutcome, raw_checked: bool) {
        self.total_records += 1;
        if raw_checked {
            self.checked_records += 1;
        }
        match outcome.diplomas {
            FieldOutcome::Failed => self.failed_diplomas += 1,
            FieldOutcome::Fixed => self.fixed_diplomas += 1,
            _ => {}
        }
        match outcome.experiences {
            FieldOutcome::Failed => self.failed_experiences += 1,
            FieldOutcome::Fixed => self.fixed_experiences += 1,
            _ => {}
        }
        self.records.push(outcome);
    }

    pub fn flagged(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.records.iter().filter(|r| r.is_flagged())
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    store: Arc<dyn ProfileStore>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, store: Arc<dyn ProfileStore>) -> Self {
        Self { config, store }
    }

    pub fn format(&self) -> ReportFormat {
        self.config.format
    }

    /// One full sequential pass over the configured kinds. Parse
    /// failures are findings, not errors; only a connectivity failure
    /// propagates.
    pub async fn run(&self) -> Result<Report, StoreError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut report = Report::new(run_id, started_at, self.config.apply_fixes);

        for kind in &self.config.kinds {
            let records = match self.store.fetch_profiles(*kind, self.config.limit).await {
                Ok(records) => records,
                Err(StoreError::SchemaMissing { table }) => {
                    warn!(table, kind = kind.slug(), "table missing, kind skipped");
                    continue;
                }
                Err(err @ StoreError::Connect(_)) => return Err(err),
                Err(err) => {
                    warn!(kind = kind.slug(), error = %err, "fetch failed, kind skipped");
                    continue;
                }
            };
            info!(kind = kind.slug(), records = records.len(), "scanning kind");

            for record in records {
                let raw_checked =
                    !record.diplomas.is_empty() || !record.experiences.is_empty();
                let outcome = self.reconcile_record(*kind, record).await;
                report.absorb(outcome, raw_checked);
            }
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            total = report.total_records,
            failed_diplomas = report.failed_diplomas,
            failed_experiences = report.failed_experiences,
            fixed_diplomas = report.fixed_diplomas,
            fixed_experiences = report.fixed_experiences,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    async fn reconcile_record(&self, kind: ProfessionKind, record: ProfileRecord) -> RecordOutcome {
        let schema = kind.schema();

        let diplomas = self
            .reconcile_field(
                kind,
                record.id,
                record.diploma_column,
                &record.diplomas,
                DIPLOMA_WRAP_KEY,
            )
            .await;
        let experiences = self
            .reconcile_field(
                kind,
                record.id,
                schema.experience_column,
                &record.experiences,
                EXPERIENCE_WRAP_KEY,
            )
            .await;

        RecordOutcome {
            kind,
            table: schema.table,
            profile_id: record.id,
            user_id: record.user_id,
            user_name: record.user_name,
            user_email: record.user_email,
            diplomas,
            experiences,
        }
    }

    async fn reconcile_field(
        &self,
        kind: ProfessionKind,
        profile_id: i64,
        column: &str,
        raw: &RawField,
        wrap_key: &str,
    ) -> FieldOutcome {
        let parsed = parse_object_list(raw);
        let outcome = FieldOutcome::classify(raw, !parsed.is_empty());
        if outcome != FieldOutcome::Failed || !self.config.apply_fixes {
            return outcome;
        }

        // Recovery path: the object parse got nothing, but the flat list
        // parse may still salvage usable strings.
        let recovered = parse_list(raw);
        if recovered.is_empty() {
            return FieldOutcome::Failed;
        }
        let entries: Vec<JsonValue> = recovered
            .into_iter()
            .map(|entry| serde_json::json!({ wrap_key: entry }))
            .collect();
        let payload = JsonValue::Array(entries).to_string();

        match self
            .store
            .update_field(kind, profile_id, column, &payload)
            .await
        {
            Ok(()) => FieldOutcome::Fixed,
            Err(err) => {
                warn!(
                    kind = kind.slug(),
                    profile_id,
                    column,
                    error = %err,
                    "fix write-back failed, record left as failed"
                );
                FieldOutcome::Failed
            }
        }
    }
}

/// Human-readable summary table plus one row per flagged record.
pub fn render_table(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("run {}\n", report.run_id));
    out.push_str(&format!(
        "scanned {} records ({} with data), fix mode {}\n",
        report.total_records,
        report.checked_records,
        if report.fix_mode { "on" } else { "off" }
    ));
    out.push_str(&format!(
        "{:<14} {:>8} {:>8}\n",
        "field", "failed", "fixed"
    ));
    out.push_str(&format!(
        "{:<14} {:>8} {:>8}\n",
        "diplomas", report.failed_diplomas, report.fixed_diplomas
    ));
    out.push_str(&format!(
        "{:<14} {:>8} {:>8}\n",
        "experiences", report.failed_experiences, report.fixed_experiences
    ));

    let flagged: Vec<_> = report.flagged().collect();
    if !flagged.is_empty() {
        out.push_str(&format!(
            "\n{:<14} {:<16} {:>10} {:<28} {:<12} {:<12}\n",
            "kind", "table", "id", "user", "diplomas", "experiences"
        ));
        for record in flagged {
            let user = record
                .user_email
                .as_deref()
                .or(record.user_name.as_deref())
                .unwrap_or("-");
            out.push_str(&format!(
                "{:<14} {:<16} {:>10} {:<28} {:<12} {:<12}\n",
                record.kind.slug(),
                record.table,
                record.profile_id,
                user,
                format!("{:?}", record.diplomas).to_lowercase(),
                format!("{:?}", record.experiences).to_lowercase(),
            ));
        }
    }
    out
}

pub fn render_json(report: &Report) -> anyhow::Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Forwards the report to the logging sink: one event per flagged
/// record plus a summary event.
pub fn emit_log(report: &Report) {
    for record in report.flagged() {
        info!(
            kind = record.kind.slug(),
            table = record.table,
            profile_id = record.profile_id,
            user_id = record.user_id,
            user_email = record.user_email.as_deref().unwrap_or("-"),
            diplomas = ?record.diplomas,
            experiences = ?record.experiences,
            "flagged profile record"
        );
    }
    info!(
        run_id = %report.run_id,
        total = report.total_records,
        checked = report.checked_records,
        failed_diplomas = report.failed_diplomas,
        failed_experiences = report.failed_experiences,
        fixed_diplomas = report.fixed_diplomas,
        fixed_experiences = report.fixed_experiences,
        "reconciliation report"
    );
}
