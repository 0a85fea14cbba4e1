//! Scoring grid session and the save/reconciliation protocol.
//!
//! A cell is bound either to a real score row or, when no row exists yet for
//! that student/column/period, to a placeholder key. Saving placeholders
//! first asks the store to apply the session's template (idempotent), then
//! re-reads the period to translate placeholders into real ids, then issues a
//! single bulk update. After a save the session is stale and has to be
//! reloaded before it accepts more edits.

use crate::calc::{self, Aggregate};
use crate::columns::{derive_columns, Column};
use crate::error::{EngineError, EngineResult};
use crate::matcher::{candidate_templates, match_template};
use crate::store::{
    check_period, ApplyOutcome, ApplyRequest, Roster, ScoreQuery, ScoreStore, ScoreUpdate,
    Student, SCORE_MAX, SCORE_MIN,
};
use crate::template::{StructureKey, Template};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridCellKey {
    Record(i64),
    Placeholder { student_id: i64, column: StructureKey },
}

impl fmt::Display for GridCellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridCellKey::Record(id) => write!(f, "{}", id),
            GridCellKey::Placeholder { student_id, column } => {
                write!(f, "new-{}-{}", student_id, column)
            }
        }
    }
}

impl Serialize for GridCellKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Edit-boundary check. `""` means "no score yet"; anything else must be a
/// plain decimal in `[0, 10]` with at most two decimals.
pub fn parse_score_input(raw: &str) -> EngineResult<Option<f64>> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let invalid = |reason| EngineError::Validation {
        input: raw.to_string(),
        reason,
    };

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let unsigned = int_part.strip_prefix('-').unwrap_or(int_part);
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    let has_digits = !unsigned.is_empty() || frac_part.is_some_and(|f| !f.is_empty());
    if !has_digits || !all_digits(unsigned) || !frac_part.map_or(true, all_digits) {
        return Err(invalid("not a number"));
    }
    if frac_part.is_some_and(|f| f.len() > 2) {
        return Err(invalid("more than 2 decimal places"));
    }

    let v: f64 = s.parse().map_err(|_| invalid("not a number"))?;
    if !(SCORE_MIN..=SCORE_MAX).contains(&v) {
        return Err(invalid("out of range 0..10"));
    }
    Ok(Some(v))
}

fn format_score(v: f64) -> String {
    let s = format!("{:.2}", v);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridContext {
    pub teacher_id: i64,
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
    /// Template picked by the user; only consulted for a period without rows.
    pub template_id: Option<i64>,
}

/// How the session's template was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateStatus {
    /// Existing rows matched a candidate structurally.
    Confirmed,
    /// Rows exist but no candidate matches them: "no template applied".
    Unconfirmed,
    /// Empty period, template chosen explicitly.
    Selected,
    /// Empty period, first active candidate for the class grade level.
    Default,
    /// Empty period and no active candidate template.
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub key: GridCellKey,
    pub input: String,
    pub dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveScope {
    All,
    Student(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub key: GridCellKey,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveTarget {
    pub template_id: Option<i64>,
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub applied: Option<ApplyOutcome>,
    pub updated: usize,
    pub not_found: Vec<i64>,
    /// Placeholders that had no row even after apply.
    pub dropped: Vec<GridCellKey>,
}

impl SaveOutcome {
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("{} saved", self.updated)];
        if !self.not_found.is_empty() {
            parts.push(format!("{} not found", self.not_found.len()));
        }
        if !self.dropped.is_empty() {
            parts.push(format!("{} skipped (no row after apply)", self.dropped.len()));
        }
        parts.join(", ")
    }
}

/// Apply → refetch → translate → bulk update, strictly in that order.
///
/// Nothing is rolled back on failure: a completed apply stays, and a retry
/// skips the rows it already created.
pub fn save_entries<S: ScoreStore + ?Sized>(
    store: &S,
    target: &SaveTarget,
    entries: Vec<PendingEntry>,
) -> EngineResult<SaveOutcome> {
    let (real, placeholders): (Vec<PendingEntry>, Vec<PendingEntry>) = entries
        .into_iter()
        .partition(|e| matches!(e.key, GridCellKey::Record(_)));

    let mut updates: Vec<ScoreUpdate> = real
        .iter()
        .filter_map(|e| match e.key {
            GridCellKey::Record(id) => Some(ScoreUpdate { id, score: e.score }),
            GridCellKey::Placeholder { .. } => None,
        })
        .collect();
    let mut outcome = SaveOutcome::default();

    if !placeholders.is_empty() {
        let Some(template_id) = target.template_id else {
            return Err(EngineError::NoTemplate {
                class_id: target.class_id,
                month: target.month,
                year: target.year,
            });
        };

        outcome.applied = Some(store.apply_template(&ApplyRequest {
            template_id,
            class_id: target.class_id,
            month: target.month,
            year: target.year,
        })?);

        let ids: HashMap<(i64, StructureKey), i64> = store
            .get_scores(&ScoreQuery::period(target.class_id, target.month, target.year))?
            .into_iter()
            .map(|r| ((r.student_id, r.structure_key()), r.id))
            .collect();

        for entry in placeholders {
            let GridCellKey::Placeholder { student_id, column } = entry.key else {
                continue;
            };
            match ids.get(&(student_id, column)) {
                Some(&id) => updates.push(ScoreUpdate {
                    id,
                    score: entry.score,
                }),
                None => {
                    warn!(key = %entry.key, template_id, "placeholder unresolved after apply, dropped");
                    outcome.dropped.push(entry.key);
                }
            }
        }
    }

    if !updates.is_empty() {
        let bulk = store.bulk_update_scores(&updates)?;
        outcome.updated = bulk.updated;
        outcome.not_found = bulk.not_found;
    }

    info!(
        class_id = target.class_id,
        month = target.month,
        year = target.year,
        summary = %outcome.summary(),
        "grid saved"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellView {
    pub key: GridCellKey,
    pub input: String,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowView {
    pub student_id: i64,
    pub student_name: String,
    pub cells: Vec<CellView>,
    pub aggregate: Aggregate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridView {
    pub session_id: String,
    pub class_id: i64,
    pub month: u32,
    pub year: i32,
    pub template_status: TemplateStatus,
    pub template_id: Option<i64>,
    pub template_name: Option<String>,
    pub columns: Vec<Column>,
    pub rows: Vec<RowView>,
    pub column_averages: Vec<Aggregate>,
    pub stale: bool,
}

#[derive(Debug)]
pub struct GridSession {
    pub id: Uuid,
    ctx: GridContext,
    template: Option<Template>,
    status: TemplateStatus,
    columns: Vec<Column>,
    students: Vec<Student>,
    cells: HashMap<(i64, StructureKey), GridCell>,
    stale: bool,
}

impl GridSession {
    pub fn open<B>(backend: &B, ctx: GridContext) -> EngineResult<Self>
    where
        B: ScoreStore + Roster + ?Sized,
    {
        check_period(ctx.month, ctx.year)?;
        let class = backend.class_info(ctx.class_id)?;
        let students = backend.class_students(ctx.class_id)?;
        let records = backend.get_scores(&ScoreQuery::period(ctx.class_id, ctx.month, ctx.year))?;
        let candidates = candidate_templates(backend, ctx.teacher_id, class.grade_level)?;

        let (template, status) = if !records.is_empty() {
            match match_template(&records, &candidates) {
                Some(t) => (Some(t.clone()), TemplateStatus::Confirmed),
                None => (None, TemplateStatus::Unconfirmed),
            }
        } else if let Some(template_id) = ctx.template_id {
            (Some(backend.get_template(template_id)?), TemplateStatus::Selected)
        } else {
            match candidates.into_iter().find(|t| t.is_active) {
                Some(t) => (Some(t), TemplateStatus::Default),
                None => (None, TemplateStatus::Missing),
            }
        };
        if status == TemplateStatus::Unconfirmed {
            warn!(
                class_id = ctx.class_id,
                month = ctx.month,
                year = ctx.year,
                "existing scores match no template"
            );
        }

        let columns = derive_columns(template.as_ref(), &records);
        let existing: HashMap<(i64, StructureKey), (i64, Option<f64>)> = records
            .iter()
            .map(|r| ((r.student_id, r.structure_key()), (r.id, r.score)))
            .collect();

        let mut cells = HashMap::with_capacity(students.len() * columns.len());
        for student in &students {
            for column in &columns {
                let k = (student.id, column.key());
                let cell = match existing.get(&k) {
                    Some(&(id, score)) => GridCell {
                        key: GridCellKey::Record(id),
                        input: score.map(format_score).unwrap_or_default(),
                        dirty: false,
                    },
                    None => GridCell {
                        key: GridCellKey::Placeholder {
                            student_id: student.id,
                            column: column.key(),
                        },
                        input: String::new(),
                        dirty: false,
                    },
                };
                cells.insert(k, cell);
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            ctx,
            template,
            status,
            columns,
            students,
            cells,
            stale: false,
        })
    }

    pub fn reload<B>(&mut self, backend: &B) -> EngineResult<()>
    where
        B: ScoreStore + Roster + ?Sized,
    {
        *self = Self::open(backend, self.ctx)?;
        Ok(())
    }

    pub fn context(&self) -> &GridContext {
        &self.ctx
    }

    pub fn status(&self) -> TemplateStatus {
        self.status
    }

    pub fn template(&self) -> Option<&Template> {
        self.template.as_ref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn cell(&self, student_id: i64, column: StructureKey) -> Option<&GridCell> {
        self.cells.get(&(student_id, column))
    }

    /// Rejected input leaves the cell untouched.
    pub fn set_input(&mut self, student_id: i64, column: StructureKey, raw: &str) -> EngineResult<()> {
        if self.stale {
            return Err(EngineError::StaleGrid);
        }
        parse_score_input(raw)?;
        let cell = self
            .cells
            .get_mut(&(student_id, column))
            .ok_or_else(|| EngineError::not_found("grid cell", format!("{}/{}", student_id, column)))?;
        cell.input = raw.trim().to_string();
        cell.dirty = true;
        Ok(())
    }

    fn pending(&self, scope: SaveScope) -> EngineResult<Vec<PendingEntry>> {
        let mut entries = Vec::new();
        for student in &self.students {
            if let SaveScope::Student(id) = scope {
                if student.id != id {
                    continue;
                }
            }
            for column in &self.columns {
                let Some(cell) = self.cells.get(&(student.id, column.key())) else {
                    continue;
                };
                if !cell.dirty {
                    continue;
                }
                entries.push(PendingEntry {
                    key: cell.key,
                    score: parse_score_input(&cell.input)?,
                });
            }
        }
        Ok(entries)
    }

    /// Saves edited cells in `scope`. On error the local inputs are kept so
    /// the save can be retried; on success the session turns stale.
    pub fn save<S: ScoreStore + ?Sized>(&mut self, store: &S, scope: SaveScope) -> EngineResult<SaveOutcome> {
        if self.stale {
            return Err(EngineError::StaleGrid);
        }
        if let SaveScope::Student(id) = scope {
            if !self.students.iter().any(|s| s.id == id) {
                return Err(EngineError::not_found("student", id));
            }
        }
        let entries = self.pending(scope)?;
        if entries.is_empty() {
            return Ok(SaveOutcome::default());
        }

        let target = SaveTarget {
            template_id: match self.status {
                TemplateStatus::Unconfirmed | TemplateStatus::Missing => None,
                _ => self.template.as_ref().map(|t| t.id),
            },
            class_id: self.ctx.class_id,
            month: self.ctx.month,
            year: self.ctx.year,
        };
        let outcome = save_entries(store, &target, entries)?;
        self.stale = true;
        Ok(outcome)
    }

    pub fn view(&self) -> GridView {
        let rows: Vec<RowView> = self
            .students
            .iter()
            .map(|student| {
                let cells: Vec<CellView> = self
                    .columns
                    .iter()
                    .filter_map(|c| self.cells.get(&(student.id, c.key())))
                    .map(|cell| CellView {
                        key: cell.key,
                        input: cell.input.clone(),
                        dirty: cell.dirty,
                    })
                    .collect();
                let aggregate =
                    calc::aggregate(cells.iter().map(|c| parse_score_input(&c.input).ok().flatten()))
                        .rounded();
                RowView {
                    student_id: student.id,
                    student_name: student.name.clone(),
                    cells,
                    aggregate,
                }
            })
            .collect();

        let column_averages = self
            .columns
            .iter()
            .map(|c| {
                calc::aggregate(self.students.iter().map(|s| {
                    self.cells
                        .get(&(s.id, c.key()))
                        .and_then(|cell| parse_score_input(&cell.input).ok().flatten())
                }))
                .rounded()
            })
            .collect();

        GridView {
            session_id: self.id.to_string(),
            class_id: self.ctx.class_id,
            month: self.ctx.month,
            year: self.ctx.year,
            template_status: self.status,
            template_id: self.template.as_ref().map(|t| t.id),
            template_name: self.template.as_ref().map(|t| t.name.clone()),
            columns: self.columns.clone(),
            rows,
            column_averages,
            stale: self.stale,
        }
    }
}
