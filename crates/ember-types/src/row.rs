//! Interned effect rows.
//!
//! An effect row is the set of not-yet-handled operation labels an expression
//! may perform, plus an optional open tail variable. Rows are interned in an
//! [`EffectRowTable`]: structurally equal rows always map to the same
//! [`EffectRowId`], so row equality is id equality.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Label, RowVarId};

/// Stable handle to an interned effect row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectRowId(pub u32);

impl EffectRowId {
    /// The empty, closed row. Always interned at index 0.
    pub const PURE: EffectRowId = EffectRowId(0);

    pub fn is_pure(self) -> bool {
        self == Self::PURE
    }
}

/// Canonical row contents. Labels are kept sorted so derived equality and
/// hashing are structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectRow {
    pub ops: BTreeSet<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<RowVarId>,
}

impl EffectRow {
    pub fn closed(ops: impl IntoIterator<Item = Label>) -> Self {
        Self {
            ops: ops.into_iter().collect(),
            tail: None,
        }
    }

    pub fn open(ops: impl IntoIterator<Item = Label>, tail: RowVarId) -> Self {
        Self {
            ops: ops.into_iter().collect(),
            tail: Some(tail),
        }
    }

    pub fn is_pure(&self) -> bool {
        self.ops.is_empty() && self.tail.is_none()
    }

    pub fn is_open(&self) -> bool {
        self.tail.is_some()
    }

    pub fn contains(&self, op: &str) -> bool {
        self.ops.iter().any(|label| label.as_str() == op)
    }
}

impl fmt::Display for EffectRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, label) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}")?;
        }
        if let Some(tail) = self.tail {
            if self.ops.is_empty() {
                write!(f, "| e{}", tail.0)?;
            } else {
                write!(f, " | e{}", tail.0)?;
            }
        }
        write!(f, "]")
    }
}

/// Error produced when rebuilding a table from serialized rows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowTableError {
    #[error("row table must start with the pure row, found {0}")]
    NonPureFirstRow(String),
}

/// Interning table for effect rows.
///
/// Ids are dense indices into the table. The table only grows; ids handed out
/// stay valid for the lifetime of the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<EffectRow>", into = "Vec<EffectRow>")]
pub struct EffectRowTable {
    rows: Vec<EffectRow>,
    index: HashMap<EffectRow, EffectRowId>,
}

impl PartialEq for EffectRowTable {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
    }
}

impl Eq for EffectRowTable {}

impl Default for EffectRowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectRowTable {
    pub fn new() -> Self {
        let pure = EffectRow::default();
        let mut index = HashMap::new();
        index.insert(pure.clone(), EffectRowId::PURE);
        Self {
            rows: vec![pure],
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Intern a row built from operation labels and an optional tail.
    pub fn intern_row(
        &mut self,
        ops: impl IntoIterator<Item = Label>,
        tail: Option<RowVarId>,
    ) -> EffectRowId {
        self.intern(EffectRow {
            ops: ops.into_iter().collect(),
            tail,
        })
    }

    /// Convenience for closed rows named by string.
    pub fn intern_ops<S: AsRef<str>>(&mut self, ops: &[S]) -> EffectRowId {
        self.intern_row(ops.iter().map(|op| Label::new(op.as_ref())), None)
    }

    pub fn intern(&mut self, row: EffectRow) -> EffectRowId {
        if let Some(id) = self.index.get(&row) {
            return *id;
        }
        let id = EffectRowId(self.rows.len() as u32);
        self.rows.push(row.clone());
        self.index.insert(row, id);
        id
    }

    /// Look up an interned row. Ids from a different table resolve to the
    /// pure row rather than panicking.
    pub fn get(&self, id: EffectRowId) -> &EffectRow {
        self.rows.get(id.0 as usize).unwrap_or(&self.rows[0])
    }

    pub fn contains(&self, id: EffectRowId, op: &str) -> bool {
        self.get(id).contains(op)
    }

    pub fn is_open(&self, id: EffectRowId) -> bool {
        self.get(id).is_open()
    }

    pub fn ops(&self, id: EffectRowId) -> impl Iterator<Item = &Label> {
        self.get(id).ops.iter()
    }

    /// Union of every row. An open tail anywhere keeps the result open; when
    /// several rows are open the smallest tail variable is kept.
    pub fn compose_effect_rows(&mut self, rows: &[EffectRowId]) -> EffectRowId {
        match rows {
            [] => EffectRowId::PURE,
            [single] => *single,
            _ => {
                let mut composed = EffectRow::default();
                for id in rows {
                    let row = self.get(*id);
                    composed.ops.extend(row.ops.iter().cloned());
                    composed.tail = match (composed.tail, row.tail) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                self.intern(composed)
            }
        }
    }

    pub fn compose2(&mut self, left: EffectRowId, right: EffectRowId) -> EffectRowId {
        if left == right || right.is_pure() {
            return left;
        }
        if left.is_pure() {
            return right;
        }
        self.compose_effect_rows(&[left, right])
    }

    /// Remove `op` from `row`, returning the interned result. Removing a label
    /// that is not present returns `row` unchanged.
    pub fn drop_handled_operation(&mut self, row: EffectRowId, op: &str) -> EffectRowId {
        if !self.contains(row, op) {
            return row;
        }
        let mut reduced = self.get(row).clone();
        reduced.ops.retain(|label| label.as_str() != op);
        self.intern(reduced)
    }

    /// Remove every label in `ops`.
    pub fn drop_handled_operations<'a>(
        &mut self,
        row: EffectRowId,
        ops: impl IntoIterator<Item = &'a str>,
    ) -> EffectRowId {
        ops.into_iter()
            .fold(row, |acc, op| self.drop_handled_operation(acc, op))
    }

    /// True when every label of `inner` is in `outer`, or `outer` is open.
    pub fn is_covered_by(&self, inner: EffectRowId, outer: EffectRowId) -> bool {
        let outer_row = self.get(outer);
        if outer_row.is_open() {
            return true;
        }
        let inner_row = self.get(inner);
        inner_row.tail.is_none() && inner_row.ops.is_subset(&outer_row.ops)
    }

    pub fn display(&self, id: EffectRowId) -> String {
        self.get(id).to_string()
    }
}

impl TryFrom<Vec<EffectRow>> for EffectRowTable {
    type Error = RowTableError;

    fn try_from(rows: Vec<EffectRow>) -> Result<Self, Self::Error> {
        let mut table = Self::new();
        let mut iter = rows.into_iter();
        if let Some(first) = iter.next()
            && !first.is_pure()
        {
            return Err(RowTableError::NonPureFirstRow(first.to_string()));
        }
        for row in iter {
            // Keep ids dense even when the serialized table repeats a row.
            let id = EffectRowId(table.rows.len() as u32);
            table.index.entry(row.clone()).or_insert(id);
            table.rows.push(row);
        }
        Ok(table)
    }
}

impl From<EffectRowTable> for Vec<EffectRow> {
    fn from(table: EffectRowTable) -> Self {
        table.rows
    }
}
