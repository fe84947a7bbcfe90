//! Turns raw wal2json events into column-level [`ChangeMessage`]s.
//!
//! Values travel as text plus a declared SQL type, so "did this column
//! change" is decided by [`loosely_equal`] rather than by comparing JSON.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::postgres::types::{
    is_numeric_type, significant_digits, ChangeKind, ChangeMessage, ColumnDatum, ColumnImage,
    Diff, DiffEntry, PrimaryKey,
};
use crate::postgres::wal2json::{datum_from_json, OldKeys, RawChangeEvent, RawKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct EventNormalizer;

impl EventNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Zips parallel name/value/type sequences into a [`ColumnImage`].
    pub fn build_image(
        &self,
        names: &[String],
        values: &[Value],
        types: &[String],
    ) -> Result<ColumnImage> {
        if names.len() != values.len() || values.len() != types.len() {
            return Err(Error::ArityMismatch {
                names: names.len(),
                values: values.len(),
                types: types.len(),
            });
        }

        let mut image = ColumnImage::new();
        for ((name, value), type_name) in names.iter().zip(values).zip(types) {
            image.insert(name.clone(), datum_from_json(value, type_name));
        }
        Ok(image)
    }

    /// Columns of `new` whose value differs from the same column in `old`.
    ///
    /// A column missing from `old` always counts as changed and is reported
    /// with an empty-string old value. Columns only present in `old` are not
    /// reported.
    pub fn diff(&self, old: &ColumnImage, new: &ColumnImage) -> Diff {
        let mut diff = Diff::new();
        for (column, new_datum) in new.iter() {
            let old_json = match old.get(column) {
                Some(old_datum) if loosely_equal(old_datum, new_datum) => continue,
                Some(old_datum) => old_datum.to_json(),
                None => Value::String(String::new()),
            };
            diff.insert(
                column.to_string(),
                DiffEntry {
                    old_value: old_json,
                    new_value: new_datum.to_json(),
                },
            );
        }
        diff
    }

    /// Every column of `old` going to `null`; used for deletes.
    pub fn removal_diff(&self, old: &ColumnImage) -> Diff {
        old.iter()
            .map(|(column, datum)| {
                (
                    column.to_string(),
                    DiffEntry {
                        old_value: datum.to_json(),
                        new_value: Value::Null,
                    },
                )
            })
            .collect()
    }

    /// Projects `image` onto the ordered primary-key columns.
    pub fn build_primary_key(&self, image: &ColumnImage, key_columns: &[String]) -> PrimaryKey {
        let mut key = PrimaryKey::new();
        for column in key_columns {
            match image.get(column) {
                Some(datum) => {
                    key.insert(column.clone(), datum.to_json());
                }
                None => warn!(column = %column, "Primary key column missing from row image"),
            }
        }
        key
    }

    /// Builds the message for one event, or `None` for event kinds that
    /// carry no row change.
    pub fn normalize(
        &self,
        event: &RawChangeEvent,
        key_columns: &[String],
        xid: Option<u64>,
    ) -> Result<Option<ChangeMessage>> {
        let (kind, diff, primary_key) = match event.kind {
            RawKind::Insert => {
                let new = self.new_image(event)?;
                let diff = self.diff(&ColumnImage::new(), &new);
                let key = self.build_primary_key(&new, key_columns);
                (ChangeKind::Insert, diff, key)
            }
            RawKind::Update => {
                let new = self.new_image(event)?;
                let old = self.old_image(event)?;
                let diff = self.diff(&old, &new);
                let key = self.build_primary_key(&old, key_columns);
                (ChangeKind::Update, diff, key)
            }
            RawKind::Delete => {
                let old = self.old_image(event)?;
                let diff = self.removal_diff(&old);
                let key = self.build_primary_key(&old, key_columns);
                (ChangeKind::Delete, diff, key)
            }
            RawKind::Other => {
                debug!(table = %event.qualified_table(), "Skipping non-row wal2json event");
                return Ok(None);
            }
        };

        Ok(Some(ChangeMessage {
            kind,
            schema: event.schema.clone(),
            table: event.table.clone(),
            diff,
            primary_key,
            xid,
            captured_at: Utc::now(),
        }))
    }

    fn new_image(&self, event: &RawChangeEvent) -> Result<ColumnImage> {
        self.build_image(&event.columnnames, &event.columnvalues, &event.columntypes)
    }

    fn old_image(&self, event: &RawChangeEvent) -> Result<ColumnImage> {
        let empty = OldKeys::default();
        let keys = event.oldkeys.as_ref().unwrap_or(&empty);
        self.build_image(&keys.keynames, &keys.keyvalues, &keys.keytypes)
    }
}

/// Equality over text-encoded values.
///
/// Two NULLs are equal and NULL never equals text. If either side has a
/// numeric SQL type and both texts parse as finite numbers they compare
/// numerically, so `1` and `1.0` match. Everything else must match exactly,
/// so a `varchar` going from `02134` to `2134` is a change.
pub fn loosely_equal(old: &ColumnDatum, new: &ColumnDatum) -> bool {
    match (old.value.as_deref(), new.value.as_deref()) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let numeric = is_numeric_type(&old.type_name) || is_numeric_type(&new.type_name);
            match (numeric, as_number(a), as_number(b)) {
                (true, Some(x), Some(y)) => x == y,
                _ => a == b,
            }
        }
        _ => false,
    }
}

/// Numbers too wide for `f64` to hold exactly are left to text comparison.
fn as_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || significant_digits(trimmed) > f64::DIGITS as usize {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}
