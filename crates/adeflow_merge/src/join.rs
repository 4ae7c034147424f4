use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::key::{check_key_types, key_indices, row_keys};
use crate::{JoinSpec, JoinType, MergeError, MergeResult};

pub(crate) const OUTPUT_BATCH_ROWS: usize = 8192;

/// Output schema of `left JOIN right`: every left column, then the right
/// columns minus the right join keys. Right columns are nullable; names that
/// clash get `spec.right_suffix`.
pub fn output_schema(left: &Schema, right: &Schema, spec: &JoinSpec) -> MergeResult<SchemaRef> {
    Ok(JoinLayout::new(left, right, spec)?.output)
}

/// Resolved column positions for one join.
#[derive(Debug, Clone)]
pub(crate) struct JoinLayout {
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    /// Right columns carried into the output, in order.
    pub right_values: Vec<usize>,
    pub output: SchemaRef,
}

impl JoinLayout {
    pub fn new(left: &Schema, right: &Schema, spec: &JoinSpec) -> MergeResult<Self> {
        let left_keys = key_indices(left, &spec.left_keys, "left")?;
        let right_keys = key_indices(right, &spec.right_keys, "right")?;
        check_key_types(left, &left_keys, right, &right_keys)?;

        let mut names: HashSet<String> = left.fields().iter().map(|f| f.name().clone()).collect();
        let mut fields: Vec<Field> = left.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut right_values = Vec::new();
        for (index, field) in right.fields().iter().enumerate() {
            if right_keys.contains(&index) {
                continue;
            }
            let mut name = field.name().clone();
            if names.contains(&name) {
                name = format!("{}{}", name, spec.right_suffix);
            }
            if !names.insert(name.clone()) {
                return Err(MergeError::Schema(format!(
                    "right column '{}' clashes with an output column even after suffixing",
                    field.name()
                )));
            }
            fields.push(field.as_ref().clone().with_name(name).with_nullable(true));
            right_values.push(index);
        }

        Ok(Self {
            left_keys,
            right_keys,
            right_values,
            output: Arc::new(Schema::new(fields)),
        })
    }
}

/// Build side of the hash join: all right rows plus key -> row positions.
pub(crate) struct RightTable {
    batch: RecordBatch,
    index: HashMap<String, Vec<u32>>,
}

impl RightTable {
    /// `batch` must hold the whole build side, in right-input order.
    pub fn build(batch: RecordBatch, key_cols: &[usize]) -> MergeResult<Self> {
        if batch.num_rows() > u32::MAX as usize {
            return Err(MergeError::Schema(format!(
                "right side has {} rows; at most {} fit one hash table",
                batch.num_rows(),
                u32::MAX
            )));
        }
        let keys = row_keys(&batch, key_cols)?;
        let mut index: HashMap<String, Vec<u32>> = HashMap::new();
        for (row, key) in keys.into_iter().enumerate() {
            if let Some(key) = key {
                index.entry(key).or_default().push(row as u32);
            }
        }
        Ok(Self { batch, index })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Match one left batch. Output rows follow left order, and within a
    /// left row the right matches follow right order.
    pub fn match_rows(&self, left_keys: &[Option<String>], join_type: JoinType) -> RowMatches {
        let mut out = RowMatches::default();
        for (row, key) in left_keys.iter().enumerate() {
            match key.as_ref().and_then(|k| self.index.get(k)) {
                Some(rows) => {
                    out.matched_rows += 1;
                    for right_row in rows {
                        out.left.push(row as u32);
                        out.right.push(Some(*right_row));
                    }
                }
                None => {
                    out.unmatched_rows += 1;
                    if join_type == JoinType::LeftOuter {
                        out.left.push(row as u32);
                        out.right.push(None);
                    }
                }
            }
        }
        out
    }

    /// Output columns for matched rows `range`: `left_cols` of the left batch,
    /// then `right_values` of the build side.
    pub fn assemble(
        &self,
        left: &RecordBatch,
        left_cols: &[usize],
        right_values: &[usize],
        matches: &RowMatches,
        range: std::ops::Range<usize>,
    ) -> MergeResult<Vec<ArrayRef>> {
        let left_idx = UInt32Array::from(matches.left[range.clone()].to_vec());
        let right_idx = UInt32Array::from(matches.right[range].to_vec());
        let mut columns = Vec::with_capacity(left_cols.len() + right_values.len());
        for col in left_cols {
            columns.push(take(left.column(*col).as_ref(), &left_idx, None)?);
        }
        for col in right_values {
            columns.push(take(self.batch.column(*col).as_ref(), &right_idx, None)?);
        }
        Ok(columns)
    }
}

/// Row pairs produced by matching one left batch against the build side.
#[derive(Debug, Default)]
pub(crate) struct RowMatches {
    pub left: Vec<u32>,
    pub right: Vec<Option<u32>>,
    pub matched_rows: u64,
    pub unmatched_rows: u64,
}

impl RowMatches {
    pub fn len(&self) -> usize {
        self.left.len()
    }

    /// Output row ranges of at most [`OUTPUT_BATCH_ROWS`].
    pub fn chunks(&self) -> impl Iterator<Item = std::ops::Range<usize>> {
        let len = self.len();
        (0..len)
            .step_by(OUTPUT_BATCH_ROWS)
            .map(move |start| start..(start + OUTPUT_BATCH_ROWS).min(len))
    }
}
