use arrow::array::Array;
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use std::collections::HashSet;

use crate::{BatchSource, MergeError, MergeResult};

const KEY_SEPARATOR: char = '\u{1f}';

/// Indices of the named key columns in `schema`.
pub(crate) fn key_indices(schema: &Schema, names: &[String], side: &str) -> MergeResult<Vec<usize>> {
    if names.is_empty() {
        return Err(MergeError::Schema(format!("no {} join keys given", side)));
    }
    names
        .iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| {
                MergeError::Schema(format!("{} input has no key column '{}'", side, name))
            })
        })
        .collect()
}

/// Key columns compare by value, so the types must line up (any string flavour matches any other).
pub(crate) fn check_key_types(left: &Schema, l: &[usize], right: &Schema, r: &[usize]) -> MergeResult<()> {
    if l.len() != r.len() {
        return Err(MergeError::Schema(format!(
            "left has {} join key(s), right has {}",
            l.len(),
            r.len()
        )));
    }
    for (li, ri) in l.iter().zip(r) {
        let lf = left.field(*li);
        let rf = right.field(*ri);
        if !types_compatible(lf.data_type(), rf.data_type()) {
            return Err(MergeError::Schema(format!(
                "key '{}' is {} on the left but '{}' is {} on the right",
                lf.name(),
                lf.data_type(),
                rf.name(),
                rf.data_type()
            )));
        }
    }
    Ok(())
}

fn types_compatible(a: &DataType, b: &DataType) -> bool {
    let stringish = |t: &DataType| matches!(t, DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View);
    a == b || (stringish(a) && stringish(b))
}

/// Row-wise join keys. `None` when any key column is null; such rows never match.
pub(crate) fn row_keys(batch: &RecordBatch, cols: &[usize]) -> MergeResult<Vec<Option<String>>> {
    let options = FormatOptions::default();
    let columns: Vec<&dyn Array> = cols.iter().map(|c| batch.column(*c).as_ref()).collect();
    let formatters = columns
        .iter()
        .map(|array| ArrayFormatter::try_new(*array, &options))
        .collect::<Result<Vec<_>, _>>()?;

    let mut keys = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if columns.iter().any(|array| array.is_null(row)) {
            keys.push(None);
            continue;
        }
        let mut key = String::new();
        for (i, formatter) in formatters.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&formatter.value(row).to_string());
        }
        keys.push(Some(key));
    }
    Ok(keys)
}

/// Number of distinct non-null key tuples in `source`.
pub fn distinct_keys(source: &dyn BatchSource, names: &[String], side: &str) -> MergeResult<u64> {
    let cols = key_indices(&source.schema(), names, side)?;
    let mut seen = HashSet::new();
    for batch in source.batches()? {
        seen.extend(row_keys(&batch?, &cols)?.into_iter().flatten());
    }
    Ok(seen.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::Field;
    use std::sync::Arc;

    #[test]
    fn composite_keys_and_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("primaryid", DataType::Int64, true),
            Field::new("drug_seq", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![Some(10), Some(10), None])),
                Arc::new(StringArray::from(vec![Some("1"), None, Some("2")])),
            ],
        )
        .unwrap();
        let cols = key_indices(&schema, &["primaryid".into(), "drug_seq".into()], "left").unwrap();
        let keys = row_keys(&batch, &cols).unwrap();
        assert_eq!(keys, vec![Some("10\u{1f}1".to_string()), None, None]);
    }

    #[test]
    fn missing_or_mismatched_keys_are_rejected() {
        let left = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let right = Schema::new(vec![Field::new("id", DataType::Utf8, false)]);
        assert!(key_indices(&left, &["nope".into()], "left").is_err());
        assert!(key_indices(&left, &[], "left").is_err());
        assert!(check_key_types(&left, &[0], &right, &[0]).is_err());

        let large = Schema::new(vec![Field::new("id", DataType::LargeUtf8, false)]);
        assert!(check_key_types(&right, &[0], &large, &[0]).is_ok());
    }

    #[test]
    fn distinct_keys_skip_nulls_and_repeats() {
        let schema = Arc::new(Schema::new(vec![Field::new("drugname", DataType::Utf8, true)]));
        let batch = |names: Vec<Option<&str>>| {
            RecordBatch::try_new(schema.clone(), vec![Arc::new(StringArray::from(names))]).unwrap()
        };
        let source = crate::MemorySource::new(
            schema.clone(),
            vec![
                batch(vec![Some("aspirin"), None, Some("ibuprofen")]),
                batch(vec![Some("aspirin"), Some("metformin")]),
            ],
        );
        assert_eq!(distinct_keys(&source, &["drugname".into()], "left").unwrap(), 3);
        assert!(distinct_keys(&source, &["rxcui".into()], "left").is_err());
    }
}
