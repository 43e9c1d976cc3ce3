//! Wire-format inference for ports without configured sensors.
//!
//! Watches the first `infer_limit` lines from a port and learns, per distinct
//! key value, the column types and key position. While learning, every line
//! is consumed without producing data; once the budget is spent the learned
//! formats freeze and subsequent lines resolve against them.

use std::collections::BTreeMap;

use tracing::debug;

use super::{FieldType, Value};

/// Column layout learned for one key (or for keyless traffic).
#[derive(Debug, Clone, PartialEq, Eq)]
struct LearnedFormat {
    key_index: Option<usize>,
    dtype: Vec<FieldType>,
}

/// Two-state format learner: Learning while fewer than `infer_limit` lines
/// have been seen, Frozen afterwards.
///
/// The first observed shape per key wins and is only replaced when a later
/// learning-phase line with the same key carries a different shape
/// (last-write-wins, no majority voting).
#[derive(Debug)]
pub struct FormatInferrer {
    infer_limit: usize,
    seen: usize,
    formats: BTreeMap<Option<String>, LearnedFormat>,
}

impl FormatInferrer {
    /// Creates a learner that freezes after `infer_limit` observed lines.
    pub fn new(infer_limit: usize) -> Self {
        Self {
            infer_limit,
            seen: 0,
            formats: BTreeMap::new(),
        }
    }

    /// True once the learning budget is spent.
    pub fn frozen(&self) -> bool {
        self.seen >= self.infer_limit
    }

    /// Consumes one split line.
    ///
    /// Returns `None` for every line during the learning phase (those samples
    /// are discarded) and for lines that resolve to no known format once
    /// frozen. Otherwise returns the typed values and the matched key.
    pub fn parse(&mut self, raw: &[&str]) -> Option<(Vec<Value>, Option<String>)> {
        if !self.frozen() {
            self.learn(raw);
            self.seen += 1;
            return None;
        }

        self.resolve(raw)
    }

    /// Records the shape of one learning-phase line.
    fn learn(&mut self, raw: &[&str]) {
        let mut key: Option<(usize, String)> = None;
        let mut dtype = Vec::with_capacity(raw.len());

        for (i, field) in raw.iter().enumerate() {
            if field.parse::<i64>().is_ok() {
                dtype.push(FieldType::Int);
            } else if field.parse::<f64>().is_ok() {
                dtype.push(FieldType::Float);
            } else {
                // At most one non-numeric field is expected per line; a later
                // one replaces the previously detected key for this call.
                key = Some((i, field.to_string()));
            }
        }

        let (key_index, key_value) = match key {
            Some((i, value)) => (Some(i), Some(value)),
            None => (None, None),
        };

        let format = LearnedFormat { key_index, dtype };
        if let Some(previous) = self.formats.get(&key_value) {
            if *previous != format {
                debug!(key = ?key_value, "inferred format changed, replacing");
            }
        }
        self.formats.insert(key_value, format);
    }

    /// Resolves a line against the frozen formats.
    fn resolve(&self, raw: &[&str]) -> Option<(Vec<Value>, Option<String>)> {
        for (key, format) in &self.formats {
            let Some(key) = key else { continue };
            let Some(key_index) = format.key_index else {
                continue;
            };

            if raw.get(key_index).copied() == Some(key.as_str()) {
                // A shape mismatch against a matched key is malformed input,
                // not cause for re-inference.
                return cast_line(raw, Some(key_index), &format.dtype)
                    .map(|values| (values, Some(key.clone())));
            }
        }

        let format = self.formats.get(&None)?;
        let values = cast_line(raw, format.key_index, &format.dtype)?;
        Some((values, None))
    }
}

/// Casts all non-key fields positionally against a learned type vector.
fn cast_line(raw: &[&str], key_index: Option<usize>, dtype: &[FieldType]) -> Option<Vec<Value>> {
    let expected = dtype.len() + usize::from(key_index.is_some());
    if raw.len() != expected {
        return None;
    }

    let mut values = Vec::with_capacity(dtype.len());
    for (i, field) in raw.iter().enumerate() {
        if Some(i) == key_index {
            continue;
        }
        values.push(dtype[values.len()].cast(field)?);
    }

    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learning_phase_yields_no_data() {
        let mut inferrer = FormatInferrer::new(3);

        for _ in 0..3 {
            assert_eq!(inferrer.parse(&["K", "1", "2.0"]), None);
        }
        assert!(inferrer.frozen());
    }

    #[test]
    fn test_frozen_resolves_learned_key() {
        let limit = 5;
        let mut inferrer = FormatInferrer::new(limit);

        for _ in 0..limit {
            assert_eq!(inferrer.parse(&["K", "1", "2.0"]), None);
        }

        let (values, key) = inferrer.parse(&["K", "1", "2.0"]).expect("frozen match");
        assert_eq!(values, vec![Value::Int(1), Value::Float(2.0)]);
        assert_eq!(key, Some("K".to_string()));
    }

    #[test]
    fn test_keyless_fallback() {
        let mut inferrer = FormatInferrer::new(1);
        assert_eq!(inferrer.parse(&["4", "1.5"]), None);

        let (values, key) = inferrer.parse(&["9", "2.5"]).expect("keyless match");
        assert_eq!(values, vec![Value::Int(9), Value::Float(2.5)]);
        assert_eq!(key, None);
    }

    #[test]
    fn test_unknown_key_without_keyless_format_is_no_data() {
        let mut inferrer = FormatInferrer::new(1);
        inferrer.parse(&["K", "1", "2.0"]);

        assert_eq!(inferrer.parse(&["T", "1", "2.0"]), None);
    }

    #[test]
    fn test_shape_mismatch_on_matched_key_is_no_data() {
        let mut inferrer = FormatInferrer::new(1);
        inferrer.parse(&["K", "1", "2.0"]);

        assert_eq!(inferrer.parse(&["K", "1", "2.0", "3"]), None);
        assert_eq!(inferrer.parse(&["K", "oops", "2.0"]), None);
    }

    #[test]
    fn test_last_write_wins_on_format_drift() {
        let mut inferrer = FormatInferrer::new(2);
        inferrer.parse(&["K", "1", "2.0"]);
        // Same key, different shape: the later line replaces the vector.
        inferrer.parse(&["K", "1", "2"]);

        let (values, key) = inferrer.parse(&["K", "3", "4"]).expect("frozen match");
        assert_eq!(values, vec![Value::Int(3), Value::Int(4)]);
        assert_eq!(key, Some("K".to_string()));

        // The old float shape no longer casts.
        assert_eq!(inferrer.parse(&["K", "3", "4.5"]), None);
    }

    #[test]
    fn test_multiple_keys_resolve_independently() {
        let mut inferrer = FormatInferrer::new(2);
        inferrer.parse(&["K", "1", "2.0"]);
        inferrer.parse(&["W", "1"]);

        let (values, key) = inferrer.parse(&["W", "7"]).expect("frozen match");
        assert_eq!(values, vec![Value::Int(7)]);
        assert_eq!(key, Some("W".to_string()));

        let (values, key) = inferrer.parse(&["K", "5", "6.5"]).expect("frozen match");
        assert_eq!(values, vec![Value::Int(5), Value::Float(6.5)]);
        assert_eq!(key, Some("K".to_string()));
    }

    #[test]
    fn test_second_non_numeric_field_overwrites_key() {
        let mut inferrer = FormatInferrer::new(1);
        inferrer.parse(&["A", "1", "B"]);

        // The key index is the later non-numeric field; the earlier one was
        // never recorded as a type, so the learned vector is degenerate and
        // the line cannot resolve.
        assert_eq!(inferrer.parse(&["A", "1", "B"]), None);
    }

    #[test]
    fn test_zero_limit_freezes_immediately() {
        let mut inferrer = FormatInferrer::new(0);
        assert!(inferrer.frozen());
        assert_eq!(inferrer.parse(&["K", "1"]), None);
    }
}
