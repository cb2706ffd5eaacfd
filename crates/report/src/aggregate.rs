//! Incremental per-column aggregation.
//!
//! An [`Aggregator`] is a fold: the builder seeds one accumulator per aggregable leaf
//! field, folds every row's value into it as the row streams past, and finalizes each
//! accumulator into the summary cell once the sheet's last row has been emitted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Number, Value as JsonValue, json};

use reportforge_core::{ExportError, ExportResult};

/// Per-sheet aggregation strategy.
pub trait Aggregator: Send + Sync {
    /// Whether `field` gets an accumulator and a finalized summary cell.
    fn is_aggregable(&self, field: &str) -> bool;

    /// Neutral starting accumulator for `field`.
    fn seed(&self, _field: &str) -> JsonValue {
        JsonValue::Null
    }

    /// Fold one row value into the accumulator.
    fn fold(&self, field: &str, value: &JsonValue, acc: JsonValue) -> JsonValue;

    /// Turn the final accumulator into the summary cell.
    fn finalize(&self, _field: &str, acc: JsonValue) -> JsonValue {
        acc
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    /// Numbers and numeric strings; everything else is skipped by the numeric folds.
    fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(Numeric::Int)
                .or_else(|| n.as_f64().map(Numeric::Float)),
            JsonValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Numeric::Int)
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Numeric::Float))
            }
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn add(self, other: Numeric) -> Numeric {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a
                .checked_add(b)
                .map(Numeric::Int)
                .unwrap_or(Numeric::Float(a as f64 + b as f64)),
            (a, b) => Numeric::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Numeric::Int(i) => JsonValue::from(i),
            Numeric::Float(f) => Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number),
        }
    }
}

fn field_set<I, S>(fields: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fields.into_iter().map(Into::into).collect()
}

/// Sums numeric values of the configured fields. Integer sums stay integers.
#[derive(Debug, Clone)]
pub struct SumAggregator {
    fields: HashSet<String>,
}

impl SumAggregator {
    pub fn over<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: field_set(fields),
        }
    }
}

impl Aggregator for SumAggregator {
    fn is_aggregable(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    fn seed(&self, _field: &str) -> JsonValue {
        json!(0)
    }

    fn fold(&self, _field: &str, value: &JsonValue, acc: JsonValue) -> JsonValue {
        let Some(value) = Numeric::from_json(value) else {
            return acc;
        };
        let acc = Numeric::from_json(&acc).unwrap_or(Numeric::Int(0));
        acc.add(value).into_json()
    }
}

/// Counts non-null values of the configured fields.
#[derive(Debug, Clone)]
pub struct CountAggregator {
    fields: HashSet<String>,
}

impl CountAggregator {
    pub fn over<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: field_set(fields),
        }
    }
}

impl Aggregator for CountAggregator {
    fn is_aggregable(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    fn seed(&self, _field: &str) -> JsonValue {
        json!(0)
    }

    fn fold(&self, _field: &str, value: &JsonValue, acc: JsonValue) -> JsonValue {
        let count = acc.as_u64().unwrap_or(0);
        if value.is_null() {
            json!(count)
        } else {
            json!(count + 1)
        }
    }
}

/// Arithmetic mean of the numeric values of the configured fields.
///
/// The accumulator is a `{sum, count}` pair; only [`Aggregator::finalize`] divides.
/// A column with no numeric values finalizes to `null`.
#[derive(Debug, Clone)]
pub struct AverageAggregator {
    fields: HashSet<String>,
}

impl AverageAggregator {
    pub fn over<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: field_set(fields),
        }
    }
}

impl Aggregator for AverageAggregator {
    fn is_aggregable(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    fn seed(&self, _field: &str) -> JsonValue {
        json!({"sum": 0, "count": 0})
    }

    fn fold(&self, _field: &str, value: &JsonValue, acc: JsonValue) -> JsonValue {
        let Some(value) = Numeric::from_json(value) else {
            return acc;
        };
        let sum = Numeric::from_json(&acc["sum"]).unwrap_or(Numeric::Int(0));
        let count = acc["count"].as_u64().unwrap_or(0);
        json!({"sum": sum.add(value).into_json(), "count": count + 1})
    }

    fn finalize(&self, _field: &str, acc: JsonValue) -> JsonValue {
        let count = acc["count"].as_u64().unwrap_or(0);
        match Numeric::from_json(&acc["sum"]) {
            Some(sum) if count > 0 => Numeric::Float(sum.as_f64() / count as f64).into_json(),
            _ => JsonValue::Null,
        }
    }
}

/// Aggregator lookup by key.
#[derive(Clone, Default)]
pub struct AggregatorRegistry {
    aggregators: HashMap<String, Arc<dyn Aggregator>>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, aggregator: impl Aggregator + 'static) {
        self.aggregators.insert(key.into(), Arc::new(aggregator));
    }

    pub fn with(mut self, key: impl Into<String>, aggregator: impl Aggregator + 'static) -> Self {
        self.register(key, aggregator);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.aggregators.contains_key(key)
    }

    pub fn resolve(&self, key: &str) -> ExportResult<Arc<dyn Aggregator>> {
        self.aggregators
            .get(key)
            .cloned()
            .ok_or_else(|| ExportError::UnknownAggregator(key.to_string()))
    }
}

impl core::fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.aggregators.keys().collect();
        keys.sort();
        f.debug_struct("AggregatorRegistry").field("keys", &keys).finish()
    }
}
