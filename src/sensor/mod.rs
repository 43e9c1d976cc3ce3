//! Sensor descriptors and the typed values they produce.
//!
//! A [`SensorDescriptor`] declares a channel's wire layout (field types plus
//! an optional key column) and turns a split line into typed values. Field
//! casts and aggregate transforms come from closed registries so the set of
//! available operations is auditable from this file alone.

pub mod infer;

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::config::{Config, SensorConfig};

/// Closed set of field casts available to sensor declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
}

impl FieldType {
    /// Resolves a configured type name. `"key"` is not a cast and is handled
    /// by [`SensorDescriptor::new`] before this lookup.
    pub fn from_name(name: &str) -> Option<FieldType> {
        match name {
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            _ => None,
        }
    }

    /// Returns the configuration name for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
        }
    }

    /// Casts one raw field. Returns `None` on non-numeric input so malformed
    /// lines drop out as "no match" instead of erroring.
    pub fn cast(&self, raw: &str) -> Option<Value> {
        match self {
            FieldType::Int => raw.parse::<i64>().ok().map(Value::Int),
            FieldType::Float => raw.parse::<f64>().ok().map(Value::Float),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    /// Numeric view used by averaging, transforms, and plotting.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Int(v) => *v as f64,
            Value::Float(v) => *v,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}

/// One typed reading produced by a port reader.
///
/// Written once by the owning reader thread and consumed exactly once by the
/// aggregator; `timestamp` is seconds since that reader started.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sensor: String,
    pub timestamp: f64,
    pub values: Vec<Value>,
}

/// Closed registry of aggregate-sensor transforms.
///
/// Replaces name-to-function resolution through dynamic evaluation: only the
/// operations listed here can be referenced from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    Mean,
    Sum,
    Min,
    Max,
    Diff,
}

impl Transform {
    /// Resolves a configured transform name.
    pub fn from_name(name: &str) -> Option<Transform> {
        match name {
            "mean" => Some(Transform::Mean),
            "sum" => Some(Transform::Sum),
            "min" => Some(Transform::Min),
            "max" => Some(Transform::Max),
            "diff" => Some(Transform::Diff),
            _ => None,
        }
    }

    /// Returns the configuration name for this transform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::Mean => "mean",
            Transform::Sum => "sum",
            Transform::Min => "min",
            Transform::Max => "max",
            Transform::Diff => "diff",
        }
    }

    /// Applies the transform across one field position of all constituents.
    pub fn apply(&self, column: &[f64]) -> Option<f64> {
        if column.is_empty() {
            return None;
        }

        let result = match self {
            Transform::Mean => column.iter().sum::<f64>() / column.len() as f64,
            Transform::Sum => column.iter().sum(),
            Transform::Min => column.iter().copied().fold(f64::INFINITY, f64::min),
            Transform::Max => column.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Transform::Diff => {
                let rest: f64 = column[1..].iter().sum();
                column[0] - rest
            }
        };

        Some(result)
    }
}

/// Errors raised while building a descriptor from configuration.
///
/// These are hard validation failures surfaced at setup time, never during
/// streaming.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("sensor {name}: `key` appears in dtype but no key value was supplied")]
    MissingKey { name: String },

    #[error("sensor {name}: `key` appears more than once in dtype")]
    DuplicateKey { name: String },

    #[error("sensor {name}: unknown field type `{raw}` in dtype")]
    UnknownFieldType { name: String, raw: String },

    #[error("sensor {name}: aggregate sensors need both `sensors` and `transform`")]
    IncompleteAggregate { name: String },
}

/// Declares a named channel's wire layout and parses raw lines into values.
///
/// Immutable after construction; safe to share across reader threads.
#[derive(Debug, Clone)]
pub struct SensorDescriptor {
    name: String,
    key: Option<String>,
    key_index: Option<usize>,
    dtype: Vec<FieldType>,
    value_index: Vec<usize>,
    logging: Option<Vec<usize>>,
    columns: Option<Vec<String>>,
    legends: Vec<String>,
    constituents: Vec<String>,
    transform: Option<Transform>,
}

impl SensorDescriptor {
    /// Builds a descriptor from its configuration section.
    pub fn new(name: &str, cfg: &SensorConfig) -> Result<Self, DescriptorError> {
        let is_aggregate = cfg.sensors.is_some() || cfg.transform.is_some();
        if is_aggregate && (cfg.sensors.is_none() || cfg.transform.is_none()) {
            return Err(DescriptorError::IncompleteAggregate {
                name: name.to_string(),
            });
        }

        let mut key_index = None;
        let mut dtype = Vec::with_capacity(cfg.dtype.len());
        for (i, entry) in cfg.dtype.iter().enumerate() {
            if entry == "key" {
                if key_index.is_some() {
                    return Err(DescriptorError::DuplicateKey {
                        name: name.to_string(),
                    });
                }
                // Aggregates never see raw lines, so the default dtype's key
                // position is allowed without a key value there.
                if cfg.key.is_none() && !is_aggregate {
                    return Err(DescriptorError::MissingKey {
                        name: name.to_string(),
                    });
                }
                key_index = Some(i);
                continue;
            }

            let field = FieldType::from_name(entry).ok_or_else(|| {
                DescriptorError::UnknownFieldType {
                    name: name.to_string(),
                    raw: entry.clone(),
                }
            })?;
            dtype.push(field);
        }

        Ok(Self {
            name: name.to_string(),
            key: cfg.key.clone(),
            key_index,
            dtype,
            value_index: cfg.value_index.clone().unwrap_or_default(),
            logging: cfg.logging.clone(),
            columns: cfg.columns.clone(),
            legends: cfg.legends.clone().unwrap_or_default(),
            constituents: cfg.sensors.clone().unwrap_or_default(),
            transform: cfg.transform,
        })
    }

    /// Configured sensor name (CSV file stem, plot label fallback).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire key, if this channel is keyed.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Declared non-key field types in wire order.
    pub fn dtype(&self) -> &[FieldType] {
        &self.dtype
    }

    /// Columns selected for plotting.
    pub fn value_index(&self) -> &[usize] {
        &self.value_index
    }

    /// The single value column treated as the channel's primary value.
    pub fn primary_value_index(&self) -> usize {
        self.value_index.first().copied().unwrap_or(0)
    }

    /// Column subset written to the log, if restricted.
    pub fn logging(&self) -> Option<&[usize]> {
        self.logging.as_deref()
    }

    /// CSV column labels, if configured.
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Plot legend labels for multi-value channels.
    pub fn legends(&self) -> &[String] {
        &self.legends
    }

    /// Constituent sensor names for aggregate channels.
    pub fn constituents(&self) -> &[String] {
        &self.constituents
    }

    /// Transform for aggregate channels.
    pub fn transform(&self) -> Option<Transform> {
        self.transform
    }

    /// True when this channel is derived from other sensors instead of a
    /// wire format.
    pub fn is_aggregate(&self) -> bool {
        self.transform.is_some()
    }

    /// Parses a split line into typed values.
    ///
    /// Returns `None` ("no match") when the key disagrees, the column count
    /// disagrees with the declared shape, or any cast fails. Purely
    /// functional over the descriptor's immutable configuration.
    pub fn parse(&self, raw: &[&str]) -> Option<Vec<Value>> {
        match (self.key_index, self.key.as_deref()) {
            (Some(ki), Some(key)) => {
                if *raw.get(ki)? != key {
                    return None;
                }
            }
            // A key value without a declared key position never matches.
            (None, Some(_)) => return None,
            _ => {}
        }

        self.cast(raw)
    }

    fn cast(&self, raw: &[&str]) -> Option<Vec<Value>> {
        let expected = self.dtype.len() + usize::from(self.key_index.is_some());
        if raw.len() != expected {
            return None;
        }

        let mut values = Vec::with_capacity(self.dtype.len());
        for (i, field) in raw.iter().enumerate() {
            if Some(i) == self.key_index {
                continue;
            }
            values.push(self.dtype[values.len()].cast(field)?);
        }

        Some(values)
    }
}

/// Immutable lookup of descriptors by the sensor id samples arrive under.
///
/// Keyed channels are indexed by their wire key; keyless channels by the
/// identity of the reader that produces them (the port name); aggregates by
/// their own name. Built once from configuration and shared read-only.
#[derive(Debug, Default)]
pub struct SensorTable {
    by_id: BTreeMap<String, SensorDescriptor>,
    aggregates: Vec<AggregateSensor>,
}

/// An aggregate channel with its constituent names resolved to sample ids.
#[derive(Debug, Clone)]
pub struct AggregateSensor {
    pub descriptor: SensorDescriptor,
    pub constituent_ids: Vec<String>,
}

impl SensorTable {
    /// Builds the table from validated configuration.
    pub fn from_config(cfg: &Config) -> Result<Self, DescriptorError> {
        let mut by_id = BTreeMap::new();
        let mut name_to_id = BTreeMap::new();
        let mut pending_aggregates = Vec::new();

        for (name, sensor_cfg) in &cfg.sensors {
            let descriptor = SensorDescriptor::new(name, sensor_cfg)?;

            if descriptor.is_aggregate() {
                pending_aggregates.push(descriptor);
                continue;
            }

            let id = match descriptor.key() {
                Some(key) => key.to_string(),
                // Keyless samples are enqueued under the reader identity.
                None => sensor_cfg.port.clone().unwrap_or_else(|| name.clone()),
            };
            name_to_id.insert(name.clone(), id.clone());
            by_id.insert(id, descriptor);
        }

        let mut aggregates = Vec::with_capacity(pending_aggregates.len());
        for descriptor in pending_aggregates {
            let constituent_ids = descriptor
                .constituents()
                .iter()
                .map(|name| name_to_id.get(name).cloned().unwrap_or_else(|| name.clone()))
                .collect();
            name_to_id.insert(descriptor.name().to_string(), descriptor.name().to_string());
            by_id.insert(descriptor.name().to_string(), descriptor.clone());
            aggregates.push(AggregateSensor {
                descriptor,
                constituent_ids,
            });
        }

        Ok(Self { by_id, aggregates })
    }

    /// Looks up the descriptor for a sample's sensor id.
    pub fn get(&self, id: &str) -> Option<&SensorDescriptor> {
        self.by_id.get(id)
    }

    /// Aggregate channels in configuration order.
    pub fn aggregates(&self) -> &[AggregateSensor] {
        &self.aggregates
    }

    /// Descriptors for the given port, in stable (name-sorted) order.
    pub fn for_port(&self, cfg: &Config, port: &str) -> Vec<SensorDescriptor> {
        cfg.sensors
            .iter()
            .filter(|(_, s)| s.port.as_deref() == Some(port))
            .filter_map(|(name, _)| {
                self.by_id
                    .values()
                    .find(|d| d.name() == name && !d.is_aggregate())
                    .cloned()
            })
            .collect()
    }
}
