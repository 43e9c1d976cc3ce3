//! Append-only CSV logging of representative samples.
//!
//! Rows buffer in memory per sensor and hit the disk on the flush interval
//! (or at shutdown). A file's header is written exactly once, when the file
//! is created; everything after is appended, never rewritten.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::sensor::{Sample, SensorTable, Value};

/// Output options for one sensor, resolved from its descriptor (or defaults
/// for sensors that were never configured, e.g. inferred channels).
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// File stem: the configured sensor name, else the sensor id.
    pub name: String,
    /// Column treated as the value of interest.
    pub value_index: usize,
    /// Logical column subset to write, in order. `None` writes all columns.
    pub logging: Option<Vec<usize>>,
    /// Labels aligned with `logging`. `None` auto-numbers.
    pub columns: Option<Vec<String>>,
}

impl LogOptions {
    /// Resolves options for the sensor id samples arrive under.
    pub fn for_sensor(table: &SensorTable, id: &str) -> Self {
        match table.get(id) {
            Some(descriptor) => Self {
                name: descriptor.name().to_string(),
                value_index: descriptor.primary_value_index(),
                logging: descriptor.logging().map(<[usize]>::to_vec),
                columns: descriptor.columns().map(<[String]>::to_vec),
            },
            None => Self {
                name: id.to_string(),
                value_index: 0,
                logging: None,
                columns: None,
            },
        }
    }
}

/// One buffered row, held in in-memory order: time, then the value of
/// interest, then the remaining fields in wire order.
#[derive(Debug, Clone)]
struct Row {
    time: f64,
    values: Vec<Value>,
}

#[derive(Debug)]
struct SensorBuffer {
    options: LogOptions,
    rows: Vec<Row>,
}

/// Buffered CSV writer, one file per sensor, owned by the aggregator.
#[derive(Debug)]
pub struct CsvLog {
    dir: PathBuf,
    flush_interval: Duration,
    last_flush: Option<Instant>,
    buffers: BTreeMap<String, SensorBuffer>,
}

impl CsvLog {
    /// Creates the log rooted at `dir`, creating the directory if needed.
    pub fn new(dir: PathBuf, flush_interval: Duration) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;

        Ok(Self {
            dir,
            flush_interval,
            last_flush: None,
            buffers: BTreeMap::new(),
        })
    }

    /// Buffers one representative sample. Buffers are created lazily per
    /// first-seen sensor.
    pub fn append(&mut self, table: &SensorTable, sample: &Sample) {
        let buffer = self
            .buffers
            .entry(sample.sensor.clone())
            .or_insert_with(|| SensorBuffer {
                options: LogOptions::for_sensor(table, &sample.sensor),
                rows: Vec::new(),
            });

        // Keep the value of interest in front; the flush remaps logical
        // column indices back to the file's layout.
        let value_index = buffer.options.value_index;
        let mut values = Vec::with_capacity(sample.values.len());
        if let Some(value) = sample.values.get(value_index) {
            values.push(*value);
        }
        for (i, value) in sample.values.iter().enumerate() {
            if i != value_index {
                values.push(*value);
            }
        }

        buffer.rows.push(Row {
            time: sample.timestamp,
            values,
        });
    }

    /// Total buffered rows and the number of sensors with a buffer, for the
    /// readiness probe.
    pub fn buffered_counts(&self) -> (usize, usize) {
        let rows = self.buffers.values().map(|b| b.rows.len()).sum();
        (rows, self.buffers.len())
    }

    /// Flushes if the flush interval has elapsed (or nothing was ever
    /// flushed). Returns whether a flush ran.
    pub fn maybe_flush(&mut self) -> Result<bool> {
        let due = self
            .last_flush
            .map_or(true, |at| at.elapsed() > self.flush_interval);

        if due {
            self.flush_all()?;
            self.last_flush = Some(Instant::now());
        }

        Ok(due)
    }

    /// Writes every buffered row to its sensor's file and clears the
    /// buffers. I/O failures propagate; silent data loss on the log path is
    /// unacceptable.
    pub fn flush_all(&mut self) -> Result<()> {
        for buffer in self.buffers.values_mut() {
            if buffer.rows.is_empty() {
                continue;
            }

            let options = &buffer.options;
            let column_count = buffer.rows[0].values.len();
            let logical: Vec<usize> = options
                .logging
                .clone()
                .unwrap_or_else(|| (0..column_count).collect());

            let path = self.dir.join(format!("{}.csv", options.name));

            if !path.is_file() {
                let file = File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                let mut writer = csv::Writer::from_writer(file);

                let mut header = Vec::with_capacity(logical.len() + 1);
                header.push("Time".to_string());
                for (i, _) in logical.iter().enumerate() {
                    let label = options
                        .columns
                        .as_ref()
                        .and_then(|columns| columns.get(i))
                        .cloned()
                        .unwrap_or_else(|| format!("Value {}", i + 1));
                    header.push(label);
                }

                writer
                    .write_record(&header)
                    .with_context(|| format!("writing header to {}", path.display()))?;
                writer
                    .flush()
                    .with_context(|| format!("flushing header to {}", path.display()))?;
            }

            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {} for append", path.display()))?;
            let mut writer = csv::Writer::from_writer(file);

            for row in &buffer.rows {
                let mut record = Vec::with_capacity(logical.len() + 1);
                record.push(row.time.to_string());

                for &index in &logical {
                    let physical = unmix(index, options.value_index);
                    let value = row.values.get(physical - 1).with_context(|| {
                        format!("column {index} missing from buffered {} row", options.name)
                    })?;
                    record.push(value.to_string());
                }

                writer
                    .write_record(&record)
                    .with_context(|| format!("appending to {}", path.display()))?;
            }

            writer
                .flush()
                .with_context(|| format!("flushing {}", path.display()))?;

            buffer.rows.clear();
        }

        Ok(())
    }
}

/// Maps a logical column index to its position in a buffered row
/// (`[time, value-of-interest, remaining...]`).
fn unmix(logical: usize, value_index: usize) -> usize {
    if logical == value_index {
        1
    } else if logical < value_index {
        logical + 2
    } else {
        logical + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SensorConfig};

    fn table_with(name: &str, sensor: SensorConfig) -> SensorTable {
        let mut cfg = Config::default();
        cfg.sensors.insert(name.to_string(), sensor);
        SensorTable::from_config(&cfg).expect("valid table")
    }

    fn sample(sensor: &str, timestamp: f64, values: Vec<Value>) -> Sample {
        Sample {
            sensor: sensor.to_string(),
            timestamp,
            values,
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .expect("file readable")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_header_written_once_across_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(10)).expect("log");
        let table = SensorTable::default();

        log.append(&table, &sample("W", 0.5, vec![Value::Float(1.5)]));
        log.flush_all().expect("first flush");
        log.append(&table, &sample("W", 1.0, vec![Value::Float(2.5)]));
        log.append(&table, &sample("W", 1.5, vec![Value::Float(3.5)]));
        log.flush_all().expect("second flush");

        let lines = read_lines(&dir.path().join("W.csv"));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Time,Value 1");
        assert_eq!(lines[1], "0.5,1.5");
        assert_eq!(lines[2], "1,2.5");
        assert_eq!(lines[3], "1.5,3.5");
    }

    #[test]
    fn test_buffers_clear_after_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(10)).expect("log");
        let table = SensorTable::default();

        log.append(&table, &sample("W", 0.5, vec![Value::Int(1)]));
        assert_eq!(log.buffered_counts(), (1, 1));

        log.flush_all().expect("flush");
        assert_eq!(log.buffered_counts(), (0, 1));

        // A second flush with empty buffers writes nothing new.
        log.flush_all().expect("empty flush");
        assert_eq!(read_lines(&dir.path().join("W.csv")).len(), 2);
    }

    #[test]
    fn test_configured_columns_and_remap() {
        let sensor = SensorConfig {
            port: Some("a".to_string()),
            key: Some("W".to_string()),
            dtype: vec!["key".to_string(), "int".to_string(), "float".to_string()],
            value_index: Some(vec![1]),
            label: None,
            logging: Some(vec![0, 1]),
            columns: Some(vec!["Raw".to_string(), "Mass".to_string()]),
            legends: None,
            sensors: None,
            transform: None,
        };
        let table = table_with("weight", sensor);

        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(10)).expect("log");

        // Wire order: column 0 = Int(12), column 1 = Float(3.5); the float
        // is the value of interest.
        log.append(&table, &sample("W", 2.0, vec![Value::Int(12), Value::Float(3.5)]));
        log.flush_all().expect("flush");

        // File is named after the sensor, not the key.
        let lines = read_lines(&dir.path().join("weight.csv"));
        assert_eq!(lines[0], "Time,Raw,Mass");
        assert_eq!(lines[1], "2,12,3.5");
    }

    #[test]
    fn test_logging_subset_restricts_columns() {
        let sensor = SensorConfig {
            port: Some("a".to_string()),
            key: Some("P".to_string()),
            dtype: vec![
                "key".to_string(),
                "int".to_string(),
                "float".to_string(),
                "float".to_string(),
            ],
            value_index: None,
            label: None,
            logging: Some(vec![2]),
            columns: None,
            legends: None,
            sensors: None,
            transform: None,
        };
        let table = table_with("pressure", sensor);

        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(10)).expect("log");

        log.append(
            &table,
            &sample(
                "P",
                1.0,
                vec![Value::Int(7), Value::Float(0.5), Value::Float(0.9)],
            ),
        );
        log.flush_all().expect("flush");

        let lines = read_lines(&dir.path().join("pressure.csv"));
        assert_eq!(lines[0], "Time,Value 1");
        assert_eq!(lines[1], "1,0.9");
    }

    #[test]
    fn test_first_maybe_flush_is_immediate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(3600)).expect("log");
        let table = SensorTable::default();

        log.append(&table, &sample("W", 0.1, vec![Value::Int(1)]));

        assert!(log.maybe_flush().expect("flush check"));
        assert!(dir.path().join("W.csv").is_file());

        // Within the interval nothing further is written.
        log.append(&table, &sample("W", 0.2, vec![Value::Int(2)]));
        assert!(!log.maybe_flush().expect("flush check"));
        assert_eq!(log.buffered_counts(), (1, 1));
    }

    #[test]
    fn test_separate_files_per_sensor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log =
            CsvLog::new(dir.path().to_path_buf(), Duration::from_secs(10)).expect("log");
        let table = SensorTable::default();

        log.append(&table, &sample("W", 0.5, vec![Value::Int(1)]));
        log.append(&table, &sample("T", 0.5, vec![Value::Float(20.5)]));
        log.flush_all().expect("flush");

        assert!(dir.path().join("W.csv").is_file());
        assert!(dir.path().join("T.csv").is_file());
    }
}
