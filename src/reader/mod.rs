//! Per-port reader threads.
//!
//! Each configured port owns one OS thread that opens the device, reads raw
//! bytes with a bounded timeout, splits them into lines, and routes every
//! line through the configured descriptors (or the format inferrer) onto the
//! shared sample queue. Serial reads block, so the readers live on dedicated
//! threads rather than the async runtime; the read timeout bounds how long a
//! stop signal can go unnoticed.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Encoding, PortConfig};
use crate::sensor::infer::FormatInferrer;
use crate::sensor::{Sample, SensorDescriptor};

/// Raw lines echoed in listener mode are rate-limited to this cadence.
const LISTEN_ECHO_INTERVAL: Duration = Duration::from_millis(50);

/// Decode and read warnings per reader before going silent.
const MAX_LINE_WARNINGS: u32 = 5;

/// Error marker pushed onto the error channel when a reader dies.
///
/// Open failure is terminal for the one reader; sibling readers and the
/// process continue.
#[derive(Debug)]
pub struct PortError {
    pub port: String,
    pub error: anyhow::Error,
}

/// One serial port and the thread streaming it.
pub struct PortReader {
    name: String,
    cfg: PortConfig,
    descriptors: Arc<[SensorDescriptor]>,
    infer_limit: usize,
    samples: UnboundedSender<Sample>,
    errors: UnboundedSender<PortError>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PortReader {
    /// Creates a reader for the port named `name`.
    ///
    /// `descriptors` are the manually-configured sensors for this port, in a
    /// stable order; when empty, the reader learns the wire format with a
    /// [`FormatInferrer`] instead.
    pub fn new(
        name: impl Into<String>,
        cfg: PortConfig,
        descriptors: Vec<SensorDescriptor>,
        infer_limit: usize,
        samples: UnboundedSender<Sample>,
        errors: UnboundedSender<PortError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            cfg,
            descriptors: descriptors.into(),
            infer_limit,
            samples,
            errors,
            cancel,
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Port name, used as the sensor identity for keyless samples.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the reader thread. No-op if already started.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let name = self.name.clone();
        let cfg = self.cfg.clone();
        let descriptors = Arc::clone(&self.descriptors);
        let infer_limit = self.infer_limit;
        let samples = self.samples.clone();
        let errors = self.errors.clone();
        let cancel = self.cancel.clone();

        let joined = std::thread::Builder::new()
            .name(format!("reader-{name}"))
            .spawn(move || {
                run_reader(name, cfg, descriptors, infer_limit, samples, errors, cancel);
            })
            .expect("spawning reader thread");

        *handle = Some(joined);
    }

    /// Signals the read loop to exit and waits for the thread.
    ///
    /// Cooperative: an in-flight blocking read completes first, so the wait
    /// is bounded by the configured port timeout. Idempotent and safe to
    /// call from any thread.
    pub fn stop(&self) {
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(port = %self.name, "reader thread panicked");
            }
        }
    }
}

/// Thread body: open the device, then stream until cancelled.
fn run_reader(
    name: String,
    cfg: PortConfig,
    descriptors: Arc<[SensorDescriptor]>,
    infer_limit: usize,
    samples: UnboundedSender<Sample>,
    errors: UnboundedSender<PortError>,
    cancel: CancellationToken,
) {
    let mut port = match open_port(&name, &cfg) {
        Ok(port) => port,
        Err(error) => {
            let _ = errors.send(PortError {
                port: name.clone(),
                error,
            });
            return;
        }
    };

    info!(port = %name, device = %cfg.device_path(&name), "serial port opened");

    // Validated by Config::validate; a reader never sees a bad pattern.
    let splitter = match Regex::new(&cfg.delimiter) {
        Ok(splitter) => splitter,
        Err(error) => {
            let _ = errors.send(PortError {
                port: name.clone(),
                error: anyhow::Error::new(error).context("compiling delimiter"),
            });
            return;
        }
    };

    let mut router = LineRouter::new(
        name.clone(),
        cfg.encoding,
        splitter,
        descriptors,
        infer_limit,
        samples,
    );

    let mut acc: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    let mut last_echo: Option<Instant> = None;
    let mut read_warnings = 0u32;

    while !cancel.is_cancelled() {
        let n = match port.read(&mut chunk) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                if read_warnings < MAX_LINE_WARNINGS {
                    read_warnings += 1;
                    warn!(port = %name, error = %e, "serial read failed");
                }
                continue;
            }
        };

        if n == 0 {
            continue;
        }

        acc.extend_from_slice(&chunk[..n]);

        while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = acc.drain(..=pos).collect();
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            if cfg.listener {
                // Diagnostic passthrough: echo the raw stream, never parse.
                if last_echo.map_or(true, |t| t.elapsed() > LISTEN_ECHO_INTERVAL) {
                    info!(port = %name, line = %String::from_utf8_lossy(&line), "listener");
                    last_echo = Some(Instant::now());
                }
                continue;
            }

            router.route(&line);
        }
    }

    debug!(port = %name, "reader stopped");
}

/// Opens the serial device with the configured parameters.
fn open_port(name: &str, cfg: &PortConfig) -> Result<Box<dyn serialport::SerialPort>> {
    let device = cfg.device_path(name);

    let mut port = serialport::new(&device, cfg.baud)
        .data_bits(cfg.serial_data_bits())
        .stop_bits(cfg.serial_stop_bits())
        .parity(cfg.serial_parity())
        .timeout(cfg.timeout)
        .open()
        .with_context(|| format!("opening serial device {device}"))?;

    if cfg.virtual_port {
        port.write_data_terminal_ready(true)
            .with_context(|| format!("asserting DTR on {device}"))?;
        port.write_request_to_send(true)
            .with_context(|| format!("asserting RTS on {device}"))?;
    }

    Ok(port)
}

/// Decodes, splits, and routes one line to a descriptor or the inferrer,
/// enqueueing the resolved sample.
struct LineRouter {
    identity: String,
    encoding: Encoding,
    splitter: Regex,
    descriptors: Arc<[SensorDescriptor]>,
    inferrer: FormatInferrer,
    samples: UnboundedSender<Sample>,
    started: Instant,
    decode_warnings: u32,
}

impl LineRouter {
    fn new(
        identity: String,
        encoding: Encoding,
        splitter: Regex,
        descriptors: Arc<[SensorDescriptor]>,
        infer_limit: usize,
        samples: UnboundedSender<Sample>,
    ) -> Self {
        Self {
            identity,
            encoding,
            splitter,
            descriptors,
            inferrer: FormatInferrer::new(infer_limit),
            samples,
            started: Instant::now(),
            decode_warnings: 0,
        }
    }

    /// Handles one newline-stripped raw line. A malformed line never aborts
    /// the loop; it simply produces no sample.
    fn route(&mut self, line: &[u8]) {
        let Some(text) = self.decode(line) else {
            return;
        };
        let text = text.to_string();

        let fields: Vec<&str> = self
            .splitter
            .split(text.trim())
            .filter(|field| !field.is_empty())
            .collect();
        if fields.is_empty() {
            return;
        }

        let resolved = if self.descriptors.is_empty() {
            self.inferrer.parse(&fields)
        } else {
            self.descriptors.iter().find_map(|descriptor| {
                descriptor
                    .parse(&fields)
                    .map(|values| (values, descriptor.key().map(str::to_string)))
            })
        };

        let Some((values, key)) = resolved else {
            return;
        };
        if values.is_empty() {
            return;
        }

        // Keyless channels fall back to the reader identity so keyless
        // sensors on different ports stay distinguishable downstream.
        let sensor = key.unwrap_or_else(|| self.identity.clone());
        let timestamp = self.started.elapsed().as_secs_f64();

        // A closed receiver means shutdown is already underway.
        let _ = self.samples.send(Sample {
            sensor,
            timestamp,
            values,
        });
    }

    fn decode<'a>(&mut self, line: &'a [u8]) -> Option<&'a str> {
        let decoded = match self.encoding {
            Encoding::Ascii if !line.is_ascii() => None,
            _ => std::str::from_utf8(line).ok(),
        };

        if decoded.is_none() && self.decode_warnings < MAX_LINE_WARNINGS {
            self.decode_warnings += 1;
            warn!(port = %self.identity, "dropping undecodable line");
            if self.decode_warnings == MAX_LINE_WARNINGS {
                warn!(port = %self.identity, "further decode warnings suppressed");
            }
        }

        decoded
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use super::*;
    use crate::config::SensorConfig;
    use crate::sensor::Value;

    fn descriptor(key: &str) -> SensorDescriptor {
        let cfg = SensorConfig {
            port: Some("test".to_string()),
            key: Some(key.to_string()),
            dtype: vec!["key".to_string(), "int".to_string(), "float".to_string()],
            value_index: None,
            label: None,
            logging: None,
            columns: None,
            legends: None,
            sensors: None,
            transform: None,
        };
        SensorDescriptor::new(key, &cfg).expect("valid descriptor")
    }

    fn router(
        descriptors: Vec<SensorDescriptor>,
        infer_limit: usize,
    ) -> (LineRouter, UnboundedReceiver<Sample>) {
        let (tx, rx) = unbounded_channel();
        let router = LineRouter::new(
            "test".to_string(),
            Encoding::Utf8,
            Regex::new(r"\s+").expect("valid pattern"),
            descriptors.into(),
            infer_limit,
            tx,
        );
        (router, rx)
    }

    #[test]
    fn test_route_matching_descriptor_enqueues_sample() {
        let (mut router, mut rx) = router(vec![descriptor("W")], 0);

        router.route(b"W 12 3.5");

        let sample = rx.try_recv().expect("sample enqueued");
        assert_eq!(sample.sensor, "W");
        assert_eq!(sample.values, vec![Value::Int(12), Value::Float(3.5)]);
    }

    #[test]
    fn test_route_first_matching_descriptor_wins() {
        let (mut router, mut rx) = router(vec![descriptor("T"), descriptor("W")], 0);

        router.route(b"W 1 2.0");
        router.route(b"T 3 4.0");

        assert_eq!(rx.try_recv().expect("first sample").sensor, "W");
        assert_eq!(rx.try_recv().expect("second sample").sensor, "T");
    }

    #[test]
    fn test_route_unmatched_line_is_dropped() {
        let (mut router, mut rx) = router(vec![descriptor("W")], 0);

        router.route(b"X 12 3.5");
        router.route(b"W 12");
        router.route(b"W twelve 3.5");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_delegates_to_inferrer_without_descriptors() {
        let (mut router, mut rx) = router(Vec::new(), 1);

        // Learning line is consumed silently.
        router.route(b"K 1 2.0");
        assert!(rx.try_recv().is_err());

        router.route(b"K 5 6.5");
        let sample = rx.try_recv().expect("frozen sample");
        assert_eq!(sample.sensor, "K");
        assert_eq!(sample.values, vec![Value::Int(5), Value::Float(6.5)]);
    }

    #[test]
    fn test_route_keyless_sample_uses_reader_identity() {
        let (mut router, mut rx) = router(Vec::new(), 1);

        router.route(b"1 2.0");
        router.route(b"5 6.5");

        let sample = rx.try_recv().expect("frozen sample");
        assert_eq!(sample.sensor, "test");
    }

    #[test]
    fn test_route_drops_undecodable_line() {
        let (mut router, mut rx) = router(vec![descriptor("W")], 0);

        router.route(&[0xff, 0xfe, b' ', b'1']);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_ascii_rejects_non_ascii() {
        let (tx, mut rx) = unbounded_channel();
        let mut router = LineRouter::new(
            "test".to_string(),
            Encoding::Ascii,
            Regex::new(r"\s+").expect("valid pattern"),
            vec![descriptor("W")].into(),
            0,
            tx,
        );

        router.route("W 12 3.5\u{00b5}".as_bytes());
        assert!(rx.try_recv().is_err());

        router.route(b"W 12 3.5");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_route_blank_line_is_ignored() {
        let (mut router, mut rx) = router(vec![descriptor("W")], 0);

        router.route(b"   ");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_timestamps_are_monotonic_per_reader() {
        let (mut router, mut rx) = router(vec![descriptor("W")], 0);

        router.route(b"W 1 1.0");
        router.route(b"W 2 2.0");

        let first = rx.try_recv().expect("first");
        let second = rx.try_recv().expect("second");
        assert!(second.timestamp >= first.timestamp);
    }
}
