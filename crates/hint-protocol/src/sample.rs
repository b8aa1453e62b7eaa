/// Sensor data model: paths, discrete batches and high-rate stream blocks.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Parts ─────────────────────────────────────────────────────────────

/// Known sensor parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Part {
    #[serde(rename = "noise")]
    CustomNoise,
    /// Temperature.
    Ds18b20,
    /// Environmental sensor.
    Bme280,
    /// Light sensor.
    Tcs3200,
    /// Accelerometer and compass.
    Lsm303d,
    Esp8266Tx,
    SbxI2c,
    SbxCpu,
    SbxBme280,
}

impl Part {
    pub const ALL: [Part; 9] = [
        Part::CustomNoise,
        Part::Ds18b20,
        Part::Bme280,
        Part::Tcs3200,
        Part::Lsm303d,
        Part::Esp8266Tx,
        Part::SbxI2c,
        Part::SbxCpu,
        Part::SbxBme280,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Part::CustomNoise => "noise",
            Part::Ds18b20 => "ds18b20",
            Part::Bme280 => "bme280",
            Part::Tcs3200 => "tcs3200",
            Part::Lsm303d => "lsm303d",
            Part::Esp8266Tx => "esp8266-tx",
            Part::SbxI2c => "sbx-i2c",
            Part::SbxCpu => "sbx-cpu",
            Part::SbxBme280 => "sbx-bme280",
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Part {
    type Err = InvalidSensorPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Part::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| InvalidSensorPath(s.to_string()))
    }
}

// ── Paths ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sensor path: {0:?}")]
pub struct InvalidSensorPath(pub String);

/// Location of a sensor value: `part/module/instance[/subpart]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorPath {
    pub module: String,
    pub part: Part,
    pub instance: String,
    pub subpart: Option<String>,
}

impl SensorPath {
    pub fn new(module: &str, part: Part, instance: &str) -> Self {
        Self {
            module: module.to_string(),
            part,
            instance: instance.to_string(),
            subpart: None,
        }
    }

    pub fn with_subpart(mut self, subpart: &str) -> Self {
        self.subpart = Some(subpart.to_string());
        self
    }

    /// The same path without subpart.
    pub fn bare(&self) -> Self {
        Self {
            subpart: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for SensorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.part, self.module, self.instance)?;
        if let Some(subpart) = &self.subpart {
            write!(f, "/{subpart}")?;
        }
        Ok(())
    }
}

impl FromStr for SensorPath {
    type Err = InvalidSensorPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSensorPath(s.to_string());
        let mut segments = s.split('/');
        let part = segments.next().ok_or_else(invalid)?.parse()?;
        let module = segments.next().filter(|m| !m.is_empty()).ok_or_else(invalid)?;
        let instance = segments.next().filter(|i| !i.is_empty()).ok_or_else(invalid)?;
        let subpart = segments.next();
        if segments.next().is_some() || subpart.is_some_and(str::is_empty) {
            return Err(invalid());
        }
        Ok(Self {
            module: module.to_string(),
            part,
            instance: instance.to_string(),
            subpart: subpart.map(str::to_string),
        })
    }
}

// ── Discrete samples ──────────────────────────────────────────────────

/// A single value at a single point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub path: SensorPath,
    pub value: f64,
}

/// All values read from one sensor at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub timestamp: DateTime<Utc>,
    pub bare_path: SensorPath,
    /// Keyed by subpart; `None` for single-valued parts.
    pub samples: Vec<(Option<String>, f64)>,
}

impl SampleBatch {
    pub fn new(timestamp: DateTime<Utc>, bare_path: SensorPath) -> Self {
        Self {
            timestamp,
            bare_path,
            samples: Vec::new(),
        }
    }

    pub fn with_sample(mut self, subpart: Option<&str>, value: f64) -> Self {
        self.samples.push((subpart.map(str::to_string), value));
        self
    }

    /// One [`Sample`] per value, with the subpart moved into the path.
    pub fn expand(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().map(|(subpart, value)| Sample {
            timestamp: self.timestamp,
            path: SensorPath {
                subpart: subpart.clone(),
                ..self.bare_path.clone()
            },
            value: *value,
        })
    }
}

// ── Stream blocks ─────────────────────────────────────────────────────

/// Externally owned resource tied to a stream block (e.g. a sample buffer
/// borrowed from a device driver). Released exactly once, when the block is
/// delivered, dropped or discarded.
pub trait ResourceHandle: Send {
    fn release(self: Box<Self>);
}

impl<F: FnOnce() + Send> ResourceHandle for F {
    fn release(self: Box<Self>) {
        (*self)()
    }
}

/// A contiguous run of high-rate signed 16 bit samples.
pub struct StreamBlock {
    pub timestamp: DateTime<Utc>,
    pub path: SensorPath,
    pub seq0: u64,
    pub period: Duration,
    /// Scale of the samples; `None` falls back to the configured range.
    pub range: Option<f64>,
    pub samples: Vec<i16>,
    handle: Option<Box<dyn ResourceHandle>>,
}

impl StreamBlock {
    pub fn new(
        timestamp: DateTime<Utc>,
        path: SensorPath,
        seq0: u64,
        period: Duration,
        samples: Vec<i16>,
    ) -> Self {
        Self {
            timestamp,
            path,
            seq0,
            period,
            range: None,
            samples,
            handle: None,
        }
    }

    pub fn with_range(mut self, range: f64) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_handle(mut self, handle: impl ResourceHandle + 'static) -> Self {
        self.handle = Some(Box::new(handle));
        self
    }

    /// Real time covered by the block.
    pub fn span(&self) -> Duration {
        self.period
            .saturating_mul(u32::try_from(self.samples.len()).unwrap_or(u32::MAX))
    }

    pub fn take_handle(&mut self) -> Option<Box<dyn ResourceHandle>> {
        self.handle.take()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Release the resource handle, if any.
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for StreamBlock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl fmt::Debug for StreamBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBlock")
            .field("path", &self.path.to_string())
            .field("t0", &self.timestamp)
            .field("seq0", &self.seq0)
            .field("period", &self.period)
            .field("samples", &self.samples.len())
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}
