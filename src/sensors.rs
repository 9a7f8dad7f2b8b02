// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Sense HAT Sampling
//!
//! Reads the board's environmental and motion sensors on a fixed cadence and
//! hands each snapshot to a [`TelemetrySink`], normally the [`Producer`]. The
//! loop checks readiness first; while the broker session is down samples are
//! skipped and counted, never queued.
//!
//! Which sensors are read, and how, comes from a [`SensorConfig`] file: a JSON
//! array with one entry per enabled sensor.
//!
//! ```json
//! [
//!   { "name": "temperature", "type": "float", "precision": 2, "units": "F", "cos_threshold": 0.5 },
//!   { "name": "orientation", "type": "float", "precision": 1, "units": "deg", "cos_threshold": 2.0 }
//! ]
//! ```
//!
//! `cos_threshold` is the change of state worth an info log line. For the IMU
//! sensors it applies to each of pitch, roll and yaw.

use crate::{errors::AmqpError, publisher::Producer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Default time between two samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);
/// Shortest accepted sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Where the binary looks for the sensor configuration.
pub const DEFAULT_SENSOR_CONFIG_PATH: &str = "sensehat.json";
/// Granularity at which a sleeping loop notices shutdown.
const TICK: Duration = Duration::from_millis(500);

pub const CELSIUS: &str = "C";
pub const FAHRENHEIT: &str = "F";
pub const MILLIBAR: &str = "mbar";
pub const INCHES_OF_MERCURY: &str = "inHg";

/// 1 mbar in inches of mercury.
const INHG_PER_MBAR: f64 = 0.029_53;

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 1.8 + 32.0
}

pub fn mbar_to_inhg(mbar: f64) -> f64 {
    mbar * INHG_PER_MBAR
}

/// Pitch, roll and yaw in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

impl Orientation {
    fn map(self, f: impl Fn(f64) -> f64) -> Orientation {
        Orientation {
            pitch: f(self.pitch),
            roll: f(self.roll),
            yaw: f(self.yaw),
        }
    }

    /// Largest change of any axis against `other`.
    fn max_delta(&self, other: &Orientation) -> f64 {
        (self.pitch - other.pitch)
            .abs()
            .max((self.roll - other.roll).abs())
            .max((self.yaw - other.yaw).abs())
    }
}

/// The readings a Sense HAT provides.
pub trait SensorSource: Send {
    /// Degrees Celsius.
    fn temperature(&mut self) -> f64;
    /// Relative humidity in percent.
    fn humidity(&mut self) -> f64;
    /// Millibars.
    fn pressure(&mut self) -> f64;
    fn orientation(&mut self) -> Orientation;
    /// Accelerometer-only orientation.
    fn accelerometer(&mut self) -> Orientation;
    /// Degrees from magnetic north.
    fn compass(&mut self) -> f64;
}

/// Deterministic stand-in for hosts without the board: slow sine drift around
/// indoor conditions.
#[derive(Debug, Default)]
pub struct SimulatedSenseHat {
    step: u64,
}

impl SimulatedSenseHat {
    pub fn new() -> SimulatedSenseHat {
        SimulatedSenseHat::default()
    }

    fn phase(&mut self) -> f64 {
        self.step += 1;
        (self.step as f64 / 12.0).sin()
    }
}

impl SensorSource for SimulatedSenseHat {
    fn temperature(&mut self) -> f64 {
        21.5 + 2.0 * self.phase()
    }

    fn humidity(&mut self) -> f64 {
        45.0 + 5.0 * self.phase()
    }

    fn pressure(&mut self) -> f64 {
        1013.25 + 3.0 * self.phase()
    }

    fn orientation(&mut self) -> Orientation {
        let phase = self.phase();
        Orientation {
            pitch: 1.5 * phase,
            roll: -0.5 * phase,
            yaw: 180.0 + 10.0 * phase,
        }
    }

    fn accelerometer(&mut self) -> Orientation {
        let phase = self.phase();
        Orientation {
            pitch: 0.2 * phase,
            roll: 0.1 * phase,
            yaw: 0.0,
        }
    }

    fn compass(&mut self) -> f64 {
        (350.0 + 20.0 * self.phase()).rem_euclid(360.0)
    }
}

/// A sensor the board exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    Orientation,
    Compass,
    Accelerometer,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Pressure => "pressure",
            SensorKind::Orientation => "orientation",
            SensorKind::Compass => "compass",
            SensorKind::Accelerometer => "accelerometer",
        };
        f.write_str(name)
    }
}

/// How a reading is formatted before it is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Rounded to `precision` decimals.
    #[default]
    Float,
    /// Truncated toward zero.
    Int,
}

fn default_precision() -> u32 {
    2
}

fn default_threshold() -> f64 {
    0.5
}

/// One enabled sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    pub name: SensorKind,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default = "default_precision")]
    pub precision: u32,
    #[serde(default)]
    pub units: String,
    /// Change of state that gets logged.
    #[serde(default = "default_threshold")]
    pub cos_threshold: f64,
}

impl SensorSettings {
    fn new(name: SensorKind, units: &str, precision: u32, cos_threshold: f64) -> SensorSettings {
        SensorSettings {
            name,
            value_type: ValueType::Float,
            precision,
            units: units.to_owned(),
            cos_threshold,
        }
    }

    pub fn format(&self, value: f64) -> f64 {
        match self.value_type {
            ValueType::Float => {
                let scale = 10f64.powi(self.precision as i32);
                (value * scale).round() / scale
            }
            ValueType::Int => value.trunc(),
        }
    }

    fn reading(&self, value: f64) -> Reading<f64> {
        Reading {
            value: self.format(value),
            unit: self.units.clone(),
        }
    }

    fn motion(&self, value: Orientation) -> Reading<Orientation> {
        Reading {
            value: value.map(|axis| self.format(axis)),
            unit: self.units.clone(),
        }
    }
}

/// The sensors a loop reads, in publishing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorConfig {
    pub sensors: Vec<SensorSettings>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            sensors: vec![
                SensorSettings::new(SensorKind::Temperature, CELSIUS, 2, 0.5),
                SensorSettings::new(SensorKind::Humidity, "%rH", 2, 1.0),
                SensorSettings::new(SensorKind::Pressure, MILLIBAR, 2, 0.5),
                SensorSettings::new(SensorKind::Orientation, "deg", 2, 1.0),
                SensorSettings::new(SensorKind::Compass, "deg", 1, 1.0),
                SensorSettings::new(SensorKind::Accelerometer, "deg", 2, 0.5),
            ],
        }
    }
}

impl SensorConfig {
    /// Loads the sensor configuration, writing the default one first when the
    /// file does not exist.
    ///
    /// # Parameters
    /// * `path` - JSON sensor configuration
    ///
    /// # Returns
    /// The validated configuration, or `SensorConfigError`
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<SensorConfig, AmqpError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "sensor config not found, writing the default one");
            let default = serde_json::to_string_pretty(&SensorConfig::default())
                .map_err(|err| AmqpError::SensorConfigError(err.to_string()))?;
            fs::write(path, default).map_err(|err| {
                AmqpError::SensorConfigError(format!("{}: {err}", path.display()))
            })?;
        }

        let raw = fs::read_to_string(path)
            .map_err(|err| AmqpError::SensorConfigError(format!("{}: {err}", path.display())))?;
        let cfg: SensorConfig = serde_json::from_str(&raw)
            .map_err(|err| AmqpError::SensorConfigError(format!("{}: {err}", path.display())))?;

        cfg.validate()?;
        debug!(path = %path.display(), sensors = cfg.sensors.len(), "sensor config successfully loaded");
        Ok(cfg)
    }

    /// Rejects units the board readings cannot be converted to.
    pub fn validate(&self) -> Result<(), AmqpError> {
        for settings in &self.sensors {
            let accepted: &[&str] = match settings.name {
                SensorKind::Temperature => &[CELSIUS, FAHRENHEIT],
                SensorKind::Pressure => &[MILLIBAR, INCHES_OF_MERCURY],
                _ => continue,
            };
            if !accepted.contains(&settings.units.as_str()) {
                return Err(AmqpError::SensorConfigError(format!(
                    "unsupported {} units `{}`",
                    settings.name, settings.units
                )));
            }
        }
        Ok(())
    }

    /// Overrides the units of every `kind` entry.
    pub fn set_units(&mut self, kind: SensorKind, units: &str) {
        for settings in self.sensors.iter_mut().filter(|s| s.name == kind) {
            settings.units = units.to_owned();
        }
    }

    pub fn settings(&self, kind: SensorKind) -> Option<&SensorSettings> {
        self.sensors.iter().find(|s| s.name == kind)
    }
}

/// A formatted value and the unit it is expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading<T> {
    pub value: T,
    pub unit: String,
}

/// One published snapshot. Sensors missing from the configuration are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Reading<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<Reading<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<Reading<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Reading<Orientation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerometer: Option<Reading<Orientation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compass: Option<Reading<f64>>,
}

impl Sample {
    /// Reads every configured sensor once, converted and formatted as configured.
    pub fn read(source: &mut dyn SensorSource, device_id: &str, config: &SensorConfig) -> Sample {
        let mut sample = Sample {
            device_id: device_id.to_owned(),
            timestamp: Utc::now(),
            temperature: None,
            humidity: None,
            pressure: None,
            orientation: None,
            accelerometer: None,
            compass: None,
        };

        for settings in &config.sensors {
            match settings.name {
                SensorKind::Temperature => {
                    let celsius = source.temperature();
                    let value = if settings.units == FAHRENHEIT {
                        celsius_to_fahrenheit(celsius)
                    } else {
                        celsius
                    };
                    sample.temperature = Some(settings.reading(value));
                }
                SensorKind::Humidity => sample.humidity = Some(settings.reading(source.humidity())),
                SensorKind::Pressure => {
                    let mbar = source.pressure();
                    let value = if settings.units == INCHES_OF_MERCURY {
                        mbar_to_inhg(mbar)
                    } else {
                        mbar
                    };
                    sample.pressure = Some(settings.reading(value));
                }
                SensorKind::Orientation => {
                    sample.orientation = Some(settings.motion(source.orientation()))
                }
                SensorKind::Accelerometer => {
                    sample.accelerometer = Some(settings.motion(source.accelerometer()))
                }
                SensorKind::Compass => sample.compass = Some(settings.reading(source.compass())),
            }
        }

        sample
    }

    fn scalar(&self, kind: SensorKind) -> Option<&Reading<f64>> {
        match kind {
            SensorKind::Temperature => self.temperature.as_ref(),
            SensorKind::Humidity => self.humidity.as_ref(),
            SensorKind::Pressure => self.pressure.as_ref(),
            SensorKind::Compass => self.compass.as_ref(),
            SensorKind::Orientation | SensorKind::Accelerometer => None,
        }
    }

    fn motion(&self, kind: SensorKind) -> Option<&Reading<Orientation>> {
        match kind {
            SensorKind::Orientation => self.orientation.as_ref(),
            SensorKind::Accelerometer => self.accelerometer.as_ref(),
            _ => None,
        }
    }
}

/// Where samples go.
#[cfg_attr(test, mockall::automock)]
pub trait TelemetrySink {
    fn is_ready(&self) -> bool;

    /// False when the sample was not sent.
    fn publish_sample(&self, sample: &Sample) -> bool;
}

impl TelemetrySink for Producer {
    fn is_ready(&self) -> bool {
        Producer::is_ready(self)
    }

    fn publish_sample(&self, sample: &Sample) -> bool {
        self.publish(sample)
    }
}

/// Fixed-cadence sampling loop.
pub struct SensorLoop<S> {
    source: S,
    device_id: String,
    config: SensorConfig,
    interval: Duration,
    last: Option<Sample>,
    published: u64,
    skipped: u64,
}

impl<S: SensorSource> SensorLoop<S> {
    pub fn new(source: S, device_id: impl Into<String>) -> SensorLoop<S> {
        SensorLoop {
            source,
            device_id: device_id.into(),
            config: SensorConfig::default(),
            interval: DEFAULT_SAMPLE_INTERVAL,
            last: None,
            published: 0,
            skipped: 0,
        }
    }

    /// Sampling interval, never below [`MIN_SAMPLE_INTERVAL`].
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_SAMPLE_INTERVAL);
        self
    }

    pub fn config(mut self, config: SensorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sample_interval(&self) -> Duration {
        self.interval
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Takes one sample and publishes it if the sink is ready.
    ///
    /// Returns whether the sample was sent.
    pub fn run_once(&mut self, sink: &dyn TelemetrySink) -> bool {
        let sample = Sample::read(&mut self.source, &self.device_id, &self.config);
        self.log_changes(&sample);

        let sent = sink.is_ready() && sink.publish_sample(&sample);
        if sent {
            self.published += 1;
        } else {
            self.skipped += 1;
            debug!(skipped = self.skipped, "sink not ready, sample skipped");
        }

        self.last = Some(sample);
        sent
    }

    /// Samples every interval until `shutdown` is set.
    pub fn run(&mut self, sink: &dyn TelemetrySink, shutdown: &AtomicBool) {
        info!(
            device_id = %self.device_id,
            interval = ?self.interval,
            sensors = self.config.sensors.len(),
            "sensor loop started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            self.run_once(sink);

            let next = Instant::now() + self.interval;
            while !shutdown.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= next {
                    break;
                }
                thread::sleep(TICK.min(next - now));
            }
        }

        info!(
            published = self.published,
            skipped = self.skipped,
            "sensor loop stopped"
        );
    }

    /// Sensors whose reading moved by at least their threshold since the last
    /// sample. Everything counts as changed on the first sample.
    fn changes(&self, sample: &Sample) -> Vec<SensorKind> {
        let last = self.last.as_ref();

        self.config
            .sensors
            .iter()
            .filter(|settings| {
                let kind = settings.name;
                if let Some(new) = sample.scalar(kind) {
                    last.and_then(|l| l.scalar(kind))
                        .map_or(true, |old| (new.value - old.value).abs() >= settings.cos_threshold)
                } else if let Some(new) = sample.motion(kind) {
                    last.and_then(|l| l.motion(kind))
                        .map_or(true, |old| new.value.max_delta(&old.value) >= settings.cos_threshold)
                } else {
                    false
                }
            })
            .map(|settings| settings.name)
            .collect()
    }

    fn log_changes(&self, sample: &Sample) {
        for kind in self.changes(sample) {
            if let Some(reading) = sample.scalar(kind) {
                info!("New {} value: {} {}", kind, reading.value, reading.unit);
            } else if let Some(reading) = sample.motion(kind) {
                info!(
                    "New {} value: pitch: {}, roll: {}, yaw: {} {}",
                    kind, reading.value.pitch, reading.value.roll, reading.value.yaw, reading.unit
                );
            }
        }
    }
}
