//! Synthetic sensor readings.

use std::fmt;
use std::str::FromStr;

use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};

/// Logical client identifier (`client_<n>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id of the `index`-th client of a run.
    pub fn indexed(index: usize) -> Self {
        Self(format!("client_{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sensor type assigned to a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Motion,
    Light,
    Pressure,
    Gps,
    Accelerometer,
    Gyroscope,
    /// Motion-triggered camera: bursts while motion is active, sparse polls while idle.
    Camera,
    Sound,
    Vibration,
    Co2,
    Voltage,
    /// Binary ON/OFF device state.
    Device,
    Other(String),
}

impl SensorKind {
    pub fn as_str(&self) -> &str {
        match self {
            SensorKind::Temperature => "temp",
            SensorKind::Humidity => "humidity",
            SensorKind::Motion => "motion",
            SensorKind::Light => "light",
            SensorKind::Pressure => "pressure",
            SensorKind::Gps => "gps",
            SensorKind::Accelerometer => "accelerometer",
            SensorKind::Gyroscope => "gyroscope",
            SensorKind::Camera => "camera",
            SensorKind::Sound => "sound",
            SensorKind::Vibration => "vibration",
            SensorKind::Co2 => "co2",
            SensorKind::Voltage => "voltage",
            SensorKind::Device => "device",
            SensorKind::Other(name) => name,
        }
    }

    /// Draws one reading value for this sensor type.
    ///
    /// Camera frames are produced by the generator, which owns the motion state;
    /// here a camera yields an idle frame.
    pub fn sample(&self, rng: &mut impl Rng) -> SensorValue {
        match self {
            SensorKind::Temperature => SensorValue::scalar(rng.random_range(15.0..35.0), "C"),
            SensorKind::Humidity => SensorValue::scalar(rng.random_range(30.0..80.0), "%"),
            SensorKind::Motion => SensorValue::Motion {
                detected: rng.random(),
                confidence: round_to(rng.random_range(0.5..1.0), 2),
            },
            SensorKind::Light => SensorValue::scalar(rng.random_range(0.0..1000.0), "lux"),
            SensorKind::Pressure => SensorValue::scalar(rng.random_range(980.0..1040.0), "hPa"),
            SensorKind::Gps => SensorValue::Location {
                latitude: round_to(rng.random_range(-90.0..90.0), 6),
                longitude: round_to(rng.random_range(-180.0..180.0), 6),
                altitude: round_to(rng.random_range(0.0..500.0), 2),
            },
            SensorKind::Accelerometer => SensorValue::Vector {
                x: round_to(rng.random_range(-10.0..10.0), 3),
                y: round_to(rng.random_range(-10.0..10.0), 3),
                z: round_to(rng.random_range(-10.0..10.0), 3),
                unit: "m/s2".into(),
            },
            SensorKind::Gyroscope => SensorValue::Vector {
                x: round_to(rng.random_range(-250.0..250.0), 2),
                y: round_to(rng.random_range(-250.0..250.0), 2),
                z: round_to(rng.random_range(-250.0..250.0), 2),
                unit: "deg/s".into(),
            },
            SensorKind::Camera => SensorValue::camera_frame(rng, false),
            SensorKind::Sound => SensorValue::scalar(rng.random_range(30.0..90.0), "dB"),
            SensorKind::Vibration => SensorValue::Vibration {
                frequency_hz: round_to(rng.random_range(10.0..100.0), 2),
                amplitude: round_to(rng.random_range(0.0..10.0), 2),
            },
            SensorKind::Co2 => SensorValue::scalar(rng.random_range(400.0..1000.0), "ppm"),
            SensorKind::Voltage => SensorValue::scalar(rng.random_range(3.0..5.0), "V"),
            SensorKind::Device => SensorValue::Switch { on: rng.random() },
            SensorKind::Other(_) => SensorValue::scalar(rng.random_range(0.0..100.0), "generic"),
        }
    }
}

impl From<String> for SensorKind {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "temp" | "temperature" => SensorKind::Temperature,
            "humidity" => SensorKind::Humidity,
            "motion" | "pir" => SensorKind::Motion,
            "light" | "lux" => SensorKind::Light,
            "pressure" => SensorKind::Pressure,
            "gps" | "location" => SensorKind::Gps,
            "accelerometer" | "accel" => SensorKind::Accelerometer,
            "gyroscope" | "gyro" => SensorKind::Gyroscope,
            "camera" | "image" => SensorKind::Camera,
            "sound" | "audio" => SensorKind::Sound,
            "vibration" => SensorKind::Vibration,
            "co2" => SensorKind::Co2,
            "voltage" => SensorKind::Voltage,
            "device" => SensorKind::Device,
            _ => SensorKind::Other(s),
        }
    }
}

impl From<SensorKind> for String {
    fn from(kind: SensorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for SensorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SensorKind::from(s.to_string()))
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `"temp,humidity"` or weighted `"temp:40,humidity:30"` sensor lists.
///
/// Weights are ignored and duplicates dropped, keeping first-seen order.
pub fn parse_sensor_list(list: &str) -> Vec<SensorKind> {
    let mut kinds = Vec::new();
    for item in list.split(',') {
        let name = item.split(':').next().unwrap_or_default().trim();
        if name.is_empty() {
            continue;
        }
        let kind = SensorKind::from(name.to_string());
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}

/// Sensor payload carried by a [`Reading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorValue {
    Scalar { value: f64, unit: String },
    Motion { detected: bool, confidence: f64 },
    Location { latitude: f64, longitude: f64, altitude: f64 },
    Vector { x: f64, y: f64, z: f64, unit: String },
    Image {
        resolution: String,
        format: String,
        size_kb: u32,
        motion: bool,
    },
    Vibration { frequency_hz: f64, amplitude: f64 },
    Switch { on: bool },
    /// Payload mangled by the fault injector; holds a tagged rendering of the original.
    Corrupted { raw: String },
}

impl SensorValue {
    fn scalar(value: f64, unit: &str) -> Self {
        SensorValue::Scalar {
            value: round_to(value, 2),
            unit: unit.to_string(),
        }
    }

    pub fn camera_frame(rng: &mut impl Rng, motion: bool) -> Self {
        SensorValue::Image {
            resolution: "1920x1080".into(),
            format: "JPEG".into(),
            size_kb: rng.random_range(50..=500),
            motion,
        }
    }

    /// Returns the corrupted form of this value, tagging the original content.
    pub fn corrupted(&self) -> Self {
        let original = serde_json::to_string(self).unwrap_or_default();
        SensorValue::Corrupted {
            raw: format!("CORRUPTED_{original}"),
        }
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, SensorValue::Corrupted { .. })
    }
}

/// One synthetic measurement, consumed exactly once by the send path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub client_id: ClientId,
    pub device_id: String,
    /// Per-client sequence number, wraps at 65536.
    pub sequence_no: u16,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub sensor: SensorValue,
    /// Identity of the emitting node, stamped by the orchestrator before send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sensor_aliases_resolve() {
        assert_eq!(SensorKind::from("temperature".to_string()), SensorKind::Temperature);
        assert_eq!(SensorKind::from("PIR".to_string()), SensorKind::Motion);
        assert_eq!(SensorKind::from("image".to_string()), SensorKind::Camera);
        assert_eq!(
            SensorKind::from("radiation".to_string()),
            SensorKind::Other("radiation".into())
        );
    }

    #[test]
    fn sensor_list_drops_weights_and_duplicates() {
        let kinds = parse_sensor_list("temp:40, humidity:30,temp,,gps");
        assert_eq!(
            kinds,
            vec![SensorKind::Temperature, SensorKind::Humidity, SensorKind::Gps]
        );
    }

    #[test]
    fn sensor_kind_serde_uses_short_names() {
        let json = serde_json::to_string(&vec![SensorKind::Temperature, SensorKind::Co2]).unwrap();
        assert_eq!(json, r#"["temp","co2"]"#);
        let back: Vec<SensorKind> = serde_json::from_str(r#"["accel","lux"]"#).unwrap();
        assert_eq!(back, vec![SensorKind::Accelerometer, SensorKind::Light]);
    }

    #[test]
    fn samples_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            match SensorKind::Humidity.sample(&mut rng) {
                SensorValue::Scalar { value, unit } => {
                    assert!((30.0..=80.0).contains(&value));
                    assert_eq!(unit, "%");
                }
                other => panic!("unexpected value {other:?}"),
            }
        }
    }

    #[test]
    fn corruption_tags_original_payload() {
        let value = SensorValue::Switch { on: true };
        let bad = value.corrupted();
        assert!(bad.is_corrupted());
        match bad {
            SensorValue::Corrupted { raw } => {
                assert!(raw.starts_with("CORRUPTED_"));
                assert!(raw.contains("switch"));
            }
            _ => unreachable!(),
        }
    }
}
