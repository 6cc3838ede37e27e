use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Compass {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Compass {
    const POINTS: [Compass; 8] = [
        Compass::N,
        Compass::NE,
        Compass::E,
        Compass::SE,
        Compass::S,
        Compass::SW,
        Compass::W,
        Compass::NW,
    ];

    /// Nearest of the eight points; each covers 45 degrees centred on its bearing.
    pub fn from_degrees(degrees: f64) -> Self {
        let degrees = degrees.rem_euclid(360.0);
        let idx = ((degrees + 22.5) / 45.0).floor() as usize % Self::POINTS.len();
        Self::POINTS[idx]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compass::N => "N",
            Compass::NE => "NE",
            Compass::E => "E",
            Compass::SE => "SE",
            Compass::S => "S",
            Compass::SW => "SW",
            Compass::W => "W",
            Compass::NW => "NW",
        }
    }
}

/// Raw ADC anchors for a wind vane. North maps to 0 degrees and east to 90;
/// readings above east run linearly to the ADC maximum at 360, readings below
/// north run from the west anchor at 270.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindCalibration {
    pub north_raw: f64,
    pub east_raw: f64,
    pub west_raw: f64,
    pub raw_max: f64,
}

impl Default for WindCalibration {
    fn default() -> Self {
        Self {
            north_raw: 14350.0,
            east_raw: 21755.0,
            west_raw: 655.0,
            raw_max: 32767.0,
        }
    }
}

impl WindCalibration {
    pub fn is_well_formed(&self) -> bool {
        [self.north_raw, self.east_raw, self.west_raw, self.raw_max]
            .iter()
            .all(|anchor| anchor.is_finite())
            && self.west_raw < self.north_raw
            && self.north_raw < self.east_raw
            && self.east_raw < self.raw_max
    }

    /// Bearing in `[0, 360)`.
    pub fn bearing(&self, raw: f64) -> f64 {
        let degrees = if raw < self.north_raw {
            270.0 + raw / (self.north_raw - self.west_raw) * 90.0
        } else if raw <= self.east_raw {
            (raw - self.north_raw) * 90.0 / (self.east_raw - self.north_raw)
        } else {
            90.0 + (raw - self.east_raw) * 270.0 / (self.raw_max - self.east_raw)
        };
        degrees.rem_euclid(360.0)
    }
}

/// One calibration reference point; only the blue channel is used.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ReferencePoint {
    pub b: f64,
}

/// Two-point moisture calibration taken from reference sticks.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MoistureCalibration {
    #[serde(alias = "white_stick")]
    pub dry: ReferencePoint,
    #[serde(alias = "blue_stick")]
    pub wet: ReferencePoint,
}

impl MoistureCalibration {
    pub fn new(dry_blue: f64, wet_blue: f64) -> Result<Self> {
        let calibration = Self {
            dry: ReferencePoint { b: dry_blue },
            wet: ReferencePoint { b: wet_blue },
        };
        calibration.check()?;
        Ok(calibration)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read calibration {}", path.display()))?;
        let calibration: Self = serde_json::from_str(&data)
            .with_context(|| format!("parse calibration {}", path.display()))?;
        calibration.check()?;
        Ok(calibration)
    }

    fn check(&self) -> Result<()> {
        if !self.dry.b.is_finite() || !self.wet.b.is_finite() {
            return Err(anyhow!("calibration reference points must be finite"));
        }
        if self.dry.b == self.wet.b {
            return Err(anyhow!(
                "calibration dry and wet points are identical ({})",
                self.dry.b
            ));
        }
        Ok(())
    }

    /// Linear moisture percentage, clamped to `[0, 100]`.
    pub fn percent(&self, blue: f64) -> f64 {
        let span = self.wet.b - self.dry.b;
        ((blue - self.dry.b) / span * 100.0).clamp(0.0, 100.0)
    }
}
