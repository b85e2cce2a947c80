use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A geographic coordinate in decimal degrees.
///
/// Both components are guaranteed finite; construction rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if latitude.is_finite() && longitude.is_finite() {
            Some(Self { latitude, longitude })
        } else {
            None
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

/// How a location was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    Config,
    Geocode,
    Ip,
}

impl LocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::Config => "config",
            LocationSource::Geocode => "geocode",
            LocationSource::Ip => "ip",
        }
    }
}

/// A coordinate together with the method that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLocation {
    pub coordinate: Coordinate,
    pub source: LocationSource,
}

/// Kind of precipitation reported or predicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecipKind {
    Rain,
    Snow,
    Sleet,
    #[default]
    None,
}

impl PrecipKind {
    /// Map free-text upstream condition vocabulary onto the closed kind set.
    ///
    /// Matching is case-insensitive substring; snow outranks sleet outranks
    /// rain when a description implies several ("light rain and snow").
    pub fn from_condition(text: &str) -> Self {
        let lower = text.to_lowercase();

        const SNOW: &[&str] = &["snow", "flurr", "blizzard", "graupel"];
        const SLEET: &[&str] = &["sleet", "freezing", "ice pellet", "wintry"];
        const RAIN: &[&str] = &["rain", "drizzle", "shower", "thunder"];

        if SNOW.iter().any(|kw| lower.contains(kw)) {
            PrecipKind::Snow
        } else if SLEET.iter().any(|kw| lower.contains(kw)) {
            PrecipKind::Sleet
        } else if RAIN.iter().any(|kw| lower.contains(kw)) {
            PrecipKind::Rain
        } else {
            PrecipKind::None
        }
    }

    pub fn is_precipitating(&self) -> bool {
        !matches!(self, PrecipKind::None)
    }
}

impl std::fmt::Display for PrecipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrecipKind::Rain => "rain",
            PrecipKind::Snow => "snow",
            PrecipKind::Sleet => "sleet",
            PrecipKind::None => "none",
        };
        f.write_str(s)
    }
}

/// A single current-conditions reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nowcast {
    pub observed_at: DateTime<Utc>,
    pub provider: String,
    /// Precipitation intensity in millimeters per hour, >= 0.
    pub rate_mm_h: f64,
    /// Probability of precipitation, 0-100, where the upstream reports one.
    pub probability: Option<f64>,
    pub kind: PrecipKind,
    pub temperature_c: Option<f64>,
}

/// One future time-point of a forecast, normalized to the common shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSlice {
    pub at: DateTime<Utc>,
    /// Minutes from the reference "now"; negative when the source is stale.
    pub minutes_out: i64,
    pub provider: String,
    pub rate_mm_h: f64,
    pub probability: Option<f64>,
    pub kind: PrecipKind,
}

impl ForecastSlice {
    pub fn minutes_from(now: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
        (at - now).num_minutes()
    }
}

/// Normalize a 0-1 probability fraction to the 0-100 scale, clamped.
pub fn fraction_to_percent(fraction: f64) -> f64 {
    (fraction * 100.0).clamp(0.0, 100.0)
}

/// Convert an accumulation bucket spanning `hours` to an hourly rate.
pub fn accumulation_to_hourly(total_mm: f64, hours: f64) -> f64 {
    if hours > 0.0 { total_mm / hours } else { 0.0 }
}

/// Convert a per-minute accumulation to an hourly rate.
pub fn per_minute_to_hourly(mm_per_minute: f64) -> f64 {
    mm_per_minute * 60.0
}
