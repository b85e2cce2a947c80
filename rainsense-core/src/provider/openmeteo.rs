use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::ProviderError,
    model::{Coordinate, ForecastSlice, Nowcast, PrecipKind, accumulation_to_hourly},
    provider::{MEMO_TTL, Memo, USER_AGENT, WeatherProvider, truncate_body, unix_to_utc},
};

const PROVIDER: &str = "openmeteo";
const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com";

/// Open-Meteo adapter. Keyless; one request carries current conditions,
/// 15-minutely precipitation and hourly probabilities, so nowcast and
/// forecast share a single memoized upstream response.
///
/// Precipitation arrives as 15-minute accumulations and is scaled to mm/h;
/// probabilities are already percentages; conditions are WMO codes.
#[derive(Debug)]
pub struct OpenMeteoProvider {
    coordinate: Coordinate,
    timeout: std::time::Duration,
    base_url: String,
    http: Client,
    memo: Memo<OmResponse>,
}

impl OpenMeteoProvider {
    pub fn new(coordinate: Coordinate, timeout: std::time::Duration) -> Self {
        Self {
            coordinate,
            timeout,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::new(),
            memo: Memo::new(MEMO_TTL),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch(&self) -> Result<OmResponse, ProviderError> {
        let url = format!("{}/v1/forecast", self.base_url);

        let res = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("latitude", self.coordinate.latitude.to_string()),
                ("longitude", self.coordinate.longitude.to_string()),
                ("current", "temperature_2m,precipitation,weather_code".to_string()),
                ("minutely_15", "precipitation".to_string()),
                ("hourly", "precipitation_probability,weather_code".to_string()),
                ("forecast_days", "2".to_string()),
                ("timeformat", "unixtime".to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: PROVIDER, source })?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|source| ProviderError::Http { provider: PROVIDER, source })?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status,
                body: truncate_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::Malformed {
            provider: PROVIDER,
            detail: format!("forecast JSON: {e}"),
        })
    }
}

/// WMO weather interpretation codes, reduced to the precipitation kinds the
/// decision engine distinguishes.
fn kind_from_wmo(code: i32) -> PrecipKind {
    match code {
        51..=55 | 61 | 63 | 65 | 80..=82 | 95 | 96 | 99 => PrecipKind::Rain,
        56 | 57 | 66 | 67 => PrecipKind::Sleet,
        71..=75 | 77 | 85 | 86 => PrecipKind::Snow,
        _ => PrecipKind::None,
    }
}

fn classify(code: Option<i32>, rate_mm_h: f64) -> PrecipKind {
    let mapped = code.map(kind_from_wmo).unwrap_or_default();
    if mapped.is_precipitating() {
        mapped
    } else if rate_mm_h > 0.0 {
        PrecipKind::Rain
    } else {
        PrecipKind::None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OmCurrent {
    time: i64,
    temperature_2m: Option<f64>,
    /// Accumulation over the current 15-minute period, in mm.
    precipitation: Option<f64>,
    weather_code: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
struct OmMinutely {
    time: Vec<i64>,
    precipitation: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct OmHourly {
    time: Vec<i64>,
    precipitation_probability: Option<Vec<f64>>,
    weather_code: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Deserialize)]
struct OmResponse {
    current: Option<OmCurrent>,
    minutely_15: Option<OmMinutely>,
    hourly: Option<OmHourly>,
}

impl OmResponse {
    /// Index of the hourly bucket containing `ts`, if any.
    fn hour_index(&self, ts: i64) -> Option<usize> {
        let hourly = self.hourly.as_ref()?;
        hourly.time.iter().rposition(|t| *t <= ts)
    }

    fn hourly_probability(&self, ts: i64) -> Option<f64> {
        let idx = self.hour_index(ts)?;
        self.hourly.as_ref()?.precipitation_probability.as_ref()?.get(idx).copied()
    }

    fn hourly_code(&self, ts: i64) -> Option<i32> {
        let idx = self.hour_index(ts)?;
        self.hourly.as_ref()?.weather_code.as_ref()?.get(idx).copied()
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn nowcast(&self) -> Result<Nowcast, ProviderError> {
        let parsed = self.memo.get_or_refresh(|| self.fetch()).await?;

        let current = parsed.current.as_ref().ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER,
            detail: "response is missing the 'current' block".to_string(),
        })?;

        let rate = accumulation_to_hourly(current.precipitation.unwrap_or(0.0), 0.25);

        Ok(Nowcast {
            observed_at: unix_to_utc(current.time).unwrap_or_else(Utc::now),
            provider: PROVIDER.to_string(),
            rate_mm_h: rate,
            probability: parsed.hourly_probability(current.time),
            kind: classify(current.weather_code, rate),
            temperature_c: current.temperature_2m,
        })
    }

    async fn forecast(&self, lookahead_minutes: u32) -> Result<Vec<ForecastSlice>, ProviderError> {
        let parsed = self.memo.get_or_refresh(|| self.fetch()).await?;

        let minutely = parsed.minutely_15.as_ref().ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER,
            detail: "response is missing the 'minutely_15' block".to_string(),
        })?;

        let now = Utc::now();
        let horizon = now + chrono::Duration::minutes(i64::from(lookahead_minutes));

        let mut slices: Vec<ForecastSlice> = minutely
            .time
            .iter()
            .zip(minutely.precipitation.iter())
            .filter_map(|(ts, mm)| {
                let at = unix_to_utc(*ts)?;
                if at < now || at > horizon {
                    return None;
                }

                let rate = accumulation_to_hourly(*mm, 0.25);
                Some(ForecastSlice {
                    at,
                    minutes_out: ForecastSlice::minutes_from(now, at),
                    provider: PROVIDER.to_string(),
                    rate_mm_h: rate,
                    probability: parsed.hourly_probability(*ts),
                    kind: classify(parsed.hourly_code(*ts), rate),
                })
            })
            .collect();

        slices.sort_by_key(|s| s.at);
        Ok(slices)
    }
}
