use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::ProviderError,
    model::{Coordinate, ForecastSlice, Nowcast, PrecipKind},
    provider::{MEMO_TTL, Memo, USER_AGENT, WeatherProvider, truncate_body, unix_to_utc},
};

const PROVIDER: &str = "accuweather";
const DEFAULT_BASE_URL: &str = "https://dataservice.accuweather.com";

/// A location key identifies a place for the rest of the API and changes
/// essentially never; memoize it for a day.
const LOCATION_KEY_TTL: std::time::Duration = std::time::Duration::from_secs(86_400);

/// AccuWeather adapter. Requires a geoposition lookup to obtain the
/// location key before conditions can be queried; the key is memoized so
/// the extra round-trip is paid once. Hourly forecast liquid totals are
/// per-hour mm, probabilities are percentages.
#[derive(Debug)]
pub struct AccuWeatherProvider {
    api_key: String,
    coordinate: Coordinate,
    timeout: std::time::Duration,
    base_url: String,
    http: Client,
    location_key: Memo<String>,
    current_memo: Memo<Vec<AwCurrent>>,
    forecast_memo: Memo<Vec<AwHour>>,
}

impl AccuWeatherProvider {
    pub fn new(api_key: String, coordinate: Coordinate, timeout: std::time::Duration) -> Self {
        Self {
            api_key,
            coordinate,
            timeout,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::new(),
            location_key: Memo::new(LOCATION_KEY_TTL),
            current_memo: Memo::new(MEMO_TTL),
            forecast_memo: Memo::new(MEMO_TTL),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        extra: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let mut query = vec![("apikey", self.api_key.clone())];
        query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        let res = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&query)
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
            detail: format!("payload: {e}"),
        })
    }

    async fn resolve_location_key(&self) -> Result<String, ProviderError> {
        self.location_key
            .get_or_refresh(|| async {
                let url =
                    format!("{}/locations/v1/cities/geoposition/search", self.base_url);
                let q = format!("{},{}", self.coordinate.latitude, self.coordinate.longitude);
                let loc: AwLocation = self.get_json(url, &[("q", q)]).await?;
                Ok(loc.key)
            })
            .await
    }
}

/// AccuWeather names its types directly; fall back to the free-text
/// condition phrase when the field is absent.
fn classify(precip_type: Option<&str>, phrase: Option<&str>, rate_mm_h: f64) -> PrecipKind {
    match precip_type {
        Some("Rain") => return PrecipKind::Rain,
        Some("Snow") => return PrecipKind::Snow,
        Some("Ice") | Some("Mixed") => return PrecipKind::Sleet,
        _ => {}
    }

    let mapped = phrase.map(PrecipKind::from_condition).unwrap_or_default();
    if mapped.is_precipitating() {
        mapped
    } else if rate_mm_h > 0.0 {
        PrecipKind::Rain
    } else {
        PrecipKind::None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AwLocation {
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AwMetricValue {
    #[serde(rename = "Value")]
    value: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct AwUnitPair {
    #[serde(rename = "Metric")]
    metric: AwMetricValue,
}

#[derive(Debug, Clone, Deserialize)]
struct AwPrecipSummary {
    #[serde(rename = "PastHour")]
    past_hour: Option<AwUnitPair>,
}

#[derive(Debug, Clone, Deserialize)]
struct AwCurrent {
    #[serde(rename = "EpochTime")]
    epoch_time: i64,
    #[serde(rename = "WeatherText")]
    weather_text: Option<String>,
    #[serde(rename = "PrecipitationType")]
    precipitation_type: Option<String>,
    #[serde(rename = "Temperature")]
    temperature: Option<AwUnitPair>,
    #[serde(rename = "PrecipitationSummary")]
    precipitation_summary: Option<AwPrecipSummary>,
}

#[derive(Debug, Clone, Deserialize)]
struct AwHour {
    #[serde(rename = "EpochDateTime")]
    epoch_date_time: i64,
    #[serde(rename = "IconPhrase")]
    icon_phrase: Option<String>,
    #[serde(rename = "PrecipitationType")]
    precipitation_type: Option<String>,
    #[serde(rename = "PrecipitationProbability")]
    precipitation_probability: Option<f64>,
    #[serde(rename = "TotalLiquid")]
    total_liquid: Option<AwMetricValue>,
}

#[async_trait]
impl WeatherProvider for AccuWeatherProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn nowcast(&self) -> Result<Nowcast, ProviderError> {
        let key = self.resolve_location_key().await?;
        let observations = self
            .current_memo
            .get_or_refresh(|| async {
                let url = format!("{}/currentconditions/v1/{key}", self.base_url);
                self.get_json::<Vec<AwCurrent>>(url, &[("details", "true".to_string())]).await
            })
            .await?;

        let current = observations.first().ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER,
            detail: "empty current conditions array".to_string(),
        })?;

        let rate = current
            .precipitation_summary
            .as_ref()
            .and_then(|s| s.past_hour.as_ref())
            .map(|p| p.metric.value)
            .unwrap_or(0.0);

        Ok(Nowcast {
            observed_at: unix_to_utc(current.epoch_time).unwrap_or_else(Utc::now),
            provider: PROVIDER.to_string(),
            rate_mm_h: rate,
            probability: None,
            kind: classify(
                current.precipitation_type.as_deref(),
                current.weather_text.as_deref(),
                rate,
            ),
            temperature_c: current.temperature.as_ref().map(|t| t.metric.value),
        })
    }

    async fn forecast(&self, lookahead_minutes: u32) -> Result<Vec<ForecastSlice>, ProviderError> {
        let key = self.resolve_location_key().await?;
        let hours = self
            .forecast_memo
            .get_or_refresh(|| async {
                let url = format!("{}/forecasts/v1/hourly/12hour/{key}", self.base_url);
                self.get_json::<Vec<AwHour>>(
                    url,
                    &[("details", "true".to_string()), ("metric", "true".to_string())],
                )
                .await
            })
            .await?;

        let now = Utc::now();
        let horizon = now + chrono::Duration::minutes(i64::from(lookahead_minutes));

        let mut slices: Vec<ForecastSlice> = hours
            .iter()
            .filter_map(|hour| {
                let at = unix_to_utc(hour.epoch_date_time)?;
                if at > horizon {
                    return None;
                }

                let rate = hour.total_liquid.as_ref().map(|l| l.value).unwrap_or(0.0);
                Some(ForecastSlice {
                    at,
                    minutes_out: ForecastSlice::minutes_from(now, at),
                    provider: PROVIDER.to_string(),
                    rate_mm_h: rate,
                    probability: hour.precipitation_probability,
                    kind: classify(
                        hour.precipitation_type.as_deref(),
                        hour.icon_phrase.as_deref(),
                        rate,
                    ),
                })
            })
            .collect();

        slices.sort_by_key(|s| s.at);
        Ok(slices)
    }
}
