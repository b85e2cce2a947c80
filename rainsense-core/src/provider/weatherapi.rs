use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::ProviderError,
    model::{Coordinate, ForecastSlice, Nowcast, PrecipKind},
    provider::{MEMO_TTL, Memo, USER_AGENT, WeatherProvider, truncate_body, unix_to_utc},
};

const PROVIDER: &str = "weatherapi";
const DEFAULT_BASE_URL: &str = "https://api.weatherapi.com/v1";

/// WeatherAPI.com adapter. `precip_mm` is already an hourly amount;
/// `chance_of_rain`/`chance_of_snow` are percentages.
#[derive(Debug)]
pub struct WeatherApiProvider {
    api_key: String,
    coordinate: Coordinate,
    timeout: std::time::Duration,
    base_url: String,
    http: Client,
    current_memo: Memo<WaCurrentResponse>,
    forecast_memo: Memo<WaForecastResponse>,
}

impl WeatherApiProvider {
    pub fn new(api_key: String, coordinate: Coordinate, timeout: std::time::Duration) -> Self {
        Self {
            api_key,
            coordinate,
            timeout,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::new(),
            current_memo: Memo::new(MEMO_TTL),
            forecast_memo: Memo::new(MEMO_TTL),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn location_query(&self) -> String {
        format!("{},{}", self.coordinate.latitude, self.coordinate.longitude)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        extra: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{endpoint}", self.base_url);

        let mut query = vec![("key", self.api_key.clone()), ("q", self.location_query())];
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
            detail: format!("{endpoint} JSON: {e}"),
        })
    }
}

fn classify(condition: &WaCondition, rate_mm_h: f64) -> PrecipKind {
    let mapped = PrecipKind::from_condition(&condition.text);
    if mapped.is_precipitating() {
        mapped
    } else if rate_mm_h > 0.0 {
        PrecipKind::Rain
    } else {
        PrecipKind::None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WaCondition {
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WaCurrent {
    temp_c: f64,
    precip_mm: f64,
    condition: WaCondition,
    last_updated_epoch: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct WaCurrentResponse {
    current: WaCurrent,
}

#[derive(Debug, Clone, Deserialize)]
struct WaForecastHour {
    time_epoch: i64,
    precip_mm: f64,
    chance_of_rain: Option<f64>,
    chance_of_snow: Option<f64>,
    condition: WaCondition,
}

#[derive(Debug, Clone, Deserialize)]
struct WaForecastDay {
    hour: Vec<WaForecastHour>,
}

#[derive(Debug, Clone, Deserialize)]
struct WaForecast {
    forecastday: Vec<WaForecastDay>,
}

#[derive(Debug, Clone, Deserialize)]
struct WaForecastResponse {
    forecast: WaForecast,
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn nowcast(&self) -> Result<Nowcast, ProviderError> {
        let parsed = self
            .current_memo
            .get_or_refresh(|| async {
                self.get_json::<WaCurrentResponse>("current.json", &[]).await
            })
            .await?;

        let current = parsed.current;
        Ok(Nowcast {
            observed_at: current
                .last_updated_epoch
                .and_then(unix_to_utc)
                .unwrap_or_else(Utc::now),
            provider: PROVIDER.to_string(),
            rate_mm_h: current.precip_mm,
            probability: None,
            kind: classify(&current.condition, current.precip_mm),
            temperature_c: Some(current.temp_c),
        })
    }

    async fn forecast(&self, lookahead_minutes: u32) -> Result<Vec<ForecastSlice>, ProviderError> {
        // Two days of hourly data covers any lookahead the chain accepts,
        // including windows that span midnight.
        let parsed = self
            .forecast_memo
            .get_or_refresh(|| async {
                self.get_json::<WaForecastResponse>("forecast.json", &[("days", "2".to_string())])
                    .await
            })
            .await?;

        let now = Utc::now();
        let horizon = now + chrono::Duration::minutes(i64::from(lookahead_minutes));

        let mut slices: Vec<ForecastSlice> = parsed
            .forecast
            .forecastday
            .iter()
            .flat_map(|day| day.hour.iter())
            .filter_map(|hour| {
                let at = unix_to_utc(hour.time_epoch)?;
                if at > horizon {
                    return None;
                }

                let probability = match (hour.chance_of_rain, hour.chance_of_snow) {
                    (None, None) => None,
                    (rain, snow) => Some(rain.unwrap_or(0.0).max(snow.unwrap_or(0.0))),
                };

                Some(ForecastSlice {
                    at,
                    minutes_out: ForecastSlice::minutes_from(now, at),
                    provider: PROVIDER.to_string(),
                    rate_mm_h: hour.precip_mm,
                    probability,
                    kind: classify(&hour.condition, hour.precip_mm),
                })
            })
            .collect();

        slices.sort_by_key(|s| s.at);
        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> WeatherApiProvider {
        WeatherApiProvider::new(
            "KEY".into(),
            Coordinate::new(40.0, -73.0).unwrap(),
            Duration::from_secs(5),
        )
        .with_base_url(base_url)
    }

    #[test]
    fn condition_text_drives_kind() {
        let cond = WaCondition { text: "Patchy light snow".into() };
        assert_eq!(classify(&cond, 0.4), PrecipKind::Snow);

        let cond = WaCondition { text: "Clear".into() };
        assert_eq!(classify(&cond, 0.0), PrecipKind::None);
        // Measured precipitation without a matching condition still counts.
        assert_eq!(classify(&cond, 0.3), PrecipKind::Rain);
    }

    #[tokio::test]
    async fn nowcast_reads_current_conditions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/current.json"))
            .and(query_param("q", "40,-73"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"current": {
                    "temp_c": 11.0,
                    "precip_mm": 0.8,
                    "condition": {"text": "Moderate rain"},
                    "last_updated_epoch": 1700000000
                }}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let nc = provider(&server.uri()).nowcast().await.expect("nowcast");
        assert_eq!(nc.kind, PrecipKind::Rain);
        assert_eq!(nc.rate_mm_h, 0.8);
        assert_eq!(nc.temperature_c, Some(11.0));
    }

    #[tokio::test]
    async fn forecast_takes_max_of_rain_and_snow_chance() {
        let server = MockServer::start().await;
        let soon = Utc::now().timestamp() + 20 * 60;
        let body = format!(
            r#"{{"forecast": {{"forecastday": [{{"hour": [
                {{"time_epoch": {soon},
                  "precip_mm": 0.5,
                  "chance_of_rain": 20,
                  "chance_of_snow": 70,
                  "condition": {{"text": "Light snow"}}}}
            ]}}]}}}}"#
        );
        Mock::given(method("GET"))
            .and(path("/forecast.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let slices = provider(&server.uri()).forecast(60).await.expect("forecast");
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].probability, Some(70.0));
        assert_eq!(slices[0].kind, PrecipKind::Snow);
    }

    #[tokio::test]
    async fn non_2xx_raises_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/current.json"))
            .respond_with(ResponseTemplate::new(403).set_body_string("key disabled"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).nowcast().await.unwrap_err();
        assert!(matches!(err, ProviderError::Status { .. }));
    }
}
