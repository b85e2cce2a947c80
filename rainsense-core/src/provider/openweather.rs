use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::ProviderError,
    model::{
        Coordinate, ForecastSlice, Nowcast, PrecipKind, accumulation_to_hourly,
        fraction_to_percent,
    },
    provider::{MEMO_TTL, Memo, USER_AGENT, WeatherProvider, truncate_body, unix_to_utc},
};

const PROVIDER: &str = "openweather";
const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

/// OpenWeatherMap adapter: current conditions plus the free 5-day/3-hour
/// forecast. Precipitation arrives as 1-hour or 3-hour accumulation buckets
/// and is normalized to mm/h; `pop` arrives as a 0-1 fraction.
#[derive(Debug)]
pub struct OpenWeatherProvider {
    api_key: String,
    coordinate: Coordinate,
    timeout: std::time::Duration,
    base_url: String,
    http: Client,
    current_memo: Memo<OwCurrentResponse>,
    forecast_memo: Memo<OwForecastResponse>,
}

impl OpenWeatherProvider {
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

    async fn fetch_current(&self) -> Result<OwCurrentResponse, ProviderError> {
        let url = format!("{}/weather", self.base_url);

        let res = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("lat", self.coordinate.latitude.to_string()),
                ("lon", self.coordinate.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
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
            detail: format!("current weather JSON: {e}"),
        })
    }

    async fn fetch_forecast(&self) -> Result<OwForecastResponse, ProviderError> {
        let url = format!("{}/forecast", self.base_url);

        let res = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("lat", self.coordinate.latitude.to_string()),
                ("lon", self.coordinate.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
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

/// Hourly rate from OpenWeather's accumulation buckets, preferring the
/// 1-hour figure when both are present.
fn bucket_rate(bucket: Option<&OwPrecipBucket>) -> f64 {
    match bucket {
        Some(OwPrecipBucket { one_h: Some(mm), .. }) => *mm,
        Some(OwPrecipBucket { three_h: Some(mm), .. }) => accumulation_to_hourly(*mm, 3.0),
        _ => 0.0,
    }
}

fn classify(condition: Option<&OwWeather>, rain_mm_h: f64, snow_mm_h: f64) -> PrecipKind {
    if snow_mm_h > 0.0 {
        return PrecipKind::Snow;
    }
    let mapped = condition.map(|w| PrecipKind::from_condition(&w.description)).unwrap_or_default();
    if mapped.is_precipitating() {
        mapped
    } else if rain_mm_h > 0.0 {
        PrecipKind::Rain
    } else {
        PrecipKind::None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OwMain {
    temp: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct OwWeather {
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OwPrecipBucket {
    #[serde(rename = "1h")]
    one_h: Option<f64>,
    #[serde(rename = "3h")]
    three_h: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct OwCurrentResponse {
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    rain: Option<OwPrecipBucket>,
    snow: Option<OwPrecipBucket>,
}

#[derive(Debug, Clone, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    weather: Vec<OwWeather>,
    /// Probability of precipitation as a 0-1 fraction.
    pop: Option<f64>,
    rain: Option<OwPrecipBucket>,
    snow: Option<OwPrecipBucket>,
}

#[derive(Debug, Clone, Deserialize)]
struct OwForecastResponse {
    list: Vec<OwForecastEntry>,
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn nowcast(&self) -> Result<Nowcast, ProviderError> {
        let parsed = self.current_memo.get_or_refresh(|| self.fetch_current()).await?;

        let rain = bucket_rate(parsed.rain.as_ref());
        let snow = bucket_rate(parsed.snow.as_ref());
        let kind = classify(parsed.weather.first(), rain, snow);

        Ok(Nowcast {
            observed_at: unix_to_utc(parsed.dt).unwrap_or_else(Utc::now),
            provider: PROVIDER.to_string(),
            rate_mm_h: rain.max(snow),
            probability: None,
            kind,
            temperature_c: Some(parsed.main.temp),
        })
    }

    async fn forecast(&self, lookahead_minutes: u32) -> Result<Vec<ForecastSlice>, ProviderError> {
        let parsed = self.forecast_memo.get_or_refresh(|| self.fetch_forecast()).await?;

        let now = Utc::now();
        let horizon = now + chrono::Duration::minutes(i64::from(lookahead_minutes));

        let mut slices: Vec<ForecastSlice> = parsed
            .list
            .iter()
            .filter_map(|entry| {
                let at = unix_to_utc(entry.dt)?;
                if at > horizon {
                    return None;
                }

                let rain = bucket_rate(entry.rain.as_ref());
                let snow = bucket_rate(entry.snow.as_ref());

                Some(ForecastSlice {
                    at,
                    minutes_out: ForecastSlice::minutes_from(now, at),
                    provider: PROVIDER.to_string(),
                    rate_mm_h: rain.max(snow),
                    probability: entry.pop.map(fraction_to_percent),
                    kind: classify(entry.weather.first(), rain, snow),
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

    fn provider(base_url: &str) -> OpenWeatherProvider {
        OpenWeatherProvider::new(
            "KEY".into(),
            Coordinate::new(40.0, -73.0).unwrap(),
            Duration::from_secs(5),
        )
        .with_base_url(base_url)
    }

    #[test]
    fn three_hour_buckets_become_hourly_rates() {
        let bucket = OwPrecipBucket { one_h: None, three_h: Some(3.6) };
        assert!((bucket_rate(Some(&bucket)) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn one_hour_bucket_wins_over_three_hour() {
        let bucket = OwPrecipBucket { one_h: Some(0.5), three_h: Some(9.0) };
        assert_eq!(bucket_rate(Some(&bucket)), 0.5);
    }

    #[test]
    fn snow_bucket_forces_snow_kind() {
        let weather = OwWeather { description: "light rain".into() };
        assert_eq!(classify(Some(&weather), 0.2, 0.1), PrecipKind::Snow);
    }

    #[tokio::test]
    async fn nowcast_parses_and_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(query_param("appid", "KEY"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{
                    "dt": 1700000000,
                    "main": {"temp": 4.5},
                    "weather": [{"description": "light rain"}],
                    "rain": {"3h": 0.9}
                }"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let nc = provider(&server.uri()).nowcast().await.expect("nowcast");
        assert_eq!(nc.provider, "openweather");
        assert_eq!(nc.kind, PrecipKind::Rain);
        assert!((nc.rate_mm_h - 0.3).abs() < 1e-9);
        assert_eq!(nc.probability, None);
        assert_eq!(nc.temperature_c, Some(4.5));
    }

    #[tokio::test]
    async fn forecast_converts_pop_fraction_and_windows() {
        let server = MockServer::start().await;
        let soon = Utc::now().timestamp() + 30 * 60;
        let late = Utc::now().timestamp() + 5 * 3600;
        let body = format!(
            r#"{{"list": [
                {{"dt": {soon}, "weather": [{{"description": "rain"}}], "pop": 0.5, "rain": {{"3h": 0.9}}}},
                {{"dt": {late}, "weather": [{{"description": "rain"}}], "pop": 0.9, "rain": {{"3h": 3.0}}}}
            ]}}"#
        );
        Mock::given(method("GET"))
            .and(path("/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let slices = provider(&server.uri()).forecast(60).await.expect("forecast");
        assert_eq!(slices.len(), 1, "the 5-hour entry is outside the window");
        assert_eq!(slices[0].probability, Some(50.0));
        assert!((slices[0].rate_mm_h - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_2xx_raises_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).nowcast().await.unwrap_err();
        assert!(matches!(err, ProviderError::Status { .. }));
    }

    #[tokio::test]
    async fn malformed_payload_raises() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = provider(&server.uri()).nowcast().await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[tokio::test]
    async fn nowcast_is_memoized_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"dt": 1700000000, "main": {"temp": 1.0}, "weather": []}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider(&server.uri());
        p.nowcast().await.expect("first");
        p.nowcast().await.expect("second served from memo");
    }
}
