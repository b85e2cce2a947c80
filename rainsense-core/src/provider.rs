use crate::{
    config::Config,
    error::ProviderError,
    model::{Coordinate, ForecastSlice, Nowcast},
    provider::{
        accuweather::AccuWeatherProvider, openmeteo::OpenMeteoProvider,
        openweather::OpenWeatherProvider, weatherapi::WeatherApiProvider,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{convert::TryFrom, fmt::Debug, future::Future, time::Duration};
use tokio::sync::Mutex;

pub mod accuweather;
pub mod openmeteo;
pub mod openweather;
pub mod weatherapi;

/// Sent with every upstream request so operators can identify the client.
pub(crate) const USER_AGENT: &str = "rainsense/0.1 (precipitation monitor)";

/// Minimum time a provider keeps its most recent raw upstream response
/// around, so a nowcast and a forecast requested in the same tick share
/// one upstream call.
pub(crate) const MEMO_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenMeteo,
    OpenWeather,
    WeatherApi,
    AccuWeather,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenMeteo => "openmeteo",
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
            ProviderId::AccuWeather => "accuweather",
        }
    }

    /// All providers, in default chain priority order.
    pub const fn all() -> &'static [ProviderId] {
        &[
            ProviderId::OpenMeteo,
            ProviderId::OpenWeather,
            ProviderId::WeatherApi,
            ProviderId::AccuWeather,
        ]
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderId::OpenMeteo)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openmeteo" => Ok(ProviderId::OpenMeteo),
            "openweather" => Ok(ProviderId::OpenWeather),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            "accuweather" => Ok(ProviderId::AccuWeather),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: \
                 openmeteo, openweather, weatherapi, accuweather."
            )),
        }
    }
}

/// Uniform contract every upstream adapter satisfies.
///
/// Adapters fail by raising [`ProviderError`], never by returning sentinel
/// values, and normalize units before handing data out: probability on the
/// 0-100 scale, intensity in mm/h, condition vocabulary mapped onto
/// [`crate::model::PrecipKind`].
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn nowcast(&self) -> Result<Nowcast, ProviderError>;

    /// Forecast slices within `lookahead_minutes` of now, ascending by time.
    async fn forecast(&self, lookahead_minutes: u32) -> Result<Vec<ForecastSlice>, ProviderError>;
}

/// Construct a provider from config and explicit ProviderId.
///
/// This is the support check: a provider without its credentials or without
/// a resolved location is reported as unsupported here, once, at chain
/// construction time.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
    location: Option<Coordinate>,
    call_timeout: Duration,
) -> Result<Box<dyn WeatherProvider>, ProviderError> {
    let coordinate = location.ok_or_else(|| ProviderError::Unsupported {
        provider: id.as_str(),
        reason: "no resolved location".to_string(),
    })?;

    let api_key = if id.requires_api_key() {
        let key = config.provider_api_key(id).ok_or_else(|| ProviderError::Unsupported {
            provider: id.as_str(),
            reason: format!(
                "no API key configured (hint: run `rainsense configure {id}`)"
            ),
        })?;
        Some(key.to_owned())
    } else {
        None
    };

    let boxed: Box<dyn WeatherProvider> = match id {
        ProviderId::OpenMeteo => Box::new(OpenMeteoProvider::new(coordinate, call_timeout)),
        ProviderId::OpenWeather => Box::new(OpenWeatherProvider::new(
            api_key.unwrap_or_default(),
            coordinate,
            call_timeout,
        )),
        ProviderId::WeatherApi => Box::new(WeatherApiProvider::new(
            api_key.unwrap_or_default(),
            coordinate,
            call_timeout,
        )),
        ProviderId::AccuWeather => Box::new(AccuWeatherProvider::new(
            api_key.unwrap_or_default(),
            coordinate,
            call_timeout,
        )),
    };

    Ok(boxed)
}

/// All usable providers in priority order: the pinned provider alone when
/// one is configured, otherwise every supported provider in default order.
/// Unsupported providers are skipped with a warning.
pub fn providers_from_config(
    config: &Config,
    location: Option<Coordinate>,
) -> anyhow::Result<Vec<Box<dyn WeatherProvider>>> {
    let call_timeout = config.call_timeout();

    let candidates: Vec<ProviderId> = match config.pinned_provider_id()? {
        Some(id) => vec![id],
        None => ProviderId::all().to_vec(),
    };

    let mut providers = Vec::new();
    for id in candidates {
        match provider_from_config(id, config, location, call_timeout) {
            Ok(p) => providers.push(p),
            Err(err) => tracing::warn!(provider = %id, %err, "skipping provider"),
        }
    }

    Ok(providers)
}

/// Single-slot memo for a provider's most recent raw upstream response.
///
/// Holding the lock across the fetch serializes concurrent refreshes of the
/// same slot, so a burst of callers costs one upstream call.
#[derive(Debug)]
pub(crate) struct Memo<T> {
    ttl: chrono::Duration,
    slot: Mutex<Option<(DateTime<Utc>, T)>>,
}

impl<T: Clone> Memo<T> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            slot: Mutex::new(None),
        }
    }

    pub(crate) async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut slot = self.slot.lock().await;
        let now = Utc::now();

        if let Some((stored_at, value)) = slot.as_ref()
            && now - *stored_at < self.ttl
        {
            return Ok(value.clone());
        }

        let value = fetch().await?;
        *slot = Some((now, value.clone()));
        Ok(value)
    }
}

pub(crate) fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX { format!("{}...", &body[..MAX]) } else { body.to_string() }
}
