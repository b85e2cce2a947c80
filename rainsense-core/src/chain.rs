use chrono::{DateTime, Utc};
use std::{collections::HashMap, future::Future, sync::Mutex, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{ChainError, ProviderError},
    model::{ForecastSlice, Nowcast},
    provider::WeatherProvider,
};

/// Tuning for a [`ProviderChain`].
#[derive(Debug, Clone)]
pub struct ChainOptions {
    /// How long a successful response stays servable from cache.
    pub cache_ttl: Duration,
    /// Budget for one provider call, raced against the call itself.
    pub call_timeout: Duration,
    /// Waits imposed after consecutive exhausted attempts, in order.
    pub backoff_schedule: Vec<Duration>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            backoff_schedule: [30, 60, 120, 300].map(Duration::from_secs).to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    fn is_valid(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.stored_at < ttl
    }
}

/// Shared failure clock: one schedule index and one next-allowed timestamp
/// covering both the nowcast and forecast paths of a chain.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    index: Option<usize>,
    until: Option<DateTime<Utc>>,
}

impl Backoff {
    /// Remaining wait, if the refusal window is still open.
    pub(crate) fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.until.filter(|until| *until > now).map(|until| {
            (until - now).to_std().unwrap_or_default()
        })
    }

    /// Move one step further into the schedule, saturating at its end.
    pub(crate) fn advance(&mut self, now: DateTime<Utc>, schedule: &[Duration]) {
        if schedule.is_empty() {
            return;
        }
        let next = match self.index {
            None => 0,
            Some(i) => (i + 1).min(schedule.len() - 1),
        };
        self.index = Some(next);
        let wait = chrono::Duration::from_std(schedule[next])
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.until = Some(now + wait);
    }

    /// Any success clears the window and the schedule position.
    pub(crate) fn reset(&mut self) {
        self.index = None;
        self.until = None;
    }
}

#[derive(Debug, Default)]
struct ChainState {
    nowcast: Option<Cached<Nowcast>>,
    forecasts: HashMap<u32, Cached<Vec<ForecastSlice>>>,
    backoff: Backoff,
}

/// Ordered fallback chain over the supported providers.
///
/// Owns its response caches and backoff clock; multiple chains never
/// interfere. Public entry points read the real clock and delegate to
/// `*_at` variants that take `now` explicitly.
pub struct ProviderChain {
    providers: Vec<Box<dyn WeatherProvider>>,
    options: ChainOptions,
    state: Mutex<ChainState>,
}

/// Forecast cache key: lookahead rounded up to the nearest 5 minutes, so
/// near-identical windows share one slot. Minimum 5.
fn round_lookahead(minutes: u32) -> u32 {
    minutes.max(5).div_ceil(5) * 5
}

impl ProviderChain {
    pub fn new(
        providers: Vec<Box<dyn WeatherProvider>>,
        mut options: ChainOptions,
    ) -> Result<Self, ChainError> {
        if providers.is_empty() {
            return Err(ChainError::NoProviders);
        }
        if options.backoff_schedule.is_empty() {
            options.backoff_schedule = ChainOptions::default().backoff_schedule;
        }

        Ok(Self { providers, options, state: Mutex::new(ChainState::default()) })
    }

    /// Ordered provider names for diagnostic display.
    pub fn describe(&self) -> String {
        self.providers.iter().map(|p| p.name()).collect::<Vec<_>>().join(" -> ")
    }

    pub async fn nowcast(&self, force: bool) -> Result<Nowcast, ChainError> {
        self.nowcast_at(Utc::now(), force).await
    }

    pub async fn forecast(
        &self,
        lookahead_minutes: u32,
        force: bool,
    ) -> Result<Vec<ForecastSlice>, ChainError> {
        self.forecast_at(Utc::now(), lookahead_minutes, force).await
    }

    /// Force the same backoff advance a failed attempt would cause. Used by
    /// the scheduler when a structurally successful result turns out to be
    /// unusable.
    pub fn mark_failure(&self) {
        self.mark_failure_at(Utc::now());
    }

    pub(crate) fn mark_failure_at(&self, now: DateTime<Utc>) {
        let mut state = self.lock_state();
        state.backoff.advance(now, &self.options.backoff_schedule);
    }

    pub(crate) async fn nowcast_at(
        &self,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Nowcast, ChainError> {
        {
            let state = self.lock_state();
            let cached = state.nowcast.as_ref().filter(|c| c.is_valid(now, self.ttl()));
            if !force && let Some(c) = cached {
                return Ok(c.value.clone());
            }
            if cached.is_none() && let Some(retry_in) = state.backoff.remaining(now) {
                return Err(ChainError::BackoffActive { retry_in });
            }
        }

        match self.try_each(|p| p.nowcast()).await {
            Ok(value) => {
                let mut state = self.lock_state();
                state.backoff.reset();
                state.nowcast = Some(Cached { value: value.clone(), stored_at: now });
                Ok(value)
            }
            Err(last) => {
                let mut state = self.lock_state();
                state.backoff.advance(now, &self.options.backoff_schedule);
                Err(ChainError::Exhausted { last })
            }
        }
    }

    pub(crate) async fn forecast_at(
        &self,
        now: DateTime<Utc>,
        lookahead_minutes: u32,
        force: bool,
    ) -> Result<Vec<ForecastSlice>, ChainError> {
        let key = round_lookahead(lookahead_minutes);

        {
            let state = self.lock_state();
            let cached = state.forecasts.get(&key).filter(|c| c.is_valid(now, self.ttl()));
            if !force && let Some(c) = cached {
                return Ok(c.value.clone());
            }
            if cached.is_none() && let Some(retry_in) = state.backoff.remaining(now) {
                return Err(ChainError::BackoffActive { retry_in });
            }
        }

        match self.try_each(move |p| p.forecast(key)).await {
            Ok(value) => {
                let mut state = self.lock_state();
                state.backoff.reset();
                state.forecasts.insert(key, Cached { value: value.clone(), stored_at: now });
                Ok(value)
            }
            Err(last) => {
                let mut state = self.lock_state();
                state.backoff.advance(now, &self.options.backoff_schedule);
                Err(ChainError::Exhausted { last })
            }
        }
    }

    /// Try every provider in priority order; the first success wins and
    /// earlier failures are only logged. Each call is raced against the
    /// per-call budget.
    async fn try_each<'a, T, F, Fut>(&'a self, call: F) -> Result<T, ProviderError>
    where
        F: Fn(&'a dyn WeatherProvider) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>> + 'a,
    {
        let budget = self.options.call_timeout;
        let mut last: Option<ProviderError> = None;

        for provider in &self.providers {
            let name = provider.name();
            match tokio::time::timeout(budget, call(provider.as_ref())).await {
                Ok(Ok(value)) => {
                    if last.is_some() {
                        debug!(provider = name, "fallback provider succeeded");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    warn!(provider = name, %err, "provider call failed, trying next");
                    last = Some(err);
                }
                Err(_elapsed) => {
                    let err = ProviderError::Timeout { provider: name, budget };
                    warn!(provider = name, %err, "provider call timed out, trying next");
                    last = Some(err);
                }
            }
        }

        match last {
            Some(err) => Err(err),
            // Unreachable: construction rejects an empty provider set.
            None => Err(ProviderError::Unsupported {
                provider: "chain",
                reason: "provider set is empty".to_string(),
            }),
        }
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.options.cache_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        // Poisoning would mean a panic while holding the lock; nothing the
        // chain can recover at that point.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    pub(crate) fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.lock_state().backoff.remaining(now)
    }
}

impl std::fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderChain").field("providers", &self.describe()).finish()
    }
}
