use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{chain::ProviderChain, decision::DecisionEngine, model::Nowcast};

/// Drives the polling loop: one nowcast fetch per tick, then sequential
/// evaluation of every output in configuration order. A failed tick faults
/// every output and leaves their last stable values untouched; the chain's
/// backoff clock decides whether the next tick may reach the network.
pub struct Scheduler {
    chain: Arc<ProviderChain>,
    engines: Vec<DecisionEngine>,
    interval: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        chain: Arc<ProviderChain>,
        engines: Vec<DecisionEngine>,
        interval: std::time::Duration,
    ) -> Self {
        Self { chain, engines, interval }
    }

    pub fn engines(&self) -> &[DecisionEngine] {
        &self.engines
    }

    pub fn engine_mut(&mut self, name: &str) -> Option<&mut DecisionEngine> {
        self.engines.iter_mut().find(|e| e.name() == name)
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Poll forever at the configured interval.
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            providers = %self.chain.describe(),
            outputs = self.engines.len(),
            "starting polling loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let minute = minute_of_day(&chrono::Local::now());
            self.tick(now, minute).await;
        }
    }

    /// One polling cycle. Split out with an explicit clock for tests and
    /// for the one-shot CLI path.
    pub async fn tick(&mut self, now: DateTime<Utc>, minute_of_day: u32) {
        match self.chain.nowcast_at(now, false).await {
            Ok(nowcast) if usable(&nowcast) => {
                debug!(
                    provider = %nowcast.provider,
                    rate_mm_h = nowcast.rate_mm_h,
                    kind = %nowcast.kind,
                    "tick"
                );
                for engine in &mut self.engines {
                    engine.evaluate(&nowcast, &self.chain, now, minute_of_day).await;
                }
            }
            Ok(nowcast) => {
                // The call succeeded but the payload is unusable; treat it
                // like a failed attempt so the backoff clock advances.
                warn!(
                    provider = %nowcast.provider,
                    rate_mm_h = nowcast.rate_mm_h,
                    "unusable nowcast, marking chain failure"
                );
                self.chain.mark_failure_at(now);
                for engine in &mut self.engines {
                    engine.mark_fault();
                }
            }
            Err(err) => {
                warn!(%err, "polling cycle failed, outputs hold their last values");
                for engine in &mut self.engines {
                    engine.mark_fault();
                }
            }
        }
    }
}

fn usable(nowcast: &Nowcast) -> bool {
    nowcast.rate_mm_h.is_finite() && nowcast.rate_mm_h >= 0.0
}

/// Minute of day in local wall-clock time, for quiet-hour checks.
pub fn minute_of_day<T: Timelike>(time: &T) -> u32 {
    time.hour() * 60 + time.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainOptions;
    use crate::decision::{SensorConfig, TargetKind, TriggerKind};
    use crate::error::ProviderError;
    use crate::model::{ForecastSlice, PrecipKind};
    use crate::provider::WeatherProvider;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[derive(Debug)]
    struct Scripted {
        rate_mm_h: f64,
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WeatherProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn nowcast(&self) -> Result<Nowcast, ProviderError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Malformed {
                    provider: "scripted",
                    detail: "scripted".into(),
                });
            }
            Ok(Nowcast {
                observed_at: t(0),
                provider: "scripted".to_string(),
                rate_mm_h: self.rate_mm_h,
                probability: Some(80.0),
                kind: if self.rate_mm_h > 0.0 { PrecipKind::Rain } else { PrecipKind::None },
                temperature_c: None,
            })
        }

        async fn forecast(&self, _lookahead: u32) -> Result<Vec<ForecastSlice>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn rain_engine() -> DecisionEngine {
        DecisionEngine::new(
            SensorConfig {
                name: "rain".into(),
                trigger: TriggerKind::Now,
                kind: TargetKind::Rain,
                rate_threshold_mm_h: 0.1,
                min_on_secs: 0,
                min_off_secs: 0,
                ..SensorConfig::default()
            },
            None,
        )
    }

    fn scheduler_with(rate_mm_h: f64) -> (Scheduler, Arc<AtomicBool>) {
        let failing = Arc::new(AtomicBool::new(false));
        let provider = Scripted { rate_mm_h, failing: Arc::clone(&failing) };
        let options = ChainOptions {
            cache_ttl: std::time::Duration::from_secs(1),
            ..ChainOptions::default()
        };
        let chain =
            Arc::new(ProviderChain::new(vec![Box::new(provider)], options).expect("chain"));
        let scheduler =
            Scheduler::new(chain, vec![rain_engine()], std::time::Duration::from_secs(180));
        (scheduler, failing)
    }

    #[test]
    fn minute_of_day_from_wall_clock() {
        let noon = chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert_eq!(minute_of_day(&noon), 720);
        let late = chrono::NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        assert_eq!(minute_of_day(&late), 1410);
    }

    #[tokio::test]
    async fn successful_tick_updates_outputs() {
        let (mut scheduler, _) = scheduler_with(0.5);

        scheduler.tick(t(0), 720).await;
        assert!(scheduler.engines()[0].is_active());
        assert!(!scheduler.engines()[0].fault());
    }

    #[tokio::test]
    async fn failed_tick_faults_outputs_and_holds_values() {
        let (mut scheduler, failing) = scheduler_with(0.5);

        scheduler.tick(t(0), 720).await;
        assert!(scheduler.engines()[0].is_active());

        failing.store(true, Ordering::SeqCst);
        scheduler.tick(t(10), 720).await;
        let engine = &scheduler.engines()[0];
        assert!(engine.fault());
        assert!(engine.is_active(), "last stable value is held");
    }

    #[tokio::test]
    async fn recovery_clears_the_fault() {
        let (mut scheduler, failing) = scheduler_with(0.5);

        failing.store(true, Ordering::SeqCst);
        scheduler.tick(t(0), 720).await;
        assert!(scheduler.engines()[0].fault());

        // Past the first backoff window the chain retries and recovers.
        failing.store(false, Ordering::SeqCst);
        scheduler.tick(t(31), 720).await;
        assert!(!scheduler.engines()[0].fault());
        assert!(scheduler.engines()[0].is_active());
    }

    #[tokio::test]
    async fn unusable_nowcast_advances_backoff_and_faults() {
        let (mut scheduler, _) = scheduler_with(f64::NAN);

        scheduler.tick(t(0), 720).await;
        assert!(scheduler.engines()[0].fault());
        assert!(scheduler.chain().backoff_remaining(t(0)).is_some());
    }
}
