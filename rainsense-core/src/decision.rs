use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chain::ProviderChain,
    hysteresis::HysteresisGate,
    model::{ForecastSlice, Nowcast, PrecipKind},
};

/// When a sensor should want to be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Current conditions clear the intensity threshold.
    #[default]
    Now,
    /// A forecast slice within the lookahead clears both thresholds.
    Soon,
    /// Either of the above; used for snow sensors.
    NowOrSoon,
}

/// Which precipitation the sensor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Rain,
    Snow,
}

impl TargetKind {
    /// Sleet counts for both targets: it is freezing rain as much as it is
    /// melting snow.
    pub fn matches(&self, kind: PrecipKind) -> bool {
        match self {
            TargetKind::Rain => matches!(kind, PrecipKind::Rain | PrecipKind::Sleet),
            TargetKind::Snow => matches!(kind, PrecipKind::Snow | PrecipKind::Sleet),
        }
    }
}

/// Configuration of one monitored output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub kind: TargetKind,
    /// Intensity threshold for the now path, mm/h.
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold_mm_h: f64,
    /// Intensity threshold a forecast slice must clear, mm/h.
    #[serde(default = "default_soon_rate_threshold")]
    pub soon_rate_threshold_mm_h: f64,
    /// Probability a forecast slice must clear, 0-100.
    #[serde(default = "default_probability_threshold")]
    pub probability_threshold_pct: f64,
    #[serde(default = "default_lookahead")]
    pub lookahead_minutes: u32,
    #[serde(default = "default_min_on")]
    pub min_on_secs: u64,
    #[serde(default = "default_min_off")]
    pub min_off_secs: u64,
    /// How long a manual toggle pins the output; 0 disables the window.
    #[serde(default = "default_override_minutes")]
    pub override_minutes: u32,
}

fn default_rate_threshold() -> f64 {
    0.1
}
fn default_soon_rate_threshold() -> f64 {
    0.2
}
fn default_probability_threshold() -> f64 {
    40.0
}
fn default_lookahead() -> u32 {
    60
}
fn default_min_on() -> u64 {
    300
}
fn default_min_off() -> u64 {
    600
}
fn default_override_minutes() -> u32 {
    60
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            trigger: TriggerKind::default(),
            kind: TargetKind::default(),
            rate_threshold_mm_h: default_rate_threshold(),
            soon_rate_threshold_mm_h: default_soon_rate_threshold(),
            probability_threshold_pct: default_probability_threshold(),
            lookahead_minutes: default_lookahead(),
            min_on_secs: default_min_on(),
            min_off_secs: default_min_off(),
            override_minutes: default_override_minutes(),
        }
    }
}

/// Daily window during which automatic state changes are suppressed.
/// Wraps midnight when start > end; start == end means never active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    start_minute: u32,
    end_minute: u32,
}

impl QuietWindow {
    pub fn from_hhmm(start: &str, end: &str) -> Result<Self> {
        Ok(Self { start_minute: parse_hhmm(start)?, end_minute: parse_hhmm(end)? })
    }

    pub fn contains(&self, minute_of_day: u32) -> bool {
        let m = minute_of_day % (24 * 60);
        if self.start_minute == self.end_minute {
            false
        } else if self.start_minute < self.end_minute {
            m >= self.start_minute && m < self.end_minute
        } else {
            m >= self.start_minute || m < self.end_minute
        }
    }
}

fn parse_hhmm(s: &str) -> Result<u32> {
    let (hh, mm) = s
        .split_once(':')
        .with_context(|| format!("expected HH:MM, got '{s}'"))?;
    let hours: u32 = hh.trim().parse().with_context(|| format!("bad hour in '{s}'"))?;
    let minutes: u32 = mm.trim().parse().with_context(|| format!("bad minute in '{s}'"))?;
    if hours > 23 || minutes > 59 {
        bail!("time '{s}' out of range");
    }
    Ok(hours * 60 + minutes)
}

/// Read-only values surfaced next to the boolean output.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub last_update: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub rate_mm_h: f64,
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct OverrideState {
    desired: bool,
    expires_at: DateTime<Utc>,
}

/// One monitored output: trigger rule + hysteresis + override/quiet-hour
/// policy, producing a stable boolean and diagnostics.
#[derive(Debug)]
pub struct DecisionEngine {
    config: SensorConfig,
    quiet: Option<QuietWindow>,
    gate: HysteresisGate,
    override_state: Option<OverrideState>,
    active: bool,
    fault: bool,
    diagnostics: Diagnostics,
}

impl DecisionEngine {
    pub fn new(config: SensorConfig, quiet: Option<QuietWindow>) -> Self {
        let gate = HysteresisGate::new(
            Duration::seconds(config.min_on_secs as i64),
            Duration::seconds(config.min_off_secs as i64),
        );
        Self {
            config,
            quiet,
            gate,
            override_state: None,
            active: false,
            fault: false,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_overridden(&self) -> bool {
        self.override_state.is_some()
    }

    pub fn fault(&self) -> bool {
        self.fault
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn mark_fault(&mut self) {
        if !self.fault {
            warn!(sensor = %self.config.name, "entering fault state");
        }
        self.fault = true;
    }

    pub fn clear_fault(&mut self) {
        self.fault = false;
    }

    /// One evaluation cycle against fresh chain data. Returns the stable
    /// output value.
    pub async fn evaluate(
        &mut self,
        nowcast: &Nowcast,
        chain: &ProviderChain,
        now: DateTime<Utc>,
        minute_of_day: u32,
    ) -> bool {
        if let Some(ov) = self.override_state {
            if now < ov.expires_at {
                // Pinned: no trigger evaluation, no hysteresis.
                self.active = ov.desired;
                self.refresh_diagnostics(nowcast, None, now);
                self.fault = false;
                return self.active;
            }

            debug!(sensor = %self.config.name, "manual override expired");
            self.override_state = None;
            self.gate.reset(self.active);
        }

        let (desired, trigger_slice) = self.desired(nowcast, chain, now).await;
        self.refresh_diagnostics(nowcast, trigger_slice.as_ref(), now);
        self.fault = false;

        if let Some(quiet) = &self.quiet
            && quiet.contains(minute_of_day)
        {
            debug!(sensor = %self.config.name, "quiet hours, holding output");
            return self.active;
        }

        let next = self.gate.update(desired, now);
        if next != self.active {
            info!(sensor = %self.config.name, from = self.active, to = next, "output changed");
        }
        self.active = next;
        self.active
    }

    /// Adopt a user-forced value. Starts an override window when one is
    /// configured; always re-bootstraps the gate so the next automatic
    /// cycle is not blocked by a stale dwell timer.
    pub fn manual_toggle(&mut self, desired: bool, now: DateTime<Utc>) {
        info!(sensor = %self.config.name, desired, "manual toggle");
        self.active = desired;
        self.gate.reset(desired);

        self.override_state = if self.config.override_minutes > 0 {
            Some(OverrideState {
                desired,
                expires_at: now + Duration::minutes(i64::from(self.config.override_minutes)),
            })
        } else {
            None
        };
    }

    async fn desired(
        &self,
        nowcast: &Nowcast,
        chain: &ProviderChain,
        now: DateTime<Utc>,
    ) -> (bool, Option<ForecastSlice>) {
        let now_hit = self.config.kind.matches(nowcast.kind)
            && nowcast.rate_mm_h >= self.config.rate_threshold_mm_h;

        match self.config.trigger {
            TriggerKind::Now => (now_hit, None),
            TriggerKind::Soon => self.soon_hit(chain, now).await,
            TriggerKind::NowOrSoon => {
                if now_hit {
                    (true, None)
                } else {
                    self.soon_hit(chain, now).await
                }
            }
        }
    }

    /// First slice in chronological order that clears both thresholds.
    /// A missing upstream probability gates on intensity alone.
    async fn soon_hit(
        &self,
        chain: &ProviderChain,
        now: DateTime<Utc>,
    ) -> (bool, Option<ForecastSlice>) {
        let slices = match chain.forecast_at(now, self.config.lookahead_minutes, false).await {
            Ok(slices) => slices,
            Err(err) => {
                warn!(sensor = %self.config.name, %err, "forecast unavailable this cycle");
                return (false, None);
            }
        };

        let lookahead = i64::from(self.config.lookahead_minutes);
        let hit = slices.into_iter().find(|s| {
            (0..=lookahead).contains(&s.minutes_out)
                && self.config.kind.matches(s.kind)
                && s.rate_mm_h >= self.config.soon_rate_threshold_mm_h
                && s.probability.is_none_or(|p| p >= self.config.probability_threshold_pct)
        });

        (hit.is_some(), hit)
    }

    fn refresh_diagnostics(
        &mut self,
        nowcast: &Nowcast,
        trigger_slice: Option<&ForecastSlice>,
        now: DateTime<Utc>,
    ) {
        self.diagnostics = match trigger_slice {
            Some(slice) => Diagnostics {
                last_update: Some(now),
                provider: Some(slice.provider.clone()),
                rate_mm_h: slice.rate_mm_h,
                probability: slice.probability,
            },
            None => Diagnostics {
                last_update: Some(now),
                provider: Some(nowcast.provider.clone()),
                rate_mm_h: nowcast.rate_mm_h,
                probability: nowcast.probability,
            },
        };
    }
}
