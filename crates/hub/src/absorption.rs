//! Per-zone soil absorption learner.
//!
//! Every completed watering session yields one sample: how many moisture
//! percentage points the zone gained per minute of watering.  The learned
//! rate is an exponentially weighted average that favours recent sessions.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Rate used until the zone has produced any usable samples (%/min).
pub const DEFAULT_ABSORPTION_RATE: f64 = 0.5;

/// Anything faster than this is treated as a sensor spike (%/min).
pub const MAX_VALID_RATE: f64 = 5.0;

const MAX_SAMPLES: usize = 100;
const RETENTION_DAYS: i64 = 30;
const RECENT_DAYS: i64 = 7;
const SMOOTHING_ALPHA: f64 = 0.3;
const FULL_CONFIDENCE_POINTS: f64 = 20.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AbsorptionSample {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub pre_moisture: f64,
    pub post_moisture: f64,
    pub duration_min: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnerStats {
    pub count: usize,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub avg_rate: Option<f64>,
    pub current_rate: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AbsorptionLearner {
    samples: Vec<AbsorptionSample>,
    default_rate: f64,
    max_valid_rate: f64,
}

impl Default for AbsorptionLearner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Learning
// ---------------------------------------------------------------------------

impl AbsorptionLearner {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            default_rate: DEFAULT_ABSORPTION_RATE,
            max_valid_rate: MAX_VALID_RATE,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Record one watering outcome.  Returns whether the sample was kept.
    pub fn add_data_point(&mut self, pre: f64, post: f64, duration_min: f64) -> bool {
        self.add_data_point_at(OffsetDateTime::now_utc(), pre, post, duration_min)
    }

    pub fn add_data_point_at(
        &mut self,
        at: OffsetDateTime,
        pre: f64,
        post: f64,
        duration_min: f64,
    ) -> bool {
        if duration_min.is_nan() || duration_min <= 0.0 {
            warn!(duration_min, "absorption: non-positive duration, sample ignored");
            return false;
        }

        let rate = (post - pre) / duration_min;
        if !rate.is_finite() || rate <= 0.0 {
            debug!(rate = format!("{rate:.4}"), "absorption: moisture did not rise, sample ignored");
            return false;
        }
        if rate > self.max_valid_rate {
            debug!(
                rate = format!("{rate:.4}"),
                max = self.max_valid_rate,
                "absorption: implausible rate, sample ignored"
            );
            return false;
        }

        self.samples.push(AbsorptionSample {
            at,
            pre_moisture: pre,
            post_moisture: post,
            duration_min,
            rate,
        });
        if self.samples.len() > MAX_SAMPLES {
            let excess = self.samples.len() - MAX_SAMPLES;
            self.samples.drain(..excess);
        }

        debug!(
            gain = format!("{:.2}", post - pre),
            duration_min,
            rate = format!("{rate:.4}"),
            "absorption: sample recorded"
        );
        true
    }

    /// Learned rate in %/min.
    pub fn get_rate(&mut self) -> f64 {
        self.get_rate_at(OffsetDateTime::now_utc())
    }

    pub fn get_rate_at(&mut self, now: OffsetDateTime) -> f64 {
        self.prune(now);
        if self.samples.is_empty() {
            return self.default_rate;
        }

        let mut ordered: Vec<&AbsorptionSample> = self.samples.iter().collect();
        ordered.sort_by_key(|s| s.at);

        // Newest sample weighs 1, each older one decays by exp(-alpha).
        let newest = (ordered.len() - 1) as f64;
        let (weighted, total) = ordered
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(weighted, total), (i, s)| {
                let w = (SMOOTHING_ALPHA * (i as f64 - newest)).exp();
                (weighted + s.rate * w, total + w)
            });

        if total > 0.0 {
            weighted / total
        } else {
            self.default_rate
        }
    }

    /// Confidence in [0, 1]; samples from the last week count twice.
    pub fn get_confidence(&self) -> f64 {
        self.get_confidence_at(OffsetDateTime::now_utc())
    }

    pub fn get_confidence_at(&self, now: OffsetDateTime) -> f64 {
        let retained = now - Duration::days(RETENTION_DAYS);
        let recent = now - Duration::days(RECENT_DAYS);

        let effective: usize = self
            .samples
            .iter()
            .filter(|s| s.at >= retained)
            .map(|s| if s.at >= recent { 2 } else { 1 })
            .sum();

        (effective as f64 / FULL_CONFIDENCE_POINTS).min(1.0)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn statistics(&mut self) -> LearnerStats {
        let now = OffsetDateTime::now_utc();
        let current_rate = self.get_rate_at(now);
        let confidence = self.get_confidence_at(now);

        let count = self.samples.len();
        let rates = self.samples.iter().map(|s| s.rate);
        let (min_rate, max_rate, avg_rate) = if count == 0 {
            (None, None, None)
        } else {
            (
                rates.clone().reduce(f64::min),
                rates.clone().reduce(f64::max),
                Some(rates.sum::<f64>() / count as f64),
            )
        };

        LearnerStats {
            count,
            min_rate,
            max_rate,
            avg_rate,
            current_rate,
            confidence,
        }
    }

    fn prune(&mut self, now: OffsetDateTime) {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        self.samples.retain(|s| s.at >= cutoff);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // -- add_data_point -----------------------------------------------------

    #[test]
    fn positive_gain_is_learned() {
        let mut learner = AbsorptionLearner::new();
        assert!(learner.add_data_point(20.0, 25.0, 30.0));
        let rate = learner.get_rate();
        assert!(approx(rate, 5.0 / 30.0), "got {rate}");
        assert!(rate > 0.0);
    }

    #[test]
    fn negative_gain_is_rejected() {
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point(20.0, 25.0, 30.0);
        assert!(!learner.add_data_point(25.0, 20.0, 30.0));
        assert_eq!(learner.len(), 1);
    }

    #[test]
    fn unchanged_moisture_is_rejected() {
        let mut learner = AbsorptionLearner::new();
        assert!(!learner.add_data_point(25.0, 25.0, 30.0));
        assert!(learner.is_empty());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut learner = AbsorptionLearner::new();
        assert!(!learner.add_data_point(10.0, 20.0, 0.0));
        assert!(!learner.add_data_point(10.0, 20.0, -5.0));
        assert!(learner.is_empty());
    }

    #[test]
    fn implausible_spike_is_rejected() {
        let mut learner = AbsorptionLearner::new();
        // 60 points in 10 minutes = 6 %/min
        assert!(!learner.add_data_point(10.0, 70.0, 10.0));
        assert!(learner.is_empty());
    }

    #[test]
    fn keeps_only_latest_hundred_samples() {
        let mut learner = AbsorptionLearner::new();
        for i in 0..120 {
            learner.add_data_point(10.0, 10.0 + 1.0 + i as f64 * 0.01, 10.0);
        }
        assert_eq!(learner.len(), 100);
        // The first twenty (smallest) gains were dropped.
        let stats = learner.statistics();
        assert!(stats.min_rate.unwrap() > 0.119);
    }

    // -- get_rate -----------------------------------------------------------

    #[test]
    fn empty_learner_returns_default() {
        let mut learner = AbsorptionLearner::new();
        assert_eq!(learner.get_rate(), DEFAULT_ABSORPTION_RATE);
    }

    #[test]
    fn recent_samples_weigh_more() {
        let now = OffsetDateTime::now_utc();
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point_at(now - Duration::hours(2), 10.0, 11.0, 10.0); // 0.1
        learner.add_data_point_at(now - Duration::hours(1), 10.0, 13.0, 10.0); // 0.3

        let w_old = (-SMOOTHING_ALPHA).exp();
        let expected = (0.1 * w_old + 0.3) / (w_old + 1.0);
        assert!(approx(learner.get_rate_at(now), expected));
        assert!(learner.get_rate_at(now) > 0.2);
    }

    #[test]
    fn weighting_follows_timestamps_not_insertion_order() {
        let now = OffsetDateTime::now_utc();
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point_at(now - Duration::hours(1), 10.0, 13.0, 10.0); // newest 0.3
        learner.add_data_point_at(now - Duration::hours(5), 10.0, 11.0, 10.0); // oldest 0.1
        assert!(learner.get_rate_at(now) > 0.2);
    }

    #[test]
    fn samples_older_than_thirty_days_are_pruned() {
        let now = OffsetDateTime::now_utc();
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point_at(now - Duration::days(31), 10.0, 20.0, 10.0);
        assert_eq!(learner.get_rate_at(now), DEFAULT_ABSORPTION_RATE);
        assert!(learner.is_empty());
    }

    // -- confidence ---------------------------------------------------------

    #[test]
    fn confidence_counts_recent_samples_twice() {
        let now = OffsetDateTime::now_utc();
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point_at(now - Duration::days(1), 10.0, 12.0, 10.0);
        learner.add_data_point_at(now - Duration::days(10), 10.0, 12.0, 10.0);
        // 2 + 1 effective points out of 20
        assert!(approx(learner.get_confidence_at(now), 3.0 / 20.0));
    }

    #[test]
    fn confidence_saturates_at_one() {
        let mut learner = AbsorptionLearner::new();
        for _ in 0..15 {
            learner.add_data_point(10.0, 12.0, 10.0);
        }
        assert_eq!(learner.get_confidence(), 1.0);
    }

    #[test]
    fn confidence_is_zero_without_samples() {
        assert_eq!(AbsorptionLearner::new().get_confidence(), 0.0);
    }

    // -- reset / statistics ---------------------------------------------------

    #[test]
    fn reset_restores_default_rate() {
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point(20.0, 25.0, 30.0);
        learner.reset();
        assert_eq!(learner.get_rate(), DEFAULT_ABSORPTION_RATE);
        assert_eq!(learner.get_confidence(), 0.0);
    }

    #[test]
    fn statistics_summarise_samples() {
        let mut learner = AbsorptionLearner::new();
        learner.add_data_point(10.0, 11.0, 10.0);
        learner.add_data_point(10.0, 13.0, 10.0);
        let stats = learner.statistics();
        assert_eq!(stats.count, 2);
        assert!(approx(stats.min_rate.unwrap(), 0.1));
        assert!(approx(stats.max_rate.unwrap(), 0.3));
        assert!(approx(stats.avg_rate.unwrap(), 0.2));
    }

    #[test]
    fn statistics_of_empty_learner() {
        let stats = AbsorptionLearner::new().statistics();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.min_rate, None);
        assert_eq!(stats.current_rate, DEFAULT_ABSORPTION_RATE);
        assert_eq!(stats.confidence, 0.0);
    }
}
