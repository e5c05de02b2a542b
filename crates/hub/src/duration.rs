//! Watering duration math: how many cycles a zone needs, and how to share a
//! limited schedule window between several zones.

use tracing::{debug, info, warn};

use crate::absorption::DEFAULT_ABSORPTION_RATE;

pub const DEFAULT_CYCLE_TIME_MIN: f64 = 15.0;
pub const DEFAULT_TARGET_MOISTURE: f64 = 80.0;

/// Deficit (mm) above which extra watering time is added.
pub const DEFICIT_BONUS_THRESHOLD_MM: f64 = 5.0;
/// Rough conversion: one millimetre of deficit needs this many minutes.
pub const MINUTES_PER_DEFICIT_MM: f64 = 2.5;

/// Wetter soil absorbs more slowly.
pub fn saturation_factor(current_moisture: f64) -> f64 {
    1.0 + 0.5 * (current_moisture / 100.0)
}

/// Extra minutes owed to a zone carrying a significant deficit.
pub fn deficit_bonus_minutes(deficit_mm: f64) -> f64 {
    if deficit_mm > DEFICIT_BONUS_THRESHOLD_MM {
        deficit_mm * MINUTES_PER_DEFICIT_MM
    } else {
        0.0
    }
}

/// Total watering minutes (a whole number of cycles, or zero).
///
/// `max_watering_time` of `Some(0.0)` disables watering; `None` or a negative
/// value means no cap.
pub fn calculate_watering_duration(
    current_moisture: f64,
    target_moisture: f64,
    absorption_rate: f64,
    cycle_time: f64,
    max_watering_time: Option<f64>,
) -> f64 {
    let current = if current_moisture.is_finite() && current_moisture >= 0.0 {
        current_moisture
    } else {
        warn!(current_moisture, "duration: invalid current moisture, using 0");
        0.0
    };
    let target = if target_moisture.is_finite() && target_moisture > 0.0 {
        target_moisture
    } else {
        warn!(target_moisture, "duration: invalid target moisture, using default");
        DEFAULT_TARGET_MOISTURE
    };
    let rate = sanitize_rate(absorption_rate);
    let cycle = sanitize_cycle_time(cycle_time);

    let gap = (target - current).max(0.0);
    if gap <= 0.0 || max_watering_time == Some(0.0) {
        return 0.0;
    }

    let adjusted = (gap / rate * saturation_factor(current)).max(cycle);
    let mut cycles = (adjusted / cycle).ceil();
    let mut total = cycles * cycle;

    if let Some(max) = max_watering_time.filter(|m| *m > 0.0) {
        let max_cycles = (max / cycle).floor().max(1.0);
        if cycles > max_cycles {
            info!(
                max_cycles,
                wanted_cycles = cycles,
                "duration: capping to maximum watering time"
            );
            cycles = max_cycles;
            total = cycles * cycle;
        }
    }

    debug!(
        total_min = total,
        cycles,
        cycle_min = cycle,
        "duration: calculated watering time"
    );
    total
}

// ---------------------------------------------------------------------------
// Multi-zone distribution
// ---------------------------------------------------------------------------

/// What one zone needs, as seen by [`distribute_watering_time`].
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDemand {
    pub current_moisture: f64,
    pub target_moisture: f64,
    pub absorption_rate: f64,
    pub deficit_mm: f64,
}

/// Cycles granted to each zone, index-aligned with `zones`.
///
/// When everything fits, each zone with a moisture gap gets what it needs
/// (at least `min_cycle_count`).  Otherwise every such zone first gets
/// `min_cycle_count` cycles and the remaining minutes are shared in
/// proportion to each zone's requirement, including zones whose only need
/// is a large deficit.  Fractional cycles of a share are
/// dropped, so the grant can fall short of `available_minutes`.
pub fn distribute_watering_time(
    zones: &[ZoneDemand],
    available_minutes: f64,
    cycle_time: f64,
    min_cycle_count: u32,
) -> Vec<u32> {
    let cycle = sanitize_cycle_time(cycle_time);

    let gaps: Vec<f64> = zones
        .iter()
        .map(|z| (z.target_moisture - z.current_moisture).max(0.0))
        .collect();
    let required: Vec<f64> = zones
        .iter()
        .zip(&gaps)
        .map(|(z, gap)| {
            let moisture_time = if *gap > 0.0 {
                gap / sanitize_rate(z.absorption_rate) * saturation_factor(z.current_moisture)
            } else {
                0.0
            };
            moisture_time + deficit_bonus_minutes(z.deficit_mm)
        })
        .collect();
    let total_required: f64 = required.iter().sum();

    if total_required <= available_minutes {
        return gaps
            .iter()
            .zip(&required)
            .map(|(gap, req)| {
                if *gap > 0.0 {
                    min_cycle_count.max((req / cycle).ceil() as u32)
                } else {
                    0
                }
            })
            .collect();
    }

    let mut granted: Vec<u32> = gaps
        .iter()
        .map(|gap| if *gap > 0.0 { min_cycle_count } else { 0 })
        .collect();
    let allocated: f64 = granted.iter().map(|c| *c as f64 * cycle).sum();
    let remaining = available_minutes - allocated;

    if remaining > 0.0 && total_required > 0.0 {
        for (i, req) in required.iter().enumerate() {
            if *req > 0.0 {
                let share = remaining * (req / total_required);
                granted[i] += (share / cycle).floor() as u32;
            }
        }
    }

    debug!(
        zones = zones.len(),
        available_minutes,
        total_required = format!("{total_required:.1}"),
        ?granted,
        "duration: distributed watering time"
    );
    granted
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        warn!(rate, "duration: invalid absorption rate, using default");
        DEFAULT_ABSORPTION_RATE
    }
}

fn sanitize_cycle_time(cycle_time: f64) -> f64 {
    if cycle_time.is_finite() && cycle_time > 0.0 {
        cycle_time
    } else {
        warn!(cycle_time, "duration: invalid cycle time, using default");
        DEFAULT_CYCLE_TIME_MIN
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(current: f64, target: f64, rate: f64, deficit_mm: f64) -> ZoneDemand {
        ZoneDemand {
            current_moisture: current,
            target_moisture: target,
            absorption_rate: rate,
            deficit_mm,
        }
    }

    // -- calculate_watering_duration ----------------------------------------

    #[test]
    fn no_gap_means_no_watering() {
        assert_eq!(calculate_watering_duration(50.0, 50.0, 0.5, 15.0, None), 0.0);
        assert_eq!(calculate_watering_duration(60.0, 50.0, 0.5, 15.0, None), 0.0);
    }

    #[test]
    fn zero_max_time_disables_watering() {
        assert_eq!(calculate_watering_duration(10.0, 50.0, 0.5, 15.0, Some(0.0)), 0.0);
    }

    #[test]
    fn result_is_whole_cycles() {
        // gap 15, 15/0.5 = 30, * 1.05 = 31.5 -> 3 cycles
        assert_eq!(calculate_watering_duration(10.0, 25.0, 0.5, 15.0, None), 45.0);
    }

    #[test]
    fn small_gap_gets_one_full_cycle() {
        // gap 1 -> 2 minutes, floored up to one cycle
        assert_eq!(calculate_watering_duration(24.0, 25.0, 0.5, 15.0, None), 15.0);
    }

    #[test]
    fn capped_by_max_watering_time() {
        let total = calculate_watering_duration(10.0, 50.0, 0.1, 15.0, Some(30.0));
        assert!(total <= 30.0);
        assert_eq!(total, 30.0);
    }

    #[test]
    fn max_time_shorter_than_cycle_still_allows_one_cycle() {
        assert_eq!(calculate_watering_duration(10.0, 50.0, 0.1, 15.0, Some(10.0)), 15.0);
    }

    #[test]
    fn negative_max_time_means_uncapped() {
        let capped = calculate_watering_duration(10.0, 50.0, 0.5, 15.0, Some(-1.0));
        let uncapped = calculate_watering_duration(10.0, 50.0, 0.5, 15.0, None);
        assert_eq!(capped, uncapped);
    }

    #[test]
    fn invalid_inputs_fall_back_to_defaults() {
        // rate 0 -> 0.5, cycle -3 -> 15
        let sanitized = calculate_watering_duration(10.0, 25.0, 0.0, -3.0, None);
        assert_eq!(sanitized, calculate_watering_duration(10.0, 25.0, 0.5, 15.0, None));
        // target 0 -> 80
        let sanitized = calculate_watering_duration(10.0, 0.0, 0.5, 15.0, None);
        assert_eq!(sanitized, calculate_watering_duration(10.0, 80.0, 0.5, 15.0, None));
        // NaN moisture -> 0
        let sanitized = calculate_watering_duration(f64::NAN, 25.0, 0.5, 15.0, None);
        assert_eq!(sanitized, calculate_watering_duration(0.0, 25.0, 0.5, 15.0, None));
    }

    #[test]
    fn output_is_non_negative_multiple_of_cycle() {
        for current in [0.0, 5.0, 12.5, 33.0, 79.0, 95.0] {
            for rate in [0.05, 0.3, 1.0, 4.0] {
                for cycle in [5.0, 10.0, 15.0] {
                    let total = calculate_watering_duration(current, 80.0, rate, cycle, Some(120.0));
                    assert!(total >= 0.0);
                    let cycles = total / cycle;
                    assert!((cycles - cycles.round()).abs() < 1e-9, "{total} vs {cycle}");
                }
            }
        }
    }

    // -- deficit bonus ------------------------------------------------------

    #[test]
    fn deficit_bonus_only_above_threshold() {
        assert_eq!(deficit_bonus_minutes(5.0), 0.0);
        assert_eq!(deficit_bonus_minutes(8.0), 20.0);
    }

    // -- distribute_watering_time -------------------------------------------

    #[test]
    fn enough_time_grants_every_needy_zone() {
        let zones = vec![
            demand(10.0, 25.0, 0.5, 0.0), // 31.5 min -> 3 cycles
            demand(30.0, 25.0, 0.5, 0.0), // no gap
            demand(24.0, 25.0, 0.5, 0.0), // 2.2 min -> min 1 cycle
        ];
        assert_eq!(distribute_watering_time(&zones, 120.0, 15.0, 1), vec![3, 0, 1]);
    }

    #[test]
    fn enough_time_respects_min_cycle_count() {
        let zones = vec![demand(24.0, 25.0, 0.5, 0.0)];
        assert_eq!(distribute_watering_time(&zones, 120.0, 15.0, 2), vec![2]);
    }

    #[test]
    fn deficit_bonus_counts_towards_requirement() {
        // gap 1 -> ~2.2 min, plus 10 mm * 2.5 = 25 min -> 2 cycles
        let zones = vec![demand(24.0, 25.0, 0.5, 10.0)];
        assert_eq!(distribute_watering_time(&zones, 120.0, 15.0, 1), vec![2]);
    }

    #[test]
    fn short_window_shares_time_proportionally() {
        // Required: 31.5 and 94.5 minutes (126 total), only 60 available.
        let zones = vec![demand(10.0, 25.0, 0.5, 0.0), demand(10.0, 55.0, 0.5, 0.0)];
        let granted = distribute_watering_time(&zones, 60.0, 15.0, 1);
        // 30 min left after minimums: 7.5 and 22.5 min -> 0 and 1 extra cycle
        assert_eq!(granted, vec![1, 2]);
    }

    #[test]
    fn short_window_drops_fractional_remainder() {
        let zones = vec![demand(10.0, 25.0, 0.5, 0.0), demand(10.0, 55.0, 0.5, 0.0)];
        let granted = distribute_watering_time(&zones, 60.0, 15.0, 1);
        let used: f64 = granted.iter().map(|c| *c as f64 * 15.0).sum();
        assert!(used <= 60.0);
        assert_eq!(used, 45.0);
    }

    #[test]
    fn short_window_still_grants_minimum_to_every_needy_zone() {
        let zones = vec![
            demand(0.0, 80.0, 0.1, 0.0),
            demand(0.0, 80.0, 0.1, 0.0),
            demand(90.0, 80.0, 0.1, 0.0),
        ];
        let granted = distribute_watering_time(&zones, 10.0, 15.0, 1);
        assert_eq!(granted, vec![1, 1, 0]);
    }

    #[test]
    fn short_window_shares_time_with_deficit_only_zone() {
        // Required: 31.5 min, and 50 min from a 20 mm deficit with no gap.
        let zones = vec![demand(10.0, 25.0, 0.5, 0.0), demand(30.0, 25.0, 0.5, 20.0)];
        let granted = distribute_watering_time(&zones, 60.0, 15.0, 1);
        // 45 min left after the one minimum: ~17.4 and ~27.6 min -> 1 extra each
        assert_eq!(granted, vec![2, 1]);
    }

    #[test]
    fn empty_zone_list() {
        assert!(distribute_watering_time(&[], 60.0, 15.0, 1).is_empty());
    }
}
