//! Moisture deficit bookkeeping (mm of water a zone is short of target).
//!
//! There is no active loop here; the coordinator calls these helpers from
//! sensor updates, the daily balance tick and final measurements.  Every
//! function returns a deficit clamped at zero.

/// Deficit at or above which a zone needs water even if its moisture sensor
/// looks fine.
pub const DEFICIT_TRIGGER_MM: f64 = 5.0;

/// 1 % of volumetric moisture is treated as roughly 1 mm of water.
pub const MM_PER_MOISTURE_PERCENT: f64 = 1.0;

/// Deficit after a new moisture reading.  Only drops add to the deficit;
/// rises are accounted for by watering outcomes and precipitation.
pub fn apply_moisture_drop(deficit: f64, previous: Option<f64>, current: f64) -> f64 {
    let deficit = clamp(deficit);
    match previous {
        Some(prev) if current < prev => clamp(deficit + (prev - current) * MM_PER_MOISTURE_PERCENT),
        _ => deficit,
    }
}

/// Daily evapotranspiration/precipitation balance.
pub fn apply_daily_balance(deficit: f64, et_mm: f64, precipitation_mm: f64) -> f64 {
    let et = if et_mm.is_finite() { et_mm.max(0.0) } else { 0.0 };
    let rain = if precipitation_mm.is_finite() {
        precipitation_mm.max(0.0)
    } else {
        0.0
    };
    clamp(clamp(deficit) + et - rain)
}

/// Deficit after a finished session.
///
/// Reaching `target` clears the deficit.  Otherwise it shrinks in proportion
/// to how much of the `pre -> target` gap the session closed.
pub fn apply_watering_outcome(deficit: f64, pre: f64, final_moisture: f64, target: f64) -> f64 {
    let deficit = clamp(deficit);
    if final_moisture >= target {
        return 0.0;
    }
    let gap = target - pre;
    if gap <= 0.0 {
        return deficit;
    }
    let closed = ((final_moisture - pre) / gap).clamp(0.0, 1.0);
    clamp(deficit * (1.0 - closed))
}

fn clamp(deficit: f64) -> f64 {
    if deficit.is_finite() {
        deficit.max(0.0)
    } else {
        0.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
