//! Weather feed as seen by the controller: the latest forecast message plus
//! the thresholds that turn it into rain/freeze decisions.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Payload of `weather/forecast`.  Every field is optional; a missing value
/// never triggers a skip on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    #[serde(default)]
    pub forecast_rain_mm: Option<f64>,
    #[serde(default)]
    pub min_forecast_temp: Option<f64>,
    #[serde(default)]
    pub daily_et_mm: Option<f64>,
    #[serde(default)]
    pub daily_precipitation_mm: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct WeatherFeed {
    forecast: Option<Forecast>,
    received_at: Option<OffsetDateTime>,
}

impl WeatherFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, forecast: Forecast, at: OffsetDateTime) {
        self.forecast = Some(forecast);
        self.received_at = Some(at);
    }

    pub fn received_at(&self) -> Option<OffsetDateTime> {
        self.received_at
    }

    /// Forecast rain, or the rain gauge, at or above the threshold.
    pub fn rain_forecasted(&self, threshold_mm: f64, rain_sensor: Option<f64>) -> bool {
        let forecast = self
            .forecast
            .as_ref()
            .and_then(|f| finite(f.forecast_rain_mm))
            .is_some_and(|mm| mm >= threshold_mm);
        let gauge = rain_sensor.is_some_and(|mm| mm.is_finite() && mm >= threshold_mm);
        forecast || gauge
    }

    pub fn freezing_forecasted(&self, freeze_threshold: f64) -> bool {
        self.forecast
            .as_ref()
            .and_then(|f| finite(f.min_forecast_temp))
            .is_some_and(|t| t <= freeze_threshold)
    }

    pub fn daily_et(&self) -> f64 {
        self.forecast
            .as_ref()
            .and_then(|f| finite(f.daily_et_mm))
            .unwrap_or(0.0)
            .max(0.0)
    }

    pub fn daily_precipitation(&self) -> f64 {
        self.forecast
            .as_ref()
            .and_then(|f| finite(f.daily_precipitation_mm))
            .unwrap_or(0.0)
            .max(0.0)
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|v| v.is_finite())
}

// ===========================================================================
// Tests
// ===========================================================================
