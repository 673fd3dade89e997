//! Tariff-shifting pump scheduler.
//!
//! Each hour of the horizon gets a pump count from a blend of normalized
//! demand and how cheap the hour is. The expected network pressure for that
//! count is checked against the pressure floor; hours that would fall below
//! it get extra pumps up to the parallel limit. Hours that still miss the
//! floor keep their modeled pressure so the plan shows the shortfall.

use serde::{Deserialize, Serialize};

use super::{CollaboratorError, EnergyOptimizer, PumpConstraints};
use crate::domain::events::{EnergyPlan, PumpStep};
use crate::domain::TariffUpdate;

/// Rolling window of recent demand readings used as an hourly forecast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemandProfile {
    readings: Vec<f64>,
}

impl DemandProfile {
    /// Readings kept for the forecast
    pub const CAPACITY: usize = 24;

    pub fn observe(&mut self, demand_lps: f64) {
        if !demand_lps.is_finite() {
            return;
        }
        if self.readings.len() == Self::CAPACITY {
            self.readings.remove(0);
        }
        self.readings.push(demand_lps.max(0.0));
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Forecast demand for hour `hour` of the horizon (repeats the window)
    pub fn forecast(&self, hour: usize) -> f64 {
        if self.readings.is_empty() {
            return 0.0;
        }
        self.readings[hour % self.readings.len()]
    }

    pub fn peak(&self) -> f64 {
        self.readings.iter().copied().fold(0.0, f64::max)
    }
}

/// Pump hydraulics and scoring parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerModel {
    pub installed_pumps: u32,
    pub nominal_pressure_kpa: f64,
    pub pressure_slope_kpa: f64,
    pub energy_per_pump_mwh: f64,
    pub demand_weight: f64,
    pub price_weight: f64,
}

impl Default for SchedulerModel {
    fn default() -> Self {
        Self {
            installed_pumps: 2,
            nominal_pressure_kpa: 280.0,
            pressure_slope_kpa: 35.0,
            energy_per_pump_mwh: 0.85,
            demand_weight: 0.6,
            price_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TariffShiftOptimizer {
    model: SchedulerModel,
}

impl TariffShiftOptimizer {
    pub fn new(model: SchedulerModel) -> Self {
        Self { model }
    }

    fn expected_pressure(&self, demand_signal: f64, pumps_on: u32) -> f64 {
        let load_penalty = demand_signal * self.model.pressure_slope_kpa;
        let relief = f64::from(pumps_on) * self.model.pressure_slope_kpa * 0.25;
        self.model.nominal_pressure_kpa - load_penalty + relief
    }

    fn baseline_pumps(&self, demand_signal: f64) -> u32 {
        if demand_signal <= 0.05 {
            return 0;
        }
        let installed = self.model.installed_pumps;
        ((demand_signal * f64::from(installed)).ceil() as u32).clamp(1, installed.max(1))
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl EnergyOptimizer for TariffShiftOptimizer {
    fn name(&self) -> &str {
        "tariff-shift-optimizer"
    }

    fn optimize(
        &self,
        demand: &DemandProfile,
        tariff: &TariffUpdate,
        constraints: PumpConstraints,
    ) -> Result<EnergyPlan, CollaboratorError> {
        if tariff.hourly_prices.is_empty() {
            return Err(CollaboratorError::InvalidInput {
                collaborator: "tariff-shift-optimizer",
                detail: "tariff has no hourly prices".to_string(),
            });
        }
        if tariff.hourly_prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(CollaboratorError::InvalidInput {
                collaborator: "tariff-shift-optimizer",
                detail: "tariff prices must be finite and non-negative".to_string(),
            });
        }
        if demand.is_empty() {
            return Err(CollaboratorError::InsufficientData {
                collaborator: "tariff-shift-optimizer",
                detail: "no demand readings yet".to_string(),
            });
        }

        let prices = &tariff.hourly_prices;
        let price_min = prices.iter().copied().fold(f64::INFINITY, f64::min);
        let price_max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let price_range = (price_max - price_min).max(1e-3);
        let demand_max = match demand.peak() {
            peak if peak > 0.0 => peak,
            _ => 1.0,
        };
        let max_pumps = constraints.max_parallel_pumps;

        let mut steps = Vec::with_capacity(constraints.horizon_hours as usize);
        let mut baseline_cost = 0.0;
        let mut optimized_cost = 0.0;

        for hour in 0..constraints.horizon_hours {
            let price = prices[hour as usize % prices.len()];
            let demand_signal = demand.forecast(hour as usize) / demand_max;
            let cheapness = 1.0 - (price - price_min) / price_range;
            let score =
                demand_signal * self.model.demand_weight + cheapness * self.model.price_weight;

            let mut pumps_on = ((score * f64::from(max_pumps)).round().max(0.0) as u32).min(max_pumps);
            if demand_signal > 0.15 {
                pumps_on = pumps_on.max(1);
            }

            // Add pumps until the floor holds or the limit is reached; the
            // reported pressure is the modeled one even if still short
            let mut pressure = self.expected_pressure(demand_signal, pumps_on);
            while pressure < constraints.pressure_floor_kpa && pumps_on < max_pumps {
                pumps_on += 1;
                pressure = self.expected_pressure(demand_signal, pumps_on);
            }

            optimized_cost += f64::from(pumps_on) * self.model.energy_per_pump_mwh * price;
            baseline_cost +=
                f64::from(self.baseline_pumps(demand_signal)) * self.model.energy_per_pump_mwh * price;

            steps.push(PumpStep {
                hour,
                pumps_on,
                price,
                pressure_kpa: round_to(pressure, 1),
            });
        }

        let savings_pct = if baseline_cost > 0.0 {
            ((baseline_cost - optimized_cost) / baseline_cost * 100.0).max(0.0)
        } else {
            0.0
        };

        Ok(EnergyPlan {
            min_pressure_kpa: steps
                .iter()
                .map(|s| s.pressure_kpa)
                .fold(f64::INFINITY, f64::min),
            max_pumps_on: steps.iter().map(|s| s.pumps_on).max().unwrap_or(0),
            savings_pct: round_to(savings_pct, 2),
            steps,
        })
    }
}
