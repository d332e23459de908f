// src/services/fare_service.rs
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::ride::VehicleClass;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClassRates {
    pub base_fare: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub min_fare: f64,
}

/// Rate tables, surge and promo catalog. Passed to the calculator by value at call
/// time; a new table gets a new `version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    pub version: u32,
    pub currency: String,
    pub classes: BTreeMap<VehicleClass, ClassRates>,
    #[serde(default)]
    pub surge: BTreeMap<VehicleClass, f64>,
    #[serde(default)]
    pub promos: HashMap<String, i64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let classes = BTreeMap::from([
            (VehicleClass::Economy, ClassRates { base_fare: 50.0, per_km: 15.0, per_min: 2.0, min_fare: 100.0 }),
            (VehicleClass::Comfort, ClassRates { base_fare: 70.0, per_km: 20.0, per_min: 3.0, min_fare: 150.0 }),
            (VehicleClass::Premium, ClassRates { base_fare: 100.0, per_km: 30.0, per_min: 4.0, min_fare: 250.0 }),
            (VehicleClass::Xl, ClassRates { base_fare: 90.0, per_km: 25.0, per_min: 3.5, min_fare: 200.0 }),
        ]);

        Self {
            version: 1,
            currency: "USD".to_string(),
            classes,
            surge: BTreeMap::new(),
            promos: HashMap::new(),
        }
    }
}

impl PricingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parses, normalizes promo codes and validates.
    pub fn from_json(raw: &str) -> DispatchResult<Self> {
        let mut config: PricingConfig = serde_json::from_str(raw)
            .map_err(|e| DispatchError::InvalidConfiguration(format!("pricing config: {}", e)))?;

        let mut promos = HashMap::with_capacity(config.promos.len());
        for (code, discount) in config.promos.drain() {
            let normalized = normalize_promo_code(&code);
            if promos.insert(normalized.clone(), discount).is_some() {
                return Err(DispatchError::InvalidConfiguration(format!(
                    "promo code {} is listed more than once",
                    normalized
                )));
            }
        }
        config.promos = promos;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.classes.is_empty() {
            return Err(DispatchError::InvalidConfiguration("pricing table has no vehicle classes".to_string()));
        }
        for (class, rates) in &self.classes {
            let values = [rates.base_fare, rates.per_km, rates.per_min, rates.min_fare];
            if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(DispatchError::InvalidConfiguration(format!(
                    "rates for {} must be finite and non-negative",
                    class
                )));
            }
        }
        for (code, discount) in &self.promos {
            if code.is_empty() || *code != normalize_promo_code(code) {
                return Err(DispatchError::InvalidConfiguration(format!("promo code {:?} is not normalized", code)));
            }
            if *discount < 0 {
                return Err(DispatchError::InvalidConfiguration(format!(
                    "promo {} has a negative discount",
                    code
                )));
            }
        }
        Ok(())
    }

    /// Rates for a class; classes missing from the table use the lowest configured class.
    pub fn rates_for(&self, class: VehicleClass) -> ClassRates {
        match self.classes.get(&class) {
            Some(rates) => *rates,
            None => {
                let (fallback, rates) = self
                    .classes
                    .first_key_value()
                    .map(|(c, r)| (*c, *r))
                    .unwrap_or((VehicleClass::Economy, ClassRates { base_fare: 0.0, per_km: 0.0, per_min: 0.0, min_fare: 0.0 }));
                tracing::warn!("No rates configured for {}, using {}", class, fallback);
                rates
            }
        }
    }

    pub fn surge_for(&self, class: VehicleClass) -> f64 {
        let surge = self.surge.get(&class).copied().unwrap_or(1.0);
        if surge.is_finite() { surge.max(1.0) } else { 1.0 }
    }

    pub fn promo_discount(&self, code: &str) -> Option<i64> {
        self.promos.get(&normalize_promo_code(code)).copied()
    }
}

pub fn normalize_promo_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareInput {
    pub distance_m: u64,
    pub duration_s: u64,
    pub vehicle_class: VehicleClass,
    pub surge_multiplier: f64,
    pub discount: i64,
}

/// Fare in minor currency units.
pub fn calculate_fare(config: &PricingConfig, input: FareInput) -> i64 {
    let rates = config.rates_for(input.vehicle_class);

    let raw = rates.base_fare
        + (input.distance_m as f64 / 1000.0) * rates.per_km
        + (input.duration_s as f64 / 60.0) * rates.per_min;
    let surged = raw * input.surge_multiplier;
    let floored = surged.max(rates.min_fare);

    let fare = (floored - input.discount as f64).round() as i64;
    fare.max(0)
}
