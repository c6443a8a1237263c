use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Denominator of a [`FractionalPercent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FractionDenominator {
    Hundred,
    TenThousand,
    Million,
}

impl FractionDenominator {
    pub fn value(self) -> u64 {
        match self {
            FractionDenominator::Hundred => 100,
            FractionDenominator::TenThousand => 10_000,
            FractionDenominator::Million => 1_000_000,
        }
    }
}

/// A fraction expressed as numerator over a fixed denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalPercent {
    pub numerator: u64,
    pub denominator: FractionDenominator,
}

impl FractionalPercent {
    pub fn new(numerator: u64, denominator: FractionDenominator) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Gate a stable random value against this fraction.
    pub fn enabled(&self, stable_random: u64) -> bool {
        stable_random % self.denominator.value() < self.numerator
    }
}

/// Runtime key/value loader consulted for per-request overrides, e.g.
/// mirror-policy percentages.
pub trait RuntimeLoader: Send + Sync {
    /// Look up a fractional percent under `key`, falling back to
    /// `default` when no override is present.
    fn fractional_percent(&self, key: &str, default: FractionalPercent) -> FractionalPercent;
}

/// In-memory runtime loader. Overrides can be installed at any time and
/// are visible to all workers.
#[derive(Debug, Default)]
pub struct StaticRuntime {
    overrides: DashMap<String, FractionalPercent>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fractional_percent(&self, key: impl Into<String>, value: FractionalPercent) {
        self.overrides.insert(key.into(), value);
    }
}

impl RuntimeLoader for StaticRuntime {
    fn fractional_percent(&self, key: &str, default: FractionalPercent) -> FractionalPercent {
        if key.is_empty() {
            return default;
        }
        self.overrides.get(key).map(|v| *v).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_enabled_boundaries() {
        let half = FractionalPercent::new(50, FractionDenominator::Hundred);
        assert!(half.enabled(0));
        assert!(half.enabled(49));
        assert!(!half.enabled(50));
        assert!(!half.enabled(99));
        assert!(half.enabled(100)); // wraps via modulo
    }

    #[test]
    fn test_denominator_scaling() {
        let fine = FractionalPercent::new(5_000, FractionDenominator::TenThousand);
        assert!(fine.enabled(4_999));
        assert!(!fine.enabled(5_000));
    }

    #[test]
    fn test_runtime_override_takes_precedence() {
        let runtime = StaticRuntime::new();
        let default = FractionalPercent::new(50, FractionDenominator::Hundred);
        assert_eq!(runtime.fractional_percent("mirror.ratio", default), default);

        runtime.set_fractional_percent(
            "mirror.ratio",
            FractionalPercent::new(100, FractionDenominator::Hundred),
        );
        assert_eq!(
            runtime.fractional_percent("mirror.ratio", default).numerator,
            100
        );
    }

    #[test]
    fn test_empty_runtime_key_uses_default() {
        let runtime = StaticRuntime::new();
        runtime.set_fractional_percent("", FractionalPercent::new(0, FractionDenominator::Hundred));
        let default = FractionalPercent::new(25, FractionDenominator::Hundred);
        assert_eq!(runtime.fractional_percent("", default), default);
    }
}
