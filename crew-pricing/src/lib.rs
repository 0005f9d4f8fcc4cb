#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Rule-pinned pricing: YAML rates evaluated into an ordered explanation
//! whose hash is stored next to every priced record.
//!
//! The engine is deterministic. For identical inputs and identical rules
//! file content, the emitted `pricing_sha` is byte-identical across calls.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crew_money::Money;
use crew_money::canonical_json;
use crew_money::round2;
use crew_money::short_sha256_hex;

pub type PricingResult<T> = Result<T, PricingError>;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("unknown rate code: {0}")]
    UnknownRateCode(String),
    #[error("unknown expense category: {0}")]
    UnknownCategory(String),
    #[error("quantity must be non-negative, got {0}")]
    NegativeQty(Decimal),
    #[error("failed to read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// A multiplier applied after the base step, in declared file order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Modifier {
    #[serde(default)]
    pub applies_to: Vec<String>,
    pub factor: Decimal,
    #[serde(default)]
    pub note: Option<String>,
}

/// Parsed rules file. `IndexMap` keeps the declared order of modifiers,
/// which fixes the order of explanation steps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleTable {
    pub version: u32,
    #[serde(default)]
    pub rates: IndexMap<String, Decimal>,
    #[serde(default)]
    pub categories: IndexMap<String, Decimal>,
    #[serde(default)]
    pub modifiers: IndexMap<String, Modifier>,
}

impl RuleTable {
    #[must_use]
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingStep {
    pub step: u32,
    pub yaml_key: String,
    pub value: Decimal,
    pub note: String,
}

/// The full priced result: ordered steps, rounded total, and the pins that
/// make the computation auditable after a rules change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingExplanation {
    pub steps: Vec<PricingStep>,
    pub total: Decimal,
    pub rules_version: u32,
    pub rules_sha: String,
    pub pricing_sha: String,
}

impl PricingExplanation {
    #[must_use]
    pub fn total_money(&self) -> Money {
        Money::new(self.total)
    }
}

#[derive(Debug)]
struct LoadedRules {
    table: RuleTable,
    rules_sha: String,
}

/// Rules live behind a copy-on-write pointer: `reload` publishes a fresh
/// `Arc`, readers clone the current one and never observe torn state.
pub struct PricingEngine {
    path: PathBuf,
    current: RwLock<Arc<LoadedRules>>,
}

impl PricingEngine {
    pub fn load(path: impl AsRef<Path>) -> PricingResult<Self> {
        let path = path.as_ref().to_path_buf();
        let loaded = read_rules(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(loaded)),
        })
    }

    /// Re-reads the rules file and atomically swaps the table in.
    pub fn reload(&self) -> PricingResult<()> {
        let loaded = read_rules(&self.path)?;
        info!(
            rules_sha = %loaded.rules_sha,
            version = loaded.table.version,
            "pricing rules reloaded"
        );
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(loaded);
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<LoadedRules> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    #[must_use]
    pub fn rules_sha(&self) -> String {
        self.snapshot().rules_sha.clone()
    }

    #[must_use]
    pub fn rules_version(&self) -> u32 {
        self.snapshot().table.version
    }

    #[must_use]
    pub fn has_category(&self, category: &str) -> bool {
        self.snapshot().table.has_category(category)
    }

    /// Prices a task: base rate × qty, then modifiers in declared order,
    /// then banker's rounding.
    pub fn price_task(&self, rate_code: &str, qty: Decimal) -> PricingResult<PricingExplanation> {
        if qty.is_sign_negative() {
            return Err(PricingError::NegativeQty(qty));
        }
        let rules = self.snapshot();
        let rate = rules
            .table
            .rates
            .get(rate_code)
            .copied()
            .ok_or_else(|| PricingError::UnknownRateCode(rate_code.into()))?;

        let mut steps = Vec::new();
        let mut running = rate * qty;
        steps.push(PricingStep {
            step: 1,
            yaml_key: format!("rates.{rate_code}"),
            value: running,
            note: format!("base {rate} x qty {qty}"),
        });

        for (name, modifier) in &rules.table.modifiers {
            if !modifier.applies_to.iter().any(|code| code == rate_code) {
                continue;
            }
            running *= modifier.factor;
            let step = steps.len() as u32 + 1;
            steps.push(PricingStep {
                step,
                yaml_key: format!("modifiers.{name}"),
                value: running,
                note: modifier
                    .note
                    .clone()
                    .unwrap_or_else(|| format!("x {}", modifier.factor)),
            });
        }

        Ok(finish(steps, running, &rules))
    }

    /// Prices an expense: category base multiplier, then rounding.
    pub fn price_expense(
        &self,
        category: &str,
        amount: Decimal,
    ) -> PricingResult<PricingExplanation> {
        let rules = self.snapshot();
        let multiplier = rules
            .table
            .categories
            .get(category)
            .copied()
            .ok_or_else(|| PricingError::UnknownCategory(category.into()))?;

        let running = amount * multiplier;
        let steps = vec![PricingStep {
            step: 1,
            yaml_key: format!("categories.{category}"),
            value: running,
            note: format!("amount {amount} x {multiplier}"),
        }];

        Ok(finish(steps, running, &rules))
    }
}

fn finish(mut steps: Vec<PricingStep>, running: Decimal, rules: &LoadedRules) -> PricingExplanation {
    let total = round2(running);
    let step = steps.len() as u32 + 1;
    steps.push(PricingStep {
        step,
        yaml_key: "rounding".into(),
        value: total,
        note: "half-even to 2 digits".into(),
    });

    let pricing_sha = explanation_sha(&steps, total, &rules.rules_sha);
    PricingExplanation {
        steps,
        total,
        rules_version: rules.table.version,
        rules_sha: rules.rules_sha.clone(),
        pricing_sha,
    }
}

fn explanation_sha(steps: &[PricingStep], total: Decimal, rules_sha: &str) -> String {
    let body = serde_json::json!({
        "steps": steps,
        "total": total,
        "rules_sha": rules_sha,
    });
    short_sha256_hex(canonical_json(&body).as_bytes())
}

fn read_rules(path: &Path) -> PricingResult<LoadedRules> {
    let raw = fs::read(path).map_err(|source| PricingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: RuleTable = serde_yaml::from_slice(&raw).map_err(|source| PricingError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(LoadedRules {
        table,
        rules_sha: short_sha256_hex(&raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const RULES: &str = "\
version: 3
rates:
  hour_electric: 800
  hour_electric_ot: 800
  day_general: 1200
categories:
  fuel: 1
  materials: 1
modifiers:
  overtime:
    applies_to: [hour_electric_ot]
    factor: \"1.5\"
  site_risk:
    applies_to: [hour_electric_ot]
    factor: \"1.1\"
";

    fn engine_with(rules: &str) -> (PricingEngine, NamedTempFile) {
        let mut file = NamedTempFile::new().expect("temp rules file");
        file.write_all(rules.as_bytes()).expect("write rules");
        let engine = PricingEngine::load(file.path()).expect("load rules");
        (engine, file)
    }

    #[test]
    fn prices_base_rate_times_qty() {
        let (engine, _file) = engine_with(RULES);
        let priced = engine
            .price_task("hour_electric", dec!(2.0))
            .expect("priced");
        assert_eq!(priced.total, dec!(1600.00));
        assert_eq!(priced.rules_version, 3);
        assert_eq!(priced.steps.len(), 2);
        assert_eq!(priced.steps[0].yaml_key, "rates.hour_electric");
        assert_eq!(priced.steps[1].yaml_key, "rounding");
        assert_eq!(priced.total_money().to_plain_string(), "1600.00");
    }

    #[test]
    fn applies_modifiers_in_declared_order() {
        let (engine, _file) = engine_with(RULES);
        let priced = engine
            .price_task("hour_electric_ot", dec!(1))
            .expect("priced");
        let keys: Vec<&str> = priced
            .steps
            .iter()
            .map(|step| step.yaml_key.as_str())
            .collect();
        assert_eq!(
            keys,
            vec![
                "rates.hour_electric_ot",
                "modifiers.overtime",
                "modifiers.site_risk",
                "rounding"
            ]
        );
        // 800 * 1.5 * 1.1 = 1320
        assert_eq!(priced.total, dec!(1320.00));
    }

    #[test]
    fn three_invocations_pin_identical_sha() {
        let (engine, _file) = engine_with(RULES);
        let first = engine
            .price_task("hour_electric", dec!(2.0))
            .expect("priced");
        let second = engine
            .price_task("hour_electric", dec!(2.0))
            .expect("priced");
        let third = engine
            .price_task("hour_electric", dec!(2.0))
            .expect("priced");
        assert_eq!(first.pricing_sha, second.pricing_sha);
        assert_eq!(second.pricing_sha, third.pricing_sha);
        assert_eq!(first.pricing_sha.len(), 12);
    }

    #[test]
    fn unknown_rate_code_is_a_domain_error() {
        let (engine, _file) = engine_with(RULES);
        let err = engine
            .price_task("hour_plumbing", dec!(1))
            .expect_err("unknown code");
        assert!(matches!(err, PricingError::UnknownRateCode(code) if code == "hour_plumbing"));

        let err = engine
            .price_expense("snacks", dec!(10))
            .expect_err("unknown category");
        assert!(matches!(err, PricingError::UnknownCategory(_)));
    }

    #[test]
    fn reload_tracks_current_file_content() {
        let (engine, file) = engine_with(RULES);
        let before = engine.rules_sha();
        let priced_before = engine
            .price_task("hour_electric", dec!(1))
            .expect("priced");

        std::fs::write(
            file.path(),
            RULES.replace("hour_electric: 800", "hour_electric: 900"),
        )
        .expect("rewrite rules");
        engine.reload().expect("reload");

        assert!(engine.rules_sha() != before);
        let priced_after = engine
            .price_task("hour_electric", dec!(1))
            .expect("priced");
        assert!(priced_after.pricing_sha != priced_before.pricing_sha);
        assert_eq!(priced_after.total, dec!(900.00));
    }

    #[test]
    fn expense_pricing_uses_category_base() {
        let (engine, _file) = engine_with(RULES);
        let priced = engine
            .price_expense("fuel", dec!(250.505))
            .expect("priced");
        assert_eq!(priced.total, dec!(250.50));
        assert_eq!(priced.steps[0].yaml_key, "categories.fuel");
    }

    #[test]
    fn negative_qty_rejected() {
        let (engine, _file) = engine_with(RULES);
        assert!(matches!(
            engine.price_task("hour_electric", dec!(-1)),
            Err(PricingError::NegativeQty(_))
        ));
    }
}
