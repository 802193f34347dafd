use crate::error::{Error, Result};
use crate::formula::{linux_container, Metric, Plan};
use std::collections::HashMap;

/// Published plans indexed by plan id, each with its versions ordered by
/// `effective` ascending. Loaded once at startup; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    plans: HashMap<String, Vec<Plan>>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        FormulaRegistry::default()
    }

    /// Registry with the built-in linux-container plans.
    pub fn with_defaults() -> Self {
        let mut registry = FormulaRegistry::new();
        for plan in [linux_container::basic_plan(), linux_container::standard_plan()] {
            // Built-in plans have distinct ids, registration cannot collide
            let _ = registry.register(plan);
        }
        registry
    }

    /// Publish a plan version. A version is immutable: republishing the same
    /// `(plan_id, effective)` is rejected.
    pub fn register(&mut self, plan: Plan) -> Result<()> {
        if plan.metrics.is_empty() {
            return Err(Error::MalformedInput(format!(
                "Plan {} has no metrics",
                plan.plan_id
            )));
        }
        let versions = self.plans.entry(plan.plan_id.clone()).or_default();
        if versions.iter().any(|p| p.effective == plan.effective) {
            return Err(Error::MalformedInput(format!(
                "Plan {} version effective at {} already published",
                plan.plan_id, plan.effective
            )));
        }
        let pos = versions
            .iter()
            .position(|p| p.effective > plan.effective)
            .unwrap_or(versions.len());
        versions.insert(pos, plan);
        Ok(())
    }

    /// Plan version in effect at `effective`: the latest one published at or
    /// before that time.
    pub fn plan(&self, plan_id: &str, effective: i64) -> Result<&Plan> {
        let versions = self
            .plans
            .get(plan_id)
            .ok_or_else(|| Error::NotFound(format!("Plan {} is not registered", plan_id)))?;
        versions
            .iter()
            .rev()
            .find(|p| p.effective <= effective)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No version of plan {} effective at {}",
                    plan_id, effective
                ))
            })
    }

    pub fn lookup(&self, plan_id: &str, effective: i64, metric: &str) -> Result<&Metric> {
        self.plan(plan_id, effective)?.metric(metric).ok_or_else(|| {
            Error::NotFound(format!("Metric {} not found in plan {}", metric, plan_id))
        })
    }

    /// Registered plan ids, sorted.
    pub fn plan_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plans.keys().map(|k| k.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// All published versions of a plan, oldest first.
    pub fn versions(&self, plan_id: &str) -> &[Plan] {
        self.plans.get(plan_id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::linux_container::{self, EFFECTIVE};

    fn version(effective: i64) -> Plan {
        Plan {
            effective,
            ..linux_container::basic_plan()
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = FormulaRegistry::with_defaults();
        assert_eq!(
            registry.plan_ids(),
            vec!["basic-linux-container", "standard-linux-container"]
        );
        let metric = registry
            .lookup("basic-linux-container", EFFECTIVE + 1, "memory")
            .unwrap();
        assert_eq!(metric.unit, "GIGABYTE");
    }

    #[test]
    fn test_lookup_not_found() {
        let registry = FormulaRegistry::with_defaults();
        assert!(matches!(
            registry.lookup("premium-linux-container", EFFECTIVE, "memory"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.lookup("basic-linux-container", EFFECTIVE, "cpu"),
            Err(Error::NotFound(_))
        ));
        // Before the first version took effect
        assert!(matches!(
            registry.lookup("basic-linux-container", EFFECTIVE - 1, "memory"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_version_selection_by_effective_date() {
        let mut registry = FormulaRegistry::new();
        registry.register(version(2_000)).unwrap();
        registry.register(version(1_000)).unwrap();
        registry.register(version(3_000)).unwrap();

        assert_eq!(registry.plan("basic-linux-container", 1_500).unwrap().effective, 1_000);
        assert_eq!(registry.plan("basic-linux-container", 2_000).unwrap().effective, 2_000);
        assert_eq!(registry.plan("basic-linux-container", 9_999).unwrap().effective, 3_000);
        assert_eq!(registry.versions("basic-linux-container").len(), 3);
    }

    #[test]
    fn test_republish_rejected() {
        let mut registry = FormulaRegistry::new();
        registry.register(version(1_000)).unwrap();
        assert!(registry.register(version(1_000)).is_err());
    }
}
