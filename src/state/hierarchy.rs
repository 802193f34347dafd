//! Aggregated usage tree of one organization.
//!
//! organization -> spaces -> consumers -> resources -> plans -> metrics, plus
//! per-resource rollups at organization and space level. The tree is rebuilt
//! by every aggregation pass and published as an immutable snapshot.

use crate::state::window::Windows;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plan version whose `summarize` projects a metric's values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaRef {
    pub metering_plan_id: String,
    pub effective: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricUsage {
    pub metric: String,
    pub formula: FormulaRef,
    pub windows: Windows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanUsage {
    pub plan_id: String,
    pub metering_plan_id: String,
    /// Price per unit by metric, resolved when the tree was built.
    pub prices: BTreeMap<String, Decimal>,
    pub aggregated_usage: Vec<MetricUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_id: String,
    pub aggregated_usage: Vec<MetricUsage>,
    pub plans: Vec<PlanUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerUsage {
    pub consumer_id: String,
    pub resources: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub space_id: String,
    pub resources: Vec<ResourceUsage>,
    pub consumers: Vec<ConsumerUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationUsage {
    pub organization_id: String,
    /// Time the charges were computed for.
    pub as_of: i64,
    pub resources: Vec<ResourceUsage>,
    pub spaces: Vec<SpaceUsage>,
    pub aggregated_usage: Vec<MetricUsage>,
}

impl OrganizationUsage {
    pub fn empty(organization_id: &str) -> Self {
        OrganizationUsage {
            organization_id: organization_id.to_string(),
            as_of: 0,
            resources: Vec::new(),
            spaces: Vec::new(),
            aggregated_usage: Vec::new(),
        }
    }

    pub fn resource(&self, resource_id: &str) -> Option<&ResourceUsage> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    pub fn space(&self, space_id: &str) -> Option<&SpaceUsage> {
        self.spaces.iter().find(|s| s.space_id == space_id)
    }

    pub fn metric(&self, metric: &str) -> Option<&MetricUsage> {
        find_metric(&self.aggregated_usage, metric)
    }
}

impl ResourceUsage {
    pub fn plan(&self, plan_id: &str) -> Option<&PlanUsage> {
        self.plans.iter().find(|p| p.plan_id == plan_id)
    }

    pub fn metric(&self, metric: &str) -> Option<&MetricUsage> {
        find_metric(&self.aggregated_usage, metric)
    }
}

impl PlanUsage {
    pub fn metric(&self, metric: &str) -> Option<&MetricUsage> {
        find_metric(&self.aggregated_usage, metric)
    }
}

impl SpaceUsage {
    pub fn resource(&self, resource_id: &str) -> Option<&ResourceUsage> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&ConsumerUsage> {
        self.consumers.iter().find(|c| c.consumer_id == consumer_id)
    }
}

impl ConsumerUsage {
    pub fn resource(&self, resource_id: &str) -> Option<&ResourceUsage> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }
}

fn find_metric<'a>(metrics: &'a [MetricUsage], metric: &str) -> Option<&'a MetricUsage> {
    metrics.iter().find(|m| m.metric == metric)
}
