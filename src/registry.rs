//! # Model Registry
//!
//! Register maps and limits per device model, with the collection plans
//! derived from them.
//!
//! The registry is built once at startup and shared with the collector.
//! A plan is computed on first use for a (model, group) pair and reused by
//! every later cycle until the model's profile is replaced.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::planner::{AttributeSource, BlockPlanner, CollectionRequest};
use crate::register_map::{CollectionGroup, RegisterMap};

/// Everything needed to plan reads for one device model.
#[derive(Debug, Clone, Default)]
pub struct ModelProfile {
    pub registers: RegisterMap,
    pub limits: DeviceLimits,
    pub attribute_source: AttributeSource,
}

impl ModelProfile {
    pub fn new(registers: RegisterMap) -> Self {
        Self {
            registers,
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_attribute_source(mut self, source: AttributeSource) -> Self {
        self.attribute_source = source;
        self
    }

    pub fn planner(&self) -> BlockPlanner {
        BlockPlanner::from_limits(&self.limits).with_attribute_source(self.attribute_source)
    }
}

/// A plan and the profile it was derived from.
#[derive(Debug)]
struct CachedPlan {
    profile: Arc<ModelProfile>,
    plan: Arc<CollectionRequest>,
}

/// Explicitly owned model → profile registry with cached plans.
///
/// A cached plan is only served while the profile it was planned from is
/// still the registered one, so a plan computed concurrently with
/// [`ModelRegistry::register`] never outlives the profile it belongs to.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    profiles: DashMap<String, Arc<ModelProfile>>,
    plans: DashMap<(String, CollectionGroup), CachedPlan>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the profile of `model`, dropping its cached plans.
    pub fn register(&self, model: impl Into<String>, profile: ModelProfile) {
        let model = model.into();
        info!(
            "Model {} registered with {} registers (max_block_size={})",
            model,
            profile.registers.len(),
            profile.limits.max_block_size
        );
        self.plans.retain(|(m, _), _| *m != model);
        self.profiles.insert(model, Arc::new(profile));
    }

    /// Load `model`'s register map from a CSV file.
    pub fn load_csv(
        &self,
        model: impl Into<String>,
        path: impl AsRef<Path>,
        limits: DeviceLimits,
    ) -> ModbusResult<()> {
        let registers = RegisterMap::from_csv_path(path)?;
        self.register(model, ModelProfile::new(registers).with_limits(limits));
        Ok(())
    }

    pub fn profile(&self, model: &str) -> ModbusResult<Arc<ModelProfile>> {
        self.profiles
            .get(model)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| ModbusError::configuration(format!("unknown device model '{}'", model)))
    }

    /// Collection plan of `model` for `group`, computed once.
    pub fn plan(&self, model: &str, group: CollectionGroup) -> ModbusResult<Arc<CollectionRequest>> {
        let profile = self.profile(model)?;
        let key = (model.to_string(), group);
        if let Some(cached) = self.plans.get(&key) {
            if Arc::ptr_eq(&cached.profile, &profile) {
                return Ok(Arc::clone(&cached.plan));
            }
        }

        let registers = profile.registers.for_group(group)?;
        let plan = Arc::new(profile.planner().plan(&registers)?);
        debug!(
            "Plan for {}/{}: {} blocks, {} registers",
            model,
            group,
            plan.len(),
            plan.total_registers()
        );
        let current = self.profiles.get(model).map(|p| Arc::clone(p.value()));
        if current.is_some_and(|current| Arc::ptr_eq(&current, &profile)) {
            self.plans.insert(
                key,
                CachedPlan {
                    profile,
                    plan: Arc::clone(&plan),
                },
            );
        }
        Ok(plan)
    }

    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.profiles.iter().map(|e| e.key().clone()).collect();
        models.sort();
        models
    }

    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::register_map::{RegisterDefinition, RegisterType};
    use std::io::Write;

    fn profile() -> ModelProfile {
        ModelProfile::new(RegisterMap::new(vec![
            RegisterDefinition::new("voltage_a", 10, RegisterType::Float32),
            RegisterDefinition::new("voltage_b", 12, RegisterType::Float32),
            RegisterDefinition::new("energy", 40, RegisterType::Uint32)
                .with_group(CollectionGroup::Monthly),
        ]))
        .with_limits(DeviceLimits::new().with_max_block_size(10))
    }

    #[test]
    fn test_plan_is_cached_per_group() {
        let registry = ModelRegistry::new();
        registry.register("tr4020", profile());

        let first = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();
        let again = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.len(), 1);
        assert_eq!(first.blocks()[0].size, 4);

        let monthly = registry.plan("tr4020", CollectionGroup::Monthly).unwrap();
        assert_eq!(monthly.blocks()[0].members, vec!["energy"]);
        assert_eq!(registry.cached_plans(), 2);
    }

    #[test]
    fn test_register_invalidates_plans() {
        let registry = ModelRegistry::new();
        registry.register("tr4020", profile());
        registry.plan("tr4020", CollectionGroup::Minutely).unwrap();

        registry.register("tr4020", profile().with_limits(DeviceLimits::new()));
        assert_eq!(registry.cached_plans(), 0);
        let plan = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_of_replaced_profile_is_not_served() {
        let registry = ModelRegistry::new();
        registry.register("tr4020", profile());
        let replaced = registry.profile("tr4020").unwrap();
        let stale = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();

        registry.register("tr4020", profile().with_limits(DeviceLimits::new()));
        // A plan for the old profile landing after the replacement.
        registry.plans.insert(
            ("tr4020".to_string(), CollectionGroup::Minutely),
            CachedPlan {
                profile: replaced,
                plan: Arc::clone(&stale),
            },
        );

        let plan = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();
        assert!(!Arc::ptr_eq(&plan, &stale));
        assert_eq!(plan.len(), 2);
        let again = registry.plan("tr4020", CollectionGroup::Minutely).unwrap();
        assert!(Arc::ptr_eq(&plan, &again));
    }

    #[test]
    fn test_unknown_model_and_empty_group() {
        let registry = ModelRegistry::new();
        registry.register("tr4020", profile());

        let err = registry.plan("mk30", CollectionGroup::Minutely).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = registry.plan("tr4020", CollectionGroup::Quarterly).unwrap_err();
        assert!(matches!(err, ModbusError::EmptyRegisterSet));
        assert_eq!(registry.cached_plans(), 0);
    }

    #[test]
    fn test_load_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "register,address,size,type,group,active").unwrap();
        writeln!(file, "voltage_a,0,2,float32,minutely,true").unwrap();
        writeln!(file, "clock,100,1,uint16,datetime,yes").unwrap();

        let registry = ModelRegistry::new();
        registry
            .load_csv("mk30", file.path(), DeviceLimits::default())
            .unwrap();
        assert_eq!(registry.models(), vec!["mk30"]);

        let plan = registry.plan("mk30", CollectionGroup::Minutely).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.blocks()[1].members, vec!["clock"]);
    }
}
