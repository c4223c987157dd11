use std::collections::BTreeMap;

use crate::criterion::{Criterion, MultiTaskBce};
use crate::error::{MlError, Result};
use crate::model::{LinearModel, MlpModel, Model};

/// Shape information the builders need, taken from the loaded dataset.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub feature_dim: usize,
    pub target_dim: usize,
    pub hidden_dim: usize,
}

type ModelBuilder = fn(&ModelSpec) -> Box<dyn Model>;
type CriterionBuilder = fn() -> Box<dyn Criterion>;

/// Maps capability names to constructors, resolved at configuration time.
///
/// Variants are selected by explicit name from the run configuration — never
/// assembled from identifiers at runtime — so an unknown name fails before
/// any worker starts, listing what is available.
pub struct Registry {
    models: BTreeMap<&'static str, ModelBuilder>,
    criteria: BTreeMap<&'static str, CriterionBuilder>,
}

impl Registry {
    /// The built-in variants.
    pub fn builtin() -> Self {
        let mut registry = Self {
            models: BTreeMap::new(),
            criteria: BTreeMap::new(),
        };
        registry.register_model("linear", |spec| {
            Box::new(LinearModel::new(spec.feature_dim, spec.target_dim))
        });
        registry.register_model("mlp", |spec| {
            Box::new(MlpModel::new(
                spec.feature_dim,
                spec.hidden_dim,
                spec.target_dim,
            ))
        });
        registry.register_criterion("multitask_bce", || Box::new(MultiTaskBce));
        registry
    }

    pub fn register_model(&mut self, name: &'static str, builder: ModelBuilder) {
        self.models.insert(name, builder);
    }

    pub fn register_criterion(&mut self, name: &'static str, builder: CriterionBuilder) {
        self.criteria.insert(name, builder);
    }

    pub fn build_model(&self, name: &str, spec: &ModelSpec) -> Result<Box<dyn Model>> {
        match self.models.get(name) {
            Some(builder) => Ok(builder(spec)),
            None => Err(MlError::UnknownModel {
                name: name.to_string(),
                known: self.models.keys().copied().collect(),
            }),
        }
    }

    pub fn build_criterion(&self, name: &str) -> Result<Box<dyn Criterion>> {
        match self.criteria.get(name) {
            Some(builder) => Ok(builder()),
            None => Err(MlError::UnknownCriterion {
                name: name.to_string(),
                known: self.criteria.keys().copied().collect(),
            }),
        }
    }
}
