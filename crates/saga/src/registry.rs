//! Step definition registry.
//!
//! Maps each saga type to its ordered steps. The registry is built once at
//! startup, either in code or from a JSON file whose action names are
//! resolved against an [`ActionCatalog`], and is read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use domain::StepDefinition;
use serde::{Deserialize, Serialize};

use crate::action::{CompensatingAction, ForwardAction};
use crate::error::{Result, SagaError};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// One step of a saga type.
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub forward: Arc<dyn ForwardAction>,
    pub compensate: Option<Arc<dyn CompensatingAction>>,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Whether the forward action may be repeated after a timeout.
    pub idempotent: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, forward: Arc<dyn ForwardAction>) -> Self {
        Self {
            name: name.into(),
            forward,
            compensate: None,
            timeout: DEFAULT_STEP_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            idempotent: true,
        }
    }

    pub fn compensate_with(mut self, action: Arc<dyn CompensatingAction>) -> Self {
        self.compensate = Some(action);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// The part of a `StepSpec` captured into a saga at creation.
    pub fn definition(&self) -> StepDefinition {
        StepDefinition {
            name: self.name.clone(),
            timeout: self.timeout,
            max_retries: self.max_retries,
            compensable: self.compensate.is_some(),
            idempotent: self.idempotent,
        }
    }
}

impl std::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("compensable", &self.compensate.is_some())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// Saga types and their ordered steps.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sagas: HashMap<String, Vec<StepSpec>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the ordered steps of a saga type.
    pub fn steps_for(&self, saga_type: &str) -> Result<&[StepSpec]> {
        self.sagas
            .get(saga_type)
            .map(Vec::as_slice)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    /// Looks up a single step of a saga type.
    pub fn step(&self, saga_type: &str, step_name: &str) -> Option<&StepSpec> {
        self.sagas
            .get(saga_type)?
            .iter()
            .find(|step| step.name == step_name)
    }

    pub fn contains(&self, saga_type: &str) -> bool {
        self.sagas.contains_key(saga_type)
    }

    /// Registered saga types, sorted.
    pub fn saga_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.sagas.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Builds a registry from parsed configuration.
    pub fn from_config(configs: Vec<SagaTypeConfig>, catalog: &ActionCatalog) -> Result<Self> {
        let mut builder = Self::builder();
        for config in configs {
            let steps = config
                .steps
                .into_iter()
                .map(|step| step.resolve(catalog))
                .collect::<Result<Vec<_>>>()?;
            builder = builder.saga(config.saga_type, steps);
        }
        builder.build()
    }

    /// Builds a registry from a JSON document.
    pub fn from_json(json: &str, catalog: &ActionCatalog) -> Result<Self> {
        let configs: Vec<SagaTypeConfig> = serde_json::from_str(json)?;
        Self::from_config(configs, catalog)
    }

    /// Builds a registry from a JSON file.
    pub fn load(path: impl AsRef<Path>, catalog: &ActionCatalog) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SagaError::Registry(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json, catalog)
    }
}

/// Collects saga definitions and validates them on `build`.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    sagas: Vec<(String, Vec<StepSpec>)>,
}

impl RegistryBuilder {
    pub fn saga(mut self, saga_type: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        self.sagas.push((saga_type.into(), steps));
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut sagas = HashMap::new();
        for (saga_type, steps) in self.sagas {
            if steps.is_empty() {
                return Err(SagaError::Registry(format!(
                    "saga type '{saga_type}' has no steps"
                )));
            }

            let mut names = HashSet::new();
            if let Some(dup) = steps.iter().find(|step| !names.insert(step.name.as_str())) {
                return Err(SagaError::Registry(format!(
                    "saga type '{saga_type}' defines step '{}' twice",
                    dup.name
                )));
            }

            if sagas.insert(saga_type.clone(), steps).is_some() {
                return Err(SagaError::Registry(format!(
                    "saga type '{saga_type}' registered twice"
                )));
            }
        }
        Ok(Registry { sagas })
    }
}

/// Named actions a registry configuration may refer to.
#[derive(Clone, Default)]
pub struct ActionCatalog {
    forward: HashMap<String, Arc<dyn ForwardAction>>,
    compensate: HashMap<String, Arc<dyn CompensatingAction>>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forward(mut self, name: impl Into<String>, action: Arc<dyn ForwardAction>) -> Self {
        self.forward.insert(name.into(), action);
        self
    }

    pub fn with_compensation(
        mut self,
        name: impl Into<String>,
        action: Arc<dyn CompensatingAction>,
    ) -> Self {
        self.compensate.insert(name.into(), action);
        self
    }

    pub fn forward(&self, name: &str) -> Result<Arc<dyn ForwardAction>> {
        self.forward
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownAction(name.to_string()))
    }

    pub fn compensation(&self, name: &str) -> Result<Arc<dyn CompensatingAction>> {
        self.compensate
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownAction(name.to_string()))
    }
}

/// A saga type as written in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTypeConfig {
    pub saga_type: String,
    pub steps: Vec<StepConfig>,
}

/// A step as written in the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Catalog name of the forward action.
    pub forward: String,
    /// Catalog name of the compensating action.
    #[serde(default)]
    pub compensate: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

fn default_idempotent() -> bool {
    true
}

impl StepConfig {
    fn resolve(self, catalog: &ActionCatalog) -> Result<StepSpec> {
        let mut spec = StepSpec::new(self.name, catalog.forward(&self.forward)?)
            .timeout(Duration::from_secs(self.timeout_seconds))
            .max_retries(self.max_retries)
            .idempotent(self.idempotent);
        if let Some(name) = &self.compensate {
            spec = spec.compensate_with(catalog.compensation(name)?);
        }
        Ok(spec)
    }
}
