//! Backend registry.
//!
//! Engines are only constructed here: every backend's constructor is
//! crate-private, and each factory checks that the collaborators it needs
//! are present before building anything.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::tokenizer::Tokenizer;

use super::batched::{BatchScheduler, BatchedEngine};
use super::external::{ExternalStreamEngine, TokenStreamRuntime};
use super::model_forward::CausalModel;
use super::sequential::SequentialDecodeEngine;
use super::types::EngineError;
use super::Engine;

/// The closed set of engine implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Batched,
    Sequential,
    ExternalStream,
}

impl BackendKind {
    /// Name the built-in registration uses.
    pub fn default_name(self) -> &'static str {
        match self {
            Self::Batched => "batched",
            Self::Sequential => "sequential",
            Self::ExternalStream => "external",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Collaborators handed to a factory.
#[derive(Clone, Default)]
pub struct BackendContext {
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    pub model: Option<Arc<dyn CausalModel>>,
    pub scheduler: Option<Arc<dyn BatchScheduler>>,
    pub runtime: Option<Arc<dyn TokenStreamRuntime>>,
    pub config: EngineConfig,
}

impl BackendContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_model(mut self, model: Arc<dyn CausalModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn BatchScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn TokenStreamRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn require_tokenizer(&self, backend: BackendKind) -> Result<Arc<dyn Tokenizer>, EngineError> {
        self.tokenizer
            .clone()
            .ok_or_else(|| EngineError::Dependency(format!("{backend} backend requires a tokenizer")))
    }
}

/// Builds one kind of engine from a [`BackendContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineFactory {
    kind: BackendKind,
}

impl EngineFactory {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub(crate) fn build(&self, ctx: &BackendContext) -> Result<Engine, EngineError> {
        match self.kind {
            BackendKind::Sequential => {
                let model = ctx.model.clone().ok_or_else(|| {
                    EngineError::Dependency("sequential backend requires a loaded model".to_string())
                })?;
                let tokenizer = ctx.require_tokenizer(self.kind)?;
                Ok(Engine::Sequential(SequentialDecodeEngine::new(
                    model,
                    tokenizer,
                    ctx.config.context_length,
                )))
            }
            BackendKind::Batched => {
                let scheduler = ctx.scheduler.clone().ok_or_else(|| {
                    EngineError::Dependency("batched backend requires a scheduler".to_string())
                })?;
                Ok(Engine::Batched(BatchedEngine::new(scheduler)?))
            }
            BackendKind::ExternalStream => {
                let runtime = ctx.runtime.clone().ok_or_else(|| {
                    EngineError::Dependency(
                        "external backend requires a token streaming runtime".to_string(),
                    )
                })?;
                let tokenizer = ctx.require_tokenizer(self.kind)?;
                Ok(Engine::ExternalStream(ExternalStreamEngine::new(
                    runtime, tokenizer,
                )?))
            }
        }
    }
}

/// Maps backend names to factories.
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, EngineFactory>>,
}

static GLOBAL_REGISTRY: LazyLock<BackendRegistry> = LazyLock::new(BackendRegistry::new);

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// A registry holding the built-in backends.
    pub fn new() -> Self {
        let registry = Self::empty();
        for kind in [
            BackendKind::Sequential,
            BackendKind::Batched,
            BackendKind::ExternalStream,
        ] {
            registry.register(kind.default_name(), EngineFactory::new(kind));
        }
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static BackendRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register `factory` under `name`. Re-registering a name replaces the
    /// previous factory.
    pub fn register(&self, name: impl Into<String>, factory: EngineFactory) {
        let name = name.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = factories.insert(name.clone(), factory) {
            if previous != factory {
                warn!(backend = %name, previous = %previous.kind(), replacement = %factory.kind(), "backend re-registered");
            } else {
                warn!(backend = %name, "backend registered twice");
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<EngineFactory, EngineError> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    /// Look up `name` and build its engine.
    pub fn create(&self, name: &str, ctx: &BackendContext) -> Result<Engine, EngineError> {
        let engine = self.get(name)?.build(ctx)?;
        info!(backend = %name, kind = %engine.kind(), "engine constructed");
        Ok(engine)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTokenizer, ScriptedModel};

    #[test]
    fn builtins_registered() {
        let registry = BackendRegistry::new();
        assert_eq!(registry.names(), vec!["batched", "external", "sequential"]);
        assert_eq!(
            registry.get("sequential").unwrap().kind(),
            BackendKind::Sequential
        );
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = BackendRegistry::new();
        let err = registry.get("tensorrt").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(ref n) if n == "tensorrt"));
        assert!(matches!(
            registry.create("tensorrt", &BackendContext::default()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn last_registration_wins() {
        let registry = BackendRegistry::empty();
        registry.register("fast", EngineFactory::new(BackendKind::Sequential));
        registry.register("fast", EngineFactory::new(BackendKind::Batched));
        assert_eq!(registry.get("fast").unwrap().kind(), BackendKind::Batched);
        assert_eq!(registry.names(), vec!["fast"]);
    }

    #[test]
    fn sequential_requires_model() {
        let ctx = BackendContext::default().with_tokenizer(Arc::new(MockTokenizer::new(16, 0)));
        assert!(matches!(
            BackendRegistry::new().create("sequential", &ctx),
            Err(EngineError::Dependency(_))
        ));
    }

    #[test]
    fn sequential_requires_tokenizer() {
        let ctx = BackendContext::default().with_model(Arc::new(ScriptedModel::new(vec![1], 16)));
        assert!(matches!(
            BackendRegistry::new().create("sequential", &ctx),
            Err(EngineError::Dependency(_))
        ));
    }

    #[test]
    fn batched_requires_scheduler() {
        assert!(matches!(
            BackendRegistry::new().create("batched", &BackendContext::default()),
            Err(EngineError::Dependency(_))
        ));
    }

    #[test]
    fn external_requires_runtime() {
        let ctx = BackendContext::default().with_tokenizer(Arc::new(MockTokenizer::new(16, 0)));
        assert!(matches!(
            BackendRegistry::new().create("external", &ctx),
            Err(EngineError::Dependency(_))
        ));
    }

    #[test]
    fn create_sequential_engine() {
        let ctx = BackendContext::default()
            .with_tokenizer(Arc::new(MockTokenizer::new(16, 0)))
            .with_model(Arc::new(ScriptedModel::new(vec![1], 16)));
        let engine = BackendRegistry::global().create("sequential", &ctx).unwrap();
        assert_eq!(engine.kind(), BackendKind::Sequential);
        assert_eq!(engine.name(), "sequential");
    }
}
