//! Per-process cache of built likelihood functions.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burn::tensor::backend::AutodiffBackend;

use super::LanFunctions;
use super::config::LanConfig;
use super::factory::build_likelihood;
use crate::errors::LanError;
use crate::graph::ModelSource;

/// Functions built on one backend and device are never handed to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: String,
    backend: &'static str,
    device: String,
    n_params: usize,
    compile: bool,
}

/// Builds each `(source, backend, device, n_params, compile)` combination once.
#[derive(Debug, Default)]
pub struct FunctionCache {
    config: LanConfig,
    entries: Mutex<HashMap<CacheKey, Arc<LanFunctions>>>,
}

impl FunctionCache {
    /// Creates a cache that builds with `config` (its `compile` flag is
    /// overridden per request).
    pub fn new(config: LanConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached functions for this key, building them on first use.
    pub fn get_or_build<B: AutodiffBackend>(
        &self,
        source: impl Into<ModelSource>,
        n_params: usize,
        compile: bool,
        device: &B::Device,
    ) -> Result<Arc<LanFunctions>, LanError> {
        let source = source.into();
        let key = CacheKey {
            source: source.cache_key(),
            backend: type_name::<B>(),
            device: format!("{device:?}"),
            n_params,
            compile,
        };

        let mut entries = self.entries();
        if let Some(functions) = entries.get(&key) {
            return Ok(Arc::clone(functions));
        }

        let config = self.config.clone().compile(compile);
        let functions = Arc::new(build_likelihood::<B>(source, n_params, &config, device)?);
        log::debug!("Cached likelihood functions for {} on {}", key.source, key.backend);
        entries.insert(key, Arc::clone(&functions));
        Ok(functions)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// A panic mid-build never inserts, so the map stays usable after poisoning.
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<LanFunctions>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
