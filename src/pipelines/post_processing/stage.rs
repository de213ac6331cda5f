// SPDX-License-Identifier: GPL-3.0-only

//! Post-processing stage contract and registry

use super::stages::{MotionDetectStage, NegateStage};
use crate::backends::camera::types::StreamConfig;
use crate::capture::frame::CompletedFrame;
use crate::errors::{CaptureResult, StageError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One step of the post-processing chain
///
/// Different frames run through the same stage at the same time, so every
/// hook except [`Stage::read`] takes `&self`. Stages that keep state between
/// frames guard it themselves.
pub trait Stage: Send + Sync {
    /// Name the stage is registered under
    fn name(&self) -> &str;

    /// Read the stage's parameters from its entry in the post-process document
    fn read(&mut self, _params: &Value) -> CaptureResult<()> {
        Ok(())
    }

    /// Adjust a stream configuration before it is negotiated with the camera
    ///
    /// `use_case` is the stream role, e.g. `"viewfinder"`.
    fn adjust_config(&self, _use_case: &str, _config: &mut StreamConfig) {}

    /// Called once the streams are final
    fn configure(&self, _streams: &[StreamConfig]) -> CaptureResult<()> {
        Ok(())
    }

    fn start(&self) {}

    /// Process one frame
    ///
    /// Returns `Ok(true)` to drop the frame. Later stages then never see it.
    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError>;

    fn stop(&self) {}

    fn teardown(&self) {}
}

/// Creates a fresh stage instance
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Name to factory map used to build a pipeline from its JSON description
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the stages shipped with the crate
    pub fn with_builtin_stages() -> Self {
        let mut registry = Self::new();
        registry.register(NegateStage::NAME, || Box::new(NegateStage::new()));
        registry.register(MotionDetectStage::NAME, || Box::new(MotionDetectStage::new()));
        registry
    }

    /// Register a factory, replacing any earlier one with the same name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        if self.factories.insert(name.to_string(), Arc::new(factory)).is_some() {
            debug!(stage = name, "Replaced stage factory");
        }
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Stage>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered stage names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
