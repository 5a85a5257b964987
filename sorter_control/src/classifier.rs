//! Classifier client seam.
//!
//! The neural inference engine is an external collaborator; this module
//! defines the capability the pipeline programs against, the wrapper
//! that applies alias mapping and the confidence gate, and the scripted
//! and stub backends used off-target.
//!
//! Model slots are a closed pair (primary/backup); failover is a
//! `reload` commanded by the recovery supervisor, not a plugin swap.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use sorter_common::clock::VirtualClock;
use sorter_common::config::AiModelSettings;
use sorter_common::item::{BoundingBox, Category, Classification};

/// Classifier failure modes surfaced to the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifyError {
    /// Inference did not finish before the deadline.
    #[error("inference timed out after {0} ms")]
    Timeout(u64),

    /// Model produced no usable result.
    #[error("model error: {0}")]
    Model(String),
}

/// Raw model output before alias mapping and the confidence gate.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub label: String,
    pub confidence: f64,
    pub bbox: Option<BoundingBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSlot {
    Primary,
    Backup,
}

/// Backend capability: classify one frame under a deadline.
pub trait Classifier: Send {
    fn classify(
        &mut self,
        frame_ref: u64,
        deadline_ns: u64,
    ) -> Result<RawClassification, ClassifyError>;

    fn active_slot(&self) -> ModelSlot;

    /// Load the given model slot. Commanded by the recovery supervisor.
    fn reload(&mut self, slot: ModelSlot) -> Result<(), ClassifyError>;
}

// ─── Client Wrapper ─────────────────────────────────────────────────

/// Applies the class-alias table and the confidence gate over a backend.
///
/// Low confidence substitutes the fallback category and sets the flag;
/// the item is still treated as classified downstream.
pub struct ClassifierClient {
    inner: Box<dyn Classifier>,
    min_confidence: f64,
    fallback: Category,
    aliases: BTreeMap<String, Category>,
}

impl ClassifierClient {
    pub fn new(inner: Box<dyn Classifier>, settings: &AiModelSettings) -> Self {
        Self {
            inner,
            min_confidence: settings.min_confidence,
            fallback: settings.fallback_category,
            aliases: settings.class_mapping.clone(),
        }
    }

    /// Reread gate parameters, e.g. after a hot reload.
    pub fn update_settings(&mut self, settings: &AiModelSettings) {
        self.min_confidence = settings.min_confidence;
        self.fallback = settings.fallback_category;
        self.aliases = settings.class_mapping.clone();
    }

    pub fn classify(
        &mut self,
        frame_ref: u64,
        deadline_ns: u64,
    ) -> Result<Classification, ClassifyError> {
        let raw = self.inner.classify(frame_ref, deadline_ns)?;

        let mapped = self
            .aliases
            .get(&raw.label)
            .copied()
            .or_else(|| Category::from_name(&raw.label));

        let (category, fallback_applied) = match mapped {
            Some(cat) if raw.confidence >= self.min_confidence => (cat, false),
            // Low confidence or an unknown label take the fallback.
            _ => (self.fallback, true),
        };

        Ok(Classification {
            category,
            confidence: raw.confidence,
            bbox: raw.bbox,
            fallback_applied,
        })
    }

    pub fn active_slot(&self) -> ModelSlot {
        self.inner.active_slot()
    }

    pub fn reload(&mut self, slot: ModelSlot) -> Result<(), ClassifyError> {
        self.inner.reload(slot)
    }
}

// ─── Scripted Backend (tests, simulation) ───────────────────────────

/// One scripted classification step.
pub struct ScriptedStep {
    /// Virtual time the inference consumes before returning.
    pub advance: Duration,
    pub result: Result<RawClassification, ClassifyError>,
}

impl ScriptedStep {
    pub fn ok(advance: Duration, label: &str, confidence: f64) -> Self {
        Self {
            advance,
            result: Ok(RawClassification {
                label: label.into(),
                confidence,
                bbox: None,
            }),
        }
    }

    pub fn err(advance: Duration, error: ClassifyError) -> Self {
        Self {
            advance,
            result: Err(error),
        }
    }
}

/// Deterministic backend driven by a script and a virtual clock.
///
/// Each `classify` pops the next step, advances the shared virtual clock
/// by the scripted inference time, and returns the scripted result, so
/// single-threaded tests observe realistic classification latency
/// without sleeping.
pub struct ScriptedClassifier {
    clock: Arc<VirtualClock>,
    script: VecDeque<ScriptedStep>,
    slot: ModelSlot,
}

impl ScriptedClassifier {
    pub fn new(clock: Arc<VirtualClock>) -> Self {
        Self {
            clock,
            script: VecDeque::new(),
            slot: ModelSlot::Primary,
        }
    }

    pub fn push(&mut self, step: ScriptedStep) {
        self.script.push_back(step);
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Classifier for ScriptedClassifier {
    fn classify(
        &mut self,
        _frame_ref: u64,
        _deadline_ns: u64,
    ) -> Result<RawClassification, ClassifyError> {
        let step = self
            .script
            .pop_front()
            .ok_or_else(|| ClassifyError::Model("script exhausted".into()))?;
        if !step.advance.is_zero() {
            self.clock.advance(step.advance);
        }
        step.result
    }

    fn active_slot(&self) -> ModelSlot {
        self.slot
    }

    fn reload(&mut self, slot: ModelSlot) -> Result<(), ClassifyError> {
        self.slot = slot;
        Ok(())
    }
}

/// Demo backend for `--simulate` runs: cycles through the canonical
/// categories with fixed confidence.
pub struct StubClassifier {
    next: usize,
    slot: ModelSlot,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self {
            next: 0,
            slot: ModelSlot::Primary,
        }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubClassifier {
    fn classify(
        &mut self,
        _frame_ref: u64,
        _deadline_ns: u64,
    ) -> Result<RawClassification, ClassifyError> {
        let category = Category::ALL[self.next % Category::ALL.len()];
        self.next += 1;
        Ok(RawClassification {
            label: category.as_str().into(),
            confidence: 0.9,
            bbox: None,
        })
    }

    fn active_slot(&self) -> ModelSlot {
        self.slot
    }

    fn reload(&mut self, slot: ModelSlot) -> Result<(), ClassifyError> {
        self.slot = slot;
        Ok(())
    }
}
