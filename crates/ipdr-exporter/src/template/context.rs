//! Transmission contexts and configuration ids.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::SessionId;

use super::types::TemplateSnapshot;

/// Immutable snapshot of a session's templates under one configuration id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionContext {
    config_id: u16,
    templates: Vec<TemplateSnapshot>,
}

impl TransmissionContext {
    pub(crate) fn new(config_id: u16, templates: Vec<TemplateSnapshot>) -> Self {
        Self {
            config_id,
            templates,
        }
    }

    pub fn config_id(&self) -> u16 {
        self.config_id
    }

    pub fn templates(&self) -> &[TemplateSnapshot] {
        &self.templates
    }

    pub fn template(&self, template_id: u16) -> Option<&TemplateSnapshot> {
        self.templates.iter().find(|t| t.id == template_id)
    }
}

/// Observes configuration id allocation.
///
/// Lets an external controller keep configuration ids consistent across
/// cooperating exporters.
pub trait ConfigurationIdCallbacks: Send + Sync {
    /// Supplies the first configuration id of a session. `None` means 1; a
    /// returned 0 is replaced by 1.
    fn initial_configuration_id(&self, _session: SessionId) -> Option<u16> {
        None
    }

    /// Called whenever a session moves to a new configuration id.
    fn configuration_id_changed(&self, _session: SessionId, _previous: u16, _current: u16) {}
}

/// Accepts the built-in numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfigurationIds;

impl ConfigurationIdCallbacks for DefaultConfigurationIds {}

/// Returns the id following `previous`, skipping the reserved value 0.
pub fn next_configuration_id(previous: u16) -> u16 {
    match previous.wrapping_add(1) {
        0 => 1,
        id => id,
    }
}

/// A session's contexts, oldest (active) first and newest (work) last.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextChain {
    contexts: VecDeque<Arc<TransmissionContext>>,
    last_config_id: Option<u16>,
}

impl ContextChain {
    /// Allocates the next configuration id. Returns the new id and, for every
    /// id after the first, the id it replaces.
    pub(crate) fn allocate_id(&mut self, initial: impl FnOnce() -> Option<u16>) -> (u16, Option<u16>) {
        let (id, previous) = match self.last_config_id {
            None => {
                let id = match initial() {
                    None | Some(0) => 1,
                    Some(id) => id,
                };
                (id, None)
            }
            Some(prev) => (next_configuration_id(prev), Some(prev)),
        };
        self.last_config_id = Some(id);
        (id, previous)
    }

    pub(crate) fn push(&mut self, context: TransmissionContext) -> Arc<TransmissionContext> {
        let context = Arc::new(context);
        self.contexts.push_back(Arc::clone(&context));
        context
    }

    pub(crate) fn work(&self) -> Option<&Arc<TransmissionContext>> {
        self.contexts.back()
    }

    pub(crate) fn ids(&self) -> Vec<u16> {
        self.contexts.iter().map(|c| c.config_id()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drops every context except the work context for which `in_use`
    /// returns false. Returns the dropped ids.
    pub(crate) fn collect_garbage(&mut self, mut in_use: impl FnMut(u16) -> bool) -> Vec<u16> {
        let Some(work_id) = self.work().map(|c| c.config_id()) else {
            return Vec::new();
        };
        let mut dropped = Vec::new();
        self.contexts.retain(|c| {
            let keep = c.config_id() == work_id || in_use(c.config_id());
            if !keep {
                dropped.push(c.config_id());
            }
            keep
        });
        dropped
    }
}
