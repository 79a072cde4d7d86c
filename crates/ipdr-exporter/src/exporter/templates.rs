//! Templates, keys and negotiation.
//!
//! Template edits change a session's mutable templates only. They reach the
//! wire once a new transmission context is built by `apply_templates`,
//! `negotiate_templates` or `start`.

use std::sync::Arc;

use tracing::debug;

use super::{audit_result, Exporter, ExporterInner};
use crate::audit::{AuditCategory, AuditObject, AuditRecord};
use crate::error::{ExporterError, ExporterResult};
use crate::template::{Key, KeyNegotiation, RecordEncoder, Template, TemplateConfig, TemplateInfo};
use crate::types::SessionId;

impl Exporter {
    /// Adds a template to one session. `encoder` defaults to
    /// [`FieldOrderEncoder`](crate::template::FieldOrderEncoder).
    pub fn create_template(
        &self,
        session: SessionId,
        config: TemplateConfig,
        encoder: Option<Arc<dyn RecordEncoder>>,
    ) -> ExporterResult<()> {
        let template_id = config.id;
        let result = self.locked(|inner| {
            let template = build_template(config, encoder)?;
            inner.insert_template(session, template)
        });
        audit_template(session.to_string(), template_id, "create_template", &result);
        result
    }

    /// Adds a template to every session. Fails without changes if any
    /// session already has it. Returns how many sessions were updated.
    pub fn create_template_all(
        &self,
        config: TemplateConfig,
        encoder: Option<Arc<dyn RecordEncoder>>,
    ) -> ExporterResult<usize> {
        let template_id = config.id;
        let result = self.locked(|inner| {
            let template = build_template(config, encoder)?;
            if let Some(session) = inner
                .sessions
                .values()
                .find(|s| s.templates.contains_key(&template_id))
            {
                return Err(ExporterError::TemplateExists {
                    session: session.id,
                    template_id,
                });
            }
            for session in inner.sessions.values_mut() {
                session.templates.insert(template_id, template.clone());
            }
            Ok(inner.sessions.len())
        });
        audit_template("*".into(), template_id, "create_template_all", &result);
        result
    }

    pub fn delete_template(&self, session: SessionId, template_id: u16) -> ExporterResult<()> {
        let result = self.locked(|inner| {
            inner
                .session_mut(session)?
                .templates
                .remove(&template_id)
                .map(|_| ())
                .ok_or(ExporterError::TemplateNotFound {
                    session,
                    template_id,
                })
        });
        audit_template(session.to_string(), template_id, "delete_template", &result);
        result
    }

    /// Removes a template from every session holding it.
    pub fn delete_template_all(&self, template_id: u16) -> ExporterResult<usize> {
        let result = self.locked(|inner| {
            let targets = inner.sessions_with_template(template_id)?;
            for id in &targets {
                if let Some(session) = inner.sessions.get_mut(id) {
                    session.templates.remove(&template_id);
                }
            }
            Ok(targets.len())
        });
        audit_template("*".into(), template_id, "delete_template_all", &result);
        result
    }

    /// Appends a key to a template.
    pub fn add_key(&self, session: SessionId, template_id: u16, key: Key) -> ExporterResult<()> {
        self.locked(|inner| {
            let template = inner.template_mut(session, template_id)?;
            let key_id = key.id;
            if !template.add_key(key) {
                return Err(ExporterError::KeyExists { template_id, key_id });
            }
            Ok(())
        })
    }

    pub fn add_key_all(&self, template_id: u16, key: Key) -> ExporterResult<usize> {
        self.locked(|inner| {
            let targets = inner.sessions_with_template(template_id)?;
            for id in &targets {
                if inner.template(*id, template_id)?.key(key.id).is_some() {
                    return Err(ExporterError::KeyExists {
                        template_id,
                        key_id: key.id,
                    });
                }
            }
            for id in &targets {
                inner.template_mut(*id, template_id)?.add_key(key.clone());
            }
            Ok(targets.len())
        })
    }

    pub fn remove_key(&self, session: SessionId, template_id: u16, key_id: u32) -> ExporterResult<()> {
        self.locked(|inner| {
            inner
                .template_mut(session, template_id)?
                .remove_key(key_id)
                .map(|_| ())
                .ok_or(ExporterError::KeyNotFound { template_id, key_id })
        })
    }

    pub fn remove_key_all(&self, template_id: u16, key_id: u32) -> ExporterResult<usize> {
        self.locked(|inner| {
            let targets = inner.sessions_with_key(template_id, key_id)?;
            for id in &targets {
                inner.template_mut(*id, template_id)?.remove_key(key_id);
            }
            Ok(targets.len())
        })
    }

    /// Sets a key's configured enablement.
    pub fn enable_key(
        &self,
        session: SessionId,
        template_id: u16,
        key_id: u32,
        enabled: bool,
    ) -> ExporterResult<()> {
        self.locked(|inner| {
            let key = inner
                .template_mut(session, template_id)?
                .key_mut(key_id)
                .ok_or(ExporterError::KeyNotFound { template_id, key_id })?;
            key.enabled = enabled;
            Ok(())
        })
    }

    pub fn enable_key_all(&self, template_id: u16, key_id: u32, enabled: bool) -> ExporterResult<usize> {
        self.locked(|inner| {
            let targets = inner.sessions_with_key(template_id, key_id)?;
            for id in &targets {
                if let Some(key) = inner.template_mut(*id, template_id)?.key_mut(key_id) {
                    key.enabled = enabled;
                }
            }
            Ok(targets.len())
        })
    }

    pub fn get_template(&self, session: SessionId, template_id: u16) -> ExporterResult<TemplateInfo> {
        self.locked(|inner| inner.template(session, template_id).map(TemplateInfo::from))
    }

    pub fn list_templates(&self, session: SessionId) -> ExporterResult<Vec<TemplateInfo>> {
        self.locked(|inner| {
            Ok(inner
                .session(session)?
                .templates
                .values()
                .map(TemplateInfo::from)
                .collect())
        })
    }

    /// Applies collector-requested key enablement and builds a new
    /// transmission context. Returns the new configuration id.
    pub fn negotiate_templates(&self, session: SessionId, changes: &[KeyNegotiation]) -> ExporterResult<u16> {
        let result = self.locked(|inner| {
            if !inner.session(session)?.negotiable {
                return Err(ExporterError::InvalidArgument(format!(
                    "session {} does not allow template negotiation",
                    session
                )));
            }
            for change in changes {
                inner
                    .template(session, change.template_id)?
                    .key(change.key_id)
                    .ok_or(ExporterError::KeyNotFound {
                        template_id: change.template_id,
                        key_id: change.key_id,
                    })?;
            }
            for change in changes {
                if let Some(key) = inner
                    .template_mut(session, change.template_id)?
                    .key_mut(change.key_id)
                {
                    key.negotiated = Some(change.enabled);
                }
            }
            debug!(session = session.0, changes = changes.len(), "templates negotiated");
            inner.new_context(session)
        });
        audit_result(
            AuditRecord::new(AuditCategory::Configuration, "negotiate_templates")
                .object(AuditObject::Session)
                .id(session.to_string())
                .details(serde_json::json!({ "changes": changes.len() })),
            &result,
        );
        result
    }
}

fn build_template(config: TemplateConfig, encoder: Option<Arc<dyn RecordEncoder>>) -> ExporterResult<Template> {
    let template_id = config.id;
    Template::from_config(config, encoder)
        .map_err(|key_id| ExporterError::KeyExists { template_id, key_id })
}

fn audit_template<T>(session: String, template_id: u16, action: &str, result: &ExporterResult<T>) {
    audit_result(
        AuditRecord::new(AuditCategory::Configuration, action)
            .object(AuditObject::Template)
            .id(format!("{}:{}", session, template_id)),
        result,
    );
}

impl ExporterInner {
    fn insert_template(&mut self, session: SessionId, template: Template) -> ExporterResult<()> {
        let target = self.session_mut(session)?;
        let template_id = template.id();
        if target.templates.contains_key(&template_id) {
            return Err(ExporterError::TemplateExists {
                session,
                template_id,
            });
        }
        target.templates.insert(template_id, template);
        Ok(())
    }

    pub(crate) fn template(&self, session: SessionId, template_id: u16) -> ExporterResult<&Template> {
        self.session(session)?
            .templates
            .get(&template_id)
            .ok_or(ExporterError::TemplateNotFound {
                session,
                template_id,
            })
    }

    fn template_mut(&mut self, session: SessionId, template_id: u16) -> ExporterResult<&mut Template> {
        self.session_mut(session)?
            .templates
            .get_mut(&template_id)
            .ok_or(ExporterError::TemplateNotFound {
                session,
                template_id,
            })
    }

    fn sessions_with_template(&self, template_id: u16) -> ExporterResult<Vec<SessionId>> {
        let targets: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.templates.contains_key(&template_id))
            .map(|s| s.id)
            .collect();
        if targets.is_empty() {
            return Err(ExporterError::TemplateNotFoundAnywhere(template_id));
        }
        Ok(targets)
    }

    /// Sessions holding the template; every one must also hold the key.
    fn sessions_with_key(&self, template_id: u16, key_id: u32) -> ExporterResult<Vec<SessionId>> {
        let targets = self.sessions_with_template(template_id)?;
        for id in &targets {
            if self.template(*id, template_id)?.key(key_id).is_none() {
                return Err(ExporterError::KeyNotFound { template_id, key_id });
            }
        }
        Ok(targets)
    }
}
