//! Execution Context
//!
//! Carries tracing ids and the acting principal through one logical flow.
//! The context lives in the ambient flow, is copied into every scope created
//! there, and is what the built-in hooks stamp entities and events with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uf_common::TsidGenerator;

/// Principal used when no caller identity is known
pub const SYSTEM_PRINCIPAL: &str = "system";

/// Context for one logical operation.
///
/// - `correlation_id` traces a request across services
/// - `causation_id` references the event that triggered this execution
/// - `principal_id` is who audit stamps are attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub principal_id: String,
    pub initiated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Fresh context; the correlation id starts as the execution id.
    pub fn create(principal_id: impl Into<String>) -> Self {
        let exec_id = TsidGenerator::prefixed("exec");
        Self {
            execution_id: exec_id.clone(),
            correlation_id: exec_id,
            causation_id: None,
            principal_id: principal_id.into(),
            initiated_at: Utc::now(),
        }
    }

    /// Context for work not attributable to a caller
    pub fn system() -> Self {
        Self::create(SYSTEM_PRINCIPAL)
    }

    /// Continue an upstream correlation id
    pub fn with_correlation(
        principal_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::create(principal_id)
        }
    }

    /// Child context within the same execution, caused by `causing_event_id`
    pub fn with_causation(&self, causing_event_id: impl Into<String>) -> Self {
        Self {
            causation_id: Some(causing_event_id.into()),
            initiated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Same execution on behalf of another principal
    pub fn with_principal(&self, principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            ..self.clone()
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::system()
    }
}

/// A domain or integration event raised by an entity.
///
/// Created unstamped by the entity; the domain event hook fills the tracing
/// fields from the saving scope's `ExecutionContext` before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    /// `{app}:{domain}:{aggregate}:{action}`, e.g. `shop:orders:order:placed`
    pub event_type: String,
    /// `{domain}.{aggregate}.{id}`
    pub subject: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        subject: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: TsidGenerator::generate(),
            event_type: event_type.into(),
            subject: subject.into(),
            time: Utc::now(),
            execution_id: None,
            correlation_id: None,
            causation_id: None,
            principal_id: None,
            data,
        }
    }

    /// Fill unset tracing fields from `ctx`. Fields the raiser already set
    /// are left alone.
    pub fn stamp(&mut self, ctx: &ExecutionContext) {
        if self.execution_id.is_none() {
            self.execution_id = Some(ctx.execution_id.clone());
        }
        if self.correlation_id.is_none() {
            self.correlation_id = Some(ctx.correlation_id.clone());
        }
        if self.causation_id.is_none() {
            self.causation_id = ctx.causation_id.clone();
        }
        if self.principal_id.is_none() {
            self.principal_id = Some(ctx.principal_id.clone());
        }
    }

    pub fn is_stamped(&self) -> bool {
        self.correlation_id.is_some() && self.principal_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_context() {
        let ctx = ExecutionContext::create("user-123");

        assert!(ctx.execution_id.starts_with("exec-"));
        assert_eq!(ctx.principal_id, "user-123");
        assert_eq!(ctx.correlation_id, ctx.execution_id);
        assert!(ctx.causation_id.is_none());
    }

    #[test]
    fn test_with_correlation() {
        let ctx = ExecutionContext::with_correlation("user-123", "corr-456");
        assert_eq!(ctx.correlation_id, "corr-456");
        assert_ne!(ctx.execution_id, "corr-456");
    }

    #[test]
    fn test_with_causation_and_principal() {
        let ctx = ExecutionContext::create("user-123");
        let child = ctx.with_causation("evt-789").with_principal("system");

        assert_eq!(child.execution_id, ctx.execution_id);
        assert_eq!(child.correlation_id, ctx.correlation_id);
        assert_eq!(child.causation_id.as_deref(), Some("evt-789"));
        assert_eq!(child.principal_id, "system");
    }

    #[test]
    fn test_stamp_keeps_explicit_fields() {
        let ctx = ExecutionContext::with_correlation("user-1", "corr-1");
        let mut event = EventEnvelope::new(
            "shop:orders:order:placed",
            "orders.order.42",
            serde_json::json!({ "total": 10 }),
        );
        event.principal_id = Some("importer".to_string());
        assert!(!event.is_stamped());

        event.stamp(&ctx);
        assert!(event.is_stamped());
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(event.principal_id.as_deref(), Some("importer"));
    }
}
