//! Policy Gate and Registry
//!
//! The policy evaluation engine itself is a black box to this crate: given a
//! policy and a request context it answers allow or deny. The registry is the
//! keyed policy storage consulted when validating inbound offers.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::{AssetId, ParticipantId, PolicyId};

/// A usage policy. The engine never interprets `terms`; it hands the whole
/// policy to the gate and embeds the policy id into agreements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub terms: serde_json::Value,
}

impl Policy {
    pub fn new(id: impl Into<PolicyId>, terms: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            terms,
        }
    }
}

/// Request context handed to the gate together with the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub provider_id: ParticipantId,
    pub consumer_id: ParticipantId,
    pub asset_id: AssetId,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Black-box policy predicate
#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn evaluate(&self, policy: &Policy, context: &PolicyContext) -> PolicyDecision;
}

/// In-memory keyed policy storage
#[derive(Default)]
pub struct PolicyRegistry {
    policies: DashMap<PolicyId, Policy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, policy: Policy) {
        self.policies.insert(policy.id.clone(), policy);
    }

    pub fn find(&self, policy_id: &str) -> Option<Policy> {
        self.policies.get(policy_id).map(|p| p.value().clone())
    }
}


#[cfg(test)]
pub use mock::MockPolicyGate;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> PolicyContext {
        PolicyContext {
            provider_id: "P-1".to_string(),
            consumer_id: "C-1".to_string(),
            asset_id: "A-1".to_string(),
        }
    }

    #[test]
    fn test_registry_find() {
        let registry = PolicyRegistry::new();
        registry.register(Policy::new("use-eu", json!({"region": "eu"})));

        assert!(registry.find("use-eu").is_some());
        assert!(registry.find("missing").is_none());
    }

    #[tokio::test]
    async fn test_mock_gate_allow_and_deny() {
        let gate = MockPolicyGate::allowing();
        let policy = Policy::new("p", json!({}));

        assert!(gate.evaluate(&policy, &context()).await.is_allowed());

        gate.set_deny(Some("region mismatch"));
        let decision = gate.evaluate(&policy, &context()).await;
        assert_eq!(decision, PolicyDecision::deny("region mismatch"));
        assert_eq!(gate.evaluate_count(), 2);
    }
}
