//! Contract Types
//!
//! Offers, agreements, and provider-side contract definitions. Offers and
//! agreements are immutable once created; counter-offers are new instances
//! appended to the negotiation history.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core_types::{AgreementId, AssetId, OfferId, ParticipantId, PolicyId};

/// Immutable description of proposed contract terms.
///
/// Each offer carries its own id, unique per negotiation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: OfferId,
    pub asset_id: AssetId,
    pub policy_id: PolicyId,
    pub provider_id: ParticipantId,
    pub consumer_id: ParticipantId,
}

impl ContractOffer {
    pub fn new(
        asset_id: impl Into<AssetId>,
        policy_id: impl Into<PolicyId>,
        provider_id: impl Into<ParticipantId>,
        consumer_id: impl Into<ParticipantId>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            asset_id: asset_id.into(),
            policy_id: policy_id.into(),
            provider_id: provider_id.into(),
            consumer_id: consumer_id.into(),
        }
    }

    /// A counter-offer proposes a different policy over the same asset and
    /// parties, under a fresh offer id.
    pub fn counter(&self, policy_id: impl Into<PolicyId>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            asset_id: self.asset_id.clone(),
            policy_id: policy_id.into(),
            provider_id: self.provider_id.clone(),
            consumer_id: self.consumer_id.clone(),
        }
    }
}

/// Immutable contract agreement, created exactly once per successful
/// negotiation when the provider accepts an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: AgreementId,
    /// The finally-accepted offer
    pub offer: ContractOffer,
    pub policy_id: PolicyId,
    pub signed_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl ContractAgreement {
    pub fn new(offer: ContractOffer, validity: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            policy_id: offer.policy_id.clone(),
            offer,
            signed_at: now,
            valid_from: now,
            valid_until: now + validity,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_from || now > self.valid_until
    }

    pub fn provider_id(&self) -> &str {
        &self.offer.provider_id
    }

    pub fn consumer_id(&self) -> &str {
        &self.offer.consumer_id
    }
}

/// Provider-side rule binding assets to the policies they may be contracted
/// under. An inbound initial offer must match a definition or the
/// negotiation is rejected before any policy evaluation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDefinition {
    pub id: String,
    /// Policy the gate evaluates for this definition
    pub contract_policy_id: PolicyId,
    /// Assets this definition covers; empty selects every asset
    pub asset_ids: Vec<AssetId>,
}

impl ContractDefinition {
    pub fn new(id: impl Into<String>, contract_policy_id: impl Into<PolicyId>) -> Self {
        Self {
            id: id.into(),
            contract_policy_id: contract_policy_id.into(),
            asset_ids: Vec::new(),
        }
    }

    pub fn for_assets(mut self, asset_ids: Vec<AssetId>) -> Self {
        self.asset_ids = asset_ids;
        self
    }

    pub fn covers(&self, asset_id: &str, policy_id: &str) -> bool {
        let asset_matches =
            self.asset_ids.is_empty() || self.asset_ids.iter().any(|a| a == asset_id);
        asset_matches && self.contract_policy_id == policy_id
    }
}

/// In-memory contract definition store
#[derive(Default)]
pub struct ContractDefinitionStore {
    definitions: DashMap<String, ContractDefinition>,
}

impl ContractDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, definition: ContractDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    /// First definition covering the given (asset, policy) pair
    pub fn definition_for(&self, asset_id: &str, policy_id: &str) -> Option<ContractDefinition> {
        self.definitions
            .iter()
            .find(|entry| entry.value().covers(asset_id, policy_id))
            .map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> ContractOffer {
        ContractOffer::new("A-1", "P-1", "provider-1", "consumer-1")
    }

    #[test]
    fn test_counter_offer_keeps_parties_and_asset() {
        let initial = offer();
        let counter = initial.counter("P-2");

        assert_ne!(initial.id, counter.id);
        assert_eq!(counter.asset_id, "A-1");
        assert_eq!(counter.policy_id, "P-2");
        assert_eq!(counter.provider_id, initial.provider_id);
        assert_eq!(counter.consumer_id, initial.consumer_id);
    }

    #[test]
    fn test_agreement_validity_window() {
        let agreement = ContractAgreement::new(offer(), chrono::Duration::hours(1));

        assert!(!agreement.is_expired(Utc::now()));
        assert!(agreement.is_expired(Utc::now() + chrono::Duration::hours(2)));
        assert!(agreement.is_expired(Utc::now() - chrono::Duration::hours(1)));
    }

    #[test]
    fn test_definition_covers() {
        let definition = ContractDefinition::new("def-1", "P-1").for_assets(vec!["A-1".into()]);

        assert!(definition.covers("A-1", "P-1"));
        assert!(!definition.covers("A-2", "P-1"));
        assert!(!definition.covers("A-1", "P-2"));

        let open = ContractDefinition::new("def-2", "P-1");
        assert!(open.covers("anything", "P-1"));
    }

    #[test]
    fn test_definition_store_lookup() {
        let store = ContractDefinitionStore::new();
        store.save(ContractDefinition::new("def-1", "P-1").for_assets(vec!["A-1".into()]));

        assert!(store.definition_for("A-1", "P-1").is_some());
        assert!(store.definition_for("A-1", "P-9").is_none());
    }
}
