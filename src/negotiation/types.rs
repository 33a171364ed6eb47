//! Contract Negotiation Record
//!
//! The mutable record persisted by the negotiation store. Managers work on a
//! transient copy for the duration of a single transition and write back via
//! the store's compare-and-swap `save`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{NegotiationState, TerminationReason};
use crate::contract::{ContractAgreement, ContractOffer};
use crate::core_types::{EndpointAddress, NegotiationId, ParticipantId, Role};

/// Mutable contract negotiation record.
///
/// # Invariants
/// - `offers` is append-only; insertion order is the negotiation history.
/// - `offers` is never empty once the record leaves INITIAL (records are
///   created carrying the initial offer, so it never is).
/// - `agreement` is set exactly once, when the record reaches AGREED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    pub id: NegotiationId,
    /// Links the provider- and consumer-side records of the same logical
    /// negotiation; assigned by the initiating consumer.
    pub correlation_id: String,
    pub role: Role,
    pub counterparty_id: ParticipantId,
    pub counterparty_endpoint: EndpointAddress,
    pub state: NegotiationState,
    /// Offer history, oldest first
    pub offers: Vec<ContractOffer>,
    pub agreement: Option<ContractAgreement>,
    pub termination_reason: Option<TerminationReason>,
    pub error_detail: Option<String>,
    pub state_entered_at: DateTime<Utc>,
    /// Earliest instant the dispatcher may pick this record up again
    pub next_attempt_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Optimistic concurrency counter, bumped by every successful save
    pub version: u64,
}

impl ContractNegotiation {
    /// Consumer-side record for a locally initiated negotiation.
    ///
    /// The record's own id doubles as the correlation id shared with the
    /// provider side.
    pub fn initiate(offer: ContractOffer, counterparty_endpoint: EndpointAddress) -> Self {
        let id = NegotiationId::new();
        let now = Utc::now();
        Self {
            id,
            correlation_id: id.to_string(),
            role: Role::Consumer,
            counterparty_id: offer.provider_id.clone(),
            counterparty_endpoint,
            state: NegotiationState::Initial,
            offers: vec![offer],
            agreement: None,
            termination_reason: None,
            error_detail: None,
            state_entered_at: now,
            next_attempt_at: now,
            retry_count: 0,
            version: 1,
        }
    }

    /// Provider-side record created on receipt of a contract request
    pub fn from_request(
        correlation_id: impl Into<String>,
        offer: ContractOffer,
        counterparty_endpoint: EndpointAddress,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: NegotiationId::new(),
            correlation_id: correlation_id.into(),
            role: Role::Provider,
            counterparty_id: offer.consumer_id.clone(),
            counterparty_endpoint,
            state: NegotiationState::Requested,
            offers: vec![offer],
            agreement: None,
            termination_reason: None,
            error_detail: None,
            state_entered_at: now,
            next_attempt_at: now,
            retry_count: 0,
            version: 1,
        }
    }

    /// The offer currently on the table
    pub fn latest_offer(&self) -> &ContractOffer {
        // Constructors always seed the first offer
        self.offers
            .last()
            .expect("negotiation record has at least one offer")
    }

    pub fn asset_id(&self) -> &str {
        &self.offers[0].asset_id
    }

    pub fn consumer_id(&self) -> &str {
        &self.offers[0].consumer_id
    }

    /// Number of offer rounds exchanged so far
    pub fn rounds(&self) -> u32 {
        self.offers.len() as u32
    }

    /// Enter a new state, resetting the retry counter and making the record
    /// immediately eligible for the dispatcher.
    pub fn transition_to(&mut self, state: NegotiationState) {
        let now = Utc::now();
        self.state = state;
        self.state_entered_at = now;
        self.next_attempt_at = now;
        self.retry_count = 0;
    }

    /// Terminate with a reason and optional detail
    pub fn transition_terminated(&mut self, reason: TerminationReason, detail: Option<String>) {
        self.transition_to(NegotiationState::Terminated);
        self.termination_reason = Some(reason);
        self.error_detail = detail;
    }

    /// Keep the current state but push the next attempt out by `delay`,
    /// counting the retry.
    pub fn schedule_retry(&mut self, delay: Duration) {
        self.retry_count += 1;
        self.defer(delay);
    }

    /// Push the next attempt out without counting a retry (idle wait on the
    /// counterparty).
    pub fn defer(&mut self, delay: Duration) {
        self.next_attempt_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
    }
}
