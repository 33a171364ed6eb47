//! Negotiation Manager
//!
//! Drives the Contract Negotiation state machine on both the provider and
//! consumer side. Transitions are driven by incoming protocol messages
//! (via [`NegotiationManager::handle_message`]) and by the dispatcher
//! invoking [`NegotiationManager::step`] on leased records.
//!
//! # Safety Invariants
//!
//! 1. Every write goes through the store's version CAS; a lost race is
//!    surfaced as `ConcurrentModification`, never silently overwritten.
//! 2. Terminal records (CONFIRMED, TERMINATED) accept no transitions;
//!    message redelivery and repeated operations are no-ops.
//! 3. Outbound sends are idempotent per message, so re-sending after a
//!    crash or lease expiry is safe.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{NegotiationState, TerminationReason};
use super::store::NegotiationStore;
use super::types::ContractNegotiation;
use crate::asset::AssetIndex;
use crate::config::{NegotiationConfig, RetryPolicy};
use crate::contract::{ContractAgreement, ContractDefinitionStore, ContractOffer};
use crate::core_types::{EndpointAddress, NegotiationId, ParticipantId, Role};
use crate::policy::{PolicyContext, PolicyDecision, PolicyGate, PolicyRegistry};
use crate::protocol::{InboundMessage, ProtocolChannel, ProtocolMessage, TransportError};
use crate::store::StoreError;

/// Negotiation manager error taxonomy
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message that cannot be applied: unknown correlation, wrong role,
    /// stale offer id
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A local operation against a record in the wrong state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl NegotiationError {
    /// Retryable errors leave the record in place for another attempt;
    /// the rest are definitive.
    pub fn is_retryable(&self) -> bool {
        match self {
            NegotiationError::Store(e) => e.is_retryable(),
            NegotiationError::Transport(_) => true,
            _ => false,
        }
    }
}

/// This connector's identity on the wire
#[derive(Debug, Clone)]
pub struct ConnectorIdentity {
    pub participant_id: ParticipantId,
    pub endpoint: EndpointAddress,
}

impl ConnectorIdentity {
    pub fn new(participant_id: impl Into<ParticipantId>, endpoint: impl Into<EndpointAddress>) -> Self {
        Self {
            participant_id: participant_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Drives contract negotiations for one connector
pub struct NegotiationManager {
    store: Arc<dyn NegotiationStore>,
    channel: Arc<dyn ProtocolChannel>,
    policy_gate: Arc<dyn PolicyGate>,
    policies: Arc<PolicyRegistry>,
    definitions: Arc<ContractDefinitionStore>,
    asset_index: Arc<dyn AssetIndex>,
    config: NegotiationConfig,
    retry: RetryPolicy,
    identity: ConnectorIdentity,
    /// Cancellations are queued and take effect when drained by the
    /// dispatcher, not synchronously.
    pending_cancellations: Mutex<Vec<NegotiationId>>,
}

impl NegotiationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn NegotiationStore>,
        channel: Arc<dyn ProtocolChannel>,
        policy_gate: Arc<dyn PolicyGate>,
        policies: Arc<PolicyRegistry>,
        definitions: Arc<ContractDefinitionStore>,
        asset_index: Arc<dyn AssetIndex>,
        config: NegotiationConfig,
        retry: RetryPolicy,
        identity: ConnectorIdentity,
    ) -> Self {
        Self {
            store,
            channel,
            policy_gate,
            policies,
            definitions,
            asset_index,
            config,
            retry,
            identity,
            pending_cancellations: Mutex::new(Vec::new()),
        }
    }

    /// Consumer side: open a negotiation with an initial offer.
    ///
    /// Fails with a store conflict if a non-terminal negotiation already
    /// exists for the same (asset, consumer) pair. The initial request is
    /// sent by the dispatcher on the next tick.
    pub async fn initiate(
        &self,
        offer: ContractOffer,
        provider_endpoint: EndpointAddress,
    ) -> Result<NegotiationId, NegotiationError> {
        let negotiation = ContractNegotiation::initiate(offer, provider_endpoint);
        let id = negotiation.id;
        let asset_id = negotiation.asset_id().to_string();
        self.store.create(negotiation).await?;

        info!(negotiation_id = %id, asset_id = %asset_id, "Contract negotiation initiated");
        Ok(id)
    }

    pub async fn get(&self, id: &NegotiationId) -> Result<ContractNegotiation, NegotiationError> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Local decision: put a counter-offer on the table.
    ///
    /// Valid while the offer loop is open (REQUESTED/OFFERED); a no-op on
    /// terminal records. The counter proposes `policy_id` over the same
    /// asset and parties.
    pub async fn counter_offer(
        &self,
        id: &NegotiationId,
        policy_id: &str,
    ) -> Result<ContractNegotiation, NegotiationError> {
        let mut negotiation = self.store.find_by_id(id).await?;

        if negotiation.state.is_terminal() {
            debug!(negotiation_id = %id, state = %negotiation.state, "Counter-offer ignored on terminal negotiation");
            return Ok(negotiation);
        }
        if !matches!(
            negotiation.state,
            NegotiationState::Requested | NegotiationState::Offered
        ) {
            return Err(NegotiationError::InvalidOperation(format!(
                "cannot counter-offer in state {}",
                negotiation.state
            )));
        }

        if negotiation.rounds() + 1 > self.config.max_rounds {
            return self.terminate_with_notice(
                negotiation,
                TerminationReason::MaxRoundsExceeded,
                None,
            )
            .await;
        }

        let counter = negotiation.latest_offer().counter(policy_id);
        self.channel
            .send(
                &negotiation.counterparty_endpoint,
                ProtocolMessage::Offer {
                    correlation_id: negotiation.correlation_id.clone(),
                    offer: counter.clone(),
                },
            )
            .await?;

        negotiation.offers.push(counter);
        // The countering party's offer is now the one on the table
        let next = match negotiation.role {
            Role::Consumer => NegotiationState::Requested,
            Role::Provider => NegotiationState::Offered,
        };
        negotiation.transition_to(next);
        let saved = self.store.save(negotiation).await?;

        info!(
            negotiation_id = %id,
            state = %saved.state,
            rounds = saved.rounds(),
            "Counter-offer sent"
        );
        Ok(saved)
    }

    /// Queue a cancellation. Takes effect the next time the dispatcher
    /// drains cancellations, not synchronously; callers needing
    /// confirmation must poll the record.
    pub fn cancel(&self, id: NegotiationId) {
        debug!(negotiation_id = %id, "Negotiation cancellation queued");
        self.pending_cancellations.lock().unwrap().push(id);
    }

    /// Apply queued cancellations; returns how many took effect
    pub async fn process_cancellations(&self) -> usize {
        let ids: Vec<NegotiationId> =
            std::mem::take(&mut *self.pending_cancellations.lock().unwrap());
        let mut applied = 0;

        for id in ids {
            match self.apply_cancellation(&id).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(NegotiationError::Store(StoreError::ConcurrentModification(_))) => {
                    // Lost the race this pass; try again next drain
                    self.pending_cancellations.lock().unwrap().push(id);
                }
                Err(e) => {
                    warn!(negotiation_id = %id, error = %e, "Failed to apply cancellation");
                }
            }
        }
        applied
    }

    async fn apply_cancellation(&self, id: &NegotiationId) -> Result<bool, NegotiationError> {
        let negotiation = self.store.find_by_id(id).await?;
        if negotiation.state.is_terminal() {
            return Ok(false);
        }

        self.terminate_with_notice(negotiation, TerminationReason::Cancelled, None)
            .await?;
        Ok(true)
    }

    /// Apply an inbound protocol message.
    ///
    /// Redelivery to a terminal record is a no-op; a save lost to a
    /// concurrent transition is retried against the fresh record.
    pub async fn handle_message(&self, inbound: InboundMessage) -> Result<(), NegotiationError> {
        debug!(
            sender = %inbound.sender,
            kind = inbound.message.kind(),
            correlation_id = inbound.message.correlation_id(),
            "Inbound negotiation message"
        );

        for _attempt in 0..3 {
            match self.apply_message(&inbound.message).await {
                Err(NegotiationError::Store(StoreError::ConcurrentModification(_))) => continue,
                result => return result,
            }
        }
        Err(NegotiationError::Store(StoreError::ConcurrentModification(
            format!("message {} never applied", inbound.message.kind()),
        )))
    }

    async fn apply_message(&self, message: &ProtocolMessage) -> Result<(), NegotiationError> {
        match message {
            ProtocolMessage::Request {
                correlation_id,
                offer,
                callback,
            } => {
                self.on_request(correlation_id, offer, callback).await
            }
            ProtocolMessage::Offer {
                correlation_id,
                offer,
            } => self.on_offer(correlation_id, offer).await,
            ProtocolMessage::Accept {
                correlation_id,
                offer_id,
            } => self.on_accept(correlation_id, offer_id).await,
            ProtocolMessage::Agreement {
                correlation_id,
                agreement,
            } => self.on_agreement(correlation_id, agreement).await,
            ProtocolMessage::Ack { correlation_id } => self.on_ack(correlation_id).await,
            ProtocolMessage::Terminate {
                correlation_id,
                reason,
            } => self.on_terminate(correlation_id, reason).await,
        }
    }

    /// Provider side: a consumer opened a negotiation
    async fn on_request(
        &self,
        correlation_id: &str,
        offer: &ContractOffer,
        callback: &EndpointAddress,
    ) -> Result<(), NegotiationError> {
        // Redelivery of an already-processed request is a no-op
        if self.store.find_by_correlation_id(correlation_id).await.is_ok() {
            debug!(correlation_id, "Duplicate contract request ignored");
            return Ok(());
        }

        let mut negotiation =
            ContractNegotiation::from_request(correlation_id, offer.clone(), callback.clone());

        if let Some(detail) = self.validate_request(offer).await {
            negotiation
                .transition_terminated(TerminationReason::InvalidOffer, Some(detail.clone()));
            self.store.create(negotiation).await?;
            self.send_terminate(callback, correlation_id, TerminationReason::InvalidOffer)
                .await;

            warn!(correlation_id, detail = %detail, "Contract request rejected as invalid");
            return Ok(());
        }

        match self.store.create(negotiation).await {
            Ok(()) => {
                info!(correlation_id, asset_id = %offer.asset_id, "Contract request accepted for evaluation");
                Ok(())
            }
            Err(StoreError::Conflict(detail)) => {
                // Another negotiation for this (asset, consumer) pair is
                // still active; tell the counterparty and drop the request.
                self.send_terminate(callback, correlation_id, TerminationReason::InvalidOffer)
                    .await;
                warn!(correlation_id, detail = %detail, "Contract request conflicts with active negotiation");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Offer received in the wrong direction or for unknown material
    async fn validate_request(&self, offer: &ContractOffer) -> Option<String> {
        if offer.provider_id != self.identity.participant_id {
            return Some(format!(
                "offer addressed to provider {}, this is {}",
                offer.provider_id, self.identity.participant_id
            ));
        }
        if self.asset_index.lookup(&offer.asset_id).await.is_none() {
            return Some(format!("unknown asset {}", offer.asset_id));
        }
        if self.policies.find(&offer.policy_id).is_none() {
            return Some(format!("unknown policy {}", offer.policy_id));
        }
        if self
            .definitions
            .definition_for(&offer.asset_id, &offer.policy_id)
            .is_none()
        {
            return Some(format!(
                "no contract definition covers asset {} under policy {}",
                offer.asset_id, offer.policy_id
            ));
        }
        None
    }

    /// Either side: a counter-offer arrived
    async fn on_offer(
        &self,
        correlation_id: &str,
        offer: &ContractOffer,
    ) -> Result<(), NegotiationError> {
        let mut negotiation = self.find_by_correlation(correlation_id).await?;

        if negotiation.state.is_terminal() {
            debug!(correlation_id, "Counter-offer ignored on terminal negotiation");
            return Ok(());
        }
        if negotiation.offers.iter().any(|o| o.id == offer.id) {
            debug!(correlation_id, offer_id = %offer.id, "Duplicate counter-offer ignored");
            return Ok(());
        }

        if negotiation.rounds() + 1 > self.config.max_rounds {
            self.terminate_with_notice(negotiation, TerminationReason::MaxRoundsExceeded, None)
                .await?;
            return Ok(());
        }

        negotiation.offers.push(offer.clone());
        // The sender's offer is now on the table; the receiver evaluates
        let next = match negotiation.role {
            Role::Provider => NegotiationState::Requested,
            Role::Consumer => NegotiationState::Offered,
        };
        negotiation.transition_to(next);
        let saved = self.store.save(negotiation).await?;

        info!(
            negotiation_id = %saved.id,
            state = %saved.state,
            rounds = saved.rounds(),
            "Counter-offer received"
        );
        Ok(())
    }

    /// Provider side: the consumer accepted the offer on the table
    async fn on_accept(
        &self,
        correlation_id: &str,
        offer_id: &str,
    ) -> Result<(), NegotiationError> {
        let mut negotiation = self.find_by_correlation(correlation_id).await?;

        if negotiation.state.is_terminal() || negotiation.agreement.is_some() {
            debug!(correlation_id, "Accept ignored; agreement already settled");
            return Ok(());
        }
        if negotiation.role != Role::Provider {
            return Err(NegotiationError::InvalidMessage(format!(
                "accept sent to {} side of {correlation_id}",
                negotiation.role
            )));
        }
        if negotiation.latest_offer().id != offer_id {
            return Err(NegotiationError::InvalidMessage(format!(
                "accept references stale offer {offer_id}"
            )));
        }

        let agreement = ContractAgreement::new(
            negotiation.latest_offer().clone(),
            self.config.agreement_validity(),
        );
        info!(
            negotiation_id = %negotiation.id,
            agreement_id = %agreement.id,
            "Offer accepted, agreement created"
        );
        negotiation.agreement = Some(agreement);
        negotiation.transition_to(NegotiationState::Agreed);
        self.store.save(negotiation).await?;
        Ok(())
    }

    /// Consumer side: the provider delivered the signed agreement
    async fn on_agreement(
        &self,
        correlation_id: &str,
        agreement: &ContractAgreement,
    ) -> Result<(), NegotiationError> {
        let mut negotiation = self.find_by_correlation(correlation_id).await?;

        if negotiation.state.is_terminal() {
            debug!(correlation_id, "Agreement ignored on terminal negotiation");
            return Ok(());
        }
        if negotiation.role != Role::Consumer {
            return Err(NegotiationError::InvalidMessage(format!(
                "agreement sent to {} side of {correlation_id}",
                negotiation.role
            )));
        }

        if negotiation.agreement.is_none() {
            negotiation.agreement = Some(agreement.clone());
        }
        negotiation.transition_to(NegotiationState::Agreed);
        let saved = self.store.save(negotiation).await?;

        info!(
            negotiation_id = %saved.id,
            agreement_id = %agreement.id,
            "Agreement received"
        );
        Ok(())
    }

    /// Provider side: the consumer acknowledged the agreement
    async fn on_ack(&self, correlation_id: &str) -> Result<(), NegotiationError> {
        let mut negotiation = self.find_by_correlation(correlation_id).await?;

        if negotiation.state.is_terminal() {
            debug!(correlation_id, "Ack ignored on terminal negotiation");
            return Ok(());
        }
        if negotiation.role != Role::Provider || negotiation.state != NegotiationState::Agreed {
            warn!(
                correlation_id,
                state = %negotiation.state,
                role = %negotiation.role,
                "Unexpected ack ignored"
            );
            return Ok(());
        }

        negotiation.transition_to(NegotiationState::Confirmed);
        let saved = self.store.save(negotiation).await?;
        info!(negotiation_id = %saved.id, "Contract negotiation confirmed");
        Ok(())
    }

    async fn on_terminate(
        &self,
        correlation_id: &str,
        reason: &str,
    ) -> Result<(), NegotiationError> {
        let mut negotiation = self.find_by_correlation(correlation_id).await?;

        if negotiation.state.is_terminal() {
            debug!(correlation_id, "Termination ignored on terminal negotiation");
            return Ok(());
        }

        negotiation.transition_terminated(
            TerminationReason::CounterpartyTerminated,
            Some(reason.to_string()),
        );
        let saved = self.store.save(negotiation).await?;
        info!(
            negotiation_id = %saved.id,
            reason,
            "Negotiation terminated by counterparty"
        );
        Ok(())
    }

    /// Execute one dispatcher-driven step on a leased record.
    ///
    /// Returns the record as persisted after the step. Terminal records
    /// pass through untouched.
    pub async fn step(
        &self,
        negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, NegotiationError> {
        if negotiation.state.is_terminal() {
            return Ok(negotiation);
        }

        match (negotiation.role, negotiation.state) {
            (Role::Consumer, NegotiationState::Initial) => self.step_send_request(negotiation).await,
            (Role::Provider, NegotiationState::Requested) => self.step_evaluate(negotiation).await,
            (Role::Consumer, NegotiationState::Offered) => self.step_evaluate(negotiation).await,
            (Role::Provider, NegotiationState::Agreed) => {
                self.step_deliver_agreement(negotiation).await
            }
            (Role::Consumer, NegotiationState::Agreed) => self.step_consumer_agreed(negotiation).await,
            // Waiting on the counterparty; check back later
            _ => {
                let mut negotiation = negotiation;
                negotiation.defer(self.config.recheck_interval());
                Ok(self.store.save(negotiation).await?)
            }
        }
    }

    /// Consumer INITIAL: send the opening contract request
    async fn step_send_request(
        &self,
        mut negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, NegotiationError> {
        let message = ProtocolMessage::Request {
            correlation_id: negotiation.correlation_id.clone(),
            offer: negotiation.latest_offer().clone(),
            callback: self.identity.endpoint.clone(),
        };

        match self
            .channel
            .send(&negotiation.counterparty_endpoint, message)
            .await
        {
            Ok(()) => {
                negotiation.transition_to(NegotiationState::Requested);
                let saved = self.store.save(negotiation).await?;
                info!(negotiation_id = %saved.id, "Contract request sent");
                Ok(saved)
            }
            Err(e) => self.retry_or_exhaust(negotiation, &e).await,
        }
    }

    /// The offer on the table is ours to judge: consult the policy gate
    async fn step_evaluate(
        &self,
        mut negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, NegotiationError> {
        let offer = negotiation.latest_offer().clone();
        let policy = match self.policies.find(&offer.policy_id) {
            Some(policy) => policy,
            None => {
                return self
                    .terminate_with_notice(
                        negotiation,
                        TerminationReason::InvalidOffer,
                        Some(format!("unknown policy {}", offer.policy_id)),
                    )
                    .await;
            }
        };

        let context = PolicyContext {
            provider_id: offer.provider_id.clone(),
            consumer_id: offer.consumer_id.clone(),
            asset_id: offer.asset_id.clone(),
        };

        match self.policy_gate.evaluate(&policy, &context).await {
            PolicyDecision::Allow => match negotiation.role {
                Role::Provider => {
                    // Accept directly: create the agreement and deliver it
                    let agreement =
                        ContractAgreement::new(offer, self.config.agreement_validity());
                    info!(
                        negotiation_id = %negotiation.id,
                        agreement_id = %agreement.id,
                        "Policy gate allowed offer, agreement created"
                    );
                    negotiation.agreement = Some(agreement);
                    negotiation.transition_to(NegotiationState::Agreed);
                    Ok(self.store.save(negotiation).await?)
                }
                Role::Consumer => {
                    // Accept the provider's counter-offer
                    let message = ProtocolMessage::Accept {
                        correlation_id: negotiation.correlation_id.clone(),
                        offer_id: offer.id.clone(),
                    };
                    match self
                        .channel
                        .send(&negotiation.counterparty_endpoint, message)
                        .await
                    {
                        Ok(()) => {
                            negotiation.transition_to(NegotiationState::Agreed);
                            let saved = self.store.save(negotiation).await?;
                            info!(negotiation_id = %saved.id, "Counter-offer accepted");
                            Ok(saved)
                        }
                        Err(e) => self.retry_or_exhaust(negotiation, &e).await,
                    }
                }
            },
            PolicyDecision::Deny { reason } => {
                info!(
                    negotiation_id = %negotiation.id,
                    reason = %reason,
                    "Policy gate denied offer"
                );
                self.terminate_with_notice(
                    negotiation,
                    TerminationReason::PolicyRejected,
                    Some(reason),
                )
                .await
            }
        }
    }

    /// Provider AGREED: deliver the agreement until acknowledged
    async fn step_deliver_agreement(
        &self,
        mut negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, NegotiationError> {
        if negotiation.retry_count >= self.config.send_retry_limit {
            return self
                .terminate_with_notice(negotiation, TerminationReason::AckTimeout, None)
                .await;
        }

        let agreement = match negotiation.agreement.clone() {
            Some(agreement) => agreement,
            None => {
                // AGREED without an agreement on the provider side is a bug
                // upstream; surface it rather than looping forever.
                return Err(NegotiationError::InvalidOperation(format!(
                    "provider negotiation {} is AGREED without an agreement",
                    negotiation.id
                )));
            }
        };

        let message = ProtocolMessage::Agreement {
            correlation_id: negotiation.correlation_id.clone(),
            agreement,
        };
        let send_result = self
            .channel
            .send(&negotiation.counterparty_endpoint, message)
            .await;

        if let Err(e) = &send_result {
            warn!(
                negotiation_id = %negotiation.id,
                error = %e,
                "Agreement delivery failed (will retry)"
            );
        }

        // Sent or not, wait for the ack with backoff; each pass counts
        // against the send retry limit.
        negotiation.schedule_retry(self.retry.delay(negotiation.retry_count));
        Ok(self.store.save(negotiation).await?)
    }

    /// Consumer AGREED: acknowledge a received agreement, or chase the
    /// provider for one
    async fn step_consumer_agreed(
        &self,
        mut negotiation: ContractNegotiation,
    ) -> Result<ContractNegotiation, NegotiationError> {
        match negotiation.agreement.clone() {
            Some(_) => {
                let message = ProtocolMessage::Ack {
                    correlation_id: negotiation.correlation_id.clone(),
                };
                match self
                    .channel
                    .send(&negotiation.counterparty_endpoint, message)
                    .await
                {
                    Ok(()) => {
                        negotiation.transition_to(NegotiationState::Confirmed);
                        let saved = self.store.save(negotiation).await?;
                        info!(negotiation_id = %saved.id, "Contract negotiation confirmed");
                        Ok(saved)
                    }
                    Err(e) => self.retry_or_exhaust(negotiation, &e).await,
                }
            }
            None => {
                // Accepted, but the agreement never arrived; re-send the
                // accept (idempotent) a bounded number of times.
                if negotiation.retry_count >= self.config.send_retry_limit {
                    return self
                        .terminate_with_notice(negotiation, TerminationReason::AckTimeout, None)
                        .await;
                }

                let message = ProtocolMessage::Accept {
                    correlation_id: negotiation.correlation_id.clone(),
                    offer_id: negotiation.latest_offer().id.clone(),
                };
                if let Err(e) = self
                    .channel
                    .send(&negotiation.counterparty_endpoint, message)
                    .await
                {
                    warn!(
                        negotiation_id = %negotiation.id,
                        error = %e,
                        "Accept re-send failed (will retry)"
                    );
                }
                negotiation.schedule_retry(self.retry.delay(negotiation.retry_count));
                Ok(self.store.save(negotiation).await?)
            }
        }
    }

    /// Retryable failure: back off, or terminate once the bound is hit
    async fn retry_or_exhaust(
        &self,
        mut negotiation: ContractNegotiation,
        error: &TransportError,
    ) -> Result<ContractNegotiation, NegotiationError> {
        if self.retry.exhausted(negotiation.retry_count) {
            warn!(
                negotiation_id = %negotiation.id,
                error = %error,
                retry_count = negotiation.retry_count,
                "Retries exhausted"
            );
            negotiation.transition_terminated(
                TerminationReason::RetriesExhausted,
                Some(error.to_string()),
            );
            return Ok(self.store.save(negotiation).await?);
        }

        debug!(
            negotiation_id = %negotiation.id,
            error = %error,
            retry_count = negotiation.retry_count,
            "Retryable failure, backing off"
        );
        negotiation.schedule_retry(self.retry.delay(negotiation.retry_count));
        Ok(self.store.save(negotiation).await?)
    }

    /// Terminate locally and tell the counterparty (best-effort)
    async fn terminate_with_notice(
        &self,
        mut negotiation: ContractNegotiation,
        reason: TerminationReason,
        detail: Option<String>,
    ) -> Result<ContractNegotiation, NegotiationError> {
        self.send_terminate(&negotiation.counterparty_endpoint, &negotiation.correlation_id, reason)
            .await;

        negotiation.transition_terminated(reason, detail);
        let saved = self.store.save(negotiation).await?;
        info!(
            negotiation_id = %saved.id,
            reason = %reason,
            "Negotiation terminated"
        );
        Ok(saved)
    }

    /// Termination notices are best-effort; a counterparty we cannot reach
    /// is already failing on its own timeouts.
    async fn send_terminate(
        &self,
        endpoint: &EndpointAddress,
        correlation_id: &str,
        reason: TerminationReason,
    ) {
        let message = ProtocolMessage::Terminate {
            correlation_id: correlation_id.to_string(),
            reason: reason.as_str().to_string(),
        };
        if let Err(e) = self.channel.send(endpoint, message).await {
            warn!(correlation_id, error = %e, "Termination notice not delivered");
        }
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<ContractNegotiation, NegotiationError> {
        self.store
            .find_by_correlation_id(correlation_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => NegotiationError::InvalidMessage(format!(
                    "no negotiation for correlation {correlation_id}"
                )),
                other => other.into(),
            })
    }
}
