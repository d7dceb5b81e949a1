//! Messages of the learning exchange protocol and the bookkeeping of the
//! insights each side offers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::compatibility::{CompatibilityResult, DepthTier};
use crate::connection::{Rejection, TerminationReason};
use crate::depth::InteractionDepth;
use crate::errors::{Result, VibeError};
use crate::id::NodeSignature;
use crate::profile::{LearningInsight, Provenance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeMessage {
    /// Opening message of both sides. The fingerprint travels in the
    /// structured wire format.
    Hello {
        signature: NodeSignature,
        fingerprint: String,
    },
    Decline {
        reason: Rejection,
    },
    DepthProposal {
        result: CompatibilityResult,
        desired: InteractionDepth,
    },
    InsightOffer {
        round: u32,
        insights: Vec<WireInsight>,
    },
    Terminate {
        reason: TerminationReason,
    },
}

impl ExchangeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeMessage::Hello { .. } => "hello",
            ExchangeMessage::Decline { .. } => "decline",
            ExchangeMessage::DepthProposal { .. } => "depth_proposal",
            ExchangeMessage::InsightOffer { .. } => "insight_offer",
            ExchangeMessage::Terminate { .. } => "terminate",
        }
    }
}

/// An insight as it travels between nodes. Provenance is stamped by the
/// receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireInsight {
    pub dimension: String,
    pub delta: f64,
    pub confidence: f64,
}

/// Number of request/response rounds that fit in the message bound.
pub fn rounds_for(max_messages: usize) -> usize {
    (max_messages / 2).max(1)
}

/// Largest number of insights a single offer may carry.
pub fn per_offer_limit(tier: DepthTier, max_messages: usize) -> usize {
    let rounds = rounds_for(max_messages);
    (tier.insight_budget() + rounds - 1) / rounds
}

/// Outgoing insights of one connection, handed out one offer at a time.
#[derive(Debug, Clone)]
pub struct InsightPlan {
    queue: VecDeque<WireInsight>,
    per_offer: usize,
}

impl InsightPlan {
    /// Build the plan from this node's own view of the peer.
    ///
    /// Each opportunity becomes a nudge of the peer toward this node's
    /// values, so the delta is `local - remote`. Confidence grows with the
    /// overall score and shrinks with the size of the gap.
    pub fn new(
        result: &CompatibilityResult,
        effective: InteractionDepth,
        max_messages: usize,
    ) -> Self {
        let tier = effective.tier();
        let queue = result
            .learning_opportunities
            .iter()
            .take(tier.insight_budget())
            .map(|d| WireInsight {
                dimension: d.dimension.clone(),
                delta: (-d.delta).clamp(-1.0, 1.0),
                confidence: (result.score * (1.0 - d.magnitude()))
                    .clamp(0.0, 1.0),
            })
            .collect();
        Self {
            queue,
            per_offer: per_offer_limit(tier, max_messages),
        }
    }

    pub fn next_offer(&mut self) -> Vec<WireInsight> {
        let n = self.per_offer.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn per_offer(&self) -> usize {
        self.per_offer
    }
}

/// Validate a received offer and turn it into local insights scaled by the
/// receiver's learning rate.
///
/// An offer larger than `limit` is a protocol violation. Individual
/// insights with unknown dimensions or out-of-range values are dropped.
pub fn accept_offer(
    offer: &[WireInsight],
    limit: usize,
    learning_rate: f64,
) -> Result<Vec<LearningInsight>> {
    if offer.len() > limit {
        return Err(VibeError::Protocol(format!(
            "offer of {} insights exceeds limit {}",
            offer.len(),
            limit
        )));
    }

    let mut accepted = Vec::with_capacity(offer.len());
    for wire in offer {
        let insight = LearningInsight {
            dimension: wire.dimension.clone(),
            delta: wire.delta,
            confidence: wire.confidence,
            provenance: Provenance::Remote,
        };
        if let Err(e) = insight.validate() {
            log::debug!("Dropping received insight: {}", e);
            continue;
        }
        accepted.push(LearningInsight {
            delta: insight.delta * learning_rate,
            ..insight
        });
    }
    Ok(accepted)
}
