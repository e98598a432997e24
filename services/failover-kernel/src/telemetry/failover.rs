use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter, KeyValue};

use crate::server::ServerState;

static ORCHESTRATOR_METRICS: Lazy<OrchestratorMetrics> = Lazy::new(|| {
    let meter = global::meter("failover-kernel.orchestrator");
    OrchestratorMetrics {
        promotion_attempts: meter
            .u64_counter("repman.promotion.attempts")
            .with_description("Promotions started by this monitor")
            .init(),
        promotion_results: meter
            .u64_counter("repman.promotion.results")
            .with_description("Outcome of failover and switchover runs")
            .init(),
        state_transitions: meter
            .u64_counter("repman.server.state.transitions")
            .with_description("Server state transitions applied by the health state machine")
            .init(),
        probe_results: meter
            .u64_counter("repman.probe.results")
            .with_description("Reachability probe outcomes")
            .init(),
        arbitration_verdicts: meter
            .u64_counter("repman.arbitration.verdicts")
            .with_description("Verdicts received from the arbitrator")
            .init(),
        rejoin_results: meter
            .u64_counter("repman.rejoin.results")
            .with_description("Rejoin attempts by strategy and outcome")
            .init(),
    }
});

struct OrchestratorMetrics {
    promotion_attempts: Counter<u64>,
    promotion_results: Counter<u64>,
    state_transitions: Counter<u64>,
    probe_results: Counter<u64>,
    arbitration_verdicts: Counter<u64>,
    rejoin_results: Counter<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotionKind {
    Failover,
    Switchover,
}

impl PromotionKind {
    pub fn from_fail(fail: bool) -> Self {
        if fail {
            PromotionKind::Failover
        } else {
            PromotionKind::Switchover
        }
    }
}

#[derive(Clone, Copy)]
pub enum PromotionOutcome {
    Completed,
    Degraded,
    Aborted,
    Rejected,
}

#[derive(Clone, Copy)]
pub enum ProbeOutcome {
    Ok,
    Error,
}

#[derive(Clone, Copy)]
pub enum ArbitrationVerdict {
    Winner,
    Loser,
    Error,
}

#[derive(Clone, Copy)]
pub enum RejoinOutcome {
    Ok,
    Error,
}

pub fn record_promotion_attempt(cluster: &str, kind: PromotionKind) {
    ORCHESTRATOR_METRICS.promotion_attempts.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("kind", promotion_kind_value(kind)),
        ],
    );
}

pub fn record_promotion_result(cluster: &str, kind: PromotionKind, outcome: PromotionOutcome) {
    ORCHESTRATOR_METRICS.promotion_results.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("kind", promotion_kind_value(kind)),
            KeyValue::new("outcome", promotion_outcome_value(outcome)),
        ],
    );
}

pub fn record_state_transition(cluster: &str, from: ServerState, to: ServerState) {
    ORCHESTRATOR_METRICS.state_transitions.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

pub fn record_probe(cluster: &str, outcome: ProbeOutcome) {
    ORCHESTRATOR_METRICS.probe_results.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new(
                "outcome",
                match outcome {
                    ProbeOutcome::Ok => "ok",
                    ProbeOutcome::Error => "error",
                },
            ),
        ],
    );
}

pub fn record_arbitration_verdict(cluster: &str, verdict: ArbitrationVerdict) {
    ORCHESTRATOR_METRICS.arbitration_verdicts.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new(
                "verdict",
                match verdict {
                    ArbitrationVerdict::Winner => "winner",
                    ArbitrationVerdict::Loser => "looser",
                    ArbitrationVerdict::Error => "error",
                },
            ),
        ],
    );
}

pub fn record_rejoin(cluster: &str, strategy: &'static str, outcome: RejoinOutcome) {
    ORCHESTRATOR_METRICS.rejoin_results.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("strategy", strategy),
            KeyValue::new(
                "outcome",
                match outcome {
                    RejoinOutcome::Ok => "ok",
                    RejoinOutcome::Error => "error",
                },
            ),
        ],
    );
}

fn promotion_kind_value(kind: PromotionKind) -> &'static str {
    match kind {
        PromotionKind::Failover => "failover",
        PromotionKind::Switchover => "switchover",
    }
}

fn promotion_outcome_value(outcome: PromotionOutcome) -> &'static str {
    match outcome {
        PromotionOutcome::Completed => "completed",
        PromotionOutcome::Degraded => "degraded",
        PromotionOutcome::Aborted => "aborted",
        PromotionOutcome::Rejected => "rejected",
    }
}
