use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use parley_core::error::Result;
use parley_core::flow::{Flow, Node};
use parley_core::state::{ConversationState, NodeStatus, TurnStatus};
use parley_core::traits::StateStore;
use parley_core::types::InboundEvent;

use crate::nodes::{execute_node, Collaborators, EngineSettings, NodeContext, Route};
use crate::variables::VariableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Reached a node with no outgoing edge.
    Completed,
    /// A router matched no edge.
    Halted,
    /// A node failed on configuration.
    Failed,
    /// The event was already handled; nothing ran.
    Replayed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub node_id: String,
    pub kind: &'static str,
    pub status: NodeStatus,
    /// Already done earlier in this turn, not re-invoked.
    pub skipped: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub flow_id: String,
    pub contact_id: String,
    pub turn_id: u64,
    pub outcome: TurnOutcome,
    pub nodes: Vec<NodeReport>,
}

/// Walks a flow graph for one inbound event.
///
/// Every node execution is followed by a persist of the conversation state,
/// so an interrupted turn can be resumed from the last completed node.
#[derive(Clone)]
pub struct GraphWalker {
    collaborators: Collaborators,
    settings: EngineSettings,
    states: Arc<dyn StateStore>,
}

/// Where a walk starts.
enum Start {
    /// Fresh turn: run the trigger first.
    Trigger,
    /// Resume an interrupted turn at this node.
    Resume(String),
}

impl GraphWalker {
    pub fn new(
        collaborators: Collaborators,
        settings: EngineSettings,
        states: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            collaborators,
            settings,
            states,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one turn. The caller must hold the contact's lock.
    pub async fn run_turn(
        &self,
        flow: &Flow,
        state: Option<ConversationState>,
        event: &InboundEvent,
    ) -> Result<TurnReport> {
        let contact_id = event.from.clone();
        let mut state = state.unwrap_or_else(|| ConversationState::new(&flow.id, &contact_id));
        let mut corrupted = false;

        if let Some(current) = &state.current_node_id {
            if flow.node(current).is_none() {
                warn!(
                    flow_id = %flow.id,
                    contact = %contact_id,
                    node_id = %current,
                    "Stored node no longer exists in flow, resetting to trigger"
                );
                state.current_node_id = None;
                state.turn = None;
                corrupted = true;
            }
        }

        // Some(finished) when this event already started a recent turn. Only
        // the last turn can still be running.
        let replay = state.is_replay_of(&event.id).then(|| {
            state
                .turn_for(&event.id)
                .map_or(true, |turn| turn.status.is_finished())
        });

        let start = match replay {
            Some(true) => {
                info!(
                    flow_id = %flow.id,
                    contact = %contact_id,
                    turn_id = state.turn_id,
                    "Event already handled, nothing to replay"
                );
                let nodes = state
                    .turn_for(&event.id)
                    .into_iter()
                    .flat_map(|turn| turn.nodes.iter())
                    .filter_map(|(id, status)| flow.node(id).map(|node| skipped_report(node, *status)))
                    .collect();
                return Ok(report(flow, &state, TurnOutcome::Replayed, nodes));
            }
            Some(false) => match &state.current_node_id {
                Some(current) => {
                    info!(
                        flow_id = %flow.id,
                        contact = %contact_id,
                        turn_id = state.turn_id,
                        node_id = %current,
                        "Resuming interrupted turn"
                    );
                    Start::Resume(current.clone())
                }
                None => Start::Trigger,
            },
            None => {
                let turn_id = state.begin_turn(&event.id);
                info!(flow_id = %flow.id, contact = %contact_id, turn_id, "Starting turn");
                Start::Trigger
            }
        };

        // The conversation's first turn always follows the trigger's own edge.
        let fresh = corrupted || state.turn_id == 1;

        let mut vars = VariableStore::from_parts(
            std::mem::take(&mut state.variables),
            std::mem::take(&mut state.promoted_by),
        )
        .with_reserved(flow.nodes().iter().map(|n| n.id.clone()));

        let mut reports = Vec::new();
        let mut current = match start {
            Start::Trigger => Some(flow.trigger().id.clone()),
            Start::Resume(node_id) => {
                let node = flow.node(&node_id).unwrap_or_else(|| flow.trigger());
                if state.node_status(&node.id) == NodeStatus::Done {
                    reports.push(skipped_report(node, NodeStatus::Done));
                    match self.resume_route(flow, node, &vars, fresh) {
                        Next::Node(next) => Some(next),
                        Next::End(status) => {
                            self.finish(&mut state, &vars, status).await?;
                            return Ok(report(flow, &state, outcome_of(status), reports));
                        }
                    }
                } else {
                    Some(node.id.clone())
                }
            }
        };

        let max_steps = flow.nodes().len();
        let mut steps = 0;
        let mut final_status = TurnStatus::Completed;

        while let Some(node_id) = current.take() {
            steps += 1;
            if steps > max_steps {
                error!(flow_id = %flow.id, turn_id = state.turn_id, "Step limit exceeded, halting turn");
                final_status = TurnStatus::Halted;
                break;
            }
            let Some(node) = flow.node(&node_id) else {
                final_status = TurnStatus::Halted;
                break;
            };

            if node.kind.is_side_effecting() && state.node_status(&node.id) == NodeStatus::Done {
                debug!(node_id = %node.id, turn_id = state.turn_id, "Side effect already done this turn, skipping");
                reports.push(skipped_report(node, NodeStatus::Done));
                current = match self.follow(flow, node, Route::Follow, fresh) {
                    Next::Node(next) => Some(next),
                    Next::End(status) => {
                        final_status = status;
                        None
                    }
                };
                continue;
            }

            state.mark(&node.id, NodeStatus::Running);
            let started = Instant::now();
            let result = {
                let ctx = NodeContext {
                    flow,
                    node,
                    vars: &vars,
                    history: &state.history,
                    event,
                    contact_id: &contact_id,
                    turn_id: state.turn_id,
                    collaborators: &self.collaborators,
                    settings: &self.settings,
                };
                execute_node(&ctx).await
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    vars.merge(&node.id, &output.values, &node.promote);
                    for message in output.history {
                        state.push_history(message, self.settings.history_limit);
                    }
                    state.mark(&node.id, NodeStatus::Done);
                    state.current_node_id = Some(node.id.clone());
                    info!(
                        flow_id = %flow.id,
                        contact = %contact_id,
                        turn_id = state.turn_id,
                        node_id = %node.id,
                        kind = node.kind.name(),
                        elapsed_ms,
                        "Node executed"
                    );
                    reports.push(NodeReport {
                        node_id: node.id.clone(),
                        kind: node.kind.name(),
                        status: NodeStatus::Done,
                        skipped: false,
                        elapsed_ms,
                    });

                    current = match self.follow(flow, node, output.route, fresh) {
                        Next::Node(next) => Some(next),
                        Next::End(status) => {
                            final_status = status;
                            None
                        }
                    };
                    self.persist(&mut state, &vars).await?;
                }
                Err(e) => {
                    error!(
                        flow_id = %flow.id,
                        contact = %contact_id,
                        turn_id = state.turn_id,
                        node_id = %node.id,
                        kind = node.kind.name(),
                        error = %e,
                        "Node failed, halting turn"
                    );
                    state.mark(&node.id, NodeStatus::Failed);
                    state.current_node_id = Some(node.id.clone());
                    reports.push(NodeReport {
                        node_id: node.id.clone(),
                        kind: node.kind.name(),
                        status: NodeStatus::Failed,
                        skipped: false,
                        elapsed_ms,
                    });
                    final_status = TurnStatus::Failed;
                    break;
                }
            }
        }

        self.finish(&mut state, &vars, final_status).await?;
        Ok(report(flow, &state, outcome_of(final_status), reports))
    }

    /// Pick the node after `node` given the route its executor chose.
    fn follow(&self, flow: &Flow, node: &Node, route: Route, fresh: bool) -> Next {
        match route {
            Route::Halt => Next::End(TurnStatus::Halted),
            Route::Edge(edge_id) => match flow.edge(&edge_id) {
                Some(edge) => Next::Node(edge.target.clone()),
                None => Next::End(TurnStatus::Halted),
            },
            Route::Follow => {
                if node.kind.is_trigger() && !fresh {
                    if let Some(restart) = &flow.restart_node_id {
                        return Next::Node(restart.clone());
                    }
                }
                match flow.outgoing(&node.id).next() {
                    Some(edge) => Next::Node(edge.target.clone()),
                    None => Next::End(TurnStatus::Completed),
                }
            }
        }
    }

    /// Recover the route a completed node took, from its stored outputs.
    fn resume_route(&self, flow: &Flow, node: &Node, vars: &VariableStore, fresh: bool) -> Next {
        let route = if node.kind.is_router() {
            match vars.get(&format!("{}.edge", node.id)).and_then(|v| v.as_str()) {
                Some(edge) => Route::Edge(edge.to_string()),
                None => Route::Halt,
            }
        } else {
            Route::Follow
        };
        self.follow(flow, node, route, fresh)
    }

    async fn persist(&self, state: &mut ConversationState, vars: &VariableStore) -> Result<()> {
        let (values, promoted_by) = vars.clone().into_parts();
        state.variables = values;
        state.promoted_by = promoted_by;
        state.touch();
        self.states.save_state(state).await
    }

    async fn finish(
        &self,
        state: &mut ConversationState,
        vars: &VariableStore,
        status: TurnStatus,
    ) -> Result<()> {
        state.finish_turn(status);
        debug!(
            flow_id = %state.flow_id,
            contact = %state.contact_id,
            turn_id = state.turn_id,
            status = ?status,
            "Turn finished"
        );
        self.persist(state, vars).await
    }
}

enum Next {
    Node(String),
    End(TurnStatus),
}

fn outcome_of(status: TurnStatus) -> TurnOutcome {
    match status {
        TurnStatus::Completed => TurnOutcome::Completed,
        TurnStatus::Failed => TurnOutcome::Failed,
        TurnStatus::Halted | TurnStatus::Running => TurnOutcome::Halted,
    }
}

fn skipped_report(node: &Node, status: NodeStatus) -> NodeReport {
    NodeReport {
        node_id: node.id.clone(),
        kind: node.kind.name(),
        status,
        skipped: true,
        elapsed_ms: 0,
    }
}

fn report(
    flow: &Flow,
    state: &ConversationState,
    outcome: TurnOutcome,
    nodes: Vec<NodeReport>,
) -> TurnReport {
    TurnReport {
        flow_id: flow.id.clone(),
        contact_id: state.contact_id.clone(),
        turn_id: state.turn_id,
        outcome,
        nodes,
    }
}
