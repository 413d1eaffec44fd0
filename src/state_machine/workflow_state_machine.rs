//! # Workflow Transition Function
//!
//! Pure `(machine, event) -> (machine, effects)` transition table for workflow
//! executions. The workflow engine feeds events in and performs the returned
//! effects; nothing here touches the network, the pool or the clock, so the
//! whole graph is unit-testable.

use serde::{Deserialize, Serialize};

use super::errors::{StateMachineError, StateMachineResult};
use super::events::{RollbackTarget, WorkflowEvent};
use super::states::WorkflowState;

/// Side effects the engine must perform after a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Announce the new state to the status sink and event publisher
    Notify { state: WorkflowState },
    /// Wait for still-running parallel siblings before aborting
    DrainSiblings,
    /// Run the definition's cleanup step, best effort
    RunCleanup,
    /// Return the execution's allocation to the pool
    ReleaseAllocation,
    /// Resume from an earlier step
    RewindTo { index: usize },
    /// Clear per-step attempt counters
    ResetAttempts,
}

/// Position of one execution in the transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMachine {
    pub state: WorkflowState,
    pub current_step: usize,
    pub step_count: usize,
    pub rollback_count: u32,
    pub max_rollbacks: u32,
}

impl WorkflowMachine {
    pub fn new(step_count: usize, max_rollbacks: u32) -> Self {
        Self {
            state: WorkflowState::Initialized,
            current_step: 0,
            step_count,
            rollback_count: 0,
            max_rollbacks,
        }
    }

    /// Apply `event` in place, returning the effects to perform
    pub fn apply(&mut self, event: &WorkflowEvent) -> StateMachineResult<Vec<Effect>> {
        let (next, effects) = transition(*self, event)?;
        *self = next;
        Ok(effects)
    }

    pub fn is_finished(&self) -> bool {
        self.current_step >= self.step_count
    }
}

fn abort_effects(drain_siblings: bool) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(4);
    if drain_siblings {
        effects.push(Effect::DrainSiblings);
    }
    effects.push(Effect::RunCleanup);
    effects.push(Effect::ReleaseAllocation);
    effects.push(Effect::Notify {
        state: WorkflowState::Failed,
    });
    effects
}

fn invalid(machine: &WorkflowMachine, event: &WorkflowEvent) -> StateMachineError {
    StateMachineError::InvalidTransition {
        from: machine.state,
        event: event.event_type().to_string(),
    }
}

fn expect_in_order(machine: &WorkflowMachine, index: usize) -> StateMachineResult<()> {
    if index != machine.current_step {
        return Err(StateMachineError::StepOutOfOrder {
            expected: machine.current_step,
            actual: index,
        });
    }
    Ok(())
}

/// The transition table
pub fn transition(
    machine: WorkflowMachine,
    event: &WorkflowEvent,
) -> StateMachineResult<(WorkflowMachine, Vec<Effect>)> {
    use WorkflowState::*;

    if machine.state.is_terminal() {
        return Err(StateMachineError::TerminalState {
            state: machine.state,
        });
    }

    let mut next = machine;
    let effects = match (machine.state, event) {
        (Initialized, WorkflowEvent::Start) => {
            next.state = Running;
            vec![Effect::Notify { state: Running }]
        }

        // Pause and resume are idempotent
        (Running, WorkflowEvent::Pause) => {
            next.state = Paused;
            vec![Effect::Notify { state: Paused }]
        }
        (Paused, WorkflowEvent::Pause) => Vec::new(),
        (Paused, WorkflowEvent::Resume) => {
            next.state = Running;
            vec![Effect::Notify { state: Running }]
        }
        (Running, WorkflowEvent::Resume) => Vec::new(),

        (Running, WorkflowEvent::StepSucceeded { index })
        | (Running, WorkflowEvent::StepSkipped { index }) => {
            expect_in_order(&machine, *index)?;
            next.current_step = index + 1;
            Vec::new()
        }
        (Running, WorkflowEvent::GroupCompleted { start, end }) => {
            expect_in_order(&machine, *start)?;
            if end < start {
                return Err(invalid(&machine, event));
            }
            next.current_step = *end;
            Vec::new()
        }

        (Running, WorkflowEvent::StepFailed { index, target }) => match target {
            RollbackTarget::Abort => {
                next.state = Failed;
                abort_effects(false)
            }
            RollbackTarget::AbortAfterSiblings => {
                next.state = Failed;
                abort_effects(true)
            }
            RollbackTarget::Checkpoint { index: checkpoint } => {
                if checkpoint > index {
                    return Err(StateMachineError::InvalidCheckpoint {
                        target: *checkpoint,
                        failed: *index,
                    });
                }
                if machine.rollback_count >= machine.max_rollbacks {
                    next.state = Failed;
                    abort_effects(false)
                } else {
                    next.current_step = *checkpoint;
                    next.rollback_count += 1;
                    vec![
                        Effect::RewindTo { index: *checkpoint },
                        Effect::ResetAttempts,
                    ]
                }
            }
        },

        (Running, WorkflowEvent::Complete) => {
            if !machine.is_finished() {
                return Err(StateMachineError::Incomplete {
                    current: machine.current_step,
                    total: machine.step_count,
                });
            }
            next.state = Completed;
            vec![
                Effect::ReleaseAllocation,
                Effect::Notify { state: Completed },
            ]
        }

        (Initialized | Running | Paused, WorkflowEvent::Fail(_))
        | (Initialized | Running | Paused, WorkflowEvent::TimedOut) => {
            next.state = Failed;
            vec![
                Effect::ReleaseAllocation,
                Effect::Notify { state: Failed },
            ]
        }

        (Initialized | Running | Paused, WorkflowEvent::Cancel) => {
            next.state = Cancelled;
            vec![
                Effect::ReleaseAllocation,
                Effect::Notify { state: Cancelled },
            ]
        }

        _ => return Err(invalid(&machine, event)),
    };

    Ok((next, effects))
}
