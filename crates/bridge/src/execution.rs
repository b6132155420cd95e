//! Per-cell execution tracking driven by `cell-op` messages.
//!
//! A `queued` status starts tracking a run. Outputs replace the cell's
//! current output, console chunks accumulate, and `idle` finishes the run.
//! A run succeeds unless it produced output on the error channel.

use std::collections::HashMap;

use log::{debug, error};
use serde::Serialize;

use crate::protocol::{CellOp, CellOutput, CellStatus};

/// Something the UI should reflect for a cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Queued {
        cell_id: String,
    },
    Running {
        cell_id: String,
    },
    Output {
        cell_id: String,
        output: CellOutput,
    },
    Console {
        cell_id: String,
        chunks: Vec<CellOutput>,
    },
    Finished {
        cell_id: String,
        success: bool,
        output: Option<CellOutput>,
        console: Vec<CellOutput>,
    },
    /// The cell will not run because an ancestor is disabled.
    Disabled {
        cell_id: String,
    },
}

#[derive(Debug, Default)]
struct Execution {
    output: Option<CellOutput>,
    console: Vec<CellOutput>,
    errored: bool,
}

#[derive(Debug, Default)]
pub struct ExecutionTracker {
    running: HashMap<String, Execution>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracking(&self, cell_id: &str) -> bool {
        self.running.contains_key(cell_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.running.len()
    }

    /// Forget every tracked run.
    pub fn clear(&mut self) {
        self.running.clear();
    }

    /// Apply one `cell-op` and return the events it produced.
    pub fn handle(&mut self, op: CellOp) -> Vec<ExecutionEvent> {
        let CellOp {
            cell_id,
            status,
            output,
            console,
            ..
        } = op;
        let mut events = Vec::new();

        match status {
            Some(CellStatus::Queued) => {
                self.running.insert(cell_id.clone(), Execution::default());
                events.push(ExecutionEvent::Queued {
                    cell_id: cell_id.clone(),
                });
            }
            Some(CellStatus::Running) if self.is_tracking(&cell_id) => {
                events.push(ExecutionEvent::Running {
                    cell_id: cell_id.clone(),
                });
            }
            _ => {}
        }

        if let Some(output) = output {
            match self.running.get_mut(&cell_id) {
                Some(execution) => {
                    execution.errored |= output.is_error();
                    execution.output = Some(output.clone());
                    events.push(ExecutionEvent::Output {
                        cell_id: cell_id.clone(),
                        output,
                    });
                }
                None => error!(
                    "[bridge] Output for cell {} which has no tracked execution",
                    cell_id
                ),
            }
        }

        if let Some(console) = console {
            let chunks = console.into_vec();
            match self.running.get_mut(&cell_id) {
                Some(execution) if !chunks.is_empty() => {
                    execution.console.extend(chunks.iter().cloned());
                    events.push(ExecutionEvent::Console {
                        cell_id: cell_id.clone(),
                        chunks,
                    });
                }
                Some(_) => {}
                None => debug!("[bridge] Console output for untracked cell {}", cell_id),
            }
        }

        match status {
            Some(CellStatus::Idle) => {
                if let Some(execution) = self.running.remove(&cell_id) {
                    events.push(ExecutionEvent::Finished {
                        cell_id,
                        success: !execution.errored,
                        output: execution.output,
                        console: execution.console,
                    });
                }
            }
            Some(CellStatus::DisabledTransitively) => {
                self.running.remove(&cell_id);
                events.push(ExecutionEvent::Disabled { cell_id });
            }
            _ => {}
        }

        events
    }
}
