//! Event-driven transaction state machine.
//!
//! One runner thread per subsystem drains a FIFO queue of transaction
//! events. A handler is invoked when its transaction enters a state; it
//! re-reads its inputs, does the external work without holding any
//! machine lock, and posts `Ok`/`Failed`/`Retry` back. The machine is
//! single-active per transaction: the runner never dispatches two
//! handlers for the same transaction concurrently.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

/// States a container transaction walks through. `Failed` is a sink;
/// `Retry` events arc back to `Download`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Verify,
    Download,
    Install,
    Load,
    StopServices,
    Unload,
    GenerateWrappers,
    Done,
    Failed,
}

impl TransactionState {
    /// The state entered when the current handler reports success.
    fn on_ok(self) -> TransactionState {
        use TransactionState::*;
        match self {
            Verify => Download,
            Download => Install,
            Install => Load,
            Load => StopServices,
            StopServices => Unload,
            Unload => GenerateWrappers,
            GenerateWrappers => Done,
            Done => Done,
            Failed => Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Done | TransactionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Ok,
    Failed,
    Retry,
}

/// Per-state handler. Returning an event drives the next transition.
pub trait TransactionHandler: Send + 'static {
    fn on_state(&mut self, txn: &str, state: TransactionState) -> TransactionEvent;
}

impl<F> TransactionHandler for F
where
    F: FnMut(&str, TransactionState) -> TransactionEvent + Send + 'static,
{
    fn on_state(&mut self, txn: &str, state: TransactionState) -> TransactionEvent {
        self(txn, state)
    }
}

struct Transaction {
    state: TransactionState,
    handler: Box<dyn TransactionHandler>,
    retries_left: u32,
}

enum RunnerMsg {
    Start {
        txn: String,
        handler: Box<dyn TransactionHandler>,
        retry_budget: u32,
    },
}

/// Shared view of transaction states, readable from any thread.
pub type StateView = Arc<Mutex<HashMap<String, TransactionState>>>;

/// Single-worker runner. Dropping it closes the queue; the worker
/// finishes the transaction it is on and exits.
pub struct TransactionRunner {
    tx: Option<Sender<RunnerMsg>>,
    worker: Option<JoinHandle<()>>,
    states: StateView,
}

/// Bounded retry budget for the `Download` arc; callers override it per
/// transaction.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

impl TransactionRunner {
    pub fn new(subsystem: &'static str) -> Self {
        let (tx, rx) = channel::<RunnerMsg>();
        let states: StateView = Arc::new(Mutex::new(HashMap::new()));
        let states_worker = states.clone();

        let worker = std::thread::Builder::new()
            .name(format!("txn-{subsystem}"))
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        RunnerMsg::Start {
                            txn,
                            handler,
                            retry_budget,
                        } => {
                            let mut t = Transaction {
                                state: TransactionState::Verify,
                                handler,
                                retries_left: retry_budget,
                            };
                            drive(&txn, &mut t, &states_worker);
                        }
                    }
                }
            })
            .expect("spawn transaction runner");

        Self {
            tx: Some(tx),
            worker: Some(worker),
            states,
        }
    }

    /// Queue a transaction. Events for earlier transactions are fully
    /// processed first (FIFO, one worker).
    pub fn start(&self, txn: impl Into<String>, handler: impl TransactionHandler) {
        self.start_with_budget(txn, handler, DEFAULT_RETRY_BUDGET);
    }

    pub fn start_with_budget(
        &self,
        txn: impl Into<String>,
        handler: impl TransactionHandler,
        retry_budget: u32,
    ) {
        let txn = txn.into();
        if let Some(tx) = &self.tx {
            let _ = tx.send(RunnerMsg::Start {
                txn,
                handler: Box::new(handler),
                retry_budget,
            });
        }
    }

    pub fn states(&self) -> StateView {
        self.states.clone()
    }

    pub fn state_of(&self, txn: &str) -> Option<TransactionState> {
        self.states.lock().unwrap().get(txn).copied()
    }

    /// Close the queue and wait for the worker to drain it.
    pub fn shutdown(mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TransactionRunner {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drive(txn: &str, t: &mut Transaction, states: &StateView) {
    loop {
        states.lock().unwrap().insert(txn.to_string(), t.state);
        if t.state.is_terminal() {
            debug!(txn, state = ?t.state, "transaction finished");
            return;
        }

        // The handler runs without the state lock held.
        let event = t.handler.on_state(txn, t.state);
        let next = match event {
            TransactionEvent::Ok => t.state.on_ok(),
            TransactionEvent::Failed => TransactionState::Failed,
            TransactionEvent::Retry => {
                if t.retries_left == 0 {
                    warn!(txn, state = ?t.state, "retry budget exhausted");
                    TransactionState::Failed
                } else {
                    t.retries_left -= 1;
                    TransactionState::Download
                }
            }
        };
        debug!(txn, from = ?t.state, to = ?next, ?event, "transition");
        t.state = next;
    }
}

/// Teardown steps, driven synchronously by `Container::destroy`. Every
/// step is attempted regardless of earlier failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStep {
    StopServices,
    Unload,
    UnmountLayers,
    RemoveCgroup,
    Destroyed,
}

impl DestroyStep {
    pub fn next(self) -> DestroyStep {
        use DestroyStep::*;
        match self {
            StopServices => Unload,
            Unload => UnmountLayers,
            UnmountLayers => RemoveCgroup,
            RemoveCgroup => Destroyed,
            Destroyed => Destroyed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn wait_terminal(runner: &TransactionRunner, txn: &str) -> TransactionState {
        for _ in 0..500 {
            if let Some(state) = runner.state_of(txn) {
                if state.is_terminal() {
                    return state;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("transaction {txn} did not finish");
    }

    #[test]
    fn happy_path_reaches_done() {
        let runner = TransactionRunner::new("test");
        let visited = Arc::new(Mutex::new(Vec::new()));
        let v = visited.clone();
        runner.start("t1", move |_: &str, state: TransactionState| {
            v.lock().unwrap().push(state);
            TransactionEvent::Ok
        });
        assert_eq!(wait_terminal(&runner, "t1"), TransactionState::Done);
        let visited = visited.lock().unwrap();
        assert_eq!(
            *visited,
            vec![
                TransactionState::Verify,
                TransactionState::Download,
                TransactionState::Install,
                TransactionState::Load,
                TransactionState::StopServices,
                TransactionState::Unload,
                TransactionState::GenerateWrappers,
            ]
        );
    }

    #[test]
    fn failure_sinks() {
        let runner = TransactionRunner::new("test");
        runner.start("t2", |_: &str, state: TransactionState| {
            if state == TransactionState::Install {
                TransactionEvent::Failed
            } else {
                TransactionEvent::Ok
            }
        });
        assert_eq!(wait_terminal(&runner, "t2"), TransactionState::Failed);
    }

    #[test]
    fn retry_arcs_back_to_download_until_budget_runs_out() {
        let runner = TransactionRunner::new("test");
        let installs = Arc::new(AtomicU32::new(0));
        let i = installs.clone();
        runner.start_with_budget(
            "t3",
            move |_: &str, state: TransactionState| {
                if state == TransactionState::Install {
                    i.fetch_add(1, Ordering::SeqCst);
                    TransactionEvent::Retry
                } else {
                    TransactionEvent::Ok
                }
            },
            2,
        );
        assert_eq!(wait_terminal(&runner, "t3"), TransactionState::Failed);
        // First attempt plus two retries.
        assert_eq!(installs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_recovers_when_transient_clears() {
        let runner = TransactionRunner::new("test");
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        runner.start("t4", move |_: &str, state: TransactionState| {
            if state == TransactionState::Download && a.fetch_add(1, Ordering::SeqCst) == 0 {
                TransactionEvent::Retry
            } else {
                TransactionEvent::Ok
            }
        });
        assert_eq!(wait_terminal(&runner, "t4"), TransactionState::Done);
    }

    #[test]
    fn transactions_run_in_fifo_order() {
        let runner = TransactionRunner::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let o = order.clone();
            runner.start(name, move |txn: &str, state: TransactionState| {
                if state == TransactionState::Verify {
                    o.lock().unwrap().push(txn.to_string());
                }
                TransactionEvent::Ok
            });
        }
        for name in ["a", "b", "c"] {
            assert_eq!(wait_terminal(&runner, name), TransactionState::Done);
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn destroy_steps_are_ordered() {
        let mut step = DestroyStep::StopServices;
        let mut seen = vec![step];
        while step != DestroyStep::Destroyed {
            step = step.next();
            seen.push(step);
        }
        assert_eq!(
            seen,
            vec![
                DestroyStep::StopServices,
                DestroyStep::Unload,
                DestroyStep::UnmountLayers,
                DestroyStep::RemoveCgroup,
                DestroyStep::Destroyed,
            ]
        );
    }
}
