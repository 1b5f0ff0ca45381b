use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::execution::ExecutionId;
use crate::path::{InstructionPath, ProductPath};

/// Notifications emitted on a generation's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// This generation was superseded by `successor`.
    Succeeded {
        ts_ms: u128,
        generation: u64,
        successor: u64,
    },
    ExecutionStarted {
        ts_ms: u128,
        path: InstructionPath,
        execution: ExecutionId,
    },
    ExecutionFinished {
        ts_ms: u128,
        path: InstructionPath,
        execution: ExecutionId,
        success: bool,
        elapsed_ms: u128,
    },
    ExecutionFailed {
        ts_ms: u128,
        path: InstructionPath,
        message: String,
    },
    ResultObserved {
        ts_ms: u128,
        product: ProductPath,
        complete: bool,
    },
    /// Every execution started or kept by this generation has completed.
    Completed {
        ts_ms: u128,
        generation: u64,
    },
}

impl OutputEvent {
    pub fn ts_ms(&self) -> u128 {
        match self {
            OutputEvent::Succeeded { ts_ms, .. }
            | OutputEvent::ExecutionStarted { ts_ms, .. }
            | OutputEvent::ExecutionFinished { ts_ms, .. }
            | OutputEvent::ExecutionFailed { ts_ms, .. }
            | OutputEvent::ResultObserved { ts_ms, .. }
            | OutputEvent::Completed { ts_ms, .. } => *ts_ms,
        }
    }

    pub fn summarize(&self) -> String {
        match self {
            OutputEvent::Succeeded {
                ts_ms,
                generation,
                successor,
            } => format!("{ts_ms} Succeeded generation={generation} successor={successor}"),
            OutputEvent::ExecutionStarted {
                ts_ms,
                path,
                execution,
            } => format!("{ts_ms} ExecutionStarted path={path} execution={execution}"),
            OutputEvent::ExecutionFinished {
                ts_ms,
                path,
                execution,
                success,
                elapsed_ms,
            } => {
                let elapsed = format_elapsed_ms(*elapsed_ms);
                format!(
                    "{ts_ms} ExecutionFinished path={path} execution={execution} success={success} elapsed={elapsed}"
                )
            }
            OutputEvent::ExecutionFailed {
                ts_ms,
                path,
                message,
            } => format!("{ts_ms} ExecutionFailed path={path} message={message}"),
            OutputEvent::ResultObserved {
                ts_ms,
                product,
                complete,
            } => format!("{ts_ms} ResultObserved product={product} complete={complete}"),
            OutputEvent::Completed { ts_ms, generation } => {
                format!("{ts_ms} Completed generation={generation}")
            }
        }
    }
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}

#[derive(Default)]
struct StreamState {
    history: Vec<OutputEvent>,
    subscribers: Vec<Sender<OutputEvent>>,
}

/// Append-only event stream of one generation.
///
/// Subscribers receive every event emitted after they subscribed; `history`
/// holds everything. The stream's lock is a leaf: nothing else is locked while
/// it is held.
#[derive(Default)]
pub struct EventStream {
    state: Mutex<StreamState>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn emit(&self, event: OutputEvent) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        state.history.push(event);
    }

    pub fn subscribe(&self) -> Receiver<OutputEvent> {
        let (tx, rx) = mpsc::channel();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.subscribers.push(tx);
        rx
    }

    pub fn history(&self) -> Vec<OutputEvent> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.history.clone()
    }

    pub fn summarize(&self) -> Vec<String> {
        self.history().iter().map(OutputEvent::summarize).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> InstructionPath {
        InstructionPath::parse(raw).unwrap()
    }

    #[test]
    fn stream_records_history_in_order() {
        let stream = EventStream::new();
        stream.emit(OutputEvent::ExecutionStarted {
            ts_ms: now_ms(),
            path: path("/a"),
            execution: ExecutionId::new(1),
        });
        stream.emit(OutputEvent::ExecutionFinished {
            ts_ms: now_ms(),
            path: path("/a"),
            execution: ExecutionId::new(1),
            success: true,
            elapsed_ms: 1_250,
        });

        let history = stream.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], OutputEvent::ExecutionStarted { .. }));
        let lines = stream.summarize();
        assert!(lines[1].contains("success=true"), "{}", lines[1]);
        assert!(lines[1].contains("elapsed=1.25s"), "{}", lines[1]);
    }

    #[test]
    fn subscribers_only_see_later_events() {
        let stream = EventStream::new();
        stream.emit(OutputEvent::Completed {
            ts_ms: now_ms(),
            generation: 1,
        });
        let rx = stream.subscribe();
        stream.emit(OutputEvent::Succeeded {
            ts_ms: now_ms(),
            generation: 1,
            successor: 2,
        });

        let event = rx.try_recv().expect("subscriber should receive the event");
        assert!(matches!(event, OutputEvent::Succeeded { successor: 2, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let stream = EventStream::new();
        drop(stream.subscribe());
        stream.emit(OutputEvent::Completed {
            ts_ms: now_ms(),
            generation: 3,
        });
        assert_eq!(stream.history().len(), 1);
    }
}
