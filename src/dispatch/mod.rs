//! Message dispatch: the shared event queue, the worker pool draining it,
//! and the transport ingress hook feeding it.

mod ingress;
mod queue;
mod worker;

pub use ingress::{InboundMessage, IngressHook, IngressOutcome, RxMessage};
pub use queue::EventQueue;
pub use worker::{MessageEvent, MessageProcessor, WorkItem, WorkerEnv, WorkerPool};
