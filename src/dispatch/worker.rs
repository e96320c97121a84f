use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rsip::{Method, SipMessage};
use tracing::{debug, error};

use crate::error::Result;
use crate::monitor::{EventAccumulator, ExceptionHandler, LoadMonitor};
use crate::sip::util;
use crate::sip::{StatelessSender, TrailId};

use super::queue::EventQueue;

/// Unit of work owned by the queue: a cloned received message, or a deferred
/// action another subsystem wants run on a worker thread.
pub enum WorkItem {
    Message(MessageEvent),
    Callback(Box<dyn FnOnce() + Send>),
}

/// A cloned SIP message together with the stopwatch started at ingress.
/// The stopwatch tracks the time from receipt to the end of processing and
/// feeds the latency table and the load monitor.
pub struct MessageEvent {
    pub msg: SipMessage,
    pub trail: TrailId,
    pub(crate) stopwatch: Instant,
}

impl MessageEvent {
    pub fn new(msg: SipMessage, trail: TrailId) -> Self {
        Self {
            msg,
            trail,
            stopwatch: Instant::now(),
        }
    }
}

/// Entry point the workers hand each dequeued message to.
pub trait MessageProcessor: Send + Sync {
    fn process(&self, msg: &SipMessage, trail: TrailId);
}

/// Collaborators shared by every worker thread.
pub struct WorkerEnv {
    pub latency_table: Arc<dyn EventAccumulator>,
    pub load_monitor: Arc<dyn LoadMonitor>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    pub stateless: Arc<dyn StatelessSender>,
}

/// Fixed pool of identical worker threads draining the event queue.
pub struct WorkerPool {
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        num_workers: usize,
        queue: Arc<EventQueue<WorkItem>>,
        processor: Arc<dyn MessageProcessor>,
        env: Arc<WorkerEnv>,
    ) -> Result<Self> {
        let single_worker = num_workers == 1;
        let mut threads = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let queue = queue.clone();
            let processor = processor.clone();
            let env = env.clone();
            let handle = thread::Builder::new()
                .name(format!("sip-worker-{idx}"))
                .spawn(move || worker_loop(queue, processor, env, single_worker))?;
            threads.push(handle);
        }
        Ok(Self { threads })
    }

    /// Blocks until every worker has observed queue termination and exited.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("worker thread panicked outside the fault guard");
            }
        }
    }
}

fn worker_loop(
    queue: Arc<EventQueue<WorkItem>>,
    processor: Arc<dyn MessageProcessor>,
    env: Arc<WorkerEnv>,
    single_worker: bool,
) {
    debug!("worker thread started");

    while let Some(item) = queue.pop() {
        match item {
            WorkItem::Callback(callback) => callback(),
            WorkItem::Message(event) => {
                if !process_message(&event, processor.as_ref(), env.as_ref(), single_worker) {
                    return;
                }

                let latency_us = event.stopwatch.elapsed().as_micros() as u64;
                debug!(trail = %event.trail, latency_us, "message processing complete");
                env.latency_table.accumulate(latency_us);
                env.load_monitor.request_complete(latency_us);
            }
        }
    }

    debug!("worker thread ended");
}

/// Runs one message through the pipeline inside the fault guard. Returns
/// `false` when the pool cannot safely continue and the worker must exit.
fn process_message(
    event: &MessageEvent,
    processor: &dyn MessageProcessor,
    env: &WorkerEnv,
    single_worker: bool,
) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        processor.process(&event.msg, event.trail)
    }));

    if outcome.is_ok() {
        return true;
    }

    // Dump correlation fields. Read them defensively: after an unknown
    // fault the message cannot be assumed well formed.
    let call_id = util::describe_call_id(&event.msg);
    let cseq = util::describe_cseq(&event.msg);
    error!(
        trail = %event.trail,
        call_id = %call_id,
        cseq = %cseq,
        "trapped fault while processing message"
    );

    if let SipMessage::Request(req) = &event.msg
        && req.method != Method::Ack
    {
        // 500 with Retry-After so the peer backs off before retrying.
        let rsp = util::fault_response(req);
        if let Err(err) = env.stateless.send_response(event.trail, rsp) {
            error!(trail = %event.trail, error = %err, "failed to send 500 after fault");
        }
    }

    if single_worker {
        // No redundancy to quarantine the fault; fast-fail restart instead.
        env.exception_handler
            .abort_process("trapped fault with a single worker thread");
        return false;
    }

    true
}
