use std::sync::Arc;

use rsip::{Method, SipMessage};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::monitor::{EventAccumulator, ExceptionHandler};
use crate::sip::util;
use crate::sip::{StatelessSender, TrailId};

use super::queue::EventQueue;
use super::worker::{MessageEvent, WorkItem};

/// What the transport layer should do with the message it just delivered.
/// The hook always absorbs: once it returns, the engine must not run its own
/// routing for this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Absorbed,
}

/// A received message as presented by the SIP engine. The parsed message is
/// only valid for the duration of the transport callback, so the hook takes
/// a deep clone before handing it to the worker pool.
pub trait InboundMessage {
    fn trail(&self) -> TrailId;
    fn message(&self) -> &SipMessage;
    fn try_clone_message(&self) -> Result<SipMessage>;
}

/// Owning inbound envelope for engines that hand over parsed messages
/// directly.
pub struct RxMessage {
    pub msg: SipMessage,
    pub trail: TrailId,
}

impl InboundMessage for RxMessage {
    fn trail(&self) -> TrailId {
        self.trail
    }

    fn message(&self) -> &SipMessage {
        &self.msg
    }

    fn try_clone_message(&self) -> Result<SipMessage> {
        Ok(self.msg.clone())
    }
}

/// Registered with the SIP engine immediately after initial parsing and
/// before any routing logic. Clones each received message onto the shared
/// event queue for the worker pool.
pub struct IngressHook {
    queue: Arc<EventQueue<WorkItem>>,
    queue_size_table: Arc<dyn EventAccumulator>,
    exception_handler: Arc<dyn ExceptionHandler>,
    stateless: Arc<dyn StatelessSender>,
    high_watermark: Option<usize>,
}

impl IngressHook {
    pub fn new(
        queue: Arc<EventQueue<WorkItem>>,
        queue_size_table: Arc<dyn EventAccumulator>,
        exception_handler: Arc<dyn ExceptionHandler>,
        stateless: Arc<dyn StatelessSender>,
        high_watermark: Option<usize>,
    ) -> Self {
        Self {
            queue,
            queue_size_table,
            exception_handler,
            stateless,
            high_watermark,
        }
    }

    pub fn on_rx_message(&self, rx: &dyn InboundMessage) -> IngressOutcome {
        let trail = rx.trail();
        debug!(trail = %trail, "received message entering dispatch");

        if self.queue.is_deadlocked() {
            // The queue has not been serviced for long enough to imply every
            // worker is wedged. Exit so the supervisor restarts the node.
            error!(trail = %trail, "worker pool deadlocked, aborting");
            self.exception_handler
                .abort_process("event queue deadlocked");
            return IngressOutcome::Absorbed;
        }

        // The soft bound sheds new requests only; responses still go
        // through, since they release in-flight transaction state.
        let depth = self.queue.len();
        if let Some(watermark) = self.high_watermark
            && depth >= watermark
            && matches!(rx.message(), SipMessage::Request(_))
        {
            warn!(trail = %trail, depth, "queue above high watermark, refusing request");
            self.refuse_overload(rx, trail);
            return IngressOutcome::Absorbed;
        }

        // The clone must happen inside the callback frame; the worker
        // processes it asynchronously.
        let msg = match rx.try_clone_message() {
            Ok(msg) => msg,
            Err(err) => {
                error!(trail = %trail, error = %err, "failed to clone incoming message, dropping");
                return IngressOutcome::Absorbed;
            }
        };

        let event = MessageEvent::new(msg, trail);
        self.queue_size_table.accumulate(depth as u64);
        debug!(trail = %trail, depth, "queueing cloned message for worker pool");
        self.queue.push(WorkItem::Message(event));

        IngressOutcome::Absorbed
    }

    /// Queues a deferred action for the worker pool on behalf of another
    /// subsystem.
    pub fn enqueue_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.queue_size_table.accumulate(self.queue.len() as u64);
        self.queue.push(WorkItem::Callback(callback));
    }

    fn refuse_overload(&self, rx: &dyn InboundMessage, trail: TrailId) {
        // Only requests other than ACK can be answered.
        let SipMessage::Request(req) = rx.message() else {
            return;
        };
        if req.method == Method::Ack {
            return;
        }
        let rsp = util::stateless_response(req, rsip::StatusCode::ServiceUnavailable);
        if let Err(err) = self.stateless.send_response(trail, rsp) {
            error!(trail = %trail, error = %err, "failed to send 503 under overload");
        }
    }
}
