//! SIP-facing surface: trail correlation, the seams to the transport and
//! transaction engine, the processing pipeline and the registrar service.

mod pipeline;
mod registrar;
pub(crate) mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use pipeline::SipPipeline;
pub use registrar::Registrar;

use std::fmt;

use rsip::{Request, Response, Uri};
use tracing::debug;

use crate::appserver::ForkId;
use crate::error::Result;

/// Opaque correlation identifier propagated with every message and event
/// for distributed tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrailId(pub u64);

impl fmt::Display for TrailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one proxied transaction, unique for the node's lifetime.
pub type TsxId = u64;

/// Emits responses statelessly on the inbound transport pool.
pub trait StatelessSender: Send + Sync {
    fn send_response(&self, trail: TrailId, rsp: Response) -> Result<()>;
}

/// The engine's stateful transaction layer. Forked requests go downstream
/// through it; consolidated responses go back upstream through it.
pub trait TransactionSink: Send + Sync {
    fn forward_request(
        &self,
        trail: TrailId,
        txn: TsxId,
        fork_id: ForkId,
        target: &Uri,
        req: Request,
    ) -> Result<()>;

    /// Cancels a downstream fork that has not yet returned a final response.
    fn cancel_fork(&self, trail: TrailId, txn: TsxId, fork_id: ForkId);

    fn send_upstream_response(&self, trail: TrailId, txn: TsxId, rsp: Response) -> Result<()>;
}

/// Sender that logs and discards. Lets the core run without a wired engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatelessSender;

impl StatelessSender for NullStatelessSender {
    fn send_response(&self, trail: TrailId, rsp: Response) -> Result<()> {
        debug!(trail = %trail, status = %rsp.status_code, "discarding stateless response (no transport wired)");
        Ok(())
    }
}

/// Transaction layer that logs and discards.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransactionSink;

impl TransactionSink for NullTransactionSink {
    fn forward_request(
        &self,
        trail: TrailId,
        txn: TsxId,
        fork_id: ForkId,
        target: &Uri,
        _req: Request,
    ) -> Result<()> {
        debug!(trail = %trail, txn, fork_id, target = %target, "discarding forwarded request (no engine wired)");
        Ok(())
    }

    fn cancel_fork(&self, trail: TrailId, txn: TsxId, fork_id: ForkId) {
        debug!(trail = %trail, txn, fork_id, "discarding fork cancel (no engine wired)");
    }

    fn send_upstream_response(&self, trail: TrailId, txn: TsxId, rsp: Response) -> Result<()> {
        debug!(trail = %trail, txn, status = %rsp.status_code, "discarding upstream response (no engine wired)");
        Ok(())
    }
}
