//! Application-server framework: the polymorphic contract pluggable
//! services implement, and the concrete per-transaction context they drive.
//!
//! A service registers under a name at startup. Its factory is consulted
//! when initial filter criteria resolve to `<service_name>.<home_domain>`,
//! or when an in-dialog request arrives on a dialog the service previously
//! joined with `add_to_dialog`. Declining (returning `None`) lets the
//! request fall through to default routing.

mod context;

pub use context::ServiceContext;
pub(crate) use context::ForkState;

use rsip::{Request, Response};

/// Identity of a downstream fork, unique and strictly increasing within one
/// transaction.
pub type ForkId = u32;

/// A named service implementation. One instance is registered per service;
/// it produces a fresh transaction handler per invocation.
pub trait AppServer: Send + Sync {
    fn service_name(&self) -> &str;

    /// Decides whether this service wants the request. `dialog_id` is empty
    /// for out-of-dialog requests and carries the established identifier for
    /// in-dialog invocations.
    fn get_context(&self, req: &Request, dialog_id: &str)
    -> Option<Box<dyn AppServerTransaction>>;
}

/// Per-transaction handler produced by a service factory. The framework
/// owns the `ServiceContext` and lends it to the handler for the duration
/// of each hook; handlers must not retain transaction state past their own
/// lifetime.
pub trait AppServerTransaction: Send {
    /// Called with the original received request for a dialog-initiating or
    /// out-of-dialog transaction. Unless `reject` was called or a final
    /// response was sent, on return the request is forwarded to every added
    /// target, or to its existing Request-URI if none were added.
    fn on_initial_request(&mut self, ctx: &mut ServiceContext, req: &Request);

    /// Called with an in-dialog request; same forwarding semantics as
    /// `on_initial_request`.
    fn on_in_dialog_request(&mut self, ctx: &mut ServiceContext, req: &Request) {
        let _ = (ctx, req);
    }

    /// Called with every response received on the transaction, tagged with
    /// the fork it arrived on. Downstream transport errors and transaction
    /// timeouts surface here as a synthesized 408. Returning `true` lets the
    /// response flow upstream (after best-response consolidation for finals
    /// on a forked request); returning `false` drops it, and any targets
    /// added during the call are forked to instead.
    fn on_response(&mut self, ctx: &mut ServiceContext, rsp: &Response, fork_id: ForkId) -> bool {
        let _ = (ctx, rsp, fork_id);
        true
    }

    /// Called when the inbound leg terminates early: 487 for a received
    /// CANCEL, 408 for an inbound transport error. Outstanding downstream
    /// forks are cancelled automatically on return.
    fn on_cancel(&mut self, ctx: &mut ServiceContext, status_code: u16) {
        let _ = (ctx, status_code);
    }
}
