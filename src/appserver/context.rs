use std::sync::Arc;

use rsip::{Method, Request, Response, StatusCode, Uri};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sip::util;
use crate::sip::{StatelessSender, TrailId, TransactionSink, TsxId};

use super::ForkId;

/// Per-transaction service state and the primitive operations a service may
/// invoke on it. Lifetime equals the SIP transaction it serves: the
/// framework creates it for the initial request, keeps it while forks are
/// outstanding, and drops it when the transaction completes.
///
/// The context uniquely owns all fork state and per-fork request messages;
/// handlers only ever borrow it for the duration of a hook.
pub struct ServiceContext {
    trail: TrailId,
    txn: TsxId,
    original_request: Request,
    dialog_id: String,
    dialog_registered: bool,
    forks: Vec<Fork>,
    dispatched: usize,
    rejected: bool,
    final_response_sent: bool,
    handling_initial_request: bool,
    stateless: Arc<dyn StatelessSender>,
    transactions: Arc<dyn TransactionSink>,
}

pub(crate) struct Fork {
    pub(crate) target: Uri,
    pub(crate) request: Request,
    pub(crate) state: ForkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForkState {
    /// Added but not yet sent downstream.
    Pending,
    /// Sent downstream, no final response yet.
    Outstanding,
    /// Final response received (or synthesized).
    Completed,
    Cancelled,
}

impl ServiceContext {
    pub(crate) fn new(
        trail: TrailId,
        txn: TsxId,
        original_request: Request,
        inherited_dialog_id: String,
        stateless: Arc<dyn StatelessSender>,
        transactions: Arc<dyn TransactionSink>,
    ) -> Self {
        Self {
            trail,
            txn,
            original_request,
            dialog_id: inherited_dialog_id,
            dialog_registered: false,
            forks: Vec::new(),
            dispatched: 0,
            rejected: false,
            final_response_sent: false,
            handling_initial_request: true,
            stateless,
            transactions,
        }
    }

    /// Joins the underlying SIP dialog so in-dialog requests re-invoke this
    /// service. Without an explicit identifier, one is derived
    /// deterministically from the request's Call-ID and From-tag.
    pub fn add_to_dialog(&mut self, dialog_id: Option<&str>) {
        self.dialog_id = match dialog_id {
            Some(id) => id.to_string(),
            None => util::derive_dialog_id(&self.original_request),
        };
        self.dialog_registered = true;
        debug!(trail = %self.trail, dialog = %self.dialog_id, "service joined dialog");
    }

    /// The dialog identifier attached to this service, established here or
    /// inherited from an earlier transaction on the same dialog. Empty if
    /// none.
    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }

    /// Deep, independently owned copy of a request, for diverging the
    /// message per fork.
    pub fn clone_request(&self, req: &Request) -> Request {
        req.clone()
    }

    /// Adds a downstream target. Without an explicit request the originally
    /// received one is used. Returns the fork identity passed in with any
    /// subsequent response on that leg.
    pub fn add_target(&mut self, target: Uri, req: Option<Request>) -> Result<ForkId> {
        if self.rejected || self.final_response_sent {
            return Err(Error::sip_stack(
                "targets cannot be added after a final response",
            ));
        }
        let request = req.unwrap_or_else(|| self.original_request.clone());
        let fork_id = self.forks.len() as ForkId;
        self.forks.push(Fork {
            target,
            request,
            state: ForkState::Pending,
        });
        debug!(trail = %self.trail, fork_id, "target added");
        Ok(fork_id)
    }

    /// Short-circuits the transaction with a stateless final response.
    /// Only valid while handling the initial request, before any
    /// `send_response`; afterwards rejection must go through
    /// `send_response`. Disables further forking.
    ///
    /// A custom status text is recorded in the trace; the status line itself
    /// renders the canonical reason phrase for the code.
    pub fn reject(&mut self, status_code: StatusCode, status_text: Option<&str>) -> Result<()> {
        if !self.handling_initial_request {
            return Err(Error::sip_stack(
                "reject is only valid while handling the initial request",
            ));
        }
        if self.rejected || self.final_response_sent {
            return Err(Error::sip_stack("a final response was already sent"));
        }
        debug!(
            trail = %self.trail,
            status = %status_code,
            reason = status_text.unwrap_or_default(),
            "service rejected request"
        );
        let rsp = util::stateless_response(&self.original_request, status_code);
        self.stateless.send_response(self.trail, rsp)?;
        self.rejected = true;
        self.final_response_sent = true;
        Ok(())
    }

    /// Sends a provisional or final response upstream. A final response on
    /// a forked INVITE cancels every fork that has not yet answered.
    pub fn send_response(&mut self, rsp: Response) -> Result<()> {
        if util::is_final(&rsp.status_code) {
            if self.final_response_sent {
                return Err(Error::sip_stack("a final response was already sent"));
            }
            self.final_response_sent = true;
            if self.original_request.method == Method::Invite {
                self.cancel_outstanding_forks();
            }
        }
        self.transactions
            .send_upstream_response(self.trail, self.txn, rsp)
    }

    /// Trail identifier to use for any diagnostic event related to this
    /// service invocation.
    pub fn trail(&self) -> TrailId {
        self.trail
    }

    // Framework-facing state below.

    pub(crate) fn txn(&self) -> TsxId {
        self.txn
    }

    pub(crate) fn original_request(&self) -> &Request {
        &self.original_request
    }

    pub(crate) fn was_rejected(&self) -> bool {
        self.rejected
    }

    pub(crate) fn has_final_response(&self) -> bool {
        self.final_response_sent
    }

    pub(crate) fn mark_final_response(&mut self) {
        self.final_response_sent = true;
    }

    pub(crate) fn dialog_registered(&self) -> bool {
        self.dialog_registered
    }

    pub(crate) fn request_phase_done(&mut self) {
        self.handling_initial_request = false;
    }

    pub(crate) fn has_undispatched_forks(&self) -> bool {
        self.forks[self.dispatched..]
            .iter()
            .any(|fork| fork.state == ForkState::Pending)
    }

    /// Hands out the forks added since the last dispatch, marking them
    /// outstanding. The caller owns sending them downstream.
    pub(crate) fn take_undispatched_forks(&mut self) -> Vec<(ForkId, Uri, Request)> {
        let mut out = Vec::new();
        for (idx, fork) in self.forks.iter_mut().enumerate().skip(self.dispatched) {
            if fork.state == ForkState::Pending {
                fork.state = ForkState::Outstanding;
                out.push((idx as ForkId, fork.target.clone(), fork.request.clone()));
            }
        }
        self.dispatched = self.forks.len();
        out
    }

    pub(crate) fn complete_fork(&mut self, fork_id: ForkId) {
        if let Some(fork) = self.forks.get_mut(fork_id as usize)
            && fork.state == ForkState::Outstanding
        {
            fork.state = ForkState::Completed;
        }
    }

    pub(crate) fn fork_state(&self, fork_id: ForkId) -> Option<ForkState> {
        self.forks.get(fork_id as usize).map(|fork| fork.state)
    }

    pub(crate) fn outstanding_forks(&self) -> usize {
        self.forks
            .iter()
            .filter(|fork| fork.state == ForkState::Outstanding)
            .count()
    }

    pub(crate) fn cancel_outstanding_forks(&mut self) {
        for (idx, fork) in self.forks.iter_mut().enumerate() {
            if fork.state == ForkState::Outstanding {
                self.transactions
                    .cancel_fork(self.trail, self.txn, idx as ForkId);
                fork.state = ForkState::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::testutil::invite_request;
    use crate::sip::{NullStatelessSender, NullTransactionSink};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        cancelled: Mutex<Vec<ForkId>>,
        upstream: Mutex<Vec<StatusCode>>,
    }

    impl TransactionSink for RecordingSink {
        fn forward_request(
            &self,
            _trail: TrailId,
            _txn: TsxId,
            _fork_id: ForkId,
            _target: &Uri,
            _req: Request,
        ) -> Result<()> {
            Ok(())
        }

        fn cancel_fork(&self, _trail: TrailId, _txn: TsxId, fork_id: ForkId) {
            self.cancelled.lock().unwrap().push(fork_id);
        }

        fn send_upstream_response(
            &self,
            _trail: TrailId,
            _txn: TsxId,
            rsp: Response,
        ) -> Result<()> {
            self.upstream.lock().unwrap().push(rsp.status_code);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingStateless {
        sent: Mutex<Vec<StatusCode>>,
    }

    impl StatelessSender for RecordingStateless {
        fn send_response(&self, _trail: TrailId, rsp: Response) -> Result<()> {
            self.sent.lock().unwrap().push(rsp.status_code);
            Ok(())
        }
    }

    fn context() -> ServiceContext {
        ServiceContext::new(
            TrailId(1),
            11,
            invite_request("sip:bob@example.com"),
            String::new(),
            Arc::new(NullStatelessSender),
            Arc::new(NullTransactionSink),
        )
    }

    fn target(uri: &str) -> Uri {
        Uri::try_from(uri).unwrap()
    }

    #[test]
    fn fork_ids_are_unique_and_strictly_increasing() {
        let mut ctx = context();
        let mut previous = None;
        for idx in 0..5 {
            let fork_id = ctx
                .add_target(target(&format!("sip:target{idx}@example.net")), None)
                .unwrap();
            if let Some(previous) = previous {
                assert!(fork_id > previous);
            }
            previous = Some(fork_id);
        }
    }

    #[test]
    fn add_target_defaults_to_the_original_request() {
        let mut ctx = context();
        ctx.add_target(target("sip:a@example.net"), None).unwrap();
        let forks = ctx.take_undispatched_forks();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].2.method, Method::Invite);
    }

    #[test]
    fn clone_request_is_a_deep_copy() {
        let ctx = context();
        let mut cloned = ctx.clone_request(ctx.original_request());
        cloned.uri = target("sip:divert@example.net");
        assert_ne!(cloned.uri, ctx.original_request().uri);
    }

    #[test]
    fn reject_is_refused_outside_the_initial_request() {
        let mut ctx = context();
        ctx.request_phase_done();
        assert!(ctx.reject(StatusCode::Forbidden, None).is_err());
    }

    #[test]
    fn reject_sends_statelessly_and_disables_forking() {
        let stateless = Arc::new(RecordingStateless::default());
        let mut ctx = ServiceContext::new(
            TrailId(1),
            11,
            invite_request("sip:bob@example.com"),
            String::new(),
            stateless.clone(),
            Arc::new(NullTransactionSink),
        );

        ctx.reject(StatusCode::Forbidden, Some("screened")).unwrap();
        assert_eq!(*stateless.sent.lock().unwrap(), vec![StatusCode::Forbidden]);

        assert!(ctx.reject(StatusCode::Forbidden, None).is_err());
        assert!(ctx.add_target(target("sip:a@example.net"), None).is_err());
    }

    #[test]
    fn final_invite_response_cancels_outstanding_forks() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = ServiceContext::new(
            TrailId(1),
            11,
            invite_request("sip:bob@example.com"),
            String::new(),
            Arc::new(NullStatelessSender),
            sink.clone(),
        );

        ctx.add_target(target("sip:a@example.net"), None).unwrap();
        ctx.add_target(target("sip:b@example.net"), None).unwrap();
        ctx.take_undispatched_forks();
        ctx.complete_fork(0);

        let rsp = crate::sip::util::stateless_response(
            ctx.original_request(),
            StatusCode::OK,
        );
        ctx.send_response(rsp).unwrap();

        assert_eq!(*sink.cancelled.lock().unwrap(), vec![1]);
        assert_eq!(*sink.upstream.lock().unwrap(), vec![StatusCode::OK]);
    }

    #[test]
    fn provisional_responses_do_not_finalize() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = ServiceContext::new(
            TrailId(1),
            11,
            invite_request("sip:bob@example.com"),
            String::new(),
            Arc::new(NullStatelessSender),
            sink.clone(),
        );

        let rsp =
            crate::sip::util::stateless_response(ctx.original_request(), StatusCode::Ringing);
        ctx.send_response(rsp).unwrap();
        assert!(!ctx.has_final_response());
        assert!(ctx.add_target(target("sip:a@example.net"), None).is_ok());
    }

    #[test]
    fn dialog_id_derivation_is_stable() {
        let mut ctx = context();
        assert_eq!(ctx.dialog_id(), "");
        ctx.add_to_dialog(None);
        let derived = ctx.dialog_id().to_string();
        assert!(!derived.is_empty());

        let mut again = context();
        again.add_to_dialog(None);
        assert_eq!(again.dialog_id(), derived);

        let mut explicit = context();
        explicit.add_to_dialog(Some("feature-x"));
        assert_eq!(explicit.dialog_id(), "feature-x");
    }
}
