use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::message::headers_ext::HeadersExt;
use rsip::{Method, Request, Response, SipMessage, StatusCode};
use tracing::{debug, warn};

use crate::appserver::{AppServer, AppServerTransaction, ForkId, ForkState, ServiceContext};
use crate::config::CoreConfig;
use crate::dispatch::MessageProcessor;
use crate::sip::util;
use crate::sip::{StatelessSender, TrailId, TransactionSink, TsxId};

/// The SIP processing entry the worker pool drives. Classifies each
/// message, resolves the serving application service, runs its handler and
/// owns the fork bookkeeping and response consolidation for every
/// transaction in flight.
pub struct SipPipeline {
    config: Arc<CoreConfig>,
    services: Vec<Arc<dyn AppServer>>,
    /// Dialog identifier to service name, for in-dialog re-invocation.
    dialogs: Mutex<HashMap<String, String>>,
    /// Transactions with forks still outstanding downstream.
    active: Mutex<HashMap<TsxId, Arc<Mutex<ActiveTransaction>>>>,
    next_txn: AtomicU64,
    stateless: Arc<dyn StatelessSender>,
    transactions: Arc<dyn TransactionSink>,
}

struct ActiveTransaction {
    context: ServiceContext,
    handler: Option<Box<dyn AppServerTransaction>>,
    call_id: String,
    cseq: u32,
    invite: bool,
    /// Best non-2xx final seen so far, pending consolidation.
    best_final: Option<Response>,
    done: bool,
}

impl MessageProcessor for SipPipeline {
    fn process(&self, msg: &SipMessage, trail: TrailId) {
        match msg {
            SipMessage::Request(req) => self.process_request(req, trail),
            SipMessage::Response(rsp) => self.process_response(rsp, trail),
        }
    }
}

impl SipPipeline {
    pub fn new(
        config: Arc<CoreConfig>,
        services: Vec<Arc<dyn AppServer>>,
        stateless: Arc<dyn StatelessSender>,
        transactions: Arc<dyn TransactionSink>,
    ) -> Self {
        Self {
            config,
            services,
            dialogs: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            stateless,
            transactions,
        }
    }

    fn process_request(&self, req: &Request, trail: TrailId) {
        debug!(trail = %trail, method = %req.method, "processing request");
        if req.method == Method::Cancel {
            self.handle_cancel(req, trail);
            return;
        }

        let in_dialog = req
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok().flatten())
            .is_some();
        if in_dialog {
            self.handle_in_dialog_request(req, trail);
        } else {
            self.handle_initial_request(req, trail);
        }
    }

    fn handle_initial_request(&self, req: &Request, trail: TrailId) {
        let service = self.resolve_initial_service(req);
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let mut context = ServiceContext::new(
            trail,
            txn,
            req.clone(),
            String::new(),
            self.stateless.clone(),
            self.transactions.clone(),
        );

        let mut handler = match &service {
            Some(service) => {
                let handler = service.get_context(req, "");
                if handler.is_none() {
                    debug!(trail = %trail, service = service.service_name(), "service declined request");
                }
                handler
            }
            None => None,
        };

        if let Some(handler) = handler.as_mut() {
            debug!(trail = %trail, txn, "invoking service for initial request");
            handler.on_initial_request(&mut context, req);
        }
        context.request_phase_done();

        if context.dialog_registered()
            && let Some(service) = &service
        {
            lock(&self.dialogs).insert(
                context.dialog_id().to_string(),
                service.service_name().to_string(),
            );
        }

        self.finish_request(context, handler, trail);
    }

    fn handle_in_dialog_request(&self, req: &Request, trail: TrailId) {
        let (dialog_id, service) = self.resolve_dialog_service(req);
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let mut context = ServiceContext::new(
            trail,
            txn,
            req.clone(),
            dialog_id.unwrap_or_default(),
            self.stateless.clone(),
            self.transactions.clone(),
        );
        // Rejection is an initial-request primitive; in-dialog handlers
        // answer through send_response instead.
        context.request_phase_done();

        let mut handler = service.and_then(|service| service.get_context(req, context.dialog_id()));
        if let Some(handler) = handler.as_mut() {
            debug!(trail = %trail, txn, dialog = context.dialog_id(), "invoking service for in-dialog request");
            handler.on_in_dialog_request(&mut context, req);
        }

        self.finish_request(context, handler, trail);
    }

    /// Shared tail of request handling: default routing, fork dispatch and
    /// transaction retention.
    fn finish_request(
        &self,
        mut context: ServiceContext,
        handler: Option<Box<dyn AppServerTransaction>>,
        trail: TrailId,
    ) {
        if context.was_rejected() || context.has_final_response() {
            return;
        }

        if !context.has_undispatched_forks() {
            let target = context.original_request().uri.clone();
            if context.add_target(target, None).is_err() {
                return;
            }
        }

        let txn = context.txn();
        let method = context.original_request().method.clone();
        let record = Arc::new(Mutex::new(ActiveTransaction {
            call_id: request_call_id(context.original_request()),
            cseq: request_cseq(context.original_request()),
            invite: method == Method::Invite,
            context,
            handler,
            best_final: None,
            done: false,
        }));

        // ACK has no responses; forward it without retaining state.
        if method != Method::Ack {
            lock(&self.active).insert(txn, record.clone());
        }

        // The worker's fault trap answers the inbound request itself, so
        // the cleanup guard only has to tear the transaction down.
        let done = self.run_txn_step(txn, &record, trail, false, || {
            let mut guard = lock_record(&record);
            self.dispatch_forks(&mut guard, trail);
            guard.done
        });

        if method == Method::Ack || done {
            lock(&self.active).remove(&txn);
        }
    }

    fn process_response(&self, rsp: &Response, trail: TrailId) {
        let Some((txn, fork_id)) = util::response_fork(rsp) else {
            debug!(trail = %trail, status = %rsp.status_code, "response carries no branch of ours, dropping");
            return;
        };

        let record = lock(&self.active).get(&txn).cloned();
        let Some(record) = record else {
            debug!(trail = %trail, txn, "response for a finished transaction, dropping");
            return;
        };

        // A fault here happens after the inbound request was absorbed, so
        // the cleanup guard also answers the upstream leg.
        let done = self.run_txn_step(txn, &record, trail, true, || {
            let mut guard = lock_record(&record);
            if guard.done {
                return true;
            }
            self.consolidate(&mut guard, fork_id, rsp.clone(), trail, false);
            guard.done
        });

        if done {
            lock(&self.active).remove(&txn);
        }
    }

    fn handle_cancel(&self, req: &Request, trail: TrailId) {
        let call_id = request_call_id(req);
        let cseq = request_cseq(req);

        let Some((txn, record)) = self.find_transaction(&call_id, cseq) else {
            debug!(trail = %trail, "CANCEL matches no transaction, answering 481");
            let not_found =
                util::stateless_response(req, StatusCode::CallTransactionDoesNotExist);
            if let Err(err) = self.stateless.send_response(trail, not_found) {
                warn!(trail = %trail, error = %err, "failed to answer stray CANCEL");
            }
            return;
        };

        self.run_txn_step(txn, &record, trail, true, || {
            let mut guard = lock_record(&record);
            if guard.done {
                return;
            }

            debug!(trail = %trail, txn, "cancelling transaction");
            let ok = util::stateless_response(req, StatusCode::OK);
            if let Err(err) = self.stateless.send_response(trail, ok) {
                warn!(trail = %trail, error = %err, "failed to answer CANCEL");
            }

            {
                let ActiveTransaction {
                    context, handler, ..
                } = &mut *guard;
                if let Some(handler) = handler.as_mut() {
                    handler.on_cancel(context, 487);
                }
            }
            guard.context.cancel_outstanding_forks();

            let terminated = util::stateless_response(
                guard.context.original_request(),
                StatusCode::RequestTerminated,
            );
            guard.context.mark_final_response();
            if let Err(err) = self
                .transactions
                .send_upstream_response(trail, txn, terminated)
            {
                warn!(trail = %trail, error = %err, "failed to send 487 upstream");
            }
            guard.done = true;
        });
        lock(&self.active).remove(&txn);
    }

    /// Engine callback for a failure of the inbound leg itself: a transport
    /// error or transaction timeout upstream of this node. The matching
    /// transaction's service sees `on_cancel(408)`, then its outstanding
    /// downstream forks are cancelled. Nothing goes upstream; that leg is
    /// gone.
    pub fn on_inbound_failure(&self, call_id: &str, cseq: u32, trail: TrailId) {
        let Some((txn, record)) = self.find_transaction(call_id, cseq) else {
            debug!(trail = %trail, call_id, "inbound failure matches no transaction");
            return;
        };

        self.run_txn_step(txn, &record, trail, false, || {
            let mut guard = lock_record(&record);
            if guard.done {
                return;
            }

            debug!(trail = %trail, txn, "inbound leg failed, terminating transaction");
            {
                let ActiveTransaction {
                    context, handler, ..
                } = &mut *guard;
                if let Some(handler) = handler.as_mut() {
                    handler.on_cancel(context, 408);
                }
            }
            guard.context.cancel_outstanding_forks();
            guard.context.mark_final_response();
            guard.done = true;
        });
        lock(&self.active).remove(&txn);
    }

    fn find_transaction(
        &self,
        call_id: &str,
        cseq: u32,
    ) -> Option<(TsxId, Arc<Mutex<ActiveTransaction>>)> {
        let candidates: Vec<(TsxId, Arc<Mutex<ActiveTransaction>>)> = lock(&self.active)
            .iter()
            .map(|(txn, record)| (*txn, record.clone()))
            .collect();

        candidates.into_iter().find(|(_, record)| {
            let guard = lock_record(record);
            !guard.done && guard.call_id == call_id && guard.cseq == cseq
        })
    }

    /// Runs one step of transaction processing under a cleanup guard: a
    /// fault inside the step (typically a panicking service handler)
    /// cancels the transaction's outstanding forks and tears the record
    /// down before the fault continues up to the worker's trap.
    /// `answer_upstream` additionally emits a 500 on the inbound leg, for
    /// steps where the worker's own fault path will not answer it.
    fn run_txn_step<R>(
        &self,
        txn: TsxId,
        record: &Arc<Mutex<ActiveTransaction>>,
        trail: TrailId,
        answer_upstream: bool,
        step: impl FnOnce() -> R,
    ) -> R {
        match panic::catch_unwind(AssertUnwindSafe(step)) {
            Ok(result) => result,
            Err(payload) => {
                warn!(trail = %trail, txn, "fault during transaction processing, cancelling outstanding forks");
                let mut guard = lock_record(record);
                guard.context.cancel_outstanding_forks();
                if answer_upstream && !guard.context.has_final_response() {
                    let failure = util::stateless_response(
                        guard.context.original_request(),
                        StatusCode::ServerInternalError,
                    );
                    if let Err(err) =
                        self.transactions.send_upstream_response(trail, txn, failure)
                    {
                        warn!(trail = %trail, txn, error = %err, "failed to answer upstream after fault");
                    }
                }
                guard.context.mark_final_response();
                guard.done = true;
                drop(guard);
                lock(&self.active).remove(&txn);
                panic::resume_unwind(payload);
            }
        }
    }

    /// Sends every not-yet-dispatched fork downstream, stamping this node's
    /// Via so responses correlate back. A send failure surfaces to the
    /// service as a synthesized 408 on that fork.
    fn dispatch_forks(&self, record: &mut ActiveTransaction, trail: TrailId) {
        let txn = record.context.txn();
        for (fork_id, target, mut request) in record.context.take_undispatched_forks() {
            request.uri = target.clone();
            let branch = util::fork_branch(txn, fork_id);
            util::prepend_header(&mut request, util::proxy_via(&self.config.home_domain, &branch));

            debug!(trail = %trail, txn, fork_id, target = %target, "forwarding request downstream");
            if let Err(err) =
                self.transactions
                    .forward_request(trail, txn, fork_id, &target, request)
            {
                warn!(trail = %trail, txn, fork_id, error = %err, "downstream send failed, synthesizing 408");
                if record.context.original_request().method == Method::Ack {
                    continue;
                }
                let timeout = util::stateless_response(
                    record.context.original_request(),
                    StatusCode::RequestTimeout,
                );
                self.consolidate(record, fork_id, timeout, trail, true);
            }
        }
    }

    /// Feeds one downstream response (or synthesized 408) through the
    /// service and the best-response logic. `synthetic` responses carry no
    /// Via of ours to strip.
    fn consolidate(
        &self,
        record: &mut ActiveTransaction,
        fork_id: ForkId,
        mut rsp: Response,
        trail: TrailId,
        synthetic: bool,
    ) {
        if !synthetic {
            util::strip_top_via(&mut rsp);
        }

        if record.context.fork_state(fork_id) == Some(ForkState::Cancelled) {
            debug!(trail = %trail, fork_id, "response on a cancelled fork, dropping");
            return;
        }

        let forward = {
            let ActiveTransaction {
                context, handler, ..
            } = &mut *record;
            match handler.as_mut() {
                Some(handler) => handler.on_response(context, &rsp, fork_id),
                None => true,
            }
        };

        let final_response = util::is_final(&rsp.status_code);
        if final_response {
            record.context.complete_fork(fork_id);
        }

        if !forward {
            debug!(trail = %trail, fork_id, status = %rsp.status_code, "service dropped response");
            if record.context.has_undispatched_forks() {
                // Drop plus fresh targets means re-fork the request.
                self.dispatch_forks(record, trail);
            }
            return;
        }

        if !final_response {
            let txn = record.context.txn();
            if let Err(err) = self.transactions.send_upstream_response(trail, txn, rsp) {
                warn!(trail = %trail, txn, error = %err, "failed to forward provisional upstream");
            }
            return;
        }

        let code = rsp.status_code.code();
        if (200..300).contains(&code) || code >= 600 {
            // 2xx and 6xx win outright and close the forking race.
            self.forward_final(record, rsp, trail);
            return;
        }

        record.best_final = Some(better_final(record.best_final.take(), rsp));
        if record.context.outstanding_forks() == 0
            && !record.context.has_undispatched_forks()
            && let Some(best) = record.best_final.take()
        {
            self.forward_final(record, best, trail);
        }
    }

    fn forward_final(&self, record: &mut ActiveTransaction, rsp: Response, trail: TrailId) {
        if record.context.has_final_response() {
            debug!(trail = %trail, status = %rsp.status_code, "transaction already answered, dropping final");
            record.done = true;
            return;
        }
        if record.invite {
            record.context.cancel_outstanding_forks();
        }
        record.context.mark_final_response();
        let txn = record.context.txn();
        debug!(trail = %trail, txn, status = %rsp.status_code, "forwarding final response upstream");
        if let Err(err) = self.transactions.send_upstream_response(trail, txn, rsp) {
            warn!(trail = %trail, txn, error = %err, "failed to forward final upstream");
        }
        record.done = true;
    }

    /// Initial filter criteria reduced to the ServiceName convention: a
    /// request addressed to `<service>.<home_domain>` invokes that service.
    fn resolve_initial_service(&self, req: &Request) -> Option<Arc<dyn AppServer>> {
        let host = req.uri.host_with_port.host.to_string();
        self.services
            .iter()
            .find(|service| {
                host.eq_ignore_ascii_case(&format!(
                    "{}.{}",
                    service.service_name(),
                    self.config.home_domain
                ))
            })
            .cloned()
    }

    /// Looks up the dialog a prior invocation joined. The identifier is
    /// derived from Call-ID plus From-tag, falling back to the To-tag for
    /// requests sent by the other party.
    fn resolve_dialog_service(&self, req: &Request) -> (Option<String>, Option<Arc<dyn AppServer>>) {
        let call_id = req
            .call_id_header()
            .map(|header| header.value().to_string())
            .unwrap_or_default();
        let from_tag = req
            .from_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten())
            .map(|tag| tag.to_string());
        let to_tag = req
            .to_header()
            .ok()
            .and_then(|header| header.tag().ok().flatten())
            .map(|tag| tag.to_string());

        let dialogs = lock(&self.dialogs);
        for tag in [from_tag, to_tag].into_iter().flatten() {
            let dialog_id = util::dialog_id_from(&call_id, &tag);
            if let Some(name) = dialogs.get(&dialog_id) {
                let service = self
                    .services
                    .iter()
                    .find(|service| service.service_name() == name)
                    .cloned();
                return (Some(dialog_id), service);
            }
        }
        (None, None)
    }
}

fn request_call_id(req: &Request) -> String {
    req.call_id_header()
        .map(|header| header.value().to_string())
        .unwrap_or_default()
}

fn request_cseq(req: &Request) -> u32 {
    req.cseq_header()
        .ok()
        .and_then(|header| header.typed().ok())
        .map(|cseq| cseq.seq)
        .unwrap_or_default()
}

fn better_final(current: Option<Response>, candidate: Response) -> Response {
    let Some(current) = current else {
        return candidate;
    };
    // 408 carries the least information; among the rest, lower codes win.
    let rank = |rsp: &Response| {
        let code = rsp.status_code.code();
        (u32::from(code == 408), u32::from(code))
    };
    if rank(&candidate) < rank(&current) {
        candidate
    } else {
        current
    }
}

// Handlers run inside the worker fault guard; a panicked handler must not
// wedge the maps for every other worker.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_record(record: &Mutex<ActiveTransaction>) -> MutexGuard<'_, ActiveTransaction> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}
