use std::sync::Arc;

use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::message::headers_ext::HeadersExt;
use rsip::{Method, Param, Request, StatusCode, Uri};
use tracing::{debug, warn};

use crate::appserver::{AppServer, AppServerTransaction, ServiceContext};
use crate::config::RegistrarConfig;
use crate::error::{Error, Result};
use crate::registration::{AoR, RegistrationStore, epoch_now};
use crate::sip::util;

/// Attempts against a contended AoR before the REGISTER is failed.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// The registrar application service: maintains endpoint reachability state
/// for the home domain. Handles REGISTER by applying the request's Contact
/// bindings to the stored AoR under the store's CAS protocol and answering
/// 200 with the surviving bindings. Declines everything else.
pub struct Registrar {
    store: Arc<RegistrationStore>,
    config: RegistrarConfig,
}

impl Registrar {
    pub fn new(store: Arc<RegistrationStore>, config: RegistrarConfig) -> Self {
        Self { store, config }
    }
}

impl AppServer for Registrar {
    fn service_name(&self) -> &str {
        "registrar"
    }

    fn get_context(
        &self,
        req: &Request,
        _dialog_id: &str,
    ) -> Option<Box<dyn AppServerTransaction>> {
        if req.method != Method::Register {
            return None;
        }
        Some(Box::new(RegistrarTransaction {
            store: self.store.clone(),
            config: self.config.clone(),
        }))
    }
}

struct RegistrarTransaction {
    store: Arc<RegistrationStore>,
    config: RegistrarConfig,
}

impl AppServerTransaction for RegistrarTransaction {
    fn on_initial_request(&mut self, ctx: &mut ServiceContext, req: &Request) {
        let Some(aor_id) = aor_of(req) else {
            warn!(trail = %ctx.trail(), "REGISTER without a usable To header");
            let _ = ctx.reject(StatusCode::BadRequest, None);
            return;
        };

        match self.update_bindings(ctx, req, &aor_id) {
            Ok(aor) => {
                debug!(trail = %ctx.trail(), aor = %aor_id, bindings = aor.binding_count(), "registration updated");
                let rsp = registration_response(req, &aor);
                if let Err(err) = ctx.send_response(rsp) {
                    warn!(trail = %ctx.trail(), error = %err, "failed to answer REGISTER");
                }
            }
            Err(err) => {
                warn!(trail = %ctx.trail(), aor = %aor_id, error = %err, "registration store update failed");
                let _ = ctx.reject(StatusCode::ServerInternalError, None);
            }
        }
    }
}

impl RegistrarTransaction {
    /// Read-modify-write loop against the shared store. Contention means
    /// another node won the race; re-read and reapply, a bounded number of
    /// times.
    fn update_bindings(
        &self,
        ctx: &ServiceContext,
        req: &Request,
        aor_id: &str,
    ) -> Result<AoR> {
        let now = epoch_now();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut aor = self.store.get_aor(aor_id)?;
            self.apply_contacts(req, &mut aor, now);

            if self.store.set_aor(aor_id, &mut aor)? {
                return Ok(aor);
            }
            debug!(trail = %ctx.trail(), aor = %aor_id, attempt, "registration write contended, retrying");
        }

        Err(Error::store(format!(
            "registration for {aor_id} contended {MAX_WRITE_ATTEMPTS} times"
        )))
    }

    fn apply_contacts(&self, req: &Request, aor: &mut AoR, now: u32) {
        let request_expires = req
            .expires_header()
            .and_then(|header| header.seconds().ok())
            .unwrap_or(self.config.default_expires);
        let call_id = req
            .call_id_header()
            .map(|header| header.value().to_string())
            .unwrap_or_default();
        let cseq = req
            .cseq_header()
            .ok()
            .and_then(|header| header.typed().ok())
            .map(|cseq| cseq.seq)
            .unwrap_or_default();
        let path_headers: Vec<String> = req
            .headers
            .iter()
            .filter_map(|header| match header {
                rsip::Header::Other(name, value) if name.eq_ignore_ascii_case("Path") => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect();

        for header in req.headers.iter() {
            let rsip::Header::Contact(contact) = header else {
                continue;
            };
            let Ok(contact) = contact.typed() else {
                warn!("unparseable Contact on REGISTER, skipping");
                continue;
            };

            let binding_id = contact.uri.to_string();
            let requested = contact
                .expires()
                .and_then(|expires| expires.seconds().ok())
                .unwrap_or(request_expires);

            if requested == 0 {
                aor.remove_binding(&binding_id);
                continue;
            }

            let granted = requested.min(self.config.max_expires);
            let binding = aor.get_binding(&binding_id);
            binding.uri = contact.uri.to_string();
            binding.call_id = call_id.clone();
            binding.cseq = cseq;
            binding.expires = now.saturating_add(granted);
            binding.priority = q_priority(&contact.params);
            binding.params = contact
                .params
                .iter()
                .filter_map(|param| match param {
                    Param::Other(name, value) => Some((
                        name.value().to_string(),
                        value
                            .as_ref()
                            .map(|value| value.value().to_string())
                            .unwrap_or_default(),
                    )),
                    _ => None,
                })
                .collect();
            binding.path_headers = path_headers.clone();
        }
    }
}

/// Canonical AoR identifier for the registering identity: the To URI
/// reduced to scheme, user and host.
fn aor_of(req: &Request) -> Option<String> {
    let to = req.to_header().ok()?.typed().ok()?;
    Some(canonical_aor(&to.uri))
}

fn canonical_aor(uri: &Uri) -> String {
    match &uri.auth {
        Some(auth) => format!("sip:{}@{}", auth.user, uri.host_with_port.host),
        None => format!("sip:{}", uri.host_with_port.host),
    }
}

/// Contact q-values map onto the binding priority as thousandths, so
/// `q=0.5` sorts as 500.
fn q_priority(params: &[Param]) -> u32 {
    params
        .iter()
        .find_map(|param| match param {
            Param::Other(name, Some(value)) if name.value().eq_ignore_ascii_case("q") => {
                value.value().parse::<f32>().ok()
            }
            _ => None,
        })
        .map(|q| (q * 1000.0) as u32)
        .unwrap_or(0)
}

/// 200 OK listing the bindings that remain active, each with the time it
/// has left.
fn registration_response(req: &Request, aor: &AoR) -> rsip::Response {
    let mut rsp = util::stateless_response(req, StatusCode::OK);
    let now = epoch_now();
    for (_, binding) in aor.bindings() {
        let remaining = binding.expires.saturating_sub(now);
        rsp.headers
            .push(rsip::Header::Contact(rsip::headers::Contact::from(format!(
                "<{}>;expires={}",
                binding.uri, remaining
            ))));
    }
    rsp
}
