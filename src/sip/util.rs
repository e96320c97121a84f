use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::message::headers_ext::HeadersExt;
use rsip::{Request, Response, SipMessage, StatusCode};

use crate::appserver::ForkId;

use super::TsxId;

pub(crate) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

/// Deterministic dialog identifier for a request: a digest of Call-ID and
/// From-tag, the pair that stays stable across every transaction the
/// originator sends on the dialog.
pub(crate) fn derive_dialog_id(req: &Request) -> String {
    let call_id = req
        .call_id_header()
        .map(|header| header.value().to_string())
        .unwrap_or_default();
    let from_tag = req
        .from_header()
        .ok()
        .and_then(|header| header.tag().ok().flatten())
        .map(|tag| tag.to_string())
        .unwrap_or_default();
    dialog_id_from(&call_id, &from_tag)
}

pub(crate) fn dialog_id_from(call_id: &str, tag: &str) -> String {
    md5_hex(format!("{call_id}:{tag}").as_bytes())
}

/// Builds a stateless response to a request per RFC 3261 section 8.2.6:
/// the Via chain, From, To, Call-ID and CSeq are mirrored from the request.
/// Tolerates missing headers; whatever is present is copied.
pub(crate) fn stateless_response(req: &Request, status_code: StatusCode) -> Response {
    let mut headers = rsip::Headers::default();
    for header in req.headers.iter() {
        match header {
            rsip::Header::Via(value) => headers.push(rsip::Header::Via(value.clone())),
            rsip::Header::From(value) => headers.push(rsip::Header::From(value.clone())),
            rsip::Header::To(value) => headers.push(rsip::Header::To(value.clone())),
            rsip::Header::CallId(value) => headers.push(rsip::Header::CallId(value.clone())),
            rsip::Header::CSeq(value) => headers.push(rsip::Header::CSeq(value.clone())),
            _ => {}
        }
    }
    headers.push(rsip::Header::ContentLength(
        rsip::headers::ContentLength::from(0u32),
    ));

    Response {
        status_code,
        version: req.version.clone(),
        headers,
        body: Vec::new(),
    }
}

/// The response emitted for a request in flight when a worker traps a
/// fault: 500 with Retry-After so the peer backs off before retrying.
pub(crate) fn fault_response(req: &Request) -> Response {
    let mut rsp = stateless_response(req, StatusCode::ServerInternalError);
    rsp.headers.push(rsip::Header::RetryAfter(
        rsip::headers::RetryAfter::new("600".to_string()),
    ));
    rsp
}

pub(crate) fn describe_call_id(msg: &SipMessage) -> String {
    let header = match msg {
        SipMessage::Request(req) => req.call_id_header(),
        SipMessage::Response(rsp) => rsp.call_id_header(),
    };
    header
        .map(|value| value.value().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

pub(crate) fn describe_cseq(msg: &SipMessage) -> String {
    let header = match msg {
        SipMessage::Request(req) => req.cseq_header(),
        SipMessage::Response(rsp) => rsp.cseq_header(),
    };
    header
        .ok()
        .and_then(|value| value.typed().ok())
        .map(|cseq| format!("{} {}", cseq.seq, cseq.method))
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Branch parameter for a downstream fork. The transaction serial and fork
/// id are recoverable from the branch of the topmost Via when the response
/// comes back.
pub(crate) fn fork_branch(txn: TsxId, fork_id: ForkId) -> String {
    format!("z9hG4bK-{txn:x}-{fork_id:x}")
}

pub(crate) fn parse_fork_branch(branch: &str) -> Option<(TsxId, ForkId)> {
    let rest = branch.strip_prefix("z9hG4bK-")?;
    let (txn, fork) = rest.split_once('-')?;
    Some((
        TsxId::from_str_radix(txn, 16).ok()?,
        ForkId::from_str_radix(fork, 16).ok()?,
    ))
}

/// Via header this node stamps on a forwarded fork.
pub(crate) fn proxy_via(local_host: &str, branch: &str) -> rsip::Header {
    rsip::Header::Via(rsip::headers::Via::new(format!(
        "SIP/2.0/UDP {local_host};branch={branch}"
    )))
}

/// Inserts a header ahead of everything already present. Used for the Via
/// this node adds, which must be topmost.
pub(crate) fn prepend_header(req: &mut Request, header: rsip::Header) {
    let mut headers = rsip::Headers::default();
    headers.push(header);
    for existing in req.headers.iter() {
        headers.push(existing.clone());
    }
    req.headers = headers;
}

/// Transaction serial and fork id recovered from the topmost Via of a
/// downstream response, if that Via carries a branch this node generated.
pub(crate) fn response_fork(rsp: &Response) -> Option<(TsxId, ForkId)> {
    let via = rsp.headers.iter().find_map(|header| match header {
        rsip::Header::Via(value) => Some(value),
        _ => None,
    })?;
    let branch = branch_param(via.value())?;
    parse_fork_branch(branch)
}

/// Removes the topmost Via, undoing this node's own stamp before a response
/// continues upstream.
pub(crate) fn strip_top_via(rsp: &mut Response) {
    let mut removed = false;
    rsp.headers.retain(|header| {
        if !removed && matches!(header, rsip::Header::Via(_)) {
            removed = true;
            return false;
        }
        true
    });
}

fn branch_param(via_value: &str) -> Option<&str> {
    for param in via_value.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("branch=") {
            return Some(value.trim());
        }
    }
    None
}

pub(crate) fn is_final(status_code: &StatusCode) -> bool {
    status_code.code() >= 200
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::testutil::{invite_request, register_request};

    #[test]
    fn dialog_id_is_deterministic() {
        let req = invite_request("sip:bob@example.com");
        assert_eq!(derive_dialog_id(&req), derive_dialog_id(&req));
        assert_ne!(derive_dialog_id(&req), dialog_id_from("other", "tags"));
    }

    #[test]
    fn stateless_response_mirrors_correlation_headers() {
        let req = register_request("sip:alice@example.com", "sip:alice@1.2.3.4", 3600);
        let rsp = stateless_response(&req, StatusCode::OK);

        assert_eq!(rsp.status_code, StatusCode::OK);
        assert_eq!(
            rsp.call_id_header().unwrap().value(),
            req.call_id_header().unwrap().value()
        );
        assert_eq!(
            rsp.cseq_header().unwrap().typed().unwrap().seq,
            req.cseq_header().unwrap().typed().unwrap().seq
        );
        assert!(rsp.via_header().is_ok());
    }

    #[test]
    fn fault_response_carries_retry_after() {
        let req = invite_request("sip:bob@example.com");
        let rsp = fault_response(&req);
        assert_eq!(rsp.status_code, StatusCode::ServerInternalError);
        assert!(rsp.headers.iter().any(|header| matches!(
            header,
            rsip::Header::RetryAfter(value) if value.value().trim() == "600"
        )));
    }

    #[test]
    fn fork_branch_round_trips() {
        let branch = fork_branch(0xdead_beef, 7);
        assert_eq!(parse_fork_branch(&branch), Some((0xdead_beef, 7)));
        assert_eq!(parse_fork_branch("z9hG4bKforeign"), None);
    }

    #[test]
    fn response_fork_reads_and_strip_removes_top_via() {
        let mut req = invite_request("sip:bob@example.com");
        let original_via = req.via_header().unwrap().value().to_string();
        prepend_header(&mut req, proxy_via("node.example.com", &fork_branch(3, 1)));

        let mut rsp = stateless_response(&req, StatusCode::Ringing);
        assert_eq!(response_fork(&rsp), Some((3, 1)));

        strip_top_via(&mut rsp);
        assert_eq!(response_fork(&rsp), None);
        assert_eq!(rsp.via_header().unwrap().value(), original_via);
    }
}
