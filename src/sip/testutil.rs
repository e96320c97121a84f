//! Message fixtures shared by the unit tests.

use rsip::{Request, Response, SipMessage, StatusCode};

use super::util;

pub(crate) fn parse_request(raw: &str) -> Request {
    match SipMessage::try_from(raw).expect("fixture must parse") {
        SipMessage::Request(req) => req,
        SipMessage::Response(_) => panic!("fixture is not a request"),
    }
}

pub(crate) fn register_request(aor: &str, contact: &str, expires: u32) -> Request {
    parse_request(&format!(
        "REGISTER sip:registrar.example.com SIP/2.0\r\n\
         Via: SIP/2.0/TCP 1.2.3.4:5060;branch=z9hG4bKnashds7\r\n\
         Max-Forwards: 70\r\n\
         From: <{aor}>;tag=4711\r\n\
         To: <{aor}>\r\n\
         Call-ID: reg-call-1@1.2.3.4\r\n\
         CSeq: 17 REGISTER\r\n\
         Contact: <{contact}>\r\n\
         Expires: {expires}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    ))
}

pub(crate) fn invite_request(target: &str) -> Request {
    parse_request(&format!(
        "INVITE {target} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK74bf9\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: 3848276298220188511@1.2.3.4\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@1.2.3.4>\r\n\
         Content-Length: 0\r\n\
         \r\n"
    ))
}

pub(crate) fn cancel_for(invite: &Request) -> Request {
    use rsip::headers::UntypedHeader;
    use rsip::message::headers_ext::HeadersExt;

    let call_id = invite.call_id_header().expect("call id").value();
    parse_request(&format!(
        "CANCEL {} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK74bf9\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 CANCEL\r\n\
         Content-Length: 0\r\n\
         \r\n",
        invite.uri
    ))
}

pub(crate) fn options_request() -> Request {
    parse_request(
        "OPTIONS sip:node.example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKhjhs8\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=1928301774\r\n\
         To: <sip:node.example.com>\r\n\
         Call-ID: options-1@1.2.3.4\r\n\
         CSeq: 63104 OPTIONS\r\n\
         Content-Length: 0\r\n\
         \r\n",
    )
}

pub(crate) fn ack_request(target: &str) -> Request {
    parse_request(&format!(
        "ACK {target} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK74bf9\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=9fxced76sl\r\n\
         To: <sip:bob@example.com>;tag=8321234356\r\n\
         Call-ID: 3848276298220188511@1.2.3.4\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\
         \r\n"
    ))
}

pub(crate) fn in_dialog_bye(call_id: &str, from_tag: &str) -> Request {
    parse_request(&format!(
        "BYE sip:bob@5.6.7.8 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKbye1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag={from_tag}\r\n\
         To: <sip:bob@example.com>;tag=8321234356\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\
         \r\n"
    ))
}

/// Response a downstream element would send to a forwarded request: the
/// forwarded request's Via chain (including this node's stamp) is mirrored,
/// so the pipeline can correlate it back to its fork.
pub(crate) fn response_to(forwarded: &Request, status_code: StatusCode) -> Response {
    util::stateless_response(forwarded, status_code)
}
