//! Stanza construction helpers and protocol wire strings.

use rand::Rng;

use crate::error::StanzaErrorCondition;
use crate::xml::{escape, Element};

/// Namespace URIs used on the stream.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// SASL negotiation namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Legacy pre-XMPP-1.0 authentication namespace
    pub const AUTH: &str = "jabber:iq:auth";
}

/// A random decimal token in `[0, 10^9)`, used for stream ids, SASL nonces
/// and generated resources. Backed by the thread-local CSPRNG.
pub fn get_random_string() -> String {
    rand::rng().random_range(0..1_000_000_000u32).to_string()
}

/// Format the stream header the server sends in response to a stream open.
pub fn stream_header(stream_id: &str, server: &str, version: &str, lang: &str) -> String {
    let mut header = format!(
        "<?xml version='1.0'?>\
         <stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}'",
        ns::JABBER_CLIENT,
        ns::STREAM,
        stream_id,
        escape(server)
    );
    if !version.is_empty() {
        header.push_str(&format!(" version='{}'", escape(version)));
    }
    if !lang.is_empty() {
        header.push_str(&format!(" xml:lang='{}'", escape(lang)));
    }
    header.push('>');
    header
}

/// The stream trailer closing the server-to-client document.
pub const STREAM_TRAILER: &str = "</stream:stream>";

/// Build a `<stream:error>` wrapper for a named condition.
pub fn stream_error(condition: &str) -> Element {
    Element::new("stream:error").child(Element::new(condition).attr_set("xmlns", ns::STREAMS))
}

/// Build a `<stream:error>` wrapper carrying a descriptive text.
pub fn stream_error_with_text(condition: &str, text: &str) -> Element {
    Element::new("stream:error")
        .child(Element::new(condition).attr_set("xmlns", ns::STREAMS))
        .child(
            Element::new("text")
                .attr_set("xmlns", ns::STREAMS)
                .attr_set("xml:lang", "en")
                .text_node(text),
        )
}

/// Build a stanza `<error>` element for a condition.
pub fn stanza_error(condition: StanzaErrorCondition) -> Element {
    Element::new("error")
        .attr_set("code", condition.code().to_string())
        .attr_set("type", condition.error_type().as_str())
        .child(Element::new(condition.as_str()).attr_set("xmlns", ns::STANZAS))
}

/// Build a stanza `<error>` element carrying a descriptive text.
pub fn stanza_error_with_text(condition: StanzaErrorCondition, text: &str) -> Element {
    Element::new("error")
        .attr_set("code", condition.code().to_string())
        .attr_set("type", condition.error_type().as_str())
        .child(Element::new(condition.as_str()).attr_set("xmlns", ns::STANZAS))
        .child(
            Element::new("text")
                .attr_set("xmlns", ns::STANZAS)
                .text_node(text),
        )
}

/// Swap the `from` and `to` attributes of a stanza in place.
///
/// A missing attribute on one side removes the swapped counterpart.
fn swap_from_to(el: &mut Element) {
    let from = el.attr("from").map(str::to_string);
    let to = el.attr("to").map(str::to_string);
    match to {
        Some(v) => el.set_attr("from", v),
        None => el.remove_attr("from"),
    }
    match from {
        Some(v) => el.set_attr("to", v),
        None => el.remove_attr("to"),
    }
}

/// Build a positive IQ reply: addresses swapped, `type='result'`, id and
/// children preserved.
pub fn make_result_iq_reply(el: &Element) -> Element {
    let mut reply = el.clone();
    swap_from_to(&mut reply);
    reply.set_attr("type", "result");
    reply
}

/// Build an error reply: addresses swapped, `type='error'`, original
/// children preserved with the error element appended.
pub fn make_error_reply(el: &Element, error: Element) -> Element {
    let mut reply = el.clone();
    swap_from_to(&mut reply);
    reply.set_attr("type", "error");
    reply.append_child(error);
    reply
}

/// Overwrite the `from` and `to` attributes of a stanza.
pub fn replace_from_to(from: &str, to: &str, el: &Element) -> Element {
    let mut out = el.clone();
    out.set_attr("from", from);
    out.set_attr("to", to);
    out
}

/// The kind of a valid IQ request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqRequest {
    /// `type='get'`
    Get,
    /// `type='set'`
    Set,
}

/// The kind of a valid IQ reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqReply {
    /// `type='result'`
    Result,
    /// `type='error'`
    Error,
}

/// Classification of a stanza as an IQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqQuery {
    /// A get or set carrying exactly one payload child with a namespace
    Request {
        /// get or set
        kind: IqRequest,
        /// The `xmlns` of the payload child
        xmlns: String,
        /// The payload child itself
        payload: Element,
    },
    /// A result or error reply
    Reply(IqReply),
    /// An `<iq>` that is neither a well-formed request nor a reply
    Invalid,
    /// Not an `<iq>` at all
    NotIq,
}

/// Classify an element as an IQ request, reply, invalid IQ, or non-IQ.
pub fn iq_query_info(el: &Element) -> IqQuery {
    if el.name() != "iq" {
        return IqQuery::NotIq;
    }
    match el.attr("type") {
        Some("get") | Some("set") => {
            let kind = if el.attr("type") == Some("get") {
                IqRequest::Get
            } else {
                IqRequest::Set
            };
            let mut children = el.children();
            let payload = match (children.next(), children.next()) {
                (Some(payload), None) => payload,
                _ => return IqQuery::Invalid,
            };
            match payload.attr("xmlns") {
                Some(xmlns) if !xmlns.is_empty() => IqQuery::Request {
                    kind,
                    xmlns: xmlns.to_string(),
                    payload: payload.clone(),
                },
                _ => IqQuery::Invalid,
            }
        }
        Some("result") => IqQuery::Reply(IqReply::Result),
        Some("error") => IqQuery::Reply(IqReply::Error),
        _ => IqQuery::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;

    fn sample_iq() -> Element {
        Element::new("iq")
            .attr_set("from", "alice@x/r")
            .attr_set("to", "x")
            .attr_set("id", "q1")
            .attr_set("type", "get")
            .child(Element::new("query").attr_set("xmlns", "jabber:iq:version"))
    }

    #[test]
    fn result_reply_swaps_addresses_and_preserves_id() {
        let reply = make_result_iq_reply(&sample_iq());
        assert_eq!(reply.attr("from"), Some("x"));
        assert_eq!(reply.attr("to"), Some("alice@x/r"));
        assert_eq!(reply.attr("id"), Some("q1"));
        assert_eq!(reply.attr("type"), Some("result"));
        assert!(reply.get_child("query").is_some());
    }

    #[test]
    fn result_reply_with_missing_from() {
        let mut iq = sample_iq();
        iq.remove_attr("from");
        let reply = make_result_iq_reply(&iq);
        assert_eq!(reply.attr("from"), Some("x"));
        assert_eq!(reply.attr("to"), None);
    }

    #[test]
    fn error_reply_appends_error_element() {
        let reply = make_error_reply(
            &sample_iq(),
            stanza_error(StanzaErrorCondition::ServiceUnavailable),
        );
        assert_eq!(reply.attr("type"), Some("error"));
        let error = reply.get_child("error").unwrap();
        assert_eq!(error.attr("code"), Some("503"));
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.get_child("service-unavailable").is_some());
    }

    #[test]
    fn iq_classification() {
        assert!(matches!(
            iq_query_info(&sample_iq()),
            IqQuery::Request { kind: IqRequest::Get, ref xmlns, .. } if xmlns == "jabber:iq:version"
        ));

        let reply = make_result_iq_reply(&sample_iq());
        assert_eq!(iq_query_info(&reply), IqQuery::Reply(IqReply::Result));

        assert_eq!(iq_query_info(&Element::new("message")), IqQuery::NotIq);

        // Payload without a namespace is invalid.
        let bad = Element::new("iq")
            .attr_set("type", "set")
            .child(Element::new("query"));
        assert_eq!(iq_query_info(&bad), IqQuery::Invalid);

        // Two payload children are invalid.
        let two = Element::new("iq")
            .attr_set("type", "get")
            .child(Element::new("a").attr_set("xmlns", "x"))
            .child(Element::new("b").attr_set("xmlns", "y"));
        assert_eq!(iq_query_info(&two), IqQuery::Invalid);

        // Missing type is invalid.
        let untyped = Element::new("iq");
        assert_eq!(iq_query_info(&untyped), IqQuery::Invalid);
    }

    #[test]
    fn stream_header_format() {
        let header = stream_header("12345", "example.net", "1.0", "en");
        assert_eq!(
            header,
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             id='12345' from='example.net' version='1.0' xml:lang='en'>"
        );

        let bare = stream_header("1", "example.net", "", "");
        assert!(!bare.contains("version"));
        assert!(!bare.contains("xml:lang"));
    }

    #[test]
    fn random_string_is_decimal_below_one_billion() {
        for _ in 0..32 {
            let s = get_random_string();
            let n: u64 = s.parse().unwrap();
            assert!(n < 1_000_000_000);
        }
    }

    #[test]
    fn stream_error_wire_form() {
        let err = stream_error("invalid-namespace");
        assert_eq!(
            err.to_xml(),
            "<stream:error>\
             <invalid-namespace xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
             </stream:error>"
        );
    }
}
