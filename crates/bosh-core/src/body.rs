//! The `<body/>` envelope: inbound request root and outbound responses.

use crate::element::{escape, Element};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Namespace of the HTTP binding envelope.
pub const HTTPBIND_NAMESPACE: &str = "http://jabber.org/protocol/httpbind";

/// Inbound `<body/>` root: its attributes and the stanzas it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRequest {
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl BodyRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Session id, absent on the session creation request.
    pub fn sid(&self) -> Option<&str> {
        self.attr("sid").filter(|s| !s.is_empty())
    }

    /// Request id. A missing or non-numeric value yields `None`.
    pub fn rid(&self) -> Option<u64> {
        self.attr("rid").and_then(|r| r.trim().parse().ok())
    }

    /// A request that carries no stanzas.
    pub fn is_poll(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Values advertised in the session creation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCreationResponse {
    pub stream_id: String,
    pub secure: bool,
    pub requests: u32,
    pub inactivity: u64,
    pub polling: u64,
    pub wait: u64,
    /// Pre-rendered feature advertisement from the protocol router.
    pub features: String,
}

impl SessionCreationResponse {
    pub fn to_xml(&self) -> String {
        let sid = escape(&self.stream_id);
        format!(
            "<body xmlns='{ns}' authID='{sid}' sid='{sid}' secure='{secure}' requests='{requests}' \
             inactivity='{inactivity}' polling='{polling}' wait='{wait}'>\
             <stream:features>{features}</stream:features></body>",
            ns = HTTPBIND_NAMESPACE,
            secure = self.secure,
            requests = self.requests,
            inactivity = self.inactivity,
            polling = self.polling,
            wait = self.wait,
            features = self.features,
        )
    }
}

/// Body wrapping outgoing stanzas. No stanzas renders the empty body.
pub fn payload_body(elements: &[Element]) -> String {
    if elements.is_empty() {
        return format!("<body xmlns='{HTTPBIND_NAMESPACE}'/>");
    }
    let inner: String = elements.iter().map(Element::to_xml).collect();
    format!("<body xmlns='{HTTPBIND_NAMESPACE}'>{inner}</body>")
}

/// Body telling the client its session is over. A client-requested
/// termination carries no condition.
pub fn terminate_body(condition: Option<&str>) -> String {
    match condition {
        Some(c) => format!(
            "<body xmlns='{HTTPBIND_NAMESPACE}' type='terminate' condition='{}'/>",
            escape(c)
        ),
        None => format!("<body xmlns='{HTTPBIND_NAMESPACE}' type='terminate'/>"),
    }
}

/// Body reporting a recoverable error on one request; the session stays open.
pub fn error_body(condition: &str) -> String {
    format!(
        "<body xmlns='{HTTPBIND_NAMESPACE}' type='error' condition='{}'/>",
        escape(condition)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_response_layout() {
        let resp = SessionCreationResponse {
            stream_id: "abc123".into(),
            secure: true,
            requests: 2,
            inactivity: 1800,
            polling: 5,
            wait: 60,
            features: "<bind/>".into(),
        };
        assert_eq!(
            resp.to_xml(),
            "<body xmlns='http://jabber.org/protocol/httpbind' authID='abc123' sid='abc123' \
             secure='true' requests='2' inactivity='1800' polling='5' wait='60'>\
             <stream:features><bind/></stream:features></body>"
        );
    }

    #[test]
    fn insecure_creation_response() {
        let resp = SessionCreationResponse {
            stream_id: "s".into(),
            secure: false,
            requests: 1,
            inactivity: 30,
            polling: 2,
            wait: 10,
            features: String::new(),
        };
        let xml = resp.to_xml();
        assert!(xml.contains("secure='false'"));
        assert!(xml.contains("<stream:features></stream:features>"));
    }

    #[test]
    fn empty_payload_is_empty_body() {
        assert_eq!(
            payload_body(&[]),
            "<body xmlns='http://jabber.org/protocol/httpbind'/>"
        );
    }

    #[test]
    fn payload_wraps_stanzas() {
        let body = payload_body(&[Element::new("presence"), Element::new("iq")]);
        assert_eq!(
            body,
            "<body xmlns='http://jabber.org/protocol/httpbind'><presence/><iq/></body>"
        );
    }

    #[test]
    fn terminate_carries_condition() {
        assert_eq!(
            terminate_body(Some("policy-violation")),
            "<body xmlns='http://jabber.org/protocol/httpbind' type='terminate' \
             condition='policy-violation'/>"
        );
        assert_eq!(
            terminate_body(None),
            "<body xmlns='http://jabber.org/protocol/httpbind' type='terminate'/>"
        );
    }

    #[test]
    fn error_keeps_condition() {
        assert_eq!(
            error_body("bad-request"),
            "<body xmlns='http://jabber.org/protocol/httpbind' type='error' condition='bad-request'/>"
        );
    }

    #[test]
    fn rid_parsing_is_tolerant() {
        assert_eq!(BodyRequest::new().with_attr("rid", "42").rid(), Some(42));
        assert_eq!(BodyRequest::new().with_attr("rid", "x").rid(), None);
        assert_eq!(BodyRequest::new().rid(), None);
    }

    #[test]
    fn empty_sid_is_creation() {
        assert_eq!(BodyRequest::new().with_attr("sid", "").sid(), None);
        assert_eq!(BodyRequest::new().with_attr("sid", "s1").sid(), Some("s1"));
    }

    #[test]
    fn poll_has_no_elements() {
        assert!(BodyRequest::new().is_poll());
        assert!(!BodyRequest::new().with_element(Element::new("iq")).is_poll());
    }

    #[test]
    fn request_from_json() {
        let json = r#"{"attrs":{"rid":"10","sid":"s"},"elements":[{"name":"presence"}]}"#;
        let req: BodyRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.rid(), Some(10));
        assert_eq!(req.elements.len(), 1);
    }
}
