//! Generic protocol element tree.
//!
//! Stands in for the parsed XML of a stanza. Inbound requests arrive already
//! parsed; outbound stanzas are rendered back to XML with [`Element::to_xml`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// A child of an [`Element`]: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Text(String),
    Element(Element),
}

/// A protocol element (stanza or nested child).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Builder-style child element.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder-style text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Concatenated character data of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Render as XML. Attributes are emitted in name order.
    ///
    /// Elements and attributes whose names are not valid XML names are left
    /// out, so client-supplied names cannot inject markup.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        if !is_xml_name(&self.name) {
            return;
        }
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in self.attrs.iter().filter(|(n, _)| is_xml_name(n)) {
            let _ = write!(out, " {}='{}'", name, escape(value));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(&escape(t)),
                Node::Element(e) => e.write_xml(out),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

/// Whether `name` is usable as an element or attribute name.
pub fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == ':')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | ':'))
}

/// Escape text for use in XML character data or single-quoted attributes.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_element_self_closes() {
        let el = Element::new("presence");
        assert_eq!(el.to_xml(), "<presence/>");
    }

    #[test]
    fn nested_with_text_and_attrs() {
        let el = Element::new("message")
            .with_attr("to", "juliet@example.com")
            .with_attr("from", "romeo@example.net")
            .with_child(Element::new("body").with_text("wherefore art thou"));
        assert_eq!(
            el.to_xml(),
            "<message from='romeo@example.net' to='juliet@example.com'>\
             <body>wherefore art thou</body></message>"
        );
    }

    #[test]
    fn escapes_attribute_and_text() {
        let el = Element::new("body")
            .with_attr("note", "it's <b>")
            .with_text("a & b");
        assert_eq!(el.to_xml(), "<body note='it&apos;s &lt;b&gt;'>a &amp; b</body>");
    }

    #[test]
    fn invalid_attribute_names_are_dropped() {
        let el = Element::new("message")
            .with_attr("x='1'/><y", "v")
            .with_attr("xml:lang", "en")
            .with_attr("to", "a@b");
        assert_eq!(el.to_xml(), "<message to='a@b' xml:lang='en'/>");
    }

    #[test]
    fn invalid_element_names_are_skipped() {
        let el = Element::new("iq")
            .with_child(Element::new("a><script"))
            .with_child(Element::new("query"));
        assert_eq!(el.to_xml(), "<iq><query/></iq>");
        assert_eq!(Element::new("").to_xml(), "");
    }

    #[test]
    fn xml_names() {
        assert!(is_xml_name("stream:features"));
        assert!(is_xml_name("_x-1.y"));
        assert!(!is_xml_name("1abc"));
        assert!(!is_xml_name("a b"));
        assert!(!is_xml_name("a'"));
        assert!(!is_xml_name(""));
    }

    #[test]
    fn text_ignores_child_elements() {
        let el = Element::new("auth")
            .with_text("dGVz")
            .with_child(Element::new("x"))
            .with_text("dA==");
        assert_eq!(el.text(), "dGVzdA==");
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{"name":"message","attrs":{"to":"a@b"},"children":["hi",{"name":"x"}]}"#;
        let el: Element = serde_json::from_str(json).unwrap();
        assert_eq!(el.attr("to"), Some("a@b"));
        assert_eq!(el.children.len(), 2);
        assert_eq!(el.children[0], Node::Text("hi".into()));
        assert_eq!(el.children[1], Node::Element(Element::new("x")));
    }
}
