//! XML element tree used for stanzas.
//!
//! The model is deliberately plain: an element is a name, an ordered list of
//! `(name, value)` attribute pairs, and a sequence of child nodes which are
//! either elements or character data. Attribute lookup returns the first
//! match. Namespaces are ordinary attributes (`xmlns`, `xmlns:stream`), which
//! is what the stream framing of the protocol needs.

use std::fmt;

/// A child of an element: a nested element or raw character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A nested element
    Element(Element),
    /// Character data
    Text(String),
}

/// A tagged XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create an element with an initial attribute list.
    pub fn with_attrs(name: impl Into<String>, attrs: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            attrs,
            children: Vec::new(),
        }
    }

    /// Builder-style: add an attribute.
    pub fn attr_set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style: append a child element.
    pub fn child(mut self, el: Element) -> Self {
        self.children.push(Node::Element(el));
        self
    }

    /// Builder-style: append character data.
    pub fn text_node(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute value by name; first match wins.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The ordered attribute list.
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    /// Set an attribute, replacing the first existing entry of that name.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    /// Remove every attribute with the given name.
    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(n, _)| n != name);
    }

    /// All child nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order, skipping character data.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn get_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name() == name)
    }

    /// Mutable child elements in document order.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Append a child element.
    pub fn append_child(&mut self, el: Element) {
        self.children.push(Node::Element(el));
    }

    /// Append character data.
    pub fn append_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    /// Remove all children.
    pub fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Concatenated direct character data.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Serialise to the wire form. Attribute values are single-quoted.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("='");
            out.push_str(&escape(value));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_xml(out),
                Node::Text(t) => out.push_str(&escape(t)),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Escape markup-significant characters for element content and attributes.
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
    fn attr_first_match_wins() {
        let el = Element::with_attrs(
            "message",
            vec![
                ("to".to_string(), "a@x".to_string()),
                ("to".to_string(), "b@x".to_string()),
            ],
        );
        assert_eq!(el.attr("to"), Some("a@x"));
    }

    #[test]
    fn set_attr_replaces_and_remove_attr_clears() {
        let mut el = Element::new("iq");
        el.set_attr("type", "get");
        el.set_attr("type", "set");
        assert_eq!(el.attr("type"), Some("set"));
        el.remove_attr("type");
        assert_eq!(el.attr("type"), None);
    }

    #[test]
    fn serialises_with_single_quotes_and_escapes() {
        let el = Element::new("message")
            .attr_set("to", "a&b@x")
            .child(Element::new("body").text_node("1 < 2 'quoted'"));
        assert_eq!(
            el.to_xml(),
            "<message to='a&amp;b@x'><body>1 &lt; 2 &apos;quoted&apos;</body></message>"
        );
    }

    #[test]
    fn self_closing_when_empty() {
        assert_eq!(Element::new("presence").to_xml(), "<presence/>");
    }

    #[test]
    fn text_concatenates_direct_cdata_only() {
        let el = Element::new("body")
            .text_node("hel")
            .child(Element::new("x").text_node("nested"))
            .text_node("lo");
        assert_eq!(el.text(), "hello");
    }
}
