//! Detached document fragments.
//!
//! A fetched page is parsed once with `html5ever` into an `RcDom`, then copied
//! into a flat, owned arena. The arena is `Send + Sync`, so the parsed page can
//! sit in the preload cache and be handed to the host's layout and swap
//! primitives without reparsing.

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};

use super::Selector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// A parsed HTML document detached from any live page.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

impl Fragment {
    /// Parses a full HTML document. Parsing follows the HTML5 error recovery
    /// rules, so malformed markup still yields a (possibly sparse) fragment.
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), Default::default()).one(html);

        let mut fragment = Fragment::default();
        let mut stack: Vec<(Handle, Option<usize>)> = dom
            .document
            .children
            .borrow()
            .iter()
            .rev()
            .map(|child| (child.clone(), None))
            .collect();

        // Depth first with an explicit stack, pages can nest arbitrarily deep.
        while let Some((handle, parent)) = stack.pop() {
            let Some(index) = fragment.push(&handle, parent) else {
                continue;
            };
            stack.extend(
                handle
                    .children
                    .borrow()
                    .iter()
                    .rev()
                    .map(|child| (child.clone(), Some(index))),
            );
        }

        tracing::trace!("parsed fragment with {} nodes", fragment.nodes.len());
        fragment
    }

    fn push(&mut self, handle: &Handle, parent: Option<usize>) -> Option<usize> {
        let kind = match &handle.data {
            NodeData::Element { name, attrs, .. } => NodeKind::Element {
                tag: name.local.to_string(),
                attrs: attrs
                    .borrow()
                    .iter()
                    .map(|attr| (attr.name.local.to_string(), attr.value.to_string()))
                    .collect(),
            },
            NodeData::Text { contents } => {
                let text = contents.borrow().to_string();
                if text.trim().is_empty() {
                    return None;
                }
                NodeKind::Text(text)
            }
            // Doctype, comments and processing instructions carry nothing
            // the engine looks at.
            _ => return None,
        };

        let index = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
        });

        match parent {
            Some(parent) => self.nodes[parent].children.push(index),
            None => self.roots.push(index),
        }

        Some(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// All elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = Element<'_>> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| matches!(node.kind, NodeKind::Element { .. }))
            .map(|(index, _)| Element {
                fragment: self,
                index,
            })
    }

    pub fn select<'a>(&'a self, selector: &'a Selector) -> impl Iterator<Item = Element<'a>> {
        self.elements().filter(move |el| selector.matches(el))
    }

    pub fn count(&self, selector: &Selector) -> usize {
        self.select(selector).count()
    }

    pub fn find_by_id(&self, id: &str) -> Option<Element<'_>> {
        self.elements().find(|el| el.attr("id") == Some(id))
    }

    pub fn title(&self) -> Option<String> {
        self.elements()
            .find(|el| el.tag() == "title")
            .map(|el| el.text())
    }
}

#[derive(Clone, Copy)]
pub struct Element<'a> {
    fragment: &'a Fragment,
    index: usize,
}

impl<'a> Element<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub(super) fn node(&self) -> &'a Node {
        &self.fragment.nodes[self.index]
    }

    fn at(&self, index: usize) -> Element<'a> {
        Element {
            fragment: self.fragment,
            index,
        }
    }

    fn is_element(&self) -> bool {
        matches!(self.node().kind, NodeKind::Element { .. })
    }

    /// Text nodes never have children, so a parent is always an element.
    pub fn parent(&self) -> Option<Element<'a>> {
        self.node().parent.map(|index| self.at(index))
    }

    /// Child elements in document order.
    pub fn children(self) -> impl Iterator<Item = Element<'a>> {
        self.node()
            .children
            .iter()
            .map(move |&index| self.at(index))
            .filter(Element::is_element)
    }

    fn siblings(&self) -> &'a [usize] {
        match self.node().parent {
            Some(parent) => &self.fragment.nodes[parent].children,
            None => &self.fragment.roots,
        }
    }

    pub fn prev_sibling(&self) -> Option<Element<'a>> {
        let siblings = self.siblings();
        let position = siblings.iter().position(|&index| index == self.index)?;
        siblings[..position]
            .iter()
            .rev()
            .map(|&index| self.at(index))
            .find(Element::is_element)
    }

    pub fn next_sibling(&self) -> Option<Element<'a>> {
        let siblings = self.siblings();
        let position = siblings.iter().position(|&index| index == self.index)?;
        siblings[position + 1..]
            .iter()
            .map(|&index| self.at(index))
            .find(Element::is_element)
    }

    fn attrs(&self) -> &'a [(String, String)] {
        match &self.fragment.nodes[self.index].kind {
            NodeKind::Element { attrs, .. } => attrs,
            NodeKind::Text(_) => &[],
        }
    }

    pub fn tag(&self) -> &'a str {
        match &self.fragment.nodes[self.index].kind {
            NodeKind::Element { tag, .. } => tag,
            NodeKind::Text(_) => "",
        }
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.attrs()
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_ascii_whitespace().any(|c| c == class))
    }

    /// Concatenated text of every descendant text node.
    pub fn text(&self) -> String {
        let mut acc = String::new();
        let mut stack = vec![self.index];

        while let Some(index) = stack.pop() {
            let node = &self.fragment.nodes[index];
            if let NodeKind::Text(text) = &node.kind {
                acc.push_str(text);
            }
            stack.extend(node.children.iter().rev());
        }

        acc
    }
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Element(<{}> #{})", self.tag(), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html>
  <head><title>Hello <b>world</b></title></head>
  <body data-page-type="single">
    <article class="post-full" id="post-1"><h1 class="post-title">Hi</h1></article>
    <a href="/b" data-shared-element>next</a>
  </body>
</html>"#;

    #[test]
    fn test_parse_document() {
        let fragment = Fragment::parse(PAGE);
        assert!(!fragment.is_empty());
        assert_eq!(fragment.elements().next().unwrap().tag(), "html");
        assert_eq!(fragment.find_by_id("post-1").unwrap().tag(), "article");
    }

    #[test]
    fn test_parse_malformed() {
        // html5ever recovers, the implied html/head/body are always present
        let fragment = Fragment::parse("<div><span>unterminated");
        assert!(fragment.elements().any(|el| el.tag() == "span"));
        assert!(fragment.elements().any(|el| el.tag() == "body"));
    }

    #[test]
    fn test_selector_matching() {
        let fragment = Fragment::parse(PAGE);
        let count = |selector: &str| fragment.count(&Selector::parse(selector).unwrap());

        assert_eq!(count("article.post-full"), 1);
        assert_eq!(count("body > a[data-shared-element]"), 1);
        assert_eq!(count("head title"), 1);
        assert_eq!(count("article.post-preview"), 0);
    }

    #[test]
    fn test_tree_navigation() {
        let fragment = Fragment::parse(PAGE);
        let article = fragment.find_by_id("post-1").unwrap();

        assert_eq!(article.parent().unwrap().tag(), "body");
        assert_eq!(article.next_sibling().unwrap().tag(), "a");
        assert!(article.prev_sibling().is_none());
        let children: Vec<_> = article.children().map(|el| el.tag()).collect();
        assert_eq!(children, vec!["h1"]);
    }

    #[test]
    fn test_deeply_nested_document() {
        let depth = 50_000;
        let fragment = Fragment::parse(&format!("{}deep", "<span>".repeat(depth)));

        assert_eq!(fragment.count(&Selector::parse("span").unwrap()), depth);
        let innermost = fragment.elements().last().unwrap();
        assert_eq!(innermost.tag(), "span");
        assert_eq!(innermost.text(), "deep");
    }

    #[test]
    fn test_title_text() {
        let fragment = Fragment::parse(PAGE);
        assert_eq!(fragment.title().as_deref(), Some("Hello <b>world</b>"));
    }
}
