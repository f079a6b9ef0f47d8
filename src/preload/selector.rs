//! CSS selectors over detached fragments.
//!
//! Parsing and matching are done by the `selectors` crate, this module only
//! teaches it what an element of a [`Fragment`](super::Fragment) looks like.

use std::borrow::Borrow;
use std::hash::{DefaultHasher, Hash, Hasher};

use cssparser::{Parser as CssParser, ParserInput, ToCss};
use precomputed_hash::PrecomputedHash;
use selectors::attr::{AttrSelectorOperation, CaseSensitivity, NamespaceConstraint};
use selectors::matching::{
    self, ElementSelectorFlags, IgnoreNthChildForInvalidation, MatchingContext, MatchingMode,
    NeedsSelectorFlags, QuirksMode,
};
use selectors::parser::{ParseRelative, SelectorList, SelectorParseErrorKind};
use selectors::{NthIndexCache, OpaqueElement};

use super::fragment::Element;
use crate::error::ConfigError;

/// A parsed selector list, e.g. `main article.post-full, .page > h1`.
#[derive(Clone)]
pub struct Selector {
    source: String,
    selectors: Vec<selectors::parser::Selector<Simple>>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut input = ParserInput::new(source);
        let mut parser = CssParser::new(&mut input);

        let list = parser
            .parse_entirely(|parser| {
                SelectorList::<Simple>::parse(&SimpleParser, parser, ParseRelative::No)
            })
            .map_err(|err| {
                ConfigError::Selector(
                    source.to_string(),
                    format!("{:?} at column {}", err.kind, err.location.column),
                )
            })?;

        Ok(Self {
            source: source.to_string(),
            selectors: list.0.iter().cloned().collect(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, element: &Element<'_>) -> bool {
        let mut nth_index_cache = NthIndexCache::default();
        let mut context = MatchingContext::new(
            MatchingMode::Normal,
            None,
            &mut nth_index_cache,
            QuirksMode::NoQuirks,
            NeedsSelectorFlags::No,
            IgnoreNthChildForInvalidation::No,
        );

        self.selectors
            .iter()
            .any(|selector| matching::matches_selector(selector, 0, None, element, &mut context))
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Selector {}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Selector({:?})", self.source)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// ******************************
// *       Selector types       *
// ******************************

/// Identifiers, names and attribute values as the parser hands them over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CssString(String);

impl From<&str> for CssString {
    fn from(value: &str) -> Self {
        CssString(value.to_string())
    }
}

impl AsRef<str> for CssString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CssString {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl ToCss for CssString {
    fn to_css<W: std::fmt::Write>(&self, dest: &mut W) -> std::fmt::Result {
        cssparser::serialize_string(&self.0, dest)
    }
}

impl PrecomputedHash for CssString {
    fn precomputed_hash(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Simple;

impl selectors::SelectorImpl for Simple {
    type ExtraMatchingData<'a> = ();
    type AttrValue = CssString;
    type Identifier = CssString;
    type LocalName = CssString;
    type NamespacePrefix = CssString;
    type NamespaceUrl = CssString;
    type BorrowedNamespaceUrl = str;
    type BorrowedLocalName = str;
    type NonTSPseudoClass = NonTSPseudoClass;
    type PseudoElement = PseudoElement;
}

/// No state pseudo-classes, a detached fragment is never hovered or focused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonTSPseudoClass {}

impl selectors::parser::NonTSPseudoClass for NonTSPseudoClass {
    type Impl = Simple;

    fn is_active_or_hover(&self) -> bool {
        match *self {}
    }

    fn is_user_action_state(&self) -> bool {
        match *self {}
    }
}

impl ToCss for NonTSPseudoClass {
    fn to_css<W: std::fmt::Write>(&self, _: &mut W) -> std::fmt::Result {
        match *self {}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PseudoElement {}

impl selectors::parser::PseudoElement for PseudoElement {
    type Impl = Simple;
}

impl ToCss for PseudoElement {
    fn to_css<W: std::fmt::Write>(&self, _: &mut W) -> std::fmt::Result {
        match *self {}
    }
}

struct SimpleParser;

impl<'i> selectors::parser::Parser<'i> for SimpleParser {
    type Impl = Simple;
    type Error = SelectorParseErrorKind<'i>;
}

// ******************************
// *          Matching          *
// ******************************

impl selectors::Element for Element<'_> {
    type Impl = Simple;

    fn opaque(&self) -> OpaqueElement {
        OpaqueElement::new(self.node())
    }

    fn parent_element(&self) -> Option<Self> {
        self.parent()
    }

    fn parent_node_is_shadow_root(&self) -> bool {
        false
    }

    fn containing_shadow_host(&self) -> Option<Self> {
        None
    }

    fn is_pseudo_element(&self) -> bool {
        false
    }

    fn prev_sibling_element(&self) -> Option<Self> {
        self.prev_sibling()
    }

    fn next_sibling_element(&self) -> Option<Self> {
        self.next_sibling()
    }

    fn first_element_child(&self) -> Option<Self> {
        self.children().next()
    }

    fn is_html_element_in_html_document(&self) -> bool {
        true
    }

    fn has_local_name(&self, local_name: &str) -> bool {
        self.tag() == local_name
    }

    fn has_namespace(&self, _: &str) -> bool {
        true
    }

    fn is_same_type(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }

    fn attr_matches(
        &self,
        _: &NamespaceConstraint<&CssString>,
        local_name: &CssString,
        operation: &AttrSelectorOperation<&CssString>,
    ) -> bool {
        self.attr(&local_name.0)
            .is_some_and(|value| operation.eval_str(value))
    }

    fn match_non_ts_pseudo_class(
        &self,
        pc: &NonTSPseudoClass,
        _: &mut MatchingContext<Self::Impl>,
    ) -> bool {
        match *pc {}
    }

    fn match_pseudo_element(&self, pe: &PseudoElement, _: &mut MatchingContext<Self::Impl>) -> bool {
        match *pe {}
    }

    fn apply_selector_flags(&self, _: ElementSelectorFlags) {}

    fn is_link(&self) -> bool {
        matches!(self.tag(), "a" | "area") && self.attr("href").is_some()
    }

    fn is_html_slot_element(&self) -> bool {
        self.tag() == "slot"
    }

    fn has_id(&self, id: &CssString, case_sensitivity: CaseSensitivity) -> bool {
        self.attr("id")
            .is_some_and(|value| case_sensitivity.eq(value.as_bytes(), id.0.as_bytes()))
    }

    fn has_class(&self, name: &CssString, case_sensitivity: CaseSensitivity) -> bool {
        self.attr("class").is_some_and(|classes| {
            classes
                .split_ascii_whitespace()
                .any(|class| case_sensitivity.eq(class.as_bytes(), name.0.as_bytes()))
        })
    }

    fn imported_part(&self, _: &CssString) -> Option<CssString> {
        None
    }

    fn is_part(&self, _: &CssString) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        self.node().children.is_empty()
    }

    fn is_root(&self) -> bool {
        self.parent().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload::Fragment;

    const PAGE: &str = r#"<!doctype html>
<html>
  <body data-page-type="single">
    <main>
      <article class="post-full" id="post-1"><h1 class="post-title">Hi</h1><p>one</p><p>two</p></article>
    </main>
    <aside><h2 class="post-title">Related</h2></aside>
    <a href="/b" data-shared-element>next</a>
  </body>
</html>"#;

    fn count(selector: &str) -> usize {
        Fragment::parse(PAGE).count(&Selector::parse(selector).unwrap())
    }

    #[test]
    fn test_compound_selectors() {
        assert_eq!(count("article.post-full"), 1);
        assert_eq!(count(".post-title"), 2);
        assert_eq!(count("a[data-shared-element]"), 1);
        assert_eq!(count("[data-page-type=single]"), 1);
        assert_eq!(count("#post-1.post-full"), 1);
        assert_eq!(count("article.post-preview"), 0);
    }

    #[test]
    fn test_combinators_and_lists() {
        assert_eq!(count("main article"), 1);
        assert_eq!(count("main .post-title"), 1);
        assert_eq!(count("article > p"), 2);
        assert_eq!(count("h1 + p"), 1);
        assert_eq!(count("h1, h2"), 2);
        assert_eq!(count("p:first-of-type"), 1);
        assert_eq!(count("article :not(p)"), 1);
    }

    #[test]
    fn test_invalid_selector() {
        for source in ["", "article[", "main >", "::banana"] {
            assert!(
                matches!(Selector::parse(source), Err(ConfigError::Selector(..))),
                "{source:?} should not parse"
            );
        }
    }

    #[test]
    fn test_equality_by_source() {
        let a = Selector::parse(".post-cover").unwrap();
        assert_eq!(a, Selector::parse(".post-cover").unwrap());
        assert_ne!(a, Selector::parse(".post-title").unwrap());
        assert_eq!(a.to_string(), ".post-cover");
    }
}
