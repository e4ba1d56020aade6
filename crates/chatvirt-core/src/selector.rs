#![forbid(unsafe_code)]

//! A small CSS selector engine for the headless document.
//!
//! Supports exactly what turn discovery and the controller need to evaluate
//! against a hosted chat page:
//!
//! - type selectors (`div`) and the universal selector (`*`)
//! - attribute selectors: `[a]`, `[a=v]`, `[a^=v]`, `[a$=v]`, `[a*=v]`
//! - `:nth-child(n)` with a literal index, `:has(<selector list>)`
//! - descendant (whitespace) and child (`>`) combinators
//! - comma-separated selector lists
//!
//! Anything else is a [`SelectorError`]. Browser hosts evaluate selectors
//! natively and never go through this module.

use std::fmt;

/// Read-only element tree the matcher walks.
pub trait ElementTree {
    type Node: Copy + PartialEq;

    fn parent_element(&self, node: Self::Node) -> Option<Self::Node>;
    /// Lowercase tag name.
    fn tag(&self, node: Self::Node) -> &str;
    fn attr(&self, node: Self::Node, name: &str) -> Option<&str>;
    /// 1-based position among the parent's element children.
    fn element_index(&self, node: Self::Node) -> usize;
    /// Element descendants of `node` in document order (excluding `node`).
    fn element_descendants(&self, node: Self::Node) -> Vec<Self::Node>;
}

/// Errors from parsing a selector string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// Empty selector or empty list entry.
    Empty { position: usize },
    /// A character that cannot start or continue the current production.
    UnexpectedChar { position: usize, found: char },
    /// Input ended inside a bracket, string or pseudo argument.
    UnexpectedEnd,
    /// Pseudo-class outside the supported set.
    UnsupportedPseudo(String),
    /// A host engine refused the selector (browser `SyntaxError`).
    Rejected(String),
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { position } => write!(f, "empty selector at offset {position}"),
            Self::UnexpectedChar { position, found } => {
                write!(f, "unexpected {found:?} at offset {position}")
            }
            Self::UnexpectedEnd => write!(f, "unexpected end of selector"),
            Self::UnsupportedPseudo(name) => write!(f, "unsupported pseudo-class :{name}"),
            Self::Rejected(msg) => write!(f, "selector rejected by host: {msg}"),
        }
    }
}

impl std::error::Error for SelectorError {}

/// Parsed selector list (`a, b > c`).
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorList {
    alternatives: Vec<Complex>,
}

#[derive(Debug, Clone, PartialEq)]
struct Complex {
    /// Compounds left to right; `parts[i].0` joins `parts[i]` to `parts[i - 1]`.
    parts: Vec<(Combinator, Compound)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Compound {
    tag: Option<String>,
    attrs: Vec<AttrMatch>,
    pseudos: Vec<Pseudo>,
}

#[derive(Debug, Clone, PartialEq)]
struct AttrMatch {
    name: String,
    op: AttrOp,
}

#[derive(Debug, Clone, PartialEq)]
enum AttrOp {
    Exists,
    Equals(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Pseudo {
    NthChild(usize),
    Has(SelectorList),
}

impl SelectorList {
    /// Parse a selector list.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut parser = Parser {
            chars: input.char_indices().collect(),
            pos: 0,
            len: input.len(),
        };
        let list = parser.list()?;
        parser.skip_ws();
        match parser.peek() {
            None => Ok(list),
            Some((position, found)) => Err(SelectorError::UnexpectedChar { position, found }),
        }
    }

    /// Whether `node` matches any alternative.
    pub fn matches<T: ElementTree>(&self, tree: &T, node: T::Node) -> bool {
        self.alternatives
            .iter()
            .any(|complex| complex.matches_at(tree, node, complex.parts.len() - 1))
    }

    /// Matching descendants of `root` in document order.
    pub fn select_within<T: ElementTree>(&self, tree: &T, root: T::Node) -> Vec<T::Node> {
        tree.element_descendants(root)
            .into_iter()
            .filter(|&node| self.matches(tree, node))
            .collect()
    }
}

impl Complex {
    fn matches_at<T: ElementTree>(&self, tree: &T, node: T::Node, idx: usize) -> bool {
        let (combinator, compound) = &self.parts[idx];
        if !compound.matches(tree, node) {
            return false;
        }
        if idx == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => tree
                .parent_element(node)
                .is_some_and(|parent| self.matches_at(tree, parent, idx - 1)),
            Combinator::Descendant => {
                let mut cursor = tree.parent_element(node);
                while let Some(ancestor) = cursor {
                    if self.matches_at(tree, ancestor, idx - 1) {
                        return true;
                    }
                    cursor = tree.parent_element(ancestor);
                }
                false
            }
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.attrs.is_empty() && self.pseudos.is_empty()
    }

    fn matches<T: ElementTree>(&self, tree: &T, node: T::Node) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && !tree.tag(node).eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        let attrs_ok = self.attrs.iter().all(|m| {
            let Some(value) = tree.attr(node, &m.name) else {
                return false;
            };
            match &m.op {
                AttrOp::Exists => true,
                AttrOp::Equals(v) => value == v,
                AttrOp::Prefix(v) => !v.is_empty() && value.starts_with(v.as_str()),
                AttrOp::Suffix(v) => !v.is_empty() && value.ends_with(v.as_str()),
                AttrOp::Contains(v) => !v.is_empty() && value.contains(v.as_str()),
            }
        });
        if !attrs_ok {
            return false;
        }
        self.pseudos.iter().all(|pseudo| match pseudo {
            Pseudo::NthChild(n) => tree.element_index(node) == *n,
            Pseudo::Has(inner) => tree
                .element_descendants(node)
                .into_iter()
                .any(|d| inner.matches(tree, d)),
        })
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.len, |(at, _)| at)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).map(|&(_, c)| c);
        self.pos += 1;
        c
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn expect(&mut self, want: char) -> Result<(), SelectorError> {
        match self.peek() {
            Some((_, c)) if c == want => {
                self.pos += 1;
                Ok(())
            }
            Some((position, found)) => Err(SelectorError::UnexpectedChar { position, found }),
            None => Err(SelectorError::UnexpectedEnd),
        }
    }

    fn list(&mut self) -> Result<SelectorList, SelectorError> {
        let mut alternatives = vec![self.complex()?];
        loop {
            self.skip_ws();
            if self.peek().is_some_and(|(_, c)| c == ',') {
                self.pos += 1;
                alternatives.push(self.complex()?);
            } else {
                return Ok(SelectorList { alternatives });
            }
        }
    }

    fn complex(&mut self) -> Result<Complex, SelectorError> {
        self.skip_ws();
        let first = self.compound()?;
        let mut parts = vec![(Combinator::Descendant, first)];
        loop {
            let had_ws = self.skip_ws();
            let combinator = match self.peek() {
                Some((_, '>')) => {
                    self.pos += 1;
                    self.skip_ws();
                    Combinator::Child
                }
                Some((_, c)) if had_ws && starts_compound(c) => Combinator::Descendant,
                _ => return Ok(Complex { parts }),
            };
            parts.push((combinator, self.compound()?));
        }
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let start = self.offset();
        let mut compound = Compound::default();
        match self.peek() {
            Some((_, '*')) => {
                self.pos += 1;
                compound.tag = Some("*".to_owned());
            }
            Some((_, c)) if is_ident_char(c) => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some((_, '[')) => {
                    self.pos += 1;
                    compound.attrs.push(self.attribute()?);
                }
                Some((_, ':')) => {
                    self.pos += 1;
                    compound.pseudos.push(self.pseudo()?);
                }
                _ => break,
            }
        }
        if compound.is_empty() {
            return match self.peek() {
                Some((position, found)) if !found.is_whitespace() && found != ',' => {
                    Err(SelectorError::UnexpectedChar { position, found })
                }
                Some(_) => Err(SelectorError::Empty { position: start }),
                None if start == 0 => Err(SelectorError::Empty { position: 0 }),
                None => Err(SelectorError::UnexpectedEnd),
            };
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        let mut out = String::new();
        while let Some((_, c)) = self.peek() {
            if !is_ident_char(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        if out.is_empty() {
            return match self.peek() {
                Some((position, found)) => Err(SelectorError::UnexpectedChar { position, found }),
                None => Err(SelectorError::UnexpectedEnd),
            };
        }
        Ok(out)
    }

    fn attribute(&mut self) -> Result<AttrMatch, SelectorError> {
        self.skip_ws();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_ws();
        let op_char = match self.peek() {
            Some((_, ']')) => {
                self.pos += 1;
                return Ok(AttrMatch {
                    name,
                    op: AttrOp::Exists,
                });
            }
            Some((_, '=')) => None,
            Some((_, c @ ('^' | '$' | '*'))) => {
                self.pos += 1;
                Some(c)
            }
            Some((position, found)) => {
                return Err(SelectorError::UnexpectedChar { position, found });
            }
            None => return Err(SelectorError::UnexpectedEnd),
        };
        self.expect('=')?;
        self.skip_ws();
        let value = self.value()?;
        self.skip_ws();
        self.expect(']')?;
        let op = match op_char {
            None => AttrOp::Equals(value),
            Some('^') => AttrOp::Prefix(value),
            Some('$') => AttrOp::Suffix(value),
            _ => AttrOp::Contains(value),
        };
        Ok(AttrMatch { name, op })
    }

    fn value(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            Some((_, quote @ ('"' | '\''))) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.bump() {
                        Some(c) if c == quote => return Ok(out),
                        Some('\\') => match self.bump() {
                            Some(escaped) => out.push(escaped),
                            None => return Err(SelectorError::UnexpectedEnd),
                        },
                        Some(c) => out.push(c),
                        None => return Err(SelectorError::UnexpectedEnd),
                    }
                }
            }
            Some(_) => self.ident(),
            None => Err(SelectorError::UnexpectedEnd),
        }
    }

    fn pseudo(&mut self) -> Result<Pseudo, SelectorError> {
        let name = self.ident()?.to_ascii_lowercase();
        match name.as_str() {
            "nth-child" => {
                self.expect('(')?;
                self.skip_ws();
                let at = self.offset();
                let digits = self.ident()?;
                let n = digits
                    .parse::<usize>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or(SelectorError::UnexpectedChar {
                        position: at,
                        found: digits.chars().next().unwrap_or('?'),
                    })?;
                self.skip_ws();
                self.expect(')')?;
                Ok(Pseudo::NthChild(n))
            }
            "has" => {
                self.expect('(')?;
                let inner = self.list()?;
                self.skip_ws();
                self.expect(')')?;
                Ok(Pseudo::Has(inner))
            }
            _ => Err(SelectorError::UnsupportedPseudo(name)),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn starts_compound(c: char) -> bool {
    is_ident_char(c) || matches!(c, '*' | '[' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat test tree: (tag, parent, attrs).
    struct Tree {
        nodes: Vec<(&'static str, Option<usize>, Vec<(&'static str, &'static str)>)>,
    }

    impl ElementTree for Tree {
        type Node = usize;

        fn parent_element(&self, node: usize) -> Option<usize> {
            self.nodes[node].1
        }

        fn tag(&self, node: usize) -> &str {
            self.nodes[node].0
        }

        fn attr(&self, node: usize, name: &str) -> Option<&str> {
            self.nodes[node]
                .2
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| *v)
        }

        fn element_index(&self, node: usize) -> usize {
            let parent = self.nodes[node].1;
            self.nodes[..=node]
                .iter()
                .filter(|n| n.1 == parent)
                .count()
        }

        fn element_descendants(&self, node: usize) -> Vec<usize> {
            (0..self.nodes.len())
                .filter(|&n| {
                    let mut cur = self.nodes[n].1;
                    while let Some(p) = cur {
                        if p == node {
                            return true;
                        }
                        cur = self.nodes[p].1;
                    }
                    false
                })
                .collect()
        }
    }

    fn chat_tree() -> Tree {
        Tree {
            nodes: vec![
                ("body", None, vec![]),
                ("main", Some(0), vec![]),
                ("article", Some(1), vec![("data-testid", "conversation-turn-1")]),
                ("div", Some(2), vec![("data-message-author-role", "user")]),
                ("article", Some(1), vec![("data-testid", "conversation-turn-2")]),
                ("div", Some(4), vec![("data-message-author-role", "assistant")]),
                ("aside", Some(0), vec![("role", "listitem")]),
            ],
        }
    }

    fn select(tree: &Tree, selector: &str) -> Vec<usize> {
        SelectorList::parse(selector)
            .expect("selector parses")
            .select_within(tree, 0)
    }

    #[test]
    fn attribute_operators_match_expected_nodes() {
        let tree = chat_tree();
        assert_eq!(select(&tree, "[data-message-author-role]"), vec![3, 5]);
        assert_eq!(
            select(&tree, "[data-message-author-role=\"assistant\"]"),
            vec![5]
        );
        assert_eq!(select(&tree, "[data-testid^='conversation-turn']"), vec![2, 4]);
        assert_eq!(select(&tree, "[data-testid$=\"-2\"]"), vec![4]);
        assert_eq!(select(&tree, "[data-testid*=turn]"), vec![2, 4]);
    }

    #[test]
    fn combinators_respect_ancestry() {
        let tree = chat_tree();
        assert_eq!(select(&tree, "main [data-message-author-role]"), vec![3, 5]);
        assert_eq!(select(&tree, "main > [data-message-author-role]"), Vec::<usize>::new());
        assert_eq!(select(&tree, "main > article > div"), vec![3, 5]);
        assert!(select(&tree, "main div[role=\"listitem\"]").is_empty());
    }

    #[test]
    fn has_and_nth_child_pseudos() {
        let tree = chat_tree();
        assert_eq!(
            select(&tree, "main article:has([data-message-author-role])"),
            vec![2, 4]
        );
        assert_eq!(select(&tree, "main > article:nth-child(2)"), vec![4]);
        assert_eq!(select(&tree, "main > *"), vec![2, 4]);
    }

    #[test]
    fn selector_lists_union_alternatives() {
        let tree = chat_tree();
        assert_eq!(select(&tree, "main, [role=listitem]"), vec![1, 6]);
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        assert!(matches!(
            SelectorList::parse(""),
            Err(SelectorError::Empty { .. })
        ));
        assert_eq!(
            SelectorList::parse("[data-x"),
            Err(SelectorError::UnexpectedEnd)
        );
        assert!(matches!(
            SelectorList::parse("div:hover"),
            Err(SelectorError::UnsupportedPseudo(name)) if name == "hover"
        ));
        assert!(matches!(
            SelectorList::parse("main >"),
            Err(SelectorError::UnexpectedEnd)
        ));
        assert!(matches!(
            SelectorList::parse("div{"),
            Err(SelectorError::UnexpectedChar { found: '{', .. })
        ));
        assert!(SelectorList::parse("a:nth-child(0)").is_err());
    }
}
