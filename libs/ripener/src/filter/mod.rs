//! Attribute filter expressions.
//!
//! The grammar is the LDAP-style filter language used for service lookups,
//! listener subscriptions and capability requirements:
//!
//! ```text
//! filter     = "(" ( and | or | not | item ) ")"
//! and        = "&" filter*
//! or         = "|" filter*
//! not        = "!" filter
//! item       = attr ( "=" | "~=" | ">=" | "<=" ) value
//! ```
//!
//! `(attr=*)` tests presence; unescaped `*` inside an `=` value is a wildcard.
//! `\` escapes the next character. Matching against a list property succeeds
//! if any element matches.

mod parser;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::properties::{Properties, PropertyValue};
use crate::version::Version;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterErrorKind {
    Empty,
    UnexpectedEnd,
    ExpectedOpenParen,
    ExpectedCloseParen,
    MissingAttribute,
    InvalidOperator,
    UnescapedParen,
    DanglingEscape,
    TrailingCharacters,
}

impl fmt::Display for FilterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FilterErrorKind::Empty => "empty filter",
            FilterErrorKind::UnexpectedEnd => "unexpected end of filter",
            FilterErrorKind::ExpectedOpenParen => "expected '('",
            FilterErrorKind::ExpectedCloseParen => "expected ')'",
            FilterErrorKind::MissingAttribute => "missing attribute name",
            FilterErrorKind::InvalidOperator => "expected one of '=', '~=', '>=', '<='",
            FilterErrorKind::UnescapedParen => "unescaped '(' in value",
            FilterErrorKind::DanglingEscape => "'\\' at end of value",
            FilterErrorKind::TrailingCharacters => "trailing characters after filter",
        };
        f.write_str(msg)
    }
}

/// Parse failure with the byte offset at which it was detected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid filter at position {position}: {kind}")]
pub struct FilterError {
    pub position: usize,
    pub kind: FilterErrorKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Equal,
    Approx,
    Greater,
    Less,
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Present(String),
    Compare {
        attr: String,
        op: Op,
        value: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

/// A parsed filter expression.
#[derive(Clone, Debug)]
pub struct Filter {
    root: Node,
}

impl Filter {
    pub fn parse(src: &str) -> Result<Self, FilterError> {
        parser::Parser::new(src).parse().map(|root| Self { root })
    }

    /// Evaluate the filter against a property map.
    pub fn matches(&self, props: &Properties) -> bool {
        eval(&self.root, props)
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// Renders the normalized form, which parses back to an equivalent filter.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(&self.root, f)
    }
}

fn eval(node: &Node, props: &Properties) -> bool {
    match node {
        Node::And(children) => children.iter().all(|c| eval(c, props)),
        Node::Or(children) => children.iter().any(|c| eval(c, props)),
        Node::Not(inner) => !eval(inner, props),
        Node::Present(attr) => props.contains_key(attr),
        Node::Compare { attr, op, value } => props
            .get(attr)
            .is_some_and(|v| v.values().iter().any(|v| compare(v, *op, value))),
        Node::Substring {
            attr,
            initial,
            any,
            last,
        } => props.get(attr).is_some_and(|v| {
            v.values().iter().any(|v| {
                let rendered = v.to_string();
                substring_match(&rendered, initial.as_deref(), any, last.as_deref())
            })
        }),
    }
}

fn compare(value: &PropertyValue, op: Op, literal: &str) -> bool {
    match value {
        PropertyValue::List(items) => items.iter().any(|v| compare(v, op, literal)),
        PropertyValue::String(s) => compare_strings(s, op, literal),
        PropertyValue::Long(v) => match literal.trim().parse::<i64>() {
            Ok(lit) => apply(v.cmp(&lit), op),
            Err(_) => compare_lexical(&v.to_string(), op, literal),
        },
        PropertyValue::Double(v) => match literal.trim().parse::<f64>() {
            Ok(lit) => v.partial_cmp(&lit).is_some_and(|ord| apply(ord, op)),
            Err(_) => compare_lexical(&v.to_string(), op, literal),
        },
        PropertyValue::Boolean(b) => match op {
            Op::Equal | Op::Approx => literal.trim().eq_ignore_ascii_case(&b.to_string()),
            _ => compare_lexical(&b.to_string(), op, literal),
        },
        PropertyValue::Version(v) => match literal.parse::<Version>() {
            Ok(lit) => apply(v.cmp(&lit), op),
            Err(_) => compare_lexical(&v.to_string(), op, literal),
        },
    }
}

/// Strings compare numerically only when both sides parse as the same
/// numeric type; otherwise lexically.
fn compare_strings(s: &str, op: Op, literal: &str) -> bool {
    match (s.trim().parse::<i64>(), literal.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => return apply(a.cmp(&b), op),
        // An integer against a decimal is a type mismatch.
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => return compare_lexical(s, op, literal),
        (Err(_), Err(_)) => {}
    }
    if looks_decimal(s) && looks_decimal(literal) {
        if let (Ok(a), Ok(b)) = (s.trim().parse::<f64>(), literal.trim().parse::<f64>()) {
            return a.partial_cmp(&b).is_some_and(|ord| apply(ord, op));
        }
    }
    compare_lexical(s, op, literal)
}

// `f64::from_str` also accepts "inf" and "NaN"; those stay lexical.
fn looks_decimal(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && s.chars().any(|c| c.is_ascii_digit())
}

fn compare_lexical(s: &str, op: Op, literal: &str) -> bool {
    match op {
        Op::Equal => s == literal,
        Op::Approx => normalize_approx(s) == normalize_approx(literal),
        Op::Greater => s >= literal,
        Op::Less => s <= literal,
    }
}

fn apply(ord: Ordering, op: Op) -> bool {
    match op {
        Op::Equal | Op::Approx => ord == Ordering::Equal,
        Op::Greater => ord != Ordering::Less,
        Op::Less => ord != Ordering::Greater,
    }
}

fn normalize_approx(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_match(s: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = s;
    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(suffix) => rest.ends_with(suffix),
        None => true,
    }
}

fn write_node(node: &Node, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match node {
        Node::And(children) | Node::Or(children) => {
            f.write_str(if matches!(node, Node::And(_)) { "(&" } else { "(|" })?;
            for c in children {
                write_node(c, f)?;
            }
            f.write_str(")")
        }
        Node::Not(inner) => {
            f.write_str("(!")?;
            write_node(inner, f)?;
            f.write_str(")")
        }
        Node::Present(attr) => write!(f, "({attr}=*)"),
        Node::Compare { attr, op, value } => {
            let op = match op {
                Op::Equal => "=",
                Op::Approx => "~=",
                Op::Greater => ">=",
                Op::Less => "<=",
            };
            write!(f, "({attr}{op}{})", escape(value))
        }
        Node::Substring {
            attr,
            initial,
            any,
            last,
        } => {
            write!(f, "({attr}=")?;
            if let Some(i) = initial {
                f.write_str(&escape(i))?;
            }
            f.write_str("*")?;
            for a in any {
                write!(f, "{}*", escape(a))?;
            }
            if let Some(l) = last {
                f.write_str(&escape(l))?;
            }
            f.write_str(")")
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '*' | '(' | ')') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Properties {
        Properties::new()
            .with("lang", "en")
            .with("count", 10i64)
            .with("ratio", 0.5)
            .with("enabled", true)
            .with("num", "10")
            .with("name", "Hello World")
            .with("tags", vec!["alpha", "beta"])
            .with("version", Version::new(1, 2, 0))
    }

    fn m(f: &str) -> bool {
        Filter::parse(f).unwrap().matches(&props())
    }

    #[test]
    fn simple_comparisons() {
        assert!(m("(lang=en)"));
        assert!(!m("(lang=fr)"));
        assert!(m("(count>=10)"));
        assert!(m("(count<=10)"));
        assert!(!m("(count>=11)"));
        assert!(m("(ratio<=0.5)"));
        assert!(m("(enabled=TRUE)"));
        assert!(m("(version>=1.1)"));
        assert!(!m("(version>=2)"));
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        // "10" >= "9" is false lexically but true numerically.
        assert!(m("(num>=9)"));
        assert!(!m("(lang>=f)"));
        assert!(m("(lang<=f)"));
    }

    #[test]
    fn mixed_integer_and_decimal_strings_compare_lexically() {
        assert!(m("(num=10)"));
        assert!(!m("(num=10.0)"));
        let p = Properties::new().with("ratio", "0.50");
        assert!(Filter::parse("(ratio=0.5)").unwrap().matches(&p));
        assert!(Filter::parse("(ratio>=0.25)").unwrap().matches(&p));
    }

    #[test]
    fn approx_ignores_case_and_whitespace() {
        assert!(m("(name~=helloworld)"));
        assert!(m("(name~= HELLO world )"));
        assert!(!m("(name~=hello)"));
    }

    #[test]
    fn presence_and_wildcards() {
        assert!(m("(lang=*)"));
        assert!(!m("(missing=*)"));
        assert!(m("(name=Hello*)"));
        assert!(m("(name=*World)"));
        assert!(m("(name=H*o*W*d)"));
        assert!(!m("(name=*xyz*)"));
    }

    #[test]
    fn multi_valued_matches_any() {
        assert!(m("(tags=beta)"));
        assert!(m("(tags=al*)"));
        assert!(!m("(tags=gamma)"));
    }

    #[test]
    fn composites_follow_de_morgan() {
        let cases = ["(lang=en)", "(lang=fr)", "(count>=10)", "(missing=*)"];
        for a in cases {
            for b in cases {
                let and = m(&format!("(&{a}{b})"));
                let or = m(&format!("(|{a}{b})"));
                assert_eq!(and, m(a) && m(b), "and {a} {b}");
                assert_eq!(or, m(a) || m(b), "or {a} {b}");
                assert_eq!(m(&format!("(!(&{a}{b}))")), m(&format!("(|(!{a})(!{b}))")));
                assert_eq!(m(&format!("(!(|{a}{b}))")), m(&format!("(&(!{a})(!{b}))")));
            }
        }
        assert!(m("(&)"));
        assert!(!m("(|)"));
    }

    #[test]
    fn escapes_and_keys_are_case_sensitive() {
        let p = Properties::new().with("expr", "a*(b)").with("Key", "v");
        let f = |s: &str| Filter::parse(s).unwrap().matches(&p);
        assert!(f(r"(expr=a\*\(b\))"));
        assert!(!f(r"(expr=a\*)"));
        assert!(f("(Key=v)"));
        assert!(!f("(key=v)"));
    }

    #[test]
    fn malformed_input_reports_position() {
        let err = Filter::parse("(lang=en").unwrap_err();
        assert_eq!(err.kind, FilterErrorKind::UnexpectedEnd);
        assert_eq!(err.position, 8);

        assert_eq!(Filter::parse("").unwrap_err().kind, FilterErrorKind::Empty);
        assert_eq!(
            Filter::parse("lang=en").unwrap_err().kind,
            FilterErrorKind::ExpectedOpenParen
        );
        assert_eq!(
            Filter::parse("(=en)").unwrap_err().kind,
            FilterErrorKind::MissingAttribute
        );
        let err = Filter::parse("(lang>en)").unwrap_err();
        assert_eq!(err.kind, FilterErrorKind::InvalidOperator);
        assert_eq!(err.position, 5);
        assert_eq!(
            Filter::parse("(a=b))").unwrap_err().kind,
            FilterErrorKind::TrailingCharacters
        );
        assert_eq!(
            Filter::parse("(a=b\\").unwrap_err().kind,
            FilterErrorKind::DanglingEscape
        );
        assert_eq!(
            Filter::parse("(&(a=b)x)").unwrap_err().kind,
            FilterErrorKind::ExpectedOpenParen
        );
    }

    #[test]
    fn display_is_reparseable() {
        for src in ["(&(a=1)(|(b=x*y)(!(c=*))))", r"(x=\(\*\))", "(v~=Foo Bar)"] {
            let f = Filter::parse(src).unwrap();
            let again = Filter::parse(&f.to_string()).unwrap();
            assert_eq!(f, again);
        }
    }
}
