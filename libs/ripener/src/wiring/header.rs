//! `namespace;attr=value;attr:Type=value;directive:=value` clause grammar.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::properties::{Properties, PropertyValue};
use crate::version::Version;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid '{header}' clause {clause}: {reason}")]
pub struct HeaderError {
    pub header: String,
    /// Zero-based index of the offending clause.
    pub clause: usize,
    pub reason: String,
}

/// One parsed clause of a capability or requirement header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Clause {
    pub namespace: String,
    pub attributes: Properties,
    pub directives: BTreeMap<String, String>,
}

/// Parse a whole header value into its clauses.
pub fn parse_clauses(header: &str, value: &str) -> Result<Vec<Clause>, HeaderError> {
    let mut clauses = Vec::new();
    for (idx, raw) in split_unquoted(value, ',').into_iter().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let clause = parse_clause(raw).map_err(|reason| HeaderError {
            header: header.to_string(),
            clause: idx,
            reason,
        })?;
        clauses.push(clause);
    }
    Ok(clauses)
}

fn parse_clause(raw: &str) -> Result<Clause, String> {
    let mut parts = split_unquoted(raw, ';').into_iter();
    let namespace = parts.next().unwrap_or_default().trim().to_string();
    if namespace.is_empty() {
        return Err("missing namespace".into());
    }
    if namespace.contains('=') || namespace.contains('"') {
        return Err(format!("'{namespace}' is not a namespace"));
    }

    let mut clause = Clause {
        namespace,
        ..Clause::default()
    };

    for param in parts {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        // The first `=` ends the key; values may contain `=` or `:=` freely.
        let Some((key, value)) = param.split_once('=') else {
            return Err(format!("expected 'key=value' but found '{param}'"));
        };
        if key.contains('"') {
            return Err(format!("quoted key in '{param}'"));
        }
        let value = unquote(value.trim())?;
        if let Some(key) = key.strip_suffix(':') {
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("directive without a name in '{param}'"));
            }
            clause.directives.insert(key.to_string(), value);
            continue;
        }
        let (name, ty) = match key.split_once(':') {
            Some((name, ty)) => (name.trim(), Some(ty.trim())),
            None => (key.trim(), None),
        };
        if name.is_empty() {
            return Err(format!("attribute without a name in '{param}'"));
        }
        clause.attributes.insert(name, typed_value(ty, &value)?);
    }
    Ok(clause)
}

fn typed_value(ty: Option<&str>, value: &str) -> Result<PropertyValue, String> {
    let scalar = |ty: &str, v: &str| -> Result<PropertyValue, String> {
        match ty {
            "String" => Ok(PropertyValue::String(v.to_string())),
            "Long" => v
                .trim()
                .parse::<i64>()
                .map(PropertyValue::Long)
                .map_err(|_| format!("'{v}' is not a Long")),
            "Double" => v
                .trim()
                .parse::<f64>()
                .map(PropertyValue::Double)
                .map_err(|_| format!("'{v}' is not a Double")),
            "Version" => v
                .parse::<Version>()
                .map(PropertyValue::Version)
                .map_err(|e| e.to_string()),
            other => Err(format!("unknown attribute type '{other}'")),
        }
    };

    match ty {
        None => Ok(PropertyValue::String(value.to_string())),
        Some(ty) => {
            if let Some(inner) = ty.strip_prefix("List<").and_then(|t| t.strip_suffix('>')) {
                let items = split_unquoted(value, ',')
                    .into_iter()
                    .map(|item| scalar(inner.trim(), item.trim()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PropertyValue::List(items))
            } else if ty == "List" {
                Ok(PropertyValue::List(
                    value
                        .split(',')
                        .map(|s| PropertyValue::String(s.trim().to_string()))
                        .collect(),
                ))
            } else {
                scalar(ty, value)
            }
        }
    }
}

/// Split at `sep` outside of double quotes. Quotes are kept.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn unquote(v: &str) -> Result<String, String> {
    let Some(inner) = v.strip_prefix('"') else {
        return Ok(v.to_string());
    };
    let Some(inner) = inner.strip_suffix('"') else {
        return Err(format!("unterminated quote in {v}"));
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => return Err(format!("dangling escape in {v}")),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_directives_and_types() {
        let clauses = parse_clauses(
            "Provide-Capability",
            r#"db;v:Long=1;name=pg;mode:="ro", cache;size:Version=1.2;tags:List<String>="a,b""#,
        )
        .unwrap();
        assert_eq!(clauses.len(), 2);

        let db = &clauses[0];
        assert_eq!(db.namespace, "db");
        assert_eq!(db.attributes.get("v"), Some(&PropertyValue::Long(1)));
        assert_eq!(db.attributes.get_str("name"), Some("pg"));
        assert_eq!(db.directives.get("mode").map(String::as_str), Some("ro"));

        let cache = &clauses[1];
        assert_eq!(
            cache.attributes.get("size"),
            Some(&PropertyValue::Version(Version::new(1, 2, 0)))
        );
        assert_eq!(
            cache.attributes.get("tags"),
            Some(&PropertyValue::List(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn quoted_filter_directive_keeps_commas_and_semicolons() {
        let clauses = parse_clauses(
            "Require-Capability",
            r#"db;filter:="(&(v>=1)(name=a;b,c))""#,
        )
        .unwrap();
        assert_eq!(clauses.len(), 1);
        assert_eq!(
            clauses[0].directives.get("filter").map(String::as_str),
            Some("(&(v>=1)(name=a;b,c))")
        );
    }

    #[test]
    fn errors_name_the_clause() {
        let err = parse_clauses("Provide-Capability", "ok;a=1, ;b=2").unwrap_err();
        assert_eq!(err.clause, 1);
        assert!(err.reason.contains("namespace"));

        let err = parse_clauses("Provide-Capability", "db;v:Long=abc").unwrap_err();
        assert!(err.reason.contains("Long"));

        let err = parse_clauses("Provide-Capability", "db;novalue").unwrap_err();
        assert!(err.reason.contains("key=value"));

        let err = parse_clauses("Provide-Capability", "db;t:Weird=1").unwrap_err();
        assert!(err.reason.contains("unknown attribute type"));
    }

    #[test]
    fn quoted_values_may_contain_directive_marker() {
        let clauses = parse_clauses("Provide-Capability", r#"ns;a:String="x:=y";b="p=q""#).unwrap();
        let ns = &clauses[0];
        assert_eq!(ns.attributes.get_str("a"), Some("x:=y"));
        assert_eq!(ns.attributes.get_str("b"), Some("p=q"));
        assert!(ns.directives.is_empty());

        let clauses = parse_clauses("Require-Capability", r#"ns;filter:="(k=a:=b)""#).unwrap();
        assert_eq!(
            clauses[0].directives.get("filter").map(String::as_str),
            Some("(k=a:=b)")
        );
    }

    #[test]
    fn escapes_inside_quotes() {
        let clauses = parse_clauses("Provide-Capability", r#"ns;a="say \"hi\"""#).unwrap();
        assert_eq!(clauses[0].attributes.get_str("a"), Some(r#"say "hi""#));

        assert!(unquote(r#""abc\""#).is_err());
        assert_eq!(unquote(r#""a\\""#).unwrap(), r"a\");
    }
}
