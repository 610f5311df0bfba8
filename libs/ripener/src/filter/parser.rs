use super::{FilterError, FilterErrorKind, Node, Op};

/// Recursive-descent parser over the raw filter bytes.
///
/// Positions reported in errors are byte offsets into the input.
pub(super) struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub(super) fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub(super) fn parse(mut self) -> Result<Node, FilterError> {
        self.skip_ws();
        if self.at_end() {
            return Err(self.error(FilterErrorKind::Empty));
        }
        let node = self.parse_filter()?;
        self.skip_ws();
        if !self.at_end() {
            return Err(self.error(FilterErrorKind::TrailingCharacters));
        }
        Ok(node)
    }

    fn parse_filter(&mut self) -> Result<Node, FilterError> {
        self.skip_ws();
        self.expect('(')?;
        self.skip_ws();
        let node = match self.peek() {
            Some('&') => {
                self.bump();
                Node::And(self.parse_list()?)
            }
            Some('|') => {
                self.bump();
                Node::Or(self.parse_list()?)
            }
            Some('!') => {
                self.bump();
                self.skip_ws();
                let inner = self.parse_filter()?;
                Node::Not(Box::new(inner))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error(FilterErrorKind::UnexpectedEnd)),
        };
        self.skip_ws();
        self.expect(')')?;
        Ok(node)
    }

    fn parse_list(&mut self) -> Result<Vec<Node>, FilterError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('(') => nodes.push(self.parse_filter()?),
                Some(')') => return Ok(nodes),
                Some(_) => return Err(self.error(FilterErrorKind::ExpectedOpenParen)),
                None => return Err(self.error(FilterErrorKind::UnexpectedEnd)),
            }
        }
    }

    fn parse_item(&mut self) -> Result<Node, FilterError> {
        let attr = self.parse_attr()?;
        let op_pos = self.pos;
        let op = match (self.peek(), self.peek_at(1)) {
            (Some('='), _) => {
                self.bump();
                Op::Equal
            }
            (Some('~'), Some('=')) => {
                self.pos += 2;
                Op::Approx
            }
            (Some('>'), Some('=')) => {
                self.pos += 2;
                Op::Greater
            }
            (Some('<'), Some('=')) => {
                self.pos += 2;
                Op::Less
            }
            (None, _) => return Err(self.error(FilterErrorKind::UnexpectedEnd)),
            _ => {
                return Err(FilterError {
                    position: op_pos,
                    kind: FilterErrorKind::InvalidOperator,
                })
            }
        };

        let pieces = self.parse_value()?;
        if op != Op::Equal {
            // Only `=` gives `*` its wildcard meaning.
            return Ok(Node::Compare {
                attr,
                op,
                value: pieces.join("*"),
            });
        }

        Ok(match pieces.as_slice() {
            [single] => Node::Compare {
                attr,
                op,
                value: single.clone(),
            },
            [a, b] if a.is_empty() && b.is_empty() => Node::Present(attr),
            _ => {
                let last_idx = pieces.len() - 1;
                let initial = Some(pieces[0].clone()).filter(|s| !s.is_empty());
                let last = Some(pieces[last_idx].clone()).filter(|s| !s.is_empty());
                let any = pieces[1..last_idx]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .cloned()
                    .collect();
                Node::Substring {
                    attr,
                    initial,
                    any,
                    last,
                }
            }
        })
    }

    fn parse_attr(&mut self) -> Result<String, FilterError> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
                break;
            }
            self.bump();
        }
        let attr = self.src[start..self.pos].trim_end();
        if attr.is_empty() {
            return Err(FilterError {
                position: start,
                kind: FilterErrorKind::MissingAttribute,
            });
        }
        Ok(attr.to_string())
    }

    /// Reads a value up to the closing paren, split at unescaped `*`.
    fn parse_value(&mut self) -> Result<Vec<String>, FilterError> {
        let mut pieces = Vec::new();
        let mut current = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(FilterErrorKind::UnexpectedEnd)),
                Some(')') => break,
                Some('(') => return Err(self.error(FilterErrorKind::UnescapedParen)),
                Some('*') => {
                    self.bump();
                    pieces.push(std::mem::take(&mut current));
                }
                Some('\\') => {
                    let escape_pos = self.pos;
                    self.bump();
                    match self.peek() {
                        Some(c) => {
                            self.bump();
                            current.push(c);
                        }
                        None => {
                            return Err(FilterError {
                                position: escape_pos,
                                kind: FilterErrorKind::DanglingEscape,
                            })
                        }
                    }
                }
                Some(c) => {
                    self.bump();
                    current.push(c);
                }
            }
        }
        pieces.push(current);
        Ok(pieces)
    }

    fn expect(&mut self, c: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(found) if found == c => {
                self.bump();
                Ok(())
            }
            None => Err(self.error(FilterErrorKind::UnexpectedEnd)),
            Some(_) if c == '(' => Err(self.error(FilterErrorKind::ExpectedOpenParen)),
            Some(_) => Err(self.error(FilterErrorKind::ExpectedCloseParen)),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn error(&self, kind: FilterErrorKind) -> FilterError {
        FilterError {
            position: self.pos,
            kind,
        }
    }
}
