//! The annotated regex AST: pattern parser, combinators, action and
//! precondition annotations, and desugaring to the foundational algebra.
//!
//! A [`Regex`] is a tree of [`Node`]s.  The full node set is sugar over
//! a small foundational algebra — `{set, cat, alt, rep, isec, diff}` —
//! which is all the NFA builder understands.  [`Regex::desugar`]
//! rewrites any tree into that subset while keeping the tree's
//! annotations attached to the rewritten roots.
//!
//! Patterns can come from two front-ends:
//!
//! - [`parse`] — the crate's own pattern syntax (byte-level, shunting-
//!   yard precedence, `\xHH` escapes, no Unicode escapes).
//! - [`Regex::from_hir`] — lowering of a byte-mode `regex-syntax` HIR,
//!   for hosts that already speak the standard syntax.

use regex_syntax::hir::{self, Hir, HirKind};

use crate::byteset::ByteSet;
use crate::CompileError;

// ---------------------------------------------------------------------------
// Node kinds and annotations
// ---------------------------------------------------------------------------

/// A single item of a character class: one byte or an inclusive range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassItem {
    Byte(u8),
    Range(u8, u8),
}

impl ClassItem {
    fn to_set(self) -> ByteSet {
        match self {
            ClassItem::Byte(b) => ByteSet::byte(b),
            ClassItem::Range(lo, hi) => ByteSet::range(lo, hi),
        }
    }
}

/// The node variants of the extended algebra.  Only `Set`, `Cat`, `Alt`,
/// `Rep`, `Isec` and `Diff` survive desugaring.
#[derive(Clone, Debug)]
pub enum Node {
    /// A single byte.
    Byte(u8),
    /// An inclusive byte range.
    Range(u8, u8),
    /// A character, matched as its UTF-8 byte sequence.
    Char(char),
    /// A literal string, matched as its UTF-8 bytes.
    Str(String),
    /// A literal byte sequence.
    Bytes(Vec<u8>),
    /// An arbitrary byte set.
    Set(ByteSet),
    /// A character class `[...]`.
    Class(Vec<ClassItem>),
    /// A complemented character class `[^...]`.
    CClass(Vec<ClassItem>),
    /// Concatenation; `Cat(vec![])` is the epsilon regex.
    Cat(Vec<Regex>),
    /// Alternation.
    Alt(Vec<Regex>),
    /// Zero or more repetitions.
    Rep(Box<Regex>),
    /// One or more repetitions.
    Rep1(Box<Regex>),
    /// Zero or one occurrence.
    Opt(Box<Regex>),
    /// Language intersection.
    Isec(Box<Regex>, Box<Regex>),
    /// Language difference.
    Diff(Box<Regex>, Box<Regex>),
    /// Language complement relative to `any*`.
    Neg(Box<Regex>),
}

/// Polarity of a precondition guard.
///
/// `True` gates an edge on the named flag being set, `False` on it
/// being clear, and `Both` references the flag without constraining it
/// (useful as an explicit "don't care" when combining guards).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Polarity {
    Both,
    True,
    False,
}

/// Which transitions of a fragment a precondition guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrecondWhen {
    /// Guard only the transitions entering the fragment.
    Enter,
    /// Guard every transition within the fragment, entry included.
    All,
}

/// Ordered action bindings for the four boundary events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Actions {
    pub enter: Vec<String>,
    pub exit: Vec<String>,
    pub fin: Vec<String>,
    pub all: Vec<String>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.enter.is_empty() && self.exit.is_empty() && self.fin.is_empty() && self.all.is_empty()
    }
}

/// An annotated regex tree.
#[derive(Clone, Debug)]
pub struct Regex {
    pub(crate) node: Node,
    pub(crate) actions: Actions,
    pub(crate) precond_enter: Option<(String, Polarity)>,
    pub(crate) precond_all: Option<(String, Polarity)>,
}

impl Regex {
    fn new(node: Node) -> Self {
        Self {
            node,
            actions: Actions::default(),
            precond_enter: None,
            precond_all: None,
        }
    }

    // -- Leaf constructors ---------------------------------------------------

    pub fn byte(b: u8) -> Self {
        Self::new(Node::Byte(b))
    }

    pub fn byte_range(lo: u8, hi: u8) -> Self {
        Self::new(Node::Range(lo, hi))
    }

    pub fn char(c: char) -> Self {
        Self::new(Node::Char(c))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::new(Node::Str(s.into()))
    }

    pub fn bytes(bs: impl Into<Vec<u8>>) -> Self {
        Self::new(Node::Bytes(bs.into()))
    }

    pub fn set(set: ByteSet) -> Self {
        Self::new(Node::Set(set))
    }

    /// Any single byte (the `.` regex).
    pub fn any() -> Self {
        Self::new(Node::Set(ByteSet::ALL))
    }

    /// The epsilon regex (matches only the empty string).
    pub fn epsilon() -> Self {
        Self::new(Node::Cat(Vec::new()))
    }

    // -- Combinators ---------------------------------------------------------

    pub fn cat(children: impl IntoIterator<Item = Regex>) -> Self {
        Self::new(Node::Cat(children.into_iter().collect()))
    }

    pub fn alt(children: impl IntoIterator<Item = Regex>) -> Self {
        Self::new(Node::Alt(children.into_iter().collect()))
    }

    pub fn rep(self) -> Self {
        Self::new(Node::Rep(Box::new(self)))
    }

    pub fn rep1(self) -> Self {
        Self::new(Node::Rep1(Box::new(self)))
    }

    pub fn opt(self) -> Self {
        Self::new(Node::Opt(Box::new(self)))
    }

    pub fn isec(self, other: Regex) -> Self {
        Self::new(Node::Isec(Box::new(self), Box::new(other)))
    }

    pub fn diff(self, other: Regex) -> Self {
        Self::new(Node::Diff(Box::new(self), Box::new(other)))
    }

    pub fn neg(self) -> Self {
        Self::new(Node::Neg(Box::new(self)))
    }

    // -- Annotations (in place) ----------------------------------------------

    /// Bind actions to run when the first byte of this regex is matched.
    pub fn on_enter<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.enter.extend(names.into_iter().map(Into::into));
    }

    /// Bind actions to run when the first byte past this regex is
    /// matched, or at EOF if input ends inside an accepting position.
    pub fn on_exit<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.exit.extend(names.into_iter().map(Into::into));
    }

    /// Bind actions to run on every byte that could be the last byte of
    /// this regex.  Rejected at compile time when the regex consumes no
    /// bytes at all.
    pub fn on_final<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.fin.extend(names.into_iter().map(Into::into));
    }

    /// Bind actions to run on every byte matched within this regex.
    pub fn on_all<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.all.extend(names.into_iter().map(Into::into));
    }

    /// Attach a named precondition guard.
    pub fn precond(&mut self, name: impl Into<String>, when: PrecondWhen, polarity: Polarity) {
        let guard = Some((name.into(), polarity));
        match when {
            PrecondWhen::Enter => self.precond_enter = guard,
            PrecondWhen::All => self.precond_all = guard,
        }
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    // -- Desugaring ----------------------------------------------------------

    /// Rewrite the tree into the foundational algebra
    /// `{set, cat, alt, rep, isec, diff}`.  Annotations on each node
    /// survive on the node's rewritten root; sugar that duplicates its
    /// operand (`rep1`) duplicates the operand's annotations with it.
    pub(crate) fn desugar(self) -> Regex {
        let Regex {
            node,
            actions,
            precond_enter,
            precond_all,
        } = self;
        let node = match node {
            Node::Byte(b) => Node::Set(ByteSet::byte(b)),
            Node::Range(lo, hi) => Node::Set(ByteSet::range(lo, hi)),
            Node::Char(c) => {
                let mut buf = [0u8; 4];
                bytes_to_cat(c.encode_utf8(&mut buf).as_bytes())
            }
            Node::Str(s) => bytes_to_cat(s.as_bytes()),
            Node::Bytes(bs) => bytes_to_cat(&bs),
            Node::Set(set) => Node::Set(set),
            Node::Class(items) => Node::Set(class_union(&items)),
            Node::CClass(items) => Node::Set(class_union(&items).complement()),
            Node::Cat(xs) => Node::Cat(xs.into_iter().map(Regex::desugar).collect()),
            Node::Alt(xs) => Node::Alt(xs.into_iter().map(Regex::desugar).collect()),
            Node::Rep(x) => Node::Rep(Box::new(x.desugar())),
            Node::Rep1(x) => {
                // rep1(x) → cat(x, rep(x))
                let x = x.desugar();
                let looped = Regex::new(Node::Rep(Box::new(x.clone())));
                Node::Cat(vec![x, looped])
            }
            Node::Opt(x) => Node::Alt(vec![x.desugar(), Regex::epsilon()]),
            Node::Isec(a, b) => Node::Isec(Box::new(a.desugar()), Box::new(b.desugar())),
            Node::Diff(a, b) => Node::Diff(Box::new(a.desugar()), Box::new(b.desugar())),
            Node::Neg(x) => {
                // neg(x) → diff(any*, x)
                let universe = Regex::new(Node::Rep(Box::new(Regex::any())));
                Node::Diff(Box::new(universe), Box::new(x.desugar()))
            }
        };
        Regex {
            node,
            actions,
            precond_enter,
            precond_all,
        }
    }

    // -- regex-syntax import -------------------------------------------------

    /// Lower a byte-mode `regex-syntax` HIR into a [`Regex`].
    ///
    /// Literals, byte classes, concatenation, alternation and
    /// repetitions are supported; capture groups are transparent.
    /// Look-around assertions and classes containing codepoints above
    /// U+00FF are rejected.
    pub fn from_hir(hir: &Hir) -> Result<Regex, CompileError> {
        match hir.kind() {
            HirKind::Empty => Ok(Regex::epsilon()),
            HirKind::Literal(lit) => Ok(Regex::bytes(lit.0.to_vec())),
            HirKind::Class(hir::Class::Bytes(class)) => {
                let mut set = ByteSet::EMPTY;
                for range in class.ranges() {
                    set = set.union(&ByteSet::range(range.start(), range.end()));
                }
                Ok(Regex::set(set))
            }
            HirKind::Class(hir::Class::Unicode(class)) => {
                // regex-syntax may produce Unicode classes for ASCII-only
                // patterns; lower them when every range fits in one byte.
                let ranges = class.ranges();
                let all_single_byte = ranges
                    .iter()
                    .all(|r| (r.start() as u32) <= 0xFF && (r.end() as u32) <= 0xFF);
                if !all_single_byte {
                    return Err(CompileError::UnsupportedHir(format!(
                        "class with codepoints above U+00FF: {:?}",
                        class
                    )));
                }
                let mut set = ByteSet::EMPTY;
                for r in ranges {
                    set = set.union(&ByteSet::range(r.start() as u8, r.end() as u8));
                }
                Ok(Regex::set(set))
            }
            HirKind::Look(look) => Err(CompileError::UnsupportedHir(format!(
                "look-around assertion {:?}",
                look
            ))),
            HirKind::Capture(cap) => Regex::from_hir(&cap.sub),
            HirKind::Concat(children) => {
                let xs = children
                    .iter()
                    .map(Regex::from_hir)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Regex::cat(xs))
            }
            HirKind::Alternation(children) => {
                let xs = children
                    .iter()
                    .map(Regex::from_hir)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Regex::alt(xs))
            }
            HirKind::Repetition(rep) => {
                let sub = Regex::from_hir(&rep.sub)?;
                Ok(lower_repetition(sub, rep.min, rep.max))
            }
        }
    }
}

/// Unroll a `{min,max}` repetition into the sugar algebra.
fn lower_repetition(sub: Regex, min: u32, max: Option<u32>) -> Regex {
    match (min, max) {
        (0, Some(1)) => sub.opt(),
        (0, None) => sub.rep(),
        (1, None) => sub.rep1(),
        (min, None) => {
            // x{m,} → x … x x*
            let mut parts: Vec<Regex> = (0..min).map(|_| sub.clone()).collect();
            parts.push(sub.rep());
            Regex::cat(parts)
        }
        (min, Some(max)) => {
            // x{m,n} → x … x (x (x (…)?)?)?
            let mut tail = Regex::epsilon();
            for _ in min..max {
                tail = Regex::cat(vec![sub.clone(), tail]).opt();
            }
            let mut parts: Vec<Regex> = (0..min).map(|_| sub.clone()).collect();
            parts.push(tail);
            Regex::cat(parts)
        }
    }
}

fn bytes_to_cat(bytes: &[u8]) -> Node {
    Node::Cat(
        bytes
            .iter()
            .map(|&b| Regex::set(ByteSet::byte(b)))
            .collect(),
    )
}

fn class_union(items: &[ClassItem]) -> ByteSet {
    let mut set = ByteSet::EMPTY;
    for item in items {
        set = set.union(&item.to_set());
    }
    set
}

// -- Operator sugar ----------------------------------------------------------

/// `a * b` — concatenation.
impl std::ops::Mul for Regex {
    type Output = Regex;

    fn mul(self, rhs: Regex) -> Regex {
        Regex::cat(vec![self, rhs])
    }
}

/// `a | b` — alternation.
impl std::ops::BitOr for Regex {
    type Output = Regex;

    fn bitor(self, rhs: Regex) -> Regex {
        Regex::alt(vec![self, rhs])
    }
}

/// `a & b` — language intersection.
impl std::ops::BitAnd for Regex {
    type Output = Regex;

    fn bitand(self, rhs: Regex) -> Regex {
        self.isec(rhs)
    }
}

/// `a - b` — language difference.
impl std::ops::Sub for Regex {
    type Output = Regex;

    fn sub(self, rhs: Regex) -> Regex {
        self.diff(rhs)
    }
}

/// `!a` — language complement relative to `any*`.
impl std::ops::Not for Regex {
    type Output = Regex;

    fn not(self) -> Regex {
        self.neg()
    }
}

// ---------------------------------------------------------------------------
// Pattern parser
// ---------------------------------------------------------------------------

/// Operator precedence: postfix quantifiers (3) > concatenation (2) >
/// alternation (1) > group marker (0).  Quantifiers bind directly to the
/// preceding operand and never enter the operator stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Alt,
    Cat,
    /// `(` marker; remembers the operand-stack depth at open so empty
    /// groups can be detected.
    Group(usize),
}

impl Op {
    fn prec(self) -> u8 {
        match self {
            Op::Group(_) => 0,
            Op::Alt => 1,
            Op::Cat => 2,
        }
    }
}

/// Parse a pattern string into a [`Regex`] (see the module docs for the
/// supported syntax).
pub fn parse(pattern: &str) -> Result<Regex, CompileError> {
    Parser::new(pattern).parse()
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
    operands: Vec<Regex>,
    ops: Vec<Op>,
    /// Whether the previous token produced an operand, i.e. whether an
    /// implicit concatenation must be inserted before the next one.
    after_operand: bool,
}

impl<'a> Parser<'a> {
    fn new(pattern: &'a str) -> Self {
        Self {
            chars: pattern.char_indices().peekable(),
            len: pattern.len(),
            operands: Vec::new(),
            ops: Vec::new(),
            after_operand: false,
        }
    }

    fn err(&mut self, message: impl Into<String>) -> CompileError {
        let pos = self.chars.peek().map_or(self.len, |&(i, _)| i);
        CompileError::Parse {
            pos,
            message: message.into(),
        }
    }

    fn parse(mut self) -> Result<Regex, CompileError> {
        while let Some(&(_, c)) = self.chars.peek() {
            match c {
                '*' | '+' | '?' => {
                    self.chars.next();
                    if !self.after_operand {
                        return Err(self.err(format!("`{}` with nothing to repeat", c)));
                    }
                    let x = self.operands.pop().expect("operand after after_operand");
                    self.operands.push(match c {
                        '*' => x.rep(),
                        '+' => x.rep1(),
                        _ => x.opt(),
                    });
                }
                '|' => {
                    self.chars.next();
                    // An absent branch (leading `|`, `||`) is epsilon.
                    if !self.after_operand {
                        self.operands.push(Regex::epsilon());
                    }
                    while self.ops.last().map_or(false, |op| op.prec() >= Op::Alt.prec()) {
                        self.apply_top();
                    }
                    self.ops.push(Op::Alt);
                    self.after_operand = false;
                }
                '(' => {
                    self.chars.next();
                    self.push_concat();
                    self.ops.push(Op::Group(self.operands.len()));
                    self.after_operand = false;
                }
                ')' => {
                    self.chars.next();
                    self.close_group()?;
                }
                _ => {
                    let re = self.operand()?;
                    self.push_concat();
                    self.operands.push(re);
                    self.after_operand = true;
                }
            }
        }
        if !self.after_operand && matches!(self.ops.last(), Some(Op::Alt)) {
            self.operands.push(Regex::epsilon());
        }
        while let Some(op) = self.ops.last().copied() {
            if matches!(op, Op::Group(_)) {
                return Err(self.err("unclosed group"));
            }
            self.apply_top();
        }
        match self.operands.len() {
            0 => Ok(Regex::epsilon()),
            1 => Ok(self.operands.pop().expect("one operand")),
            _ => unreachable!("operand stack imbalance"),
        }
    }

    /// Insert an implicit concatenation operator if the previous token
    /// produced an operand.
    fn push_concat(&mut self) {
        if self.after_operand {
            while self.ops.last().map_or(false, |op| op.prec() >= Op::Cat.prec()) {
                self.apply_top();
            }
            self.ops.push(Op::Cat);
        }
    }

    /// Pop the top operator and combine the two top operands,
    /// flattening into an existing bare `Cat`/`Alt` node.
    fn apply_top(&mut self) {
        let op = self.ops.pop().expect("operator to apply");
        let rhs = self.operands.pop().expect("rhs operand");
        let lhs = self.operands.pop().expect("lhs operand");
        let combined = match op {
            Op::Cat => match lhs {
                Regex {
                    node: Node::Cat(mut xs),
                    actions,
                    precond_enter: None,
                    precond_all: None,
                } if actions.is_empty() && !xs.is_empty() => {
                    xs.push(rhs);
                    Regex::cat(xs)
                }
                lhs => Regex::cat(vec![lhs, rhs]),
            },
            Op::Alt => match lhs {
                Regex {
                    node: Node::Alt(mut xs),
                    actions,
                    precond_enter: None,
                    precond_all: None,
                } if actions.is_empty() => {
                    xs.push(rhs);
                    Regex::alt(xs)
                }
                lhs => Regex::alt(vec![lhs, rhs]),
            },
            Op::Group(_) => unreachable!("group marker applied as operator"),
        };
        self.operands.push(combined);
    }

    fn close_group(&mut self) -> Result<(), CompileError> {
        if !self.after_operand && matches!(self.ops.last(), Some(Op::Alt)) {
            self.operands.push(Regex::epsilon());
        }
        loop {
            match self.ops.last().copied() {
                Some(Op::Group(depth)) => {
                    self.ops.pop();
                    if self.operands.len() == depth {
                        // An empty group `()` is epsilon.
                        self.operands.push(Regex::epsilon());
                    }
                    self.after_operand = true;
                    return Ok(());
                }
                Some(_) => self.apply_top(),
                None => return Err(self.err("unmatched `)`")),
            }
        }
    }

    /// Parse a single operand token: a literal, `.`, an escape, or a
    /// character class.
    fn operand(&mut self) -> Result<Regex, CompileError> {
        let (_, c) = self.chars.next().expect("operand start");
        match c {
            '.' => Ok(Regex::any()),
            '[' => self.class(),
            ']' => Err(self.err("unmatched `]`")),
            '\\' => Ok(Regex::byte(self.escape()?)),
            c if c.is_ascii() => Ok(Regex::byte(c as u8)),
            // Multi-byte characters match their UTF-8 byte sequence.
            c => Ok(Regex::char(c)),
        }
    }

    /// Parse the remainder of an escape sequence (after `\`), yielding
    /// the denoted byte.
    fn escape(&mut self) -> Result<u8, CompileError> {
        let (_, c) = match self.chars.next() {
            Some(ic) => ic,
            None => return Err(self.err("trailing `\\`")),
        };
        match c {
            'a' => Ok(0x07),
            'b' => Ok(0x08),
            't' => Ok(b'\t'),
            'n' => Ok(b'\n'),
            'v' => Ok(0x0b),
            'f' => Ok(0x0c),
            'r' => Ok(b'\r'),
            '0' => Ok(0x00),
            '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '\\' | '|' | '-' | '^' => Ok(c as u8),
            'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                Ok(hi * 16 + lo)
            }
            'u' | 'U' => Err(self.err("unicode escapes are not supported")),
            c => Err(self.err(format!("invalid escape `\\{}`", c))),
        }
    }

    fn hex_digit(&mut self) -> Result<u8, CompileError> {
        match self.chars.next() {
            Some((_, c)) => c
                .to_digit(16)
                .map(|d| d as u8)
                .ok_or_else(|| self.err(format!("invalid hex digit `{}`", c))),
            None => Err(self.err("truncated `\\x` escape")),
        }
    }

    /// Parse a `[...]` or `[^...]` class (the `[` is already consumed).
    fn class(&mut self) -> Result<Regex, CompileError> {
        let negated = matches!(self.chars.peek(), Some(&(_, '^')));
        if negated {
            self.chars.next();
        }
        let mut items = Vec::new();
        loop {
            let c = match self.chars.peek() {
                Some(&(_, c)) => c,
                None => return Err(self.err("unclosed character class")),
            };
            if c == ']' {
                self.chars.next();
                break;
            }
            let lo = self.class_byte()?;
            // `a-z` range, unless `-` is the last character of the class.
            if matches!(self.chars.peek(), Some(&(_, '-'))) {
                let mut ahead = self.chars.clone();
                ahead.next();
                if !matches!(ahead.peek(), Some(&(_, ']')) | None) {
                    self.chars.next();
                    let hi = self.class_byte()?;
                    if lo > hi {
                        return Err(self.err("invalid range in character class"));
                    }
                    items.push(ClassItem::Range(lo, hi));
                    continue;
                }
            }
            items.push(ClassItem::Byte(lo));
        }
        if items.is_empty() {
            return Err(self.err("empty character class"));
        }
        Ok(Regex::new(if negated {
            Node::CClass(items)
        } else {
            Node::Class(items)
        }))
    }

    /// A single byte inside a class: a literal ASCII character or an
    /// escape.  Classes operate on bytes, so multi-byte characters are
    /// rejected.
    fn class_byte(&mut self) -> Result<u8, CompileError> {
        let (_, c) = self.chars.next().expect("class item start");
        match c {
            '\\' => self.escape(),
            c if c.is_ascii() => Ok(c as u8),
            c => Err(self.err(format!(
                "multi-byte character `{}` in class; classes operate on bytes",
                c
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
