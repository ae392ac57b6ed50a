//! Lexer for the small string languages embedded in netlist fields
//!
//! Several netlist values are strings with their own syntax:
//! - Program operands: `$loop_count`, `4`, `true`
//! - Tile dimensions: `32x32`, `1x32`
//! - Relative fused-op buffer names: `input0`, `intermed2`, `dest`, `output`
//! - Per-input op keys: `input_0_tms`, `input_1_pad`, `input_2_unpad`

use logos::Logos;

/// Token types for netlist value strings
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Var(String),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[token("true", ignore(ascii_case))]
    True,

    #[token("false", ignore(ascii_case))]
    False,

    #[regex(r"[0-9]+x[0-9]+", parse_tile_dim)]
    TileDim((u32, u32)),

    #[regex(r"input[0-9]+", |lex| lex.slice()[5..].parse::<usize>().ok())]
    Input(usize),

    #[regex(r"intermed[0-9]+", |lex| lex.slice()[8..].parse::<usize>().ok())]
    Intermed(usize),

    #[token("dest")]
    Dest,

    #[token("output")]
    Output,

    #[regex(r"input_[0-9]+_tms", |lex| input_field_index(lex.slice()))]
    InputTms(usize),

    #[regex(r"input_[0-9]+_pad", |lex| input_field_index(lex.slice()))]
    InputPad(usize),

    #[regex(r"input_[0-9]+_unpad", |lex| input_field_index(lex.slice()))]
    InputUnpad(usize),
}

fn parse_tile_dim(lex: &mut logos::Lexer<Token>) -> Option<(u32, u32)> {
    let (h, w) = lex.slice().split_once('x')?;
    Some((h.parse().ok()?, w.parse().ok()?))
}

fn input_field_index(slice: &str) -> Option<usize> {
    slice.split('_').nth(1)?.parse().ok()
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Var(name) => write!(f, "{}", name),
            Token::Int(n) => write!(f, "{}", n),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::TileDim((h, w)) => write!(f, "{}x{}", h, w),
            Token::Input(i) => write!(f, "input{}", i),
            Token::Intermed(i) => write!(f, "intermed{}", i),
            Token::Dest => write!(f, "dest"),
            Token::Output => write!(f, "output"),
            Token::InputTms(i) => write!(f, "input_{}_tms", i),
            Token::InputPad(i) => write!(f, "input_{}_pad", i),
            Token::InputUnpad(i) => write!(f, "input_{}_unpad", i),
        }
    }
}

/// Lexer wrapper that provides a stream of tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<Result<Token, ()>>>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&Result<Token, ()>> {
        let inner = &mut self.inner;
        self.peeked.get_or_insert_with(|| inner.next()).as_ref()
    }

    /// True once every token has been consumed
    pub fn is_exhausted(&mut self) -> bool {
        self.peek().is_none()
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<Token, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(peeked) = self.peeked.take() {
            peeked
        } else {
            self.inner.next()
        }
    }
}

/// Lex `source` as exactly one token, or `None` if it is anything else
pub fn single_token(source: &str) -> Option<Token> {
    let mut lexer = Lexer::new(source);
    let token = lexer.next()?.ok()?;
    if lexer.is_exhausted() {
        Some(token)
    } else {
        None
    }
}
