// Token definitions for Glimmer source.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Errno,
    Eof,

    Ident(String),
    NumLit(f64),
    StrLit(String),

    Assign,

    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    Bang,

    Pipe,
    Caret,
    Amp,
    LShift,
    RShift,

    Eq,
    Neq,
    Lt,
    Gt,
    Leq,
    Geq,
    AndAnd,
    OrOr,

    PlusPlus,
    MinusMinus,

    Question,
    Colon,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    Comma,
    Dot,
    Semicolon,

    KwVar,
    KwFunction,
    KwIf,
    KwElif,
    KwElse,
    KwWhile,
    KwFor,
    KwForeach,
    KwIn,
    KwBreak,
    KwContinue,
    KwReturn,
    KwInclude,
    KwRecover,
    KwTrue,
    KwFalse,
    KwNull,
}
