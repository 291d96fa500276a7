use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Var,
    Unary,
    Binary,
    Ident(String),
    Number(f64),
    Kwd(char),
    Eof,
}

impl Token {
    pub(crate) fn keyword(id: &str) -> Option<Token> {
        let token = match id {
            "def" => Token::Def,
            "extern" => Token::Extern,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            "var" => Token::Var,
            "unary" => Token::Unary,
            "binary" => Token::Binary,
            _ => return None,
        };
        Some(token)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Def => write!(f, "'def'"),
            Token::Extern => write!(f, "'extern'"),
            Token::If => write!(f, "'if'"),
            Token::Then => write!(f, "'then'"),
            Token::Else => write!(f, "'else'"),
            Token::For => write!(f, "'for'"),
            Token::In => write!(f, "'in'"),
            Token::Var => write!(f, "'var'"),
            Token::Unary => write!(f, "'unary'"),
            Token::Binary => write!(f, "'binary'"),
            Token::Ident(id) => write!(f, "identifier '{}'", id),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Kwd(c) => write!(f, "'{}'", c),
            Token::Eof => write!(f, "end of input"),
        }
    }
}
