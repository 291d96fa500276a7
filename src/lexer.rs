use super::error::{Error, ErrorKind};
use super::token::Token;
use combine::error::{ParseError, StreamError};
use combine::parser::char::{digit, space};
use combine::parser::choice::or;
use combine::parser::Parser;
use combine::stream::{Stream, StreamErrorFor};
use combine::{any, choice, eof, many, many1, satisfy, skip_many, token};
use log::trace;

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.'))))
        .and_then(|ns: String| ns.parse::<f64>().map_err(StreamErrorFor::<Input>::other))
        .map(Token::Number)
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        satisfy(|c: char| c.is_ascii_alphabetic()),
        many(satisfy(|c: char| c.is_ascii_alphanumeric())),
    )
        .map(|(first, rest): (char, String)| {
            let mut id = String::with_capacity(rest.len() + 1);
            id.push(first);
            id.push_str(&rest);
            Token::keyword(&id).unwrap_or(Token::Ident(id))
        })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        token('#'),
        skip_many(satisfy(|c: char| c != '\n' && c != '\r')),
    )
        .map(|_| ())
}

/// Whitespace and comments between tokens.
fn trivia<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(or(space().map(|_| ()), comment()))
}

fn lexeme<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((
        number(),
        ident(),
        eof().map(|_| Token::Eof),
        any().map(Token::Kwd),
    ))
}

/// Pulls tokens one at a time out of a source string.
///
/// The lexer never rewinds. A malformed numeric literal is skipped as a whole
/// and reported as [`ErrorKind::InvalidNumber`]; the next call resumes after it.
pub struct Lexer<'a> {
    input: &'a str,
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, rest: input }
    }

    /// Byte offset of the next unread character.
    pub fn offset(&self) -> usize {
        self.input.len() - self.rest.len()
    }

    pub fn next_token(&mut self) -> Result<Token, Error> {
        if let Ok(((), rest)) = trivia().parse(self.rest) {
            self.rest = rest;
        }

        match lexeme().parse(self.rest) {
            Ok((token, rest)) => {
                trace!("lexed {} at offset {}", token, self.offset());
                self.rest = rest;
                Ok(token)
            }
            Err(_) => {
                let offset = self.offset();
                let literal = self.skip_malformed();
                Err(Error::from(ErrorKind::InvalidNumber { literal, offset }))
            }
        }
    }

    // Only a numeric run can fail to lex: every other character is a token.
    fn skip_malformed(&mut self) -> String {
        let mut len = self
            .rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or_else(|| self.rest.len());
        if len == 0 {
            len = self.rest.chars().next().map_or(0, char::len_utf8);
        }
        let (literal, rest) = self.rest.split_at(len);
        self.rest = rest;
        literal.to_owned()
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(Token::Eof) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::token::Token::*;
    use super::*;
    use combine::parser::EasyParser;

    fn lex_tokens(s: &str) -> Vec<Token> {
        Lexer::new(s).map(|t| t.unwrap()).collect()
    }

    #[test]
    fn test_number() {
        assert_eq!(number().easy_parse("1.0").map(|x| x.0), Ok(Number(1.0)));
        assert_eq!(number().easy_parse(".5").map(|x| x.0), Ok(Number(0.5)));
        assert!(number().easy_parse("1.2.3").is_err());
    }

    #[test]
    fn test_ident() {
        assert_eq!(
            ident().easy_parse("test").map(|x| x.0),
            Ok(Ident("test".to_owned()))
        );
        assert_eq!(
            ident().easy_parse("x1y2").map(|x| x.0),
            Ok(Ident("x1y2".to_owned()))
        );

        assert_eq!(ident().easy_parse("def").map(|x| x.0), Ok(Def));
        assert_eq!(ident().easy_parse("binary").map(|x| x.0), Ok(Binary));
    }

    #[test]
    fn test_comment() {
        assert_eq!(comment().easy_parse("#hoge").map(|x| x.0), Ok(()));
        assert_eq!(
            comment().easy_parse("# hoge\nrest").map(|x| x.1),
            Ok("\nrest")
        );
    }

    #[test]
    fn test_lex() {
        assert_eq!(
            lex_tokens(
                r#"#comment
1.0
"#
            ),
            vec![Number(1.0)]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            lex_tokens("def extern if then else for in var unary binary"),
            vec![Def, Extern, If, Then, Else, For, In, Var, Unary, Binary]
        );
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            lex_tokens("foo(y, 4.0) < 2;"),
            vec![
                Ident("foo".to_owned()),
                Kwd('('),
                Ident("y".to_owned()),
                Kwd(','),
                Number(4.0),
                Kwd(')'),
                Kwd('<'),
                Number(2.0),
                Kwd(';'),
            ]
        );
    }

    #[test]
    fn test_digit_then_letters_splits() {
        assert_eq!(
            lex_tokens("2x"),
            vec![Number(2.0), Ident("x".to_owned())]
        );
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut lexer = Lexer::new("  # only a comment");
        assert_eq!(lexer.next_token().unwrap(), Eof);
        assert_eq!(lexer.next_token().unwrap(), Eof);
    }

    #[test]
    fn test_malformed_number() {
        let mut lexer = Lexer::new("x 1.2.3 + 4");
        assert_eq!(lexer.next_token().unwrap(), Ident("x".to_owned()));

        let err = lexer.next_token().unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::InvalidNumber {
                literal: "1.2.3".to_owned(),
                offset: 2,
            }
        );

        assert_eq!(lexer.next_token().unwrap(), Kwd('+'));
        assert_eq!(lexer.next_token().unwrap(), Number(4.0));
        assert_eq!(lexer.next_token().unwrap(), Eof);
    }
}
