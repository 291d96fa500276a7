use super::ast::{Expr, Function, Prototype, PrototypeKind, ANON_FUNCTION_NAME};
use super::error::{Error, ErrorKind};
use super::lexer::Lexer;
use super::token::Token;
use log::{debug, warn};
use std::collections::HashMap;

/// Precedence given to `binary OP` prototypes that do not spell one out.
pub const DEFAULT_BINARY_PRECEDENCE: i32 = 30;

/// Binding strength of binary operators; higher binds tighter.
///
/// Seeded with the built-in operators and extended whenever a `binary`
/// operator definition is generated successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecedenceTable {
    table: HashMap<char, i32>,
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        let table = [('=', 2), ('<', 10), ('+', 20), ('-', 20), ('*', 40), ('/', 40)]
            .iter()
            .cloned()
            .collect();
        PrecedenceTable { table }
    }
}

impl PrecedenceTable {
    pub fn get(&self, op: char) -> Option<i32> {
        self.table.get(&op).cloned()
    }

    /// Installs or overwrites an operator, returning the previous precedence.
    pub fn insert(&mut self, op: char, precedence: i32) -> Option<i32> {
        self.table.insert(op, precedence)
    }
}

/// Recursive-descent parser pulling tokens from a [`Lexer`] on demand.
///
/// A fresh parser sits on a `;` separator so the first real token is read
/// by whoever drives it, typically [`Parser::advance`].
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(source),
            current: Token::Kwd(';'),
        }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn advance(&mut self) -> Result<(), Error> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    /// Gives up on the current statement: discards one token and hands the
    /// original error back.
    pub fn abandon(&mut self, error: Error) -> Error {
        if let Err(skipped) = self.advance() {
            warn!("while recovering from '{}': {}", error, skipped);
        }
        error
    }

    /// definition ::= 'def' prototype expression
    pub fn parse_definition(&mut self, prec: &PrecedenceTable) -> Result<Function, Error> {
        self.advance()?;
        let proto = self.parse_prototype()?;
        let body = self.parse_expression(prec)?;
        debug!("parsed definition of '{}'", proto.name);
        Ok(Function::new(proto, body))
    }

    /// external ::= 'extern' prototype
    pub fn parse_extern(&mut self) -> Result<Prototype, Error> {
        self.advance()?;
        let proto = self.parse_prototype()?;
        debug!("parsed extern '{}'", proto.name);
        Ok(proto)
    }

    /// toplevelexpr ::= expression
    pub fn parse_top_level_expression(
        &mut self,
        prec: &PrecedenceTable,
    ) -> Result<Function, Error> {
        let body = self.parse_expression(prec)?;
        debug!("parsed a top-level expression");
        Ok(Function::new(
            Prototype::new(ANON_FUNCTION_NAME, vec![]),
            body,
        ))
    }

    /// expression ::= unary binoprhs
    pub fn parse_expression(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        let lhs = self.parse_unary(prec)?;
        self.parse_bin_op_rhs(prec, 0, lhs)
    }

    /// prototype
    ///   ::= id '(' id* ')'
    ///   ::= 'unary' op '(' id ')'
    ///   ::= 'binary' op number? '(' id id ')'
    fn parse_prototype(&mut self) -> Result<Prototype, Error> {
        let (name, kind) = match self.current {
            Token::Ident(_) => {
                let name = self.identifier("function name in prototype")?;
                (name, PrototypeKind::Function)
            }
            Token::Unary => {
                self.advance()?;
                let op = self.operator("unary operator")?;
                (format!("unary{}", op), PrototypeKind::Unary(op))
            }
            Token::Binary => {
                self.advance()?;
                let op = self.operator("binary operator")?;
                let precedence = match self.current {
                    Token::Number(n) => {
                        if !(1.0..=100.0).contains(&n) {
                            return Err(Error::from(ErrorKind::InvalidPrecedence(n)));
                        }
                        self.advance()?;
                        n as i32
                    }
                    _ => DEFAULT_BINARY_PRECEDENCE,
                };
                (format!("binary{}", op), PrototypeKind::Binary { op, precedence })
            }
            _ => return Err(self.unexpected("function name in prototype")),
        };

        self.expect(Token::Kwd('('), "'(' in prototype")?;
        let mut params = Vec::new();
        while let Token::Ident(id) = &self.current {
            params.push(id.clone());
            self.advance()?;
        }
        self.expect(Token::Kwd(')'), "')' in prototype")?;

        if let Some(expected) = kind.operands() {
            if params.len() != expected {
                return Err(Error::from(ErrorKind::OperatorArity {
                    name,
                    expected,
                    found: params.len(),
                }));
            }
        }

        Ok(Prototype { name, params, kind })
    }

    /// unary
    ///   ::= primary
    ///   ::= op unary
    fn parse_unary(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        match self.current {
            Token::Kwd(op) if op.is_ascii() && op != '(' && op != ',' => {
                self.advance()?;
                let operand = self.parse_unary(prec)?;
                Ok(Expr::Unary(op, Box::new(operand)))
            }
            _ => self.parse_primary(prec),
        }
    }

    /// binoprhs ::= (op unary)*
    ///
    /// Precedence climbing: operators binding looser than `expr_prec` are
    /// left for the caller.
    fn parse_bin_op_rhs(
        &mut self,
        prec: &PrecedenceTable,
        expr_prec: i32,
        mut lhs: Expr,
    ) -> Result<Expr, Error> {
        loop {
            let tok_prec = self.token_precedence(prec);
            if tok_prec < expr_prec {
                return Ok(lhs);
            }
            let op = match self.current {
                Token::Kwd(op) => op,
                _ => return Ok(lhs),
            };
            self.advance()?;

            let mut rhs = self.parse_unary(prec)?;
            if tok_prec < self.token_precedence(prec) {
                rhs = self.parse_bin_op_rhs(prec, tok_prec + 1, rhs)?;
            }
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_primary(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        match self.current {
            Token::Ident(_) => self.parse_identifier_expr(prec),
            Token::Number(n) => {
                self.advance()?;
                Ok(Expr::Number(n))
            }
            Token::Kwd('(') => self.parse_paren_expr(prec),
            Token::If => self.parse_if_expr(prec),
            Token::For => self.parse_for_expr(prec),
            Token::Var => self.parse_var_expr(prec),
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// parenexpr ::= '(' expression ')'
    fn parse_paren_expr(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        self.advance()?;
        let expr = self.parse_expression(prec)?;
        self.expect(Token::Kwd(')'), "')'")?;
        Ok(expr)
    }

    /// identifierexpr
    ///   ::= id
    ///   ::= id '(' (expression (',' expression)*)? ')'
    fn parse_identifier_expr(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        let name = self.identifier("identifier")?;
        if self.current != Token::Kwd('(') {
            return Ok(Expr::Variable(name));
        }
        self.advance()?;

        let mut args = Vec::new();
        if self.current != Token::Kwd(')') {
            loop {
                args.push(self.parse_expression(prec)?);
                match self.current {
                    Token::Kwd(')') => break,
                    Token::Kwd(',') => self.advance()?,
                    _ => return Err(self.unexpected("')' or ',' in argument list")),
                }
            }
        }
        self.advance()?;
        Ok(Expr::Call(name, args))
    }

    /// ifexpr ::= 'if' expression 'then' expression 'else' expression
    fn parse_if_expr(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        self.advance()?;
        let cond = self.parse_expression(prec)?;
        self.expect(Token::Then, "'then'")?;
        let then = self.parse_expression(prec)?;
        self.expect(Token::Else, "'else'")?;
        let otherwise = self.parse_expression(prec)?;
        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    /// forexpr ::= 'for' id '=' expression ',' expression (',' expression)? 'in' expression
    fn parse_for_expr(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        self.advance()?;
        let var = self.identifier("identifier after 'for'")?;
        self.expect(Token::Kwd('='), "'=' after for")?;
        let start = self.parse_expression(prec)?;
        self.expect(Token::Kwd(','), "',' after for start value")?;
        let end = self.parse_expression(prec)?;

        let step = if self.current == Token::Kwd(',') {
            self.advance()?;
            Some(Box::new(self.parse_expression(prec)?))
        } else {
            None
        };

        self.expect(Token::In, "'in' after for")?;
        let body = self.parse_expression(prec)?;
        Ok(Expr::For(
            var,
            Box::new(start),
            Box::new(end),
            step,
            Box::new(body),
        ))
    }

    /// varexpr ::= 'var' id ('=' expression)? (',' id ('=' expression)?)* 'in' expression
    fn parse_var_expr(&mut self, prec: &PrecedenceTable) -> Result<Expr, Error> {
        self.advance()?;
        let mut bindings = Vec::new();
        loop {
            let name = self.identifier("identifier after 'var'")?;
            let init = if self.current == Token::Kwd('=') {
                self.advance()?;
                Some(self.parse_expression(prec)?)
            } else {
                None
            };
            bindings.push((name, init));

            if self.current != Token::Kwd(',') {
                break;
            }
            self.advance()?;
        }

        self.expect(Token::In, "'in' after var")?;
        let body = self.parse_expression(prec)?;
        Ok(Expr::Var(bindings, Box::new(body)))
    }

    fn token_precedence(&self, prec: &PrecedenceTable) -> i32 {
        match self.current {
            Token::Kwd(op) if op.is_ascii() => prec.get(op).unwrap_or(-1),
            _ => -1,
        }
    }

    fn identifier(&mut self, expected: &str) -> Result<String, Error> {
        match &self.current {
            Token::Ident(id) => {
                let id = id.clone();
                self.advance()?;
                Ok(id)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn operator(&mut self, expected: &str) -> Result<char, Error> {
        match self.current {
            Token::Kwd(op) if op.is_ascii() => {
                self.advance()?;
                Ok(op)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<(), Error> {
        if self.current == token {
            self.advance()
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::from(ErrorKind::UnexpectedToken {
            expected: expected.to_owned(),
            found: self.current.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser(s: &str) -> Parser<'_> {
        let mut parser = Parser::new(s);
        parser.advance().unwrap();
        parser
    }

    fn expr_with(s: &str, prec: &PrecedenceTable) -> Expr {
        parser(s).parse_expression(prec).unwrap()
    }

    fn expr(s: &str) -> Expr {
        expr_with(s, &PrecedenceTable::default())
    }

    fn definition(s: &str) -> Result<Function, Error> {
        parser(s).parse_definition(&PrecedenceTable::default())
    }

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Number(n))
    }

    fn var(id: &str) -> Box<Expr> {
        Box::new(Expr::Variable(id.to_owned()))
    }

    fn bin(op: char, lhs: Box<Expr>, rhs: Box<Expr>) -> Box<Expr> {
        Box::new(Expr::Binary(op, lhs, rhs))
    }

    #[test]
    fn test_primary() {
        assert_eq!(expr("1.0"), Expr::Number(1.0));
        assert_eq!(expr("y"), Expr::Variable("y".to_owned()));
        assert_eq!(expr("(y)"), Expr::Variable("y".to_owned()));
    }

    #[test]
    fn test_expr() {
        assert_eq!(expr("1 + 2"), *bin('+', num(1.0), num(2.0)));
        assert_eq!(
            expr("1 + 2 * 3"),
            *bin('+', num(1.0), bin('*', num(2.0), num(3.0)))
        );
        assert_eq!(
            expr("(1 + 2) * 3"),
            *bin('*', bin('+', num(1.0), num(2.0)), num(3.0))
        );
        assert_eq!(
            expr("a < b + c"),
            *bin('<', var("a"), bin('+', var("b"), var("c")))
        );
    }

    #[test]
    fn test_left_associative() {
        assert_eq!(
            expr("a - b - c"),
            *bin('-', bin('-', var("a"), var("b")), var("c"))
        );
        assert_eq!(
            expr("a / b * c"),
            *bin('*', bin('/', var("a"), var("b")), var("c"))
        );
    }

    #[test]
    fn test_tighter_follower_groups_right() {
        assert_eq!(
            expr("a + b * c - d"),
            *bin('-', bin('+', var("a"), bin('*', var("b"), var("c"))), var("d"))
        );
    }

    #[test]
    fn test_assignment() {
        assert_eq!(
            expr("x = y + 1"),
            *bin('=', var("x"), bin('+', var("y"), num(1.0)))
        );
    }

    #[test]
    fn test_unary() {
        assert_eq!(expr("-x"), Expr::Unary('-', var("x")));
        assert_eq!(
            expr("!-x"),
            Expr::Unary('!', Box::new(Expr::Unary('-', var("x"))))
        );
        assert_eq!(
            expr("a + -b"),
            *bin('+', var("a"), Box::new(Expr::Unary('-', var("b"))))
        );
    }

    #[test]
    fn test_user_operator_precedence() {
        let mut prec = PrecedenceTable::default();
        assert_eq!(prec.insert('^', 50), None);
        assert_eq!(
            expr_with("a + b ^ c", &prec),
            *bin('+', var("a"), bin('^', var("b"), var("c")))
        );

        prec.insert('^', 5);
        assert_eq!(
            expr_with("a + b ^ c", &prec),
            *bin('^', bin('+', var("a"), var("b")), var("c"))
        );
    }

    #[test]
    fn test_unknown_operator_ends_expression() {
        let mut p = parser("a ^ b");
        assert_eq!(
            p.parse_expression(&PrecedenceTable::default()).unwrap(),
            Expr::Variable("a".to_owned())
        );
        assert_eq!(p.current(), &Token::Kwd('^'));
    }

    #[test]
    fn test_call() {
        assert_eq!(
            expr("foo(y, 4.0)"),
            Expr::Call(
                "foo".to_owned(),
                vec![Expr::Variable("y".to_owned()), Expr::Number(4.0)]
            )
        );
        assert_eq!(expr("foo()"), Expr::Call("foo".to_owned(), vec![]));
    }

    #[test]
    fn test_if() {
        assert_eq!(
            expr("if x < 3 then 1 else 2"),
            Expr::If(bin('<', var("x"), num(3.0)), num(1.0), num(2.0))
        );
    }

    #[test]
    fn test_for() {
        assert_eq!(
            expr("for i=1, 3 in 3"),
            Expr::For("i".to_owned(), num(1.0), num(3.0), None, num(3.0))
        );

        assert_eq!(
            expr("for i=1, 3,2 in 3"),
            Expr::For("i".to_owned(), num(1.0), num(3.0), Some(num(2.0)), num(3.0))
        );
    }

    #[test]
    fn test_var() {
        assert_eq!(
            expr("var a = 1, b in a + b"),
            Expr::Var(
                vec![
                    ("a".to_owned(), Some(Expr::Number(1.0))),
                    ("b".to_owned(), None)
                ],
                bin('+', var("a"), var("b"))
            )
        );
    }

    #[test]
    fn test_prototype() {
        let mut p = parser("f()");
        assert_eq!(p.parse_prototype().unwrap(), Prototype::new("f", vec![]));

        let mut p = parser("extern sin(x)");
        assert_eq!(
            p.parse_extern().unwrap(),
            Prototype::new("sin", vec!["x".to_owned()])
        );
    }

    #[test]
    fn test_operator_prototypes() {
        let f = definition("def binary| 5 (a b) if a then 1 else b").unwrap();
        assert_eq!(
            f.proto,
            Prototype::binary('|', 5, "a".to_owned(), "b".to_owned())
        );
        assert_eq!(f.proto.name, "binary|");
        assert_eq!(f.proto.binary_precedence(), Some(('|', 5)));

        let f = definition("def binary& (a b) 0").unwrap();
        assert_eq!(
            f.proto.binary_precedence(),
            Some(('&', DEFAULT_BINARY_PRECEDENCE))
        );

        let f = definition("def unary!(v) if v then 0 else 1").unwrap();
        assert_eq!(f.proto, Prototype::unary('!', "v".to_owned()));
        assert_eq!(f.proto.binary_precedence(), None);
    }

    #[test]
    fn test_precedence_out_of_range() {
        for src in &["def binary% 0 (a b) a", "def binary% 101 (a b) a"] {
            match definition(src).unwrap_err().kind() {
                ErrorKind::InvalidPrecedence(_) => {}
                other => panic!("unexpected error {:?}", other),
            }
        }
        assert!(definition("def binary% 100 (a b) a").is_ok());
        assert!(definition("def binary% 1 (a b) a").is_ok());
    }

    #[test]
    fn test_operator_arity() {
        assert_eq!(
            definition("def binary% 5 (a) a").unwrap_err().kind(),
            &ErrorKind::OperatorArity {
                name: "binary%".to_owned(),
                expected: 2,
                found: 1,
            }
        );
        assert_eq!(
            definition("def unary-(a b) a").unwrap_err().kind(),
            &ErrorKind::OperatorArity {
                name: "unary-".to_owned(),
                expected: 1,
                found: 2,
            }
        );
    }

    #[test]
    fn test_top_level() {
        let f = parser("1 + x")
            .parse_top_level_expression(&PrecedenceTable::default())
            .unwrap();
        assert_eq!(f.proto, Prototype::new(ANON_FUNCTION_NAME, vec![]));
        assert_eq!(f.body, *bin('+', num(1.0), var("x")));
    }

    #[test]
    fn test_errors() {
        let prec = PrecedenceTable::default();
        match parser("(1 + 2").parse_expression(&prec).unwrap_err().kind() {
            ErrorKind::UnexpectedToken { expected, found } => {
                assert_eq!(expected, "')'");
                assert_eq!(found, "end of input");
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(parser("foo(1 2)").parse_expression(&prec).is_err());
        assert!(parser("if 1 then 2").parse_expression(&prec).is_err());
        assert!(parser("extern 1()").parse_extern().is_err());
        assert!(parser("def f(x").parse_definition(&prec).is_err());
    }

    #[test]
    fn test_abandon_skips_one_token() {
        let mut p = parser("def 1 ; 2");
        let err = p.parse_definition(&PrecedenceTable::default()).unwrap_err();
        assert_eq!(p.current(), &Token::Number(1.0));
        let err = p.abandon(err);
        assert!(err.to_string().contains("function name in prototype"));
        assert_eq!(p.current(), &Token::Kwd(';'));
    }
}
