use super::ast::ANON_FUNCTION_NAME;
use super::backend::{Backend, Interpreter};
use super::codegen::{CodeGen, PrototypeCache};
use super::config::{Config, ErrorPolicy};
use super::error::Error;
use super::parser::{Parser, PrecedenceTable};
use super::token::Token;
use log::debug;

/// Result of one top-level statement.
#[derive(Debug)]
pub enum Outcome {
    /// A function was compiled and its unit handed to the engine.
    Defined(String),
    Declared(String),
    Evaluated(f64),
    /// Only produced under [`ErrorPolicy::Recover`].
    Failed(Error),
}

/// Compilation-unit manager.
///
/// Every definition is compiled into the current unit, which is then
/// finalized and replaced by a fresh one. Top-level expressions get a unit of
/// their own that is unloaded as soon as it has run. The precedence table and
/// prototype cache outlive units.
pub struct Session<B: Backend> {
    backend: B,
    precedence: PrecedenceTable,
    prototypes: PrototypeCache,
    config: Config,
}

impl Session<Interpreter> {
    pub fn interpreter(config: Config) -> Self {
        Session::new(Interpreter::with_max_call_depth(config.max_call_depth), config)
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Session {
            backend,
            precedence: PrecedenceTable::default(),
            prototypes: PrototypeCache::new(),
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn precedence(&self) -> &PrecedenceTable {
        &self.precedence
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs every statement in `source`, collecting the outcomes.
    pub fn run(&mut self, source: &str) -> Result<Vec<Outcome>, Error> {
        let mut outcomes = Vec::new();
        self.run_with(source, |outcome| outcomes.push(outcome))?;
        Ok(outcomes)
    }

    /// Like [`Session::run`], but hands each outcome to `f` as soon as the
    /// statement has been processed.
    pub fn run_with<F>(&mut self, source: &str, mut f: F) -> Result<(), Error>
    where
        F: FnMut(Outcome),
    {
        let mut parser = Parser::new(source);
        loop {
            let step = match parser.current() {
                Token::Eof => return Ok(()),
                Token::Kwd(';') => parser.advance().map(|()| None),
                Token::Def => self.handle_definition(&mut parser).map(Some),
                Token::Extern => self.handle_extern(&mut parser).map(Some),
                _ => self.handle_top_level_expression(&mut parser).map(Some),
            };
            match step {
                Ok(Some(outcome)) => f(outcome),
                Ok(None) => {}
                Err(e) => match self.config.error_policy {
                    ErrorPolicy::Recover => {
                        debug!("recovering from: {}", e);
                        f(Outcome::Failed(e));
                    }
                    ErrorPolicy::Abort => return Err(e),
                },
            }
        }
    }

    /// Whether `source` ends in the middle of a statement. Only parses;
    /// nothing is generated. A statement that fails before the end of input
    /// counts as complete so that running it reports the error.
    pub fn is_incomplete(&self, source: &str) -> bool {
        let mut parser = Parser::new(source);
        loop {
            let parsed = match parser.current() {
                Token::Eof => return false,
                Token::Kwd(';') => parser.advance(),
                Token::Def => parser.parse_definition(&self.precedence).map(drop),
                Token::Extern => parser.parse_extern().map(drop),
                _ => parser
                    .parse_top_level_expression(&self.precedence)
                    .map(drop),
            };
            if parsed.is_err() {
                return *parser.current() == Token::Eof;
            }
        }
    }

    fn handle_definition(&mut self, parser: &mut Parser) -> Result<Outcome, Error> {
        let func = parser
            .parse_definition(&self.precedence)
            .map_err(|e| parser.abandon(e))?;
        let function = self.codegen().codegen_function(&func)?;
        self.dump(function);
        self.backend.submit_unit()?;
        debug!("finalized unit defining '{}'", func.proto.name);
        Ok(Outcome::Defined(func.proto.name))
    }

    fn handle_extern(&mut self, parser: &mut Parser) -> Result<Outcome, Error> {
        let proto = parser.parse_extern().map_err(|e| parser.abandon(e))?;
        let function = self.codegen().codegen_proto(&proto)?;
        self.dump(function);
        Ok(Outcome::Declared(proto.name))
    }

    fn handle_top_level_expression(&mut self, parser: &mut Parser) -> Result<Outcome, Error> {
        let func = parser
            .parse_top_level_expression(&self.precedence)
            .map_err(|e| parser.abandon(e))?;
        let function = self.codegen().codegen_function(&func)?;
        self.dump(function);

        let unit = self.backend.submit_unit()?;
        let result = self.backend.run_function(&unit, ANON_FUNCTION_NAME);
        // The unit goes away whether or not it ran.
        self.backend.remove_unit(unit)?;
        let value = result?;
        debug!("evaluated to {}", value);
        Ok(Outcome::Evaluated(value))
    }

    fn codegen(&mut self) -> CodeGen<'_, B> {
        CodeGen::new(&mut self.backend, &mut self.prototypes, &mut self.precedence)
    }

    fn dump(&self, function: B::Function) {
        let ir = self.backend.print_function(function);
        debug!("generated:\n{}", ir);
        if self.config.dump_ir {
            eprint!("{}", ir);
        }
    }
}
