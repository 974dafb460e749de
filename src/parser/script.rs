//! T-SQL batch parsing
//!
//! sqlparser handles individual statements; this layer handles what sits
//! between them: variable declarations and assignment, IF/WHILE, blocks,
//! TRY/CATCH, labels and GOTO, THROW, PRINT and RETURN. Query hints in
//! `OPTION (...)` clauses are stripped from the token stream before parsing
//! and attached to the statement they were written in.

use crate::config::{QueryHints, MAX_RECURSION_LIMIT};
use crate::error::{QueryError, Result};
use crate::parser::ast::{SqlDataType, SqlExpr, Statement};
use crate::physical::SourceSpan;
use sqlparser::dialect::MsSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, TokenWithLocation, Tokenizer};
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub data_type: SqlDataType,
    pub initial: Option<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrowArgs {
    pub number: SqlExpr,
    pub message: SqlExpr,
    pub state: SqlExpr,
}

/// One statement of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptNode {
    Sql(Box<Statement>),
    Declare(Vec<Declaration>),
    SetVariable {
        name: String,
        value: SqlExpr,
    },
    If {
        condition: SqlExpr,
        then_branch: Box<ScriptStatement>,
        else_branch: Option<Box<ScriptStatement>>,
    },
    While {
        condition: SqlExpr,
        body: Box<ScriptStatement>,
    },
    Break,
    Continue,
    Block(Vec<ScriptStatement>),
    TryCatch {
        try_block: Vec<ScriptStatement>,
        catch_block: Vec<ScriptStatement>,
    },
    Label(String),
    Goto(String),
    /// `THROW` without arguments re-raises the current error
    Throw(Option<ThrowArgs>),
    Print(SqlExpr),
    Return,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStatement {
    pub node: ScriptNode,
    pub span: SourceSpan,
    pub hints: QueryHints,
}

/// Parse a batch of T-SQL statements
pub fn parse_script(sql: &str) -> Result<Vec<ScriptStatement>> {
    let dialect = MsSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize_with_location()?;
    let (tokens, hints) = extract_hints(tokens)?;
    let parser = Parser::new(&dialect).with_tokens_with_locations(tokens);
    let mut script = ScriptParser { parser, hints };
    let statements = script.parse_statements(&[])?;
    if !script.at_end() {
        let token = script.parser.peek_token();
        return Err(QueryError::Parse(format!(
            "Unexpected '{}' at line {}, column {}",
            token.token, token.location.line, token.location.column
        )));
    }
    Ok(statements)
}

/// `OPTION (...)` hints keyed by the position of the OPTION keyword
type HintList = Vec<((u64, u64), QueryHints)>;

fn is_word(token: &Token, word: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(word))
}

fn extract_hints(tokens: Vec<TokenWithLocation>) -> Result<(Vec<TokenWithLocation>, HintList)> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut hints = HintList::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_option = is_word(&tokens[i].token, "OPTION")
            && tokens[i + 1..]
                .iter()
                .find(|t| !matches!(t.token, Token::Whitespace(_)))
                .is_some_and(|t| t.token == Token::LParen);
        if !is_option {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        }

        let start = (tokens[i].location.line, tokens[i].location.column);
        let body: Vec<&Token> = tokens[i + 1..]
            .iter()
            .map(|t| &t.token)
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .skip(1)
            .take_while(|t| **t != Token::RParen)
            .collect();
        let close = tokens[i + 1..]
            .iter()
            .position(|t| t.token == Token::RParen)
            .ok_or_else(|| QueryError::Parse("Unterminated OPTION clause".into()))?;
        hints.push((start, parse_hints(&body)?));
        i += close + 2;
    }
    Ok((out, hints))
}

fn parse_hints(body: &[&Token]) -> Result<QueryHints> {
    let mut hints = QueryHints::default();
    for hint in body.split(|t| **t == Token::Comma) {
        match hint {
            [w, Token::Number(n, _)] if is_word(w, "MAXRECURSION") => {
                let value: u64 = n
                    .parse()
                    .map_err(|_| QueryError::Parse(format!("Invalid MAXRECURSION value {}", n)))?;
                if value > MAX_RECURSION_LIMIT as u64 {
                    return Err(QueryError::Structural(format!(
                        "The value {} specified for the MAXRECURSION option exceeds the allowed maximum of {}",
                        value, MAX_RECURSION_LIMIT
                    )));
                }
                hints.max_recursion = Some(value as u32);
            }
            [w] if is_word(w, "NO_PERFORMANCE_SPOOL") => hints.no_performance_spool = true,
            other => {
                let text: Vec<String> = other.iter().map(|t| t.to_string()).collect();
                return Err(QueryError::not_supported_with(
                    format!("OPTION ({})", text.join(" ")),
                    "Only the MAXRECURSION and NO_PERFORMANCE_SPOOL query hints are supported",
                ));
            }
        }
    }
    Ok(hints)
}

struct ScriptParser<'a> {
    parser: Parser<'a>,
    hints: HintList,
}

impl<'a> ScriptParser<'a> {
    fn at_end(&self) -> bool {
        self.parser.peek_token().token == Token::EOF
    }

    fn peek_word(&self, n: usize) -> Option<String> {
        match self.parser.peek_nth_token(n).token {
            Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn position(&self) -> (u64, u64) {
        let token = self.parser.peek_token();
        match token.token {
            Token::EOF => (u64::MAX, u64::MAX),
            _ => (token.location.line, token.location.column),
        }
    }

    fn span(&self) -> SourceSpan {
        let token = self.parser.peek_token();
        SourceSpan::new(token.location.line, token.location.column)
    }

    fn skip_semicolons(&mut self) {
        while self.parser.consume_token(&Token::SemiColon) {}
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.peek_word(0).as_deref() == Some(word) {
            self.parser.next_token();
            Ok(())
        } else {
            Err(QueryError::Parse(format!(
                "Expected {}, found '{}'",
                word,
                self.parser.peek_token().token
            )))
        }
    }

    fn next_name(&mut self, what: &str) -> Result<String> {
        match self.parser.next_token().token {
            Token::Word(w) => Ok(w.value),
            other => Err(QueryError::Parse(format!(
                "Expected {}, found '{}'",
                what, other
            ))),
        }
    }

    /// Parse statements until EOF or one of the terminator word pairs
    fn parse_statements(&mut self, terminators: &[[&str; 2]]) -> Result<Vec<ScriptStatement>> {
        let mut statements = vec![];
        loop {
            self.skip_semicolons();
            if self.at_end() {
                break;
            }
            let first = self.peek_word(0);
            let second = self.peek_word(1);
            let stop = terminators.iter().any(|[a, b]| {
                first.as_deref() == Some(*a) && (b.is_empty() || second.as_deref() == Some(*b))
            });
            if stop {
                break;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<ScriptStatement> {
        let span = self.span();
        let word = self.peek_word(0);

        // `name:` declares a label
        if word.is_some() && self.parser.peek_nth_token(1).token == Token::Colon {
            let name = self.next_name("label")?;
            self.parser.next_token();
            return Ok(self.statement(ScriptNode::Label(name), span));
        }

        let node = match word.as_deref() {
            Some("DECLARE") => {
                self.parser.next_token();
                ScriptNode::Declare(self.parse_declarations()?)
            }
            Some("SET") if self.parser_peek_is_variable(1) => {
                self.parser.next_token();
                let name = self.next_name("variable")?;
                self.parser.expect_token(&Token::Eq)?;
                let value = self.parser.parse_expr()?;
                ScriptNode::SetVariable { name, value }
            }
            Some("IF") => {
                self.parser.next_token();
                let condition = self.parser.parse_expr()?;
                let then_branch = Box::new(self.parse_statement()?);
                self.skip_semicolons();
                let else_branch = if self.peek_word(0).as_deref() == Some("ELSE") {
                    self.parser.next_token();
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                ScriptNode::If {
                    condition,
                    then_branch,
                    else_branch,
                }
            }
            Some("WHILE") => {
                self.parser.next_token();
                let condition = self.parser.parse_expr()?;
                let body = Box::new(self.parse_statement()?);
                ScriptNode::While { condition, body }
            }
            Some("BREAK") => {
                self.parser.next_token();
                ScriptNode::Break
            }
            Some("CONTINUE") => {
                self.parser.next_token();
                ScriptNode::Continue
            }
            Some("BEGIN") => self.parse_begin()?,
            Some("GOTO") => {
                self.parser.next_token();
                ScriptNode::Goto(self.next_name("label")?)
            }
            Some("THROW") => {
                self.parser.next_token();
                let bare = matches!(self.parser.peek_token().token, Token::SemiColon | Token::EOF)
                    || self.peek_word(0).as_deref() == Some("END");
                if bare {
                    ScriptNode::Throw(None)
                } else {
                    let number = self.parser.parse_expr()?;
                    self.parser.expect_token(&Token::Comma)?;
                    let message = self.parser.parse_expr()?;
                    self.parser.expect_token(&Token::Comma)?;
                    let state = self.parser.parse_expr()?;
                    ScriptNode::Throw(Some(ThrowArgs {
                        number,
                        message,
                        state,
                    }))
                }
            }
            Some("PRINT") => {
                self.parser.next_token();
                ScriptNode::Print(self.parser.parse_expr()?)
            }
            Some("RETURN") => {
                self.parser.next_token();
                ScriptNode::Return
            }
            _ => {
                let start = self.position();
                let statement = self.parser.parse_statement()?;
                let end = self.position();
                let mut hints = QueryHints::default();
                for (at, h) in &self.hints {
                    if *at >= start && *at < end {
                        hints.merge(h.clone());
                    }
                }
                trace!(line = span.line, "parsed SQL statement");
                return Ok(ScriptStatement {
                    node: ScriptNode::Sql(Box::new(statement)),
                    span,
                    hints,
                });
            }
        };
        Ok(self.statement(node, span))
    }

    fn statement(&self, node: ScriptNode, span: SourceSpan) -> ScriptStatement {
        ScriptStatement {
            node,
            span,
            hints: QueryHints::default(),
        }
    }

    fn parser_peek_is_variable(&self, n: usize) -> bool {
        matches!(&self.parser.peek_nth_token(n).token, Token::Word(w) if w.value.starts_with('@'))
    }

    fn parse_declarations(&mut self) -> Result<Vec<Declaration>> {
        let mut declarations = vec![];
        loop {
            let name = self.next_name("variable name")?;
            if !name.starts_with('@') {
                return Err(QueryError::Parse(format!(
                    "Variable names must start with '@', found '{}'",
                    name
                )));
            }
            if self.peek_word(0).as_deref() == Some("AS") {
                self.parser.next_token();
            }
            if self.peek_word(0).as_deref() == Some("TABLE") {
                return Err(QueryError::not_supported_with(
                    format!("DECLARE {} TABLE", name),
                    "Use a temporary table (CREATE TABLE #name) instead",
                ));
            }
            let data_type = self.parser.parse_data_type()?;
            let initial = if self.parser.consume_token(&Token::Eq) {
                Some(self.parser.parse_expr()?)
            } else {
                None
            };
            declarations.push(Declaration {
                name,
                data_type,
                initial,
            });
            if !self.parser.consume_token(&Token::Comma) {
                break;
            }
        }
        Ok(declarations)
    }

    fn parse_begin(&mut self) -> Result<ScriptNode> {
        match self.peek_word(1).as_deref() {
            Some("TRY") => {
                self.parser.next_token();
                self.parser.next_token();
                let try_block = self.parse_statements(&[["END", "TRY"]])?;
                self.expect_word("END")?;
                self.expect_word("TRY")?;
                self.skip_semicolons();
                self.expect_word("BEGIN")?;
                self.expect_word("CATCH")?;
                let catch_block = self.parse_statements(&[["END", "CATCH"]])?;
                self.expect_word("END")?;
                self.expect_word("CATCH")?;
                Ok(ScriptNode::TryCatch {
                    try_block,
                    catch_block,
                })
            }
            Some("TRAN") | Some("TRANSACTION") | Some("DISTRIBUTED") => {
                Err(QueryError::not_supported_with(
                    "BEGIN TRANSACTION",
                    "Each statement is sent to the backend as its own request",
                ))
            }
            _ => {
                self.parser.next_token();
                let statements = self.parse_statements(&[["END", ""]])?;
                self.expect_word("END")?;
                Ok(ScriptNode::Block(statements))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_statements_with_spans() {
        let script = parse_script("SELECT 1;\nSELECT 2").unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[1].span, SourceSpan::new(2, 1));
    }

    #[test]
    fn test_declare_and_set() {
        let script = parse_script("DECLARE @x INT = 1, @y NVARCHAR(10); SET @x = @x + 1").unwrap();
        match &script[0].node {
            ScriptNode::Declare(decls) => {
                assert_eq!(decls.len(), 2);
                assert_eq!(decls[0].name, "@x");
                assert!(decls[0].initial.is_some());
                assert!(decls[1].initial.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&script[1].node, ScriptNode::SetVariable { name, .. } if name == "@x"));
    }

    #[test]
    fn test_if_else_and_while() {
        let sql = "IF @x > 1 BEGIN PRINT 'big' END ELSE PRINT 'small'; WHILE @x < 10 BEGIN SET @x = @x + 1; IF @x = 5 BREAK; END";
        let script = parse_script(sql).unwrap();
        assert_eq!(script.len(), 2);
        match &script[0].node {
            ScriptNode::If { else_branch, .. } => assert!(else_branch.is_some()),
            other => panic!("unexpected {:?}", other),
        }
        match &script[1].node {
            ScriptNode::While { body, .. } => match &body.node {
                ScriptNode::Block(stmts) => assert_eq!(stmts.len(), 2),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_and_throw() {
        let sql = "BEGIN TRY SELECT 1 END TRY BEGIN CATCH THROW; END CATCH; THROW 50000, 'oops', 1";
        let script = parse_script(sql).unwrap();
        match &script[0].node {
            ScriptNode::TryCatch {
                try_block,
                catch_block,
            } => {
                assert_eq!(try_block.len(), 1);
                assert!(matches!(catch_block[0].node, ScriptNode::Throw(None)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(script[1].node, ScriptNode::Throw(Some(_))));
    }

    #[test]
    fn test_labels_and_goto() {
        let script = parse_script("start: PRINT 'x'; GOTO start").unwrap();
        assert_eq!(script[0].node, ScriptNode::Label("start".into()));
        assert_eq!(script[2].node, ScriptNode::Goto("start".into()));
    }

    #[test]
    fn test_option_hints_attach_to_statement() {
        let sql = "SELECT 1 OPTION (MAXRECURSION 5, NO_PERFORMANCE_SPOOL); SELECT 2";
        let script = parse_script(sql).unwrap();
        assert_eq!(script[0].hints.max_recursion, Some(5));
        assert!(script[0].hints.no_performance_spool);
        assert_eq!(script[1].hints, QueryHints::default());
    }

    #[test]
    fn test_option_out_of_range_recursion() {
        let err = parse_script("SELECT 1 OPTION (MAXRECURSION 40000)").unwrap_err();
        assert!(matches!(err, QueryError::Structural(_)));
    }

    #[test]
    fn test_unknown_hint_not_supported() {
        let err = parse_script("SELECT 1 OPTION (RECOMPILE)").unwrap_err();
        assert!(matches!(err, QueryError::NotSupported { .. }));
    }
}
