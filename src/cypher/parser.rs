//! Recursive-descent parser, one method per grammar production.

use crate::error::{NornicError, Result};
use crate::model::{PropertyValue, ValueKind};

use super::ast::*;
use super::lexer::{lex, Token};

pub fn parse(input: &str) -> Result<Statement> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.parse_statement()?;
    if !parser.at_end() {
        return Err(parser.unexpected("end of statement"));
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{token:?}")))
        }
    }

    fn unexpected(&self, wanted: &str) -> NornicError {
        match self.peek() {
            Some(token) => NornicError::Syntax(format!("expected {wanted}, found {token:?}")),
            None => NornicError::Syntax(format!("expected {wanted}, found end of input")),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            // Soft keywords usable as identifiers in property/name position.
            Some(Token::Key) => Ok("key".into()),
            Some(Token::Node) => Ok("node".into()),
            Some(Token::Index) => Ok("index".into()),
            other => Err(NornicError::Syntax(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Create), Some(Token::Constraint)) => self.parse_create_constraint(),
            (Some(Token::Drop), Some(Token::Constraint)) => {
                self.pos += 2;
                let name = self.ident()?;
                if self.eat(&Token::If) {
                    self.expect(Token::Exists)?;
                }
                Ok(Statement::DropConstraint { name })
            }
            _ => Ok(Statement::Query(self.parse_query()?)),
        }
    }

    fn parse_query(&mut self) -> Result<Query> {
        let mut clauses = Vec::new();
        while let Some(token) = self.peek() {
            let clause = match token {
                Token::Match => self.parse_match()?,
                Token::Where => {
                    self.pos += 1;
                    Clause::Where(self.parse_expr()?)
                }
                Token::Create => self.parse_create()?,
                Token::Merge => {
                    self.pos += 1;
                    Clause::Merge {
                        pattern: self.parse_pattern()?,
                    }
                }
                Token::Set => self.parse_set()?,
                Token::Remove => self.parse_remove()?,
                Token::Delete | Token::Detach => self.parse_delete()?,
                Token::Return => self.parse_return()?,
                Token::Call => self.parse_call()?,
                _ => return Err(self.unexpected("a clause keyword")),
            };
            clauses.push(clause);
        }
        if clauses.is_empty() {
            return Err(NornicError::Syntax("empty statement".into()));
        }
        Ok(Query { clauses })
    }

    fn parse_match(&mut self) -> Result<Clause> {
        self.expect(Token::Match)?;
        let mut patterns = vec![self.parse_pattern()?];
        while self.eat(&Token::Comma) {
            patterns.push(self.parse_pattern()?);
        }
        Ok(Clause::Match { patterns })
    }

    fn parse_create(&mut self) -> Result<Clause> {
        self.expect(Token::Create)?;
        let mut patterns = vec![self.parse_pattern()?];
        while self.eat(&Token::Comma) {
            patterns.push(self.parse_pattern()?);
        }
        Ok(Clause::Create { patterns })
    }

    fn parse_set(&mut self) -> Result<Clause> {
        self.expect(Token::Set)?;
        let mut items = vec![self.parse_set_item()?];
        while self.eat(&Token::Comma) {
            items.push(self.parse_set_item()?);
        }
        Ok(Clause::Set(items))
    }

    fn parse_set_item(&mut self) -> Result<SetItem> {
        let var = self.ident()?;
        if self.eat(&Token::Colon) {
            let label = self.ident()?;
            return Ok(SetItem::Label { var, label });
        }
        self.expect(Token::Dot)?;
        let key = self.ident()?;
        self.expect(Token::Eq)?;
        let value = self.parse_expr()?;
        Ok(SetItem::Property { var, key, value })
    }

    fn parse_remove(&mut self) -> Result<Clause> {
        self.expect(Token::Remove)?;
        let mut items = vec![self.parse_remove_item()?];
        while self.eat(&Token::Comma) {
            items.push(self.parse_remove_item()?);
        }
        Ok(Clause::Remove(items))
    }

    fn parse_remove_item(&mut self) -> Result<RemoveItem> {
        let var = self.ident()?;
        if self.eat(&Token::Colon) {
            let label = self.ident()?;
            return Ok(RemoveItem::Label { var, label });
        }
        self.expect(Token::Dot)?;
        let key = self.ident()?;
        Ok(RemoveItem::Property { var, key })
    }

    fn parse_delete(&mut self) -> Result<Clause> {
        let detach = self.eat(&Token::Detach);
        self.expect(Token::Delete)?;
        let mut exprs = vec![self.parse_expr()?];
        while self.eat(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        Ok(Clause::Delete { detach, exprs })
    }

    fn parse_return(&mut self) -> Result<Clause> {
        self.expect(Token::Return)?;
        let distinct = self.eat(&Token::Distinct);
        let mut items = vec![self.parse_return_item()?];
        while self.eat(&Token::Comma) {
            items.push(self.parse_return_item()?);
        }
        let limit = if self.eat(&Token::Limit) {
            match self.next() {
                Some(Token::Integer(n)) if n >= 0 => Some(n as usize),
                other => {
                    return Err(NornicError::Syntax(format!(
                        "LIMIT expects a non-negative integer, found {other:?}"
                    )))
                }
            }
        } else {
            None
        };
        Ok(Clause::Return {
            items,
            distinct,
            limit,
        })
    }

    fn parse_return_item(&mut self) -> Result<ReturnItem> {
        let expr = self.parse_expr()?;
        let alias = if self.eat(&Token::As) {
            Some(self.ident()?)
        } else {
            None
        };
        Ok(ReturnItem { expr, alias })
    }

    fn parse_call(&mut self) -> Result<Clause> {
        self.expect(Token::Call)?;
        let mut name = self.ident()?;
        while self.eat(&Token::Dot) {
            name.push('.');
            name.push_str(&self.ident()?);
        }
        let mut args = Vec::new();
        if self.eat(&Token::LParen) {
            if !self.eat(&Token::RParen) {
                args.push(self.parse_expr()?);
                while self.eat(&Token::Comma) {
                    args.push(self.parse_expr()?);
                }
                self.expect(Token::RParen)?;
            }
        }
        let mut yields = Vec::new();
        if self.eat(&Token::Yield) {
            yields.push(self.ident()?);
            while self.eat(&Token::Comma) {
                yields.push(self.ident()?);
            }
        }
        Ok(Clause::Call {
            procedure: name,
            args,
            yields,
        })
    }

    fn parse_pattern(&mut self) -> Result<Pattern> {
        let start = self.parse_node_pattern()?;
        let hop = match self.peek() {
            Some(Token::Minus | Token::ArrowLeft) => {
                let (rel, end) = self.parse_hop()?;
                Some((rel, end))
            }
            _ => None,
        };
        Ok(Pattern { start, hop })
    }

    fn parse_node_pattern(&mut self) -> Result<NodePattern> {
        self.expect(Token::LParen)?;
        let mut pattern = NodePattern::default();
        if let Some(Token::Ident(_)) = self.peek() {
            pattern.var = Some(self.ident()?);
        }
        while self.eat(&Token::Colon) {
            pattern.labels.push(self.ident()?);
        }
        if self.peek() == Some(&Token::LBrace) {
            pattern.props = self.parse_property_map()?;
        }
        self.expect(Token::RParen)?;
        Ok(pattern)
    }

    /// Parses `-[r:T]->`, `<-[r:T]-` or `-[r:T]-` followed by the far node.
    fn parse_hop(&mut self) -> Result<(RelPattern, NodePattern)> {
        let leading_left = self.eat(&Token::ArrowLeft);
        if !leading_left {
            self.expect(Token::Minus)?;
        }
        let mut rel = RelPattern {
            var: None,
            rel_type: None,
            props: Vec::new(),
            direction: RelDir::Undirected,
        };
        if self.eat(&Token::LBracket) {
            if let Some(Token::Ident(_)) = self.peek() {
                rel.var = Some(self.ident()?);
            }
            if self.eat(&Token::Colon) {
                rel.rel_type = Some(self.ident()?);
            }
            if self.peek() == Some(&Token::LBrace) {
                rel.props = self.parse_property_map()?;
            }
            self.expect(Token::RBracket)?;
        }
        let trailing_right = if self.eat(&Token::ArrowRight) {
            true
        } else {
            self.expect(Token::Minus)?;
            false
        };
        rel.direction = match (leading_left, trailing_right) {
            (true, false) => RelDir::In,
            (false, true) => RelDir::Out,
            (false, false) => RelDir::Undirected,
            (true, true) => {
                return Err(NornicError::Syntax(
                    "relationship cannot point both ways".into(),
                ))
            }
        };
        let end = self.parse_node_pattern()?;
        Ok((rel, end))
    }

    fn parse_property_map(&mut self) -> Result<Vec<(String, Expr)>> {
        self.expect(Token::LBrace)?;
        let mut props = Vec::new();
        if !self.eat(&Token::RBrace) {
            loop {
                let key = self.ident()?;
                self.expect(Token::Colon)?;
                let value = self.parse_expr()?;
                props.push((key, value));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RBrace)?;
        }
        Ok(props)
    }

    // Expression precedence: OR < AND < NOT < comparison < unary < primary.
    fn parse_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Neq) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                self.expect(Token::Null)?;
                return Ok(Expr::IsNull(Box::new(left), negated));
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let mut base = match self.next() {
            Some(Token::Integer(n)) => Expr::Literal(PropertyValue::Int(n)),
            Some(Token::Float(f)) => Expr::Literal(PropertyValue::Float(f)),
            Some(Token::Str(s)) => Expr::Literal(PropertyValue::String(s)),
            Some(Token::True) => Expr::Literal(PropertyValue::Bool(true)),
            Some(Token::False) => Expr::Literal(PropertyValue::Bool(false)),
            Some(Token::Null) => Expr::Literal(PropertyValue::Null),
            Some(Token::Param(name)) => Expr::Param(name),
            Some(Token::Minus) => match self.next() {
                Some(Token::Integer(n)) => Expr::Literal(PropertyValue::Int(-n)),
                Some(Token::Float(f)) => Expr::Literal(PropertyValue::Float(-f)),
                other => {
                    return Err(NornicError::Syntax(format!(
                        "expected number after '-', found {other:?}"
                    )))
                }
            },
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                inner
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        match self.parse_expr()? {
                            Expr::Literal(value) => items.push(value),
                            _ => {
                                return Err(NornicError::Syntax(
                                    "list literals may only contain scalars".into(),
                                ))
                            }
                        }
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                Expr::Literal(PropertyValue::List(items))
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.parse_fn_call(name)?
                } else {
                    Expr::Var(name)
                }
            }
            other => {
                return Err(NornicError::Syntax(format!(
                    "expected expression, found {other:?}"
                )))
            }
        };
        while self.eat(&Token::Dot) {
            let key = self.ident()?;
            base = Expr::Property(Box::new(base), key);
        }
        Ok(base)
    }

    fn parse_fn_call(&mut self, name: String) -> Result<Expr> {
        self.expect(Token::LParen)?;
        if self.eat(&Token::Star) {
            self.expect(Token::RParen)?;
            return Ok(Expr::FnCall {
                name,
                args: Vec::new(),
                star: true,
            });
        }
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            args.push(self.parse_expr()?);
            while self.eat(&Token::Comma) {
                args.push(self.parse_expr()?);
            }
            self.expect(Token::RParen)?;
        }
        Ok(Expr::FnCall {
            name,
            args,
            star: false,
        })
    }

    fn parse_create_constraint(&mut self) -> Result<Statement> {
        self.expect(Token::Create)?;
        self.expect(Token::Constraint)?;
        let name = if let Some(Token::Ident(_)) = self.peek() {
            Some(self.ident()?)
        } else {
            None
        };
        let mut if_not_exists = false;
        if self.eat(&Token::If) {
            self.expect(Token::Not)?;
            self.expect(Token::Exists)?;
            if_not_exists = true;
        }
        self.expect(Token::For)?;

        // `(n:Label)` or `()-[r:TYPE]-()`
        let (var, label, on_relationship) = self.parse_constraint_target()?;
        self.expect(Token::Require)?;

        let mut properties = Vec::new();
        let grouped = self.eat(&Token::LParen);
        loop {
            let prop_var = self.ident()?;
            if prop_var != var {
                return Err(NornicError::Syntax(format!(
                    "unknown variable {prop_var} in REQUIRE"
                )));
            }
            self.expect(Token::Dot)?;
            properties.push(self.ident()?);
            if !(grouped && self.eat(&Token::Comma)) {
                break;
            }
        }
        if grouped {
            self.expect(Token::RParen)?;
        }

        self.expect(Token::Is)?;
        let flavor = if self.eat(&Token::Unique) {
            ConstraintFlavor::Unique
        } else if self.eat(&Token::Node) {
            self.expect(Token::Key)?;
            ConstraintFlavor::NodeKey
        } else if self.eat(&Token::Not) {
            self.expect(Token::Null)?;
            ConstraintFlavor::Exists
        } else if self.eat(&Token::DoubleColon) {
            let type_name = self.ident()?;
            let kind = ValueKind::parse(&type_name).ok_or_else(|| {
                NornicError::Syntax(format!("unknown property type {type_name}"))
            })?;
            ConstraintFlavor::PropType(kind)
        } else {
            return Err(self.unexpected("UNIQUE, NODE KEY, NOT NULL or :: TYPE"));
        };

        Ok(Statement::CreateConstraint {
            name,
            if_not_exists,
            def: ConstraintDef {
                label,
                properties,
                on_relationship,
                flavor,
            },
        })
    }

    fn parse_constraint_target(&mut self) -> Result<(String, String, bool)> {
        self.expect(Token::LParen)?;
        // Relationship target starts with an empty node `()`.
        if self.eat(&Token::RParen) {
            if !self.eat(&Token::Minus) && !self.eat(&Token::ArrowLeft) {
                return Err(self.unexpected("-[r:TYPE]-"));
            }
            self.expect(Token::LBracket)?;
            let var = self.ident()?;
            self.expect(Token::Colon)?;
            let rel_type = self.ident()?;
            self.expect(Token::RBracket)?;
            if !self.eat(&Token::ArrowRight) {
                self.expect(Token::Minus)?;
            }
            self.expect(Token::LParen)?;
            self.expect(Token::RParen)?;
            return Ok((var, rel_type, true));
        }
        let var = self.ident()?;
        self.expect(Token::Colon)?;
        let label = self.ident()?;
        self.expect(Token::RParen)?;
        Ok((var, label, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_return() {
        let stmt = parse("CREATE (n:Person {email: 'a@x'}) RETURN n").unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        assert_eq!(query.clauses.len(), 2);
        assert!(matches!(query.clauses[0], Clause::Create { .. }));
    }

    #[test]
    fn parses_match_where_return_with_alias() {
        let stmt =
            parse("MATCH (n:Person) WHERE n.age >= 21 AND NOT n.banned RETURN n.name AS name LIMIT 5")
                .unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        assert!(matches!(query.clauses[1], Clause::Where(_)));
        let Clause::Return {
            items,
            distinct,
            limit,
        } = &query.clauses[2]
        else {
            panic!("expected return");
        };
        assert_eq!(items[0].column_name(), "name");
        assert!(!distinct);
        assert_eq!(*limit, Some(5));
    }

    #[test]
    fn parses_return_distinct() {
        let stmt = parse("MATCH (n:Person) RETURN DISTINCT n.city AS city").unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        let Clause::Return { distinct, .. } = &query.clauses[1] else {
            panic!("expected return");
        };
        assert!(*distinct);
    }

    #[test]
    fn parses_relationship_patterns() {
        let stmt = parse("MATCH (a:User)-[r:KNOWS]->(b:User) RETURN a, b").unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        let Clause::Match { patterns } = &query.clauses[0] else {
            panic!("expected match");
        };
        let (rel, _) = patterns[0].hop.as_ref().unwrap();
        assert_eq!(rel.rel_type.as_deref(), Some("KNOWS"));
        assert_eq!(rel.direction, RelDir::Out);
    }

    #[test]
    fn parses_unique_constraint() {
        let stmt =
            parse("CREATE CONSTRAINT user_email FOR (n:User) REQUIRE n.email IS UNIQUE").unwrap();
        let Statement::CreateConstraint { name, def, .. } = stmt else {
            panic!("expected constraint");
        };
        assert_eq!(name.as_deref(), Some("user_email"));
        assert_eq!(def.label, "User");
        assert_eq!(def.flavor, ConstraintFlavor::Unique);
    }

    #[test]
    fn parses_node_key_constraint() {
        let stmt = parse(
            "CREATE CONSTRAINT user_key FOR (u:User) REQUIRE (u.username, u.domain) IS NODE KEY",
        )
        .unwrap();
        let Statement::CreateConstraint { def, .. } = stmt else {
            panic!("expected constraint");
        };
        assert_eq!(def.properties, vec!["username", "domain"]);
        assert_eq!(def.flavor, ConstraintFlavor::NodeKey);
    }

    #[test]
    fn parses_call_with_yield() {
        let stmt = parse("CALL db.index.vector.queryNodes('embeddings', 5, $vec) YIELD node, score")
            .unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        let Clause::Call {
            procedure,
            args,
            yields,
        } = &query.clauses[0]
        else {
            panic!("expected call");
        };
        assert_eq!(procedure, "db.index.vector.queryNodes");
        assert_eq!(args.len(), 3);
        assert_eq!(yields, &["node", "score"]);
    }

    #[test]
    fn rejects_unsupported_grammar() {
        assert!(parse("MATCH (n) UNION MATCH (m) RETURN m").is_err());
        assert!(parse("FOREACH (x IN [1,2] | SET n.k = x)").is_err());
        assert!(matches!(
            parse("MATCH (n RETURN n"),
            Err(NornicError::Syntax(_))
        ));
    }

    #[test]
    fn detach_delete_flag_is_captured() {
        let stmt = parse("MATCH (n:Temp) DETACH DELETE n").unwrap();
        let Statement::Query(query) = stmt else {
            panic!("expected query");
        };
        assert!(matches!(
            query.clauses[1],
            Clause::Delete { detach: true, .. }
        ));
    }
}
