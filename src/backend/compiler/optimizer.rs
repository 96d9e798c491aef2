// Constant folding (§4.7). A pure AST-to-AST pass: each expression is
// rewritten bottom-up, and any infix of two numeric or boolean literals, two
// string literals joined by `+`, or a prefix `-`/`!` on a literal is replaced
// by the literal node holding the computed value. Everything else is
// returned unchanged. Numeric folding follows the VM's own widening (§4.9):
// results stay plain `f64`, same as every other AST number literal.
use crate::frontend::parser::ast::{AssignTarget, BinOp, Expression, Literal, Program, Statement, UnOp};

pub fn optimize(program: Program) -> Program {
    Program { body: program.body.into_iter().map(fold_statement).collect() }
}

fn fold_statement(stmt: Statement) -> Statement {
    match stmt {
        Statement::ExprStatement(e) => Statement::ExprStatement(fold_expression(e)),
        Statement::VarDecl { names, values } => {
            Statement::VarDecl { names, values: values.into_iter().map(fold_expression).collect() }
        }
        Statement::Assign { target, value } => Statement::Assign { target: fold_target(target), value: fold_expression(value) },
        Statement::If { arms, else_branch } => Statement::If {
            arms: arms.into_iter().map(|(cond, body)| (fold_expression(cond), fold_block(body))).collect(),
            else_branch: else_branch.map(fold_block),
        },
        Statement::While { condition, body } => Statement::While { condition: fold_expression(condition), body: fold_block(body) },
        Statement::For { init, condition, update, body } => Statement::For {
            init: init.map(|s| Box::new(fold_statement(*s))),
            condition: condition.map(fold_expression),
            update: update.map(|s| Box::new(fold_statement(*s))),
            body: fold_block(body),
        },
        Statement::Foreach { var_name, source, body } => {
            Statement::Foreach { var_name, source: fold_expression(source), body: fold_block(body) }
        }
        Statement::Break | Statement::Continue => stmt,
        Statement::Return(expr) => Statement::Return(expr.map(fold_expression)),
        Statement::Block(stmts) => Statement::Block(fold_block(stmts)),
        Statement::Include(_) => stmt,
        Statement::Recover { err_name, body } => Statement::Recover { err_name, body: fold_block(body) },
    }
}

fn fold_block(stmts: Vec<Statement>) -> Vec<Statement> {
    stmts.into_iter().map(fold_statement).collect()
}

fn fold_target(target: AssignTarget) -> AssignTarget {
    match target {
        AssignTarget::Identifier(_) => target,
        AssignTarget::Index { collection, index } => AssignTarget::Index {
            collection: Box::new(fold_expression(*collection)),
            index: Box::new(fold_expression(*index)),
        },
    }
}

fn fold_expression(expr: Expression) -> Expression {
    match expr {
        Expression::Binary { left, operator, right } => {
            let left = fold_expression(*left);
            let right = fold_expression(*right);
            match fold_binary(&left, operator, &right) {
                Some(lit) => Expression::Literal(lit),
                None => Expression::Binary { left: Box::new(left), operator, right: Box::new(right) },
            }
        }
        Expression::Logical { left, operator, right } => {
            Expression::Logical { left: Box::new(fold_expression(*left)), operator, right: Box::new(fold_expression(*right)) }
        }
        Expression::Unary { operator, operand } => {
            let operand = fold_expression(*operand);
            match fold_unary(operator, &operand) {
                Some(lit) => Expression::Literal(lit),
                None => Expression::Unary { operator, operand: Box::new(operand) },
            }
        }
        Expression::Ternary { condition, then_branch, else_branch } => Expression::Ternary {
            condition: Box::new(fold_expression(*condition)),
            then_branch: Box::new(fold_expression(*then_branch)),
            else_branch: Box::new(fold_expression(*else_branch)),
        },
        Expression::Call { callee, arguments } => Expression::Call {
            callee: Box::new(fold_expression(*callee)),
            arguments: arguments.into_iter().map(fold_expression).collect(),
        },
        Expression::Index { collection, index } => {
            Expression::Index { collection: Box::new(fold_expression(*collection)), index: Box::new(fold_expression(*index)) }
        }
        Expression::Array(items) => Expression::Array(items.into_iter().map(fold_expression).collect()),
        Expression::MapLit(pairs) => {
            Expression::MapLit(pairs.into_iter().map(|(k, v)| (fold_expression(k), fold_expression(v))).collect())
        }
        Expression::FunctionLit { name, params, body } => Expression::FunctionLit { name, params, body: fold_block(body) },
        Expression::PostfixIncDec { target, operator } => Expression::PostfixIncDec { target: fold_target(target), operator },
        Expression::Assign { target, value } => {
            Expression::Assign { target: Box::new(fold_target(*target)), value: Box::new(fold_expression(*value)) }
        }
        Expression::Identifier(_) | Expression::Literal(_) => expr,
    }
}

fn fold_binary(left: &Expression, op: BinOp, right: &Expression) -> Option<Literal> {
    match (as_literal(left)?, as_literal(right)?) {
        (Literal::Number(a), Literal::Number(b)) => fold_numeric(a, op, b),
        (Literal::Boolean(a), Literal::Boolean(b)) => match op {
            BinOp::Eq => Some(Literal::Boolean(a == b)),
            BinOp::Neq => Some(Literal::Boolean(a != b)),
            _ => None,
        },
        (Literal::String(a), Literal::String(b)) if op == BinOp::Add => Some(Literal::String(format!("{a}{b}"))),
        _ => None,
    }
}

/// Mirrors `dispatch::arithmetic::to_i32`'s ECMAScript-style `ToInt32`: a
/// non-finite operand (NaN or either infinity) truncates to 0 rather than
/// wrapping, so folding agrees with the VM's own runtime evaluation.
fn to_int32(f: f64) -> i32 {
    if f.is_finite() { f as i64 as i32 } else { 0 }
}

fn fold_numeric(a: f64, op: BinOp, b: f64) -> Option<Literal> {
    match op {
        BinOp::Add => Some(Literal::Number(a + b)),
        BinOp::Sub => Some(Literal::Number(a - b)),
        BinOp::Mul => Some(Literal::Number(a * b)),
        BinOp::Div if b != 0.0 => Some(Literal::Number(a / b)),
        BinOp::Mod if b != 0.0 => Some(Literal::Number(a % b)),
        BinOp::Div | BinOp::Mod => None, // leave division/modulo by zero for the VM to raise
        BinOp::BitOr => Some(Literal::Number((to_int32(a) | to_int32(b)) as f64)),
        BinOp::BitXor => Some(Literal::Number((to_int32(a) ^ to_int32(b)) as f64)),
        BinOp::BitAnd => Some(Literal::Number((to_int32(a) & to_int32(b)) as f64)),
        BinOp::LShift => Some(Literal::Number(to_int32(a).wrapping_shl(to_int32(b) as u32) as f64)),
        BinOp::RShift => Some(Literal::Number(to_int32(a).wrapping_shr(to_int32(b) as u32) as f64)),
        BinOp::Eq => Some(Literal::Boolean(a == b)),
        BinOp::Neq => Some(Literal::Boolean(a != b)),
        BinOp::Lt => Some(Literal::Boolean(a < b)),
        BinOp::Leq => Some(Literal::Boolean(a <= b)),
        BinOp::Gt => Some(Literal::Boolean(a > b)),
        BinOp::Geq => Some(Literal::Boolean(a >= b)),
    }
}

fn fold_unary(op: UnOp, operand: &Expression) -> Option<Literal> {
    match (op, as_literal(operand)?) {
        (UnOp::Neg, Literal::Number(n)) => Some(Literal::Number(-n)),
        (UnOp::Not, Literal::Boolean(b)) => Some(Literal::Boolean(!b)),
        _ => None,
    }
}

fn as_literal(expr: &Expression) -> Option<Literal> {
    match expr {
        Expression::Literal(lit) => Some(lit.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::ast::Expression as E;

    fn num(n: f64) -> Expression {
        E::Literal(Literal::Number(n))
    }

    #[test]
    fn folds_numeric_addition() {
        let expr = E::Binary { left: Box::new(num(1.0)), operator: BinOp::Add, right: Box::new(num(2.0)) };
        assert_eq!(fold_expression(expr), E::Literal(Literal::Number(3.0)));
    }

    #[test]
    fn folds_nested_arithmetic() {
        let inner = E::Binary { left: Box::new(num(2.0)), operator: BinOp::Mul, right: Box::new(num(3.0)) };
        let outer = E::Binary { left: Box::new(num(1.0)), operator: BinOp::Add, right: Box::new(inner) };
        assert_eq!(fold_expression(outer), E::Literal(Literal::Number(7.0)));
    }

    #[test]
    fn folds_string_concatenation() {
        let expr = E::Binary {
            left: Box::new(E::Literal(Literal::String("foo".into()))),
            operator: BinOp::Add,
            right: Box::new(E::Literal(Literal::String("bar".into()))),
        };
        assert_eq!(fold_expression(expr), E::Literal(Literal::String("foobar".into())));
    }

    #[test]
    fn folds_unary_negation() {
        let expr = E::Unary { operator: UnOp::Neg, operand: Box::new(num(5.0)) };
        assert_eq!(fold_expression(expr), E::Literal(Literal::Number(-5.0)));
    }

    #[test]
    fn leaves_division_by_zero_unfolded() {
        let expr = E::Binary { left: Box::new(num(1.0)), operator: BinOp::Div, right: Box::new(num(0.0)) };
        assert!(matches!(fold_expression(expr), E::Binary { .. }));
    }

    #[test]
    fn leaves_non_literal_operands_unfolded() {
        let expr = E::Binary { left: Box::new(E::Identifier("x".into())), operator: BinOp::Add, right: Box::new(num(1.0)) };
        assert!(matches!(fold_expression(expr), E::Binary { .. }));
    }
}
