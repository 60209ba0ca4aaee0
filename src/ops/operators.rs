//! Built-in operator kernels.
//!
//! Kernels are pure cell-wise functions; alignment happens in the cube
//! plumbing and type promotion in the interpreter, so a kernel never sees
//! a missing left operand. Boolean results are encoded as 1.0 / 0.0.

use std::sync::Arc;

use crate::core::registry::{Operator, OperatorKernel};
use crate::core::types;

fn truthy(v: f64) -> bool {
    v.is_finite() && v != 0.0
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn unary(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> OperatorKernel {
    OperatorKernel::Unary(Arc::new(f))
}

fn binary(f: impl Fn(f64, f64) -> f64 + Send + Sync + 'static) -> OperatorKernel {
    OperatorKernel::Binary(Arc::new(f))
}

fn membership(f: impl Fn(f64, &[f64]) -> f64 + Send + Sync + 'static) -> OperatorKernel {
    OperatorKernel::Membership(Arc::new(f))
}

/// The built-in operator catalog, in registration order.
pub fn builtin_operators() -> Vec<(&'static str, Operator)> {
    vec![
        // -- Boolean operators --
        (
            "not",
            Operator::new(types::boolean_unary(), unary(|x| bool_value(x == 0.0))),
        ),
        (
            "and",
            Operator::new(
                types::boolean_binary(),
                binary(|x, y| bool_value(truthy(x) && truthy(y))),
            ),
        ),
        (
            "or",
            Operator::new(
                types::boolean_binary(),
                binary(|x, y| bool_value(truthy(x) || truthy(y))),
            ),
        ),
        (
            "exclusive_or",
            Operator::new(
                types::boolean_binary(),
                binary(|x, y| bool_value(truthy(x) != truthy(y))),
            ),
        ),
        // -- Algebraic operators --
        ("add", Operator::new(types::algebraic_binary(), binary(|x, y| x + y))),
        ("subtract", Operator::new(types::algebraic_binary(), binary(|x, y| x - y))),
        ("multiply", Operator::new(types::algebraic_binary(), binary(|x, y| x * y))),
        ("divide", Operator::new(types::algebraic_binary(), binary(|x, y| x / y))),
        ("power", Operator::new(types::algebraic_binary(), binary(f64::powf))),
        ("absolute", Operator::new(types::absolute_manual(), unary(f64::abs))),
        ("square_root", Operator::new(types::algebraic_unary(), unary(f64::sqrt))),
        ("cube_root", Operator::new(types::algebraic_unary(), unary(f64::cbrt))),
        ("natural_logarithm", Operator::new(types::algebraic_unary(), unary(f64::ln))),
        ("exponential", Operator::new(types::algebraic_unary(), unary(f64::exp))),
        // -- Equality operators --
        ("equal", Operator::new(types::equality(), binary(|x, y| bool_value(x == y)))),
        (
            "not_equal",
            Operator::new(
                types::equality(),
                binary(|x, y| bool_value(y.is_finite() && x != y)),
            ),
        ),
        (
            "in",
            Operator::new(
                types::equality(),
                membership(|x, ys| bool_value(ys.contains(&x))),
            ),
        ),
        (
            "not_in",
            Operator::new(
                types::equality(),
                membership(|x, ys| bool_value(!ys.contains(&x))),
            ),
        ),
        // -- Relational operators --
        ("greater", Operator::new(types::relational(), binary(|x, y| bool_value(x > y)))),
        (
            "greater_equal",
            Operator::new(types::relational(), binary(|x, y| bool_value(x >= y))),
        ),
        ("less", Operator::new(types::relational(), binary(|x, y| bool_value(x < y)))),
        (
            "less_equal",
            Operator::new(types::relational(), binary(|x, y| bool_value(x <= y))),
        ),
        // -- Assignment --
        ("assign", Operator::new(types::assign_manual(), binary(|_, y| y))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel2(name: &str) -> Arc<dyn Fn(f64, f64) -> f64 + Send + Sync> {
        for (n, op) in builtin_operators() {
            if n == name {
                if let OperatorKernel::Binary(f) = op.kernel {
                    return f;
                }
            }
        }
        panic!("no binary kernel named '{name}'");
    }

    #[test]
    fn test_boolean_kernels_ignore_missing_rhs() {
        let and = kernel2("and");
        assert_eq!(and(1.0, 1.0), 1.0);
        assert_eq!(and(1.0, 0.0), 0.0);
        assert_eq!(and(1.0, f64::NAN), 0.0);
        let or = kernel2("or");
        assert_eq!(or(0.0, f64::NAN), 0.0);
        assert_eq!(or(0.0, 2.0), 1.0);
    }

    #[test]
    fn test_comparisons_with_missing_rhs_are_false() {
        let eq = kernel2("equal");
        assert_eq!(eq(1.0, f64::NAN), 0.0);
        let gt = kernel2("greater");
        assert_eq!(gt(1.0, f64::NAN), 0.0);
        let ne = kernel2("not_equal");
        assert_eq!(ne(1.0, f64::NAN), 0.0);
    }

    #[test]
    fn test_arithmetic_propagates_missing_rhs() {
        let add = kernel2("add");
        assert!(add(1.0, f64::NAN).is_nan());
        assert_eq!(add(1.0, 2.0), 3.0);
    }

    #[test]
    fn test_membership() {
        for (n, op) in builtin_operators() {
            if n == "in" {
                if let OperatorKernel::Membership(f) = op.kernel {
                    assert_eq!(f(2.0, &[1.0, 2.0]), 1.0);
                    assert_eq!(f(3.0, &[1.0, 2.0]), 0.0);
                    return;
                }
            }
        }
        panic!("missing 'in' operator");
    }

    #[test]
    fn test_assign_returns_replacement() {
        let assign = kernel2("assign");
        assert_eq!(assign(5.0, 9.0), 9.0);
    }
}
