use crate::storage::value::Value;
use crate::types::{Result, StoreError};

/// Arithmetic operator of a combine mutation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArithOp {
    /// Checked addition.
    Add,
    /// Checked subtraction.
    Sub,
    /// Checked multiplication.
    Mul,
    /// Checked division; zero divisors are rejected.
    Div,
    /// Checked remainder; zero divisors are rejected.
    Rem,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Left shift.
    Shl,
    /// Right shift; logical when the slot carries the unsigned flag.
    Shr,
}

impl ArithOp {
    fn is_bitwise(self) -> bool {
        matches!(self, ArithOp::And | ArithOp::Or | ArithOp::Xor | ArithOp::Shl | ArithOp::Shr)
    }
}

const OVERFLOW: StoreError = StoreError::Invalid("arithmetic overflow");
const DIV_ZERO: StoreError = StoreError::Invalid("division by zero");
const MISMATCH: StoreError = StoreError::Invalid("operand type does not match value");

fn shift_amount(b: i128) -> Result<u32> {
    if (0..64).contains(&b) {
        Ok(b as u32)
    } else {
        Err(StoreError::Invalid("shift amount out of range"))
    }
}

fn int(a: i64, op: ArithOp, b: i64, unsigned: bool) -> Result<i64> {
    match op {
        ArithOp::Add => a.checked_add(b).ok_or(OVERFLOW),
        ArithOp::Sub => a.checked_sub(b).ok_or(OVERFLOW),
        ArithOp::Mul => a.checked_mul(b).ok_or(OVERFLOW),
        ArithOp::Div if b == 0 => Err(DIV_ZERO),
        ArithOp::Div => a.checked_div(b).ok_or(OVERFLOW),
        ArithOp::Rem if b == 0 => Err(DIV_ZERO),
        ArithOp::Rem => a.checked_rem(b).ok_or(OVERFLOW),
        ArithOp::And => Ok(a & b),
        ArithOp::Or => Ok(a | b),
        ArithOp::Xor => Ok(a ^ b),
        ArithOp::Shl => Ok(a << shift_amount(b as i128)?),
        ArithOp::Shr if unsigned => Ok(((a as u64) >> shift_amount(b as i128)?) as i64),
        ArithOp::Shr => Ok(a >> shift_amount(b as i128)?),
    }
}

fn uint(a: u64, op: ArithOp, b: u64) -> Result<u64> {
    match op {
        ArithOp::Add => a.checked_add(b).ok_or(OVERFLOW),
        ArithOp::Sub => a.checked_sub(b).ok_or(OVERFLOW),
        ArithOp::Mul => a.checked_mul(b).ok_or(OVERFLOW),
        ArithOp::Div => a.checked_div(b).ok_or(DIV_ZERO),
        ArithOp::Rem => a.checked_rem(b).ok_or(DIV_ZERO),
        ArithOp::And => Ok(a & b),
        ArithOp::Or => Ok(a | b),
        ArithOp::Xor => Ok(a ^ b),
        ArithOp::Shl => Ok(a << shift_amount(b as i128)?),
        ArithOp::Shr => Ok(a >> shift_amount(b as i128)?),
    }
}

fn float(a: f64, op: ArithOp, b: f64) -> Result<f64> {
    match op {
        ArithOp::Add => Ok(a + b),
        ArithOp::Sub => Ok(a - b),
        ArithOp::Mul => Ok(a * b),
        ArithOp::Div if b == 0.0 => Err(DIV_ZERO),
        ArithOp::Div => Ok(a / b),
        ArithOp::Rem if b == 0.0 => Err(DIV_ZERO),
        ArithOp::Rem => Ok(a % b),
        _ => Err(StoreError::Invalid("bitwise operator on float")),
    }
}

fn as_i64(v: &Value) -> Result<i64> {
    match *v {
        Value::Int(b) => Ok(b),
        Value::UInt(b) => i64::try_from(b).map_err(|_| OVERFLOW),
        _ => Err(MISMATCH),
    }
}

fn as_u64(v: &Value) -> Result<u64> {
    match *v {
        Value::UInt(b) => Ok(b),
        Value::Int(b) => u64::try_from(b).map_err(|_| OVERFLOW),
        _ => Err(MISMATCH),
    }
}

/// Decodes `current`, applies `op` with `operand`, and returns the value to
/// re-encode. `unsigned` selects the logical right shift for signed values.
pub(crate) fn combine(current: &Value, op: ArithOp, operand: &Value, unsigned: bool) -> Result<Value> {
    match current {
        Value::Int(a) => int(*a, op, as_i64(operand)?, unsigned).map(Value::Int),
        Value::UInt(a) => uint(*a, op, as_u64(operand)?).map(Value::UInt),
        Value::Float(a) => {
            let b = match *operand {
                Value::Float(b) => b,
                Value::Int(b) => b as f64,
                Value::UInt(b) => b as f64,
                _ => return Err(MISMATCH),
            };
            float(*a, op, b).map(Value::Float)
        }
        Value::Date(a) | Value::DateTime(a) => {
            if !matches!(op, ArithOp::Add | ArithOp::Sub) {
                return Err(StoreError::Invalid("only add and sub apply to dates"));
            }
            let v = int(*a, op, as_i64(operand)?, false)?;
            Ok(match current {
                Value::Date(_) => Value::Date(v),
                _ => Value::DateTime(v),
            })
        }
        _ if op.is_bitwise() => Err(StoreError::Invalid("bitwise operator on non-integer")),
        _ => Err(StoreError::Invalid("value is not numeric")),
    }
}
