//! Arithmetic, comparison, string concatenation and the logical/bitwise
//! operator family.
//!
//! Integer arithmetic wraps (two's complement); division by zero aborts
//! the task. Array-flagged operands pop an array handle and fold its
//! elements before combining.

use crate::machine::ExecutionContext;
use crate::ops::{evaluate_operand, ArithmeticKind, ArithmeticOp, CompareKind, Op};
use crate::value::{ArrayHandle, RuntimeError, Value, VmType};

fn pop_array_elements(ctx: &mut ExecutionContext) -> Result<Vec<Value>, RuntimeError> {
    let handle = ArrayHandle(ctx.stack.pop_handle()?);
    let storage = ctx.program.arrays.get(handle)?;
    let elements = storage.elements.read().clone();
    Ok(elements)
}

fn fold_i32(kind: ArithmeticKind, values: &[i32]) -> Result<i32, RuntimeError> {
    let mut iter = values.iter().copied();
    let mut acc = match iter.next() {
        Some(first) => first,
        None => return Ok(if kind == ArithmeticKind::Multiply { 1 } else { 0 }),
    };
    for value in iter {
        acc = combine_i32(kind, acc, value)?;
    }
    Ok(acc)
}

fn combine_i32(kind: ArithmeticKind, a: i32, b: i32) -> Result<i32, RuntimeError> {
    Ok(match kind {
        ArithmeticKind::Add => a.wrapping_add(b),
        ArithmeticKind::Subtract => a.wrapping_sub(b),
        ArithmeticKind::Multiply => a.wrapping_mul(b),
        ArithmeticKind::Divide => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
    })
}

fn combine_i16(kind: ArithmeticKind, a: i16, b: i16) -> Result<i16, RuntimeError> {
    Ok(match kind {
        ArithmeticKind::Add => a.wrapping_add(b),
        ArithmeticKind::Subtract => a.wrapping_sub(b),
        ArithmeticKind::Multiply => a.wrapping_mul(b),
        ArithmeticKind::Divide => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
    })
}

fn combine_real(kind: ArithmeticKind, a: f32, b: f32) -> f32 {
    match kind {
        ArithmeticKind::Add => a + b,
        ArithmeticKind::Subtract => a - b,
        ArithmeticKind::Multiply => a * b,
        ArithmeticKind::Divide => a / b,
    }
}

fn i32_operand(
    ctx: &mut ExecutionContext,
    kind: ArithmeticKind,
    is_array: bool,
) -> Result<i32, RuntimeError> {
    if is_array {
        let elements = pop_array_elements(ctx)?;
        let values: Result<Vec<i32>, _> = elements.iter().map(|v| v.as_i32()).collect();
        fold_i32(kind, &values?)
    } else {
        ctx.stack.pop_i32()
    }
}

fn i16_operand(
    ctx: &mut ExecutionContext,
    kind: ArithmeticKind,
    is_array: bool,
) -> Result<i16, RuntimeError> {
    if is_array {
        let elements = pop_array_elements(ctx)?;
        let mut values = Vec::with_capacity(elements.len());
        for value in &elements {
            values.push(value.as_i16()?);
        }
        let mut iter = values.into_iter();
        let mut acc = match iter.next() {
            Some(first) => first,
            None => return Ok(if kind == ArithmeticKind::Multiply { 1 } else { 0 }),
        };
        for value in iter {
            acc = combine_i16(kind, acc, value)?;
        }
        Ok(acc)
    } else {
        ctx.stack.pop_i16()
    }
}

fn real_operand(
    ctx: &mut ExecutionContext,
    kind: ArithmeticKind,
    is_array: bool,
) -> Result<f32, RuntimeError> {
    if is_array {
        let elements = pop_array_elements(ctx)?;
        let mut iter = elements.iter();
        let mut acc = match iter.next() {
            Some(first) => first.as_real()?,
            None => return Ok(if kind == ArithmeticKind::Multiply { 1.0 } else { 0.0 }),
        };
        for value in iter {
            acc = combine_real(kind, acc, value.as_real()?);
        }
        Ok(acc)
    } else {
        ctx.stack.pop_f32()
    }
}

pub(crate) fn arithmetic(
    ctx: &mut ExecutionContext,
    op: &ArithmeticOp,
) -> Result<Value, RuntimeError> {
    match op.ty {
        VmType::Int32 => {
            if op.param_count == 1 {
                let elements = pop_array_elements(ctx)?;
                let values: Result<Vec<i32>, _> = elements.iter().map(|v| v.as_i32()).collect();
                Ok(Value::Int32(fold_i32(op.kind, &values?)?))
            } else {
                // Operands pushed first-then-second, so second pops first.
                let second = i32_operand(ctx, op.kind, op.second_is_array)?;
                let first = i32_operand(ctx, op.kind, op.first_is_array)?;
                Ok(Value::Int32(combine_i32(op.kind, first, second)?))
            }
        }
        VmType::Int16 => {
            if op.param_count == 1 {
                let folded = i16_operand(ctx, op.kind, true)?;
                Ok(Value::Int16(folded))
            } else {
                let second = i16_operand(ctx, op.kind, op.second_is_array)?;
                let first = i16_operand(ctx, op.kind, op.first_is_array)?;
                Ok(Value::Int16(combine_i16(op.kind, first, second)?))
            }
        }
        VmType::Real => {
            if op.param_count == 1 {
                let folded = real_operand(ctx, op.kind, true)?;
                Ok(Value::Real(folded))
            } else {
                let second = real_operand(ctx, op.kind, op.second_is_array)?;
                let first = real_operand(ctx, op.kind, op.first_is_array)?;
                Ok(Value::Real(combine_real(op.kind, first, second)))
            }
        }
        other => {
            Err(RuntimeError::type_mismatch(VmType::Int32, other))
        }
    }
}

fn string_operand(ctx: &mut ExecutionContext, is_array: bool) -> Result<String, RuntimeError> {
    if is_array {
        let elements = pop_array_elements(ctx)?;
        let mut joined = String::new();
        for value in &elements {
            joined.push_str(&ctx.program.resolve(value.as_str()?));
        }
        Ok(joined)
    } else {
        let id = crate::value::StrId(ctx.stack.pop_handle()?);
        Ok(ctx.program.resolve(id).to_string())
    }
}

pub(crate) fn concat(
    ctx: &mut ExecutionContext,
    first_is_array: bool,
    second_is_array: bool,
    param_count: u32,
) -> Result<Value, RuntimeError> {
    let combined = if param_count == 1 {
        string_operand(ctx, true)?
    } else {
        let second = string_operand(ctx, second_is_array)?;
        let first = string_operand(ctx, first_is_array)?;
        format!("{}{}", first, second)
    };
    Ok(Value::Str(ctx.program.intern(&combined)))
}

fn ordering_matches(kind: CompareKind, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match kind {
        CompareKind::Equal => ordering == Equal,
        CompareKind::NotEqual => ordering != Equal,
        CompareKind::Less => ordering == Less,
        CompareKind::LessEqual => ordering != Greater,
        CompareKind::Greater => ordering == Greater,
        CompareKind::GreaterEqual => ordering != Less,
    }
}

pub(crate) fn compare(
    ctx: &mut ExecutionContext,
    kind: CompareKind,
    ty: VmType,
) -> Result<Value, RuntimeError> {
    let result = match ty {
        VmType::Int32 => {
            let second = ctx.stack.pop_i32()?;
            let first = ctx.stack.pop_i32()?;
            ordering_matches(kind, first.cmp(&second))
        }
        VmType::Int16 => {
            let second = ctx.stack.pop_i16()?;
            let first = ctx.stack.pop_i16()?;
            ordering_matches(kind, first.cmp(&second))
        }
        VmType::Real => {
            let second = ctx.stack.pop_f32()?;
            let first = ctx.stack.pop_f32()?;
            let ordering = first
                .partial_cmp(&second)
                .unwrap_or(std::cmp::Ordering::Greater);
            ordering_matches(kind, ordering)
        }
        VmType::Bool => {
            let second = ctx.stack.pop_bool()?;
            let first = ctx.stack.pop_bool()?;
            ordering_matches(kind, first.cmp(&second))
        }
        VmType::Str => {
            let second = crate::value::StrId(ctx.stack.pop_handle()?);
            let first = crate::value::StrId(ctx.stack.pop_handle()?);
            match kind {
                // Interned: identical content means identical handle.
                CompareKind::Equal => first == second,
                CompareKind::NotEqual => first != second,
                _ => {
                    let a = ctx.program.resolve(first);
                    let b = ctx.program.resolve(second);
                    ordering_matches(kind, a.cmp(&b))
                }
            }
        }
        VmType::Task => {
            let second = ctx.stack.pop_handle()?;
            let first = ctx.stack.pop_handle()?;
            match kind {
                CompareKind::Equal => first == second,
                CompareKind::NotEqual => first != second,
                _ => return Err(RuntimeError::type_mismatch(VmType::Int32, ty)),
            }
        }
        other => return Err(RuntimeError::type_mismatch(VmType::Int32, other)),
    };
    Ok(Value::Bool(result))
}

pub(crate) fn logical_and(
    ctx: &mut ExecutionContext,
    operands: &[Op],
) -> Result<Value, RuntimeError> {
    // Short-circuit: later operands are not evaluated once one is false.
    for op in operands {
        let value = evaluate_operand(op, ctx)?;
        if !value.as_bool()? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

pub(crate) fn logical_or(
    ctx: &mut ExecutionContext,
    operands: &[Op],
) -> Result<Value, RuntimeError> {
    for op in operands {
        let value = evaluate_operand(op, ctx)?;
        if value.as_bool()? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

pub(crate) fn logical_xor(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    let second = ctx.stack.pop_bool()?;
    let first = ctx.stack.pop_bool()?;
    Ok(Value::Bool(first ^ second))
}

pub(crate) fn logical_not(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    let value = ctx.stack.pop_bool()?;
    Ok(Value::Bool(!value))
}

fn integer_operand(ctx: &mut ExecutionContext, ty: VmType) -> Result<i64, RuntimeError> {
    match ty {
        VmType::Int32 => Ok(ctx.stack.pop_i32()? as i64),
        VmType::Int16 => Ok(ctx.stack.pop_i16()? as i64),
        other => Err(RuntimeError::type_mismatch(VmType::Int32, other)),
    }
}

fn integer_value(ty: VmType, raw: i64) -> Value {
    match ty {
        VmType::Int16 => Value::Int16(raw as i16),
        _ => Value::Int32(raw as i32),
    }
}

pub(crate) fn bitwise_compound(
    ctx: &mut ExecutionContext,
    ty: VmType,
    operands: &[Op],
    combine: impl Fn(i64, i64) -> i64,
) -> Result<Value, RuntimeError> {
    let mut acc = if operands.is_empty() {
        // Bare form: both operands arrive on the stack.
        let second = integer_operand(ctx, ty)?;
        let first = integer_operand(ctx, ty)?;
        combine(first, second)
    } else {
        let mut values = Vec::with_capacity(operands.len());
        for op in operands {
            let value = evaluate_operand(op, ctx)?;
            values.push(match ty {
                VmType::Int16 => value.as_i16()? as i64,
                _ => value.as_i32()? as i64,
            });
        }
        let mut iter = values.into_iter();
        let mut acc = iter.next().ok_or(RuntimeError::StackUnderflow)?;
        for value in iter {
            acc = combine(acc, value);
        }
        acc
    };
    acc &= 0xFFFF_FFFF;
    Ok(integer_value(ty, acc))
}

pub(crate) fn bitwise_xor(ctx: &mut ExecutionContext, ty: VmType) -> Result<Value, RuntimeError> {
    let second = integer_operand(ctx, ty)?;
    let first = integer_operand(ctx, ty)?;
    Ok(integer_value(ty, first ^ second))
}

pub(crate) fn bitwise_not(ctx: &mut ExecutionContext, ty: VmType) -> Result<Value, RuntimeError> {
    let value = integer_operand(ctx, ty)?;
    Ok(integer_value(ty, !value))
}
