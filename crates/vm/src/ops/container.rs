//! Container meta-operations: map an operation over an array, or fold
//! an array with a binary operation.

use crate::machine::ExecutionContext;
use crate::ops::{evaluate_operand, Op};
use crate::value::{ArrayHandle, RuntimeError, Value};

fn pop_array(ctx: &mut ExecutionContext) -> Result<(ArrayHandle, Vec<Value>), RuntimeError> {
    let handle = ArrayHandle(ctx.stack.pop_handle()?);
    let storage = ctx.program.arrays.get(handle)?;
    let elements = storage.elements.read().clone();
    Ok((handle, elements))
}

/// Apply the operation to each element; the results form a new array.
pub(crate) fn map_array(ctx: &mut ExecutionContext, op: &Op) -> Result<Value, RuntimeError> {
    let (source, elements) = pop_array(ctx)?;
    let source_type = ctx.program.arrays.get(source)?.elem_type;

    let mut mapped = Vec::with_capacity(elements.len());
    for element in elements {
        ctx.push_value(&element)?;
        mapped.push(evaluate_operand(op, ctx)?);
    }
    let elem_type = mapped
        .first()
        .map(|value| value.vm_type())
        .unwrap_or(source_type);
    Ok(Value::Array(ctx.program.arrays.alloc(elem_type, mapped)))
}

/// Left-fold the array with a binary operation.
pub(crate) fn reduce_array(ctx: &mut ExecutionContext, op: &Op) -> Result<Value, RuntimeError> {
    let (_, elements) = pop_array(ctx)?;
    let mut iter = elements.into_iter();
    let mut acc = iter
        .next()
        .ok_or_else(|| RuntimeError::InternalFailure("cannot reduce an empty array".into()))?;
    for element in iter {
        ctx.push_value(&acc)?;
        ctx.push_value(&element)?;
        acc = evaluate_operand(op, ctx)?;
    }
    Ok(acc)
}
