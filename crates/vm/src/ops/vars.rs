//! Variable, array and console operations.

use crate::machine::ExecutionContext;
use crate::ops::{evaluate_operand, Op};
use crate::value::{FunctionId, RuntimeError, StrId, Value, VmType};

pub(crate) fn debug_write(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    let id = StrId(ctx.stack.pop_handle()?);
    let text = ctx.program.resolve(id);
    ctx.console.write_line(&text);
    Ok(Value::Null)
}

pub(crate) fn debug_read(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    let line = ctx.console.read_line();
    let id = ctx.program.intern(&line);
    ctx.stack.push_handle(id.0)?;
    Ok(Value::Str(id))
}

/// Pop a value of the variable's declared type and store it. `is_init`
/// distinguishes first initialization (allowed on constants) from
/// reassignment (rejected on constants).
pub(crate) fn assign_value(
    ctx: &mut ExecutionContext,
    name: StrId,
    is_init: bool,
) -> Result<Value, RuntimeError> {
    let ty = ctx
        .program
        .scopes()
        .variable_type(ctx.current_scope(), name)
        .ok_or_else(|| ctx.unknown_variable(name))?;
    let value = ctx.pop_value(ty)?;
    ctx.write_variable(name, value.clone(), is_init)?;
    Ok(value)
}

/// Push a binding to the variable's live slot. The callee that pops the
/// binding writes through to this exact cell.
pub(crate) fn bind_reference(ctx: &mut ExecutionContext, name: StrId) -> Result<Value, RuntimeError> {
    let slot = ctx
        .lookup_slot(name)
        .ok_or_else(|| ctx.unknown_variable(name))?;
    let id = ctx.bind_address(slot);
    ctx.stack.push_handle(id.0)?;
    Ok(Value::Address(id))
}

pub(crate) fn bind_function_reference(
    ctx: &mut ExecutionContext,
    name: StrId,
) -> Result<Value, RuntimeError> {
    let id = ctx
        .program
        .scopes()
        .function(ctx.current_scope(), name)
        .ok_or_else(|| RuntimeError::UnknownFunction(ctx.program.resolve(name).to_string()))?;
    ctx.stack.push_handle(id.0)?;
    Ok(Value::Function(id))
}

/// Storage footprint of a variable: element count for arrays, layout
/// width for composites, natural width for primitives.
pub(crate) fn size_of(ctx: &mut ExecutionContext, name: StrId) -> Result<Value, RuntimeError> {
    let scope = ctx.current_scope();
    let ty = ctx
        .program
        .scopes()
        .variable_type(scope, name)
        .ok_or_else(|| ctx.unknown_variable(name))?;
    let size = match ty {
        VmType::Array => match ctx.read_variable(name)? {
            Value::Array(handle) => ctx.program.arrays.get(handle)?.elements.read().len(),
            _ => 0,
        },
        VmType::Tuple | VmType::Structure => {
            let hint = ctx
                .program
                .scopes()
                .variable_hint(scope, name)
                .ok_or_else(|| ctx.unknown_variable(name))?;
            ctx.program.layout_for_hint(hint)?.stack_width()
        }
        other => other.stack_width().unwrap_or(0),
    };
    Ok(Value::Int32(size as i32))
}

pub(crate) fn read_array(ctx: &mut ExecutionContext, name: StrId) -> Result<Value, RuntimeError> {
    let index = ctx.stack.pop_i32()?;
    let handle = ctx.read_variable(name)?.as_array()?;
    let storage = ctx.program.arrays.get(handle)?;
    let elements = storage.elements.read();
    let length = elements.len();
    elements
        .get(index_in_bounds(index, length)?)
        .cloned()
        .ok_or(RuntimeError::IndexOutOfBounds {
            index: index as i64,
            length,
        })
}

pub(crate) fn write_array(ctx: &mut ExecutionContext, name: StrId) -> Result<Value, RuntimeError> {
    let elem_type = ctx
        .program
        .scopes()
        .array_elem_type(ctx.current_scope(), name)
        .ok_or_else(|| ctx.unknown_variable(name))?;
    let value = ctx.pop_value(elem_type)?;
    let index = ctx.stack.pop_i32()?;

    let handle = ctx.read_variable(name)?.as_array()?;
    let storage = ctx.program.arrays.get(handle)?;
    let mut elements = storage.elements.write();
    let length = elements.len();
    let slot = elements
        .get_mut(index_in_bounds(index, length)?)
        .ok_or(RuntimeError::IndexOutOfBounds {
            index: index as i64,
            length,
        })?;
    *slot = value.clone();
    Ok(value)
}

pub(crate) fn array_length(ctx: &mut ExecutionContext, name: StrId) -> Result<Value, RuntimeError> {
    let handle = ctx.read_variable(name)?.as_array()?;
    let length = ctx.program.arrays.get(handle)?.elements.read().len();
    Ok(Value::Int32(length as i32))
}

/// Construct an array from stack values. The wrapped operation yields
/// the element count; elements were pushed first-to-last.
pub(crate) fn cons_array_indirect(
    ctx: &mut ExecutionContext,
    elem_type: VmType,
    count: &Op,
) -> Result<Value, RuntimeError> {
    let count = evaluate_operand(count, ctx)?.as_i32()?;
    if count < 0 {
        return Err(RuntimeError::IndexOutOfBounds {
            index: count as i64,
            length: 0,
        });
    }
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        elements.push(ctx.pop_value(elem_type)?);
    }
    elements.reverse();
    let handle = ctx.program.arrays.alloc(elem_type, elements);
    Ok(Value::Array(handle))
}

fn index_in_bounds(index: i32, length: usize) -> Result<usize, RuntimeError> {
    if index < 0 || index as usize >= length {
        return Err(RuntimeError::IndexOutOfBounds {
            index: index as i64,
            length,
        });
    }
    Ok(index as usize)
}

/// Resolve a function id for indirect invocation through a variable
/// holding a function binding, enforcing the registered signature.
pub(crate) fn resolve_function_binding(
    ctx: &ExecutionContext,
    name: StrId,
) -> Result<Option<FunctionId>, RuntimeError> {
    let scope = ctx.current_scope();
    if ctx.program.scopes().variable_type(scope, name) != Some(VmType::Function) {
        return Ok(None);
    }
    let id = match ctx.read_variable(name)? {
        Value::Function(id) => id,
        other => return Err(RuntimeError::type_mismatch(VmType::Function, other.vm_type())),
    };
    if let Some(expected) = ctx.program.scopes().signature(scope, name) {
        let actual = ctx.program.function(id)?.derive_signature(&ctx.program);
        if !expected.matches(&actual) {
            return Err(RuntimeError::SignatureMismatch(
                ctx.program.resolve(name).to_string(),
            ));
        }
    }
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Console, ExecutionContext};
    use crate::program::Program;
    use crate::task::TaskRuntime;
    use crate::value::TaskId;
    use std::sync::Arc;

    fn context_with_array() -> (ExecutionContext, StrId) {
        let mut program = Program::new();
        let global = program.global_scope();
        let name = program.intern("items");
        program
            .scopes_mut()
            .get_mut(global)
            .add_variable(name, VmType::Array, false);
        program
            .scopes_mut()
            .get_mut(global)
            .array_types
            .insert(name, VmType::Int32);

        let runtime = TaskRuntime::new(Arc::new(fugue_extension::ExtensionRegistry::new()));
        let (task, _) = runtime.register_task();
        let (console, _) = Console::capture();
        let mut ctx =
            ExecutionContext::new(Arc::new(program), runtime, console, task, TaskId::NONE);
        ctx.activate_globals().unwrap();

        let handle = ctx.program.arrays.alloc(
            VmType::Int32,
            vec![Value::Int32(10), Value::Int32(20), Value::Int32(30)],
        );
        ctx.write_variable(name, Value::Array(handle), true).unwrap();
        (ctx, name)
    }

    #[test]
    fn test_read_array() {
        let (mut ctx, name) = context_with_array();
        ctx.stack.push_i32(1).unwrap();
        assert_eq!(read_array(&mut ctx, name).unwrap(), Value::Int32(20));
    }

    #[test]
    fn test_read_array_out_of_bounds() {
        let (mut ctx, name) = context_with_array();
        ctx.stack.push_i32(3).unwrap();
        assert!(matches!(
            read_array(&mut ctx, name),
            Err(RuntimeError::IndexOutOfBounds { index: 3, length: 3 })
        ));

        ctx.stack.push_i32(-1).unwrap();
        assert!(matches!(
            read_array(&mut ctx, name),
            Err(RuntimeError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_write_array() {
        let (mut ctx, name) = context_with_array();
        ctx.stack.push_i32(2).unwrap(); // index
        ctx.stack.push_i32(99).unwrap(); // value
        write_array(&mut ctx, name).unwrap();

        ctx.stack.push_i32(2).unwrap();
        assert_eq!(read_array(&mut ctx, name).unwrap(), Value::Int32(99));
    }

    #[test]
    fn test_array_length() {
        let (mut ctx, name) = context_with_array();
        assert_eq!(array_length(&mut ctx, name).unwrap(), Value::Int32(3));
        assert_eq!(size_of(&mut ctx, name).unwrap(), Value::Int32(3));
    }

    #[test]
    fn test_cons_array_indirect() {
        let (mut ctx, _) = context_with_array();
        ctx.stack.push_i32(7).unwrap();
        ctx.stack.push_i32(8).unwrap();
        let op = Op::IntConstant(2);
        let value = cons_array_indirect(&mut ctx, VmType::Int32, &op).unwrap();
        let handle = value.as_array().unwrap();
        let storage = ctx.program.arrays.get(handle).unwrap();
        assert_eq!(
            &*storage.elements.read(),
            &[Value::Int32(7), Value::Int32(8)]
        );
    }

    #[test]
    fn test_debug_write_pops_string() {
        let (mut ctx, _) = context_with_array();
        let id = ctx.program.intern("hello");
        ctx.stack.push_handle(id.0).unwrap();
        debug_write(&mut ctx).unwrap();
        assert!(ctx.stack.is_empty());
    }
}
