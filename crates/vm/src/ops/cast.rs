//! Typed conversions among primitives, and primitive-to-string casts.
//! Unsupported combinations are runtime errors.

use crate::machine::ExecutionContext;
use crate::value::{BufferHandle, RuntimeError, StrId, Value, VmType};

fn parse_failure(text: &str, target: VmType) -> RuntimeError {
    RuntimeError::ParseFailure {
        text: text.to_string(),
        target: target.name().to_string(),
    }
}

pub(crate) fn type_cast(
    ctx: &mut ExecutionContext,
    from: VmType,
    to: VmType,
) -> Result<Value, RuntimeError> {
    let source = ctx.pop_value(from)?;
    Ok(match to {
        VmType::Int32 => Value::Int32(match source {
            Value::Str(id) => {
                let text = ctx.program.resolve(id);
                text.trim()
                    .parse::<i32>()
                    .map_err(|_| parse_failure(&text, to))?
            }
            Value::Real(v) => v as i32,
            Value::Int16(v) => v as i32,
            Value::Bool(v) => v as i32,
            _ => return Err(RuntimeError::invalid_cast(from, to)),
        }),
        VmType::Int16 => Value::Int16(match source {
            Value::Str(id) => {
                let text = ctx.program.resolve(id);
                text.trim()
                    .parse::<i16>()
                    .map_err(|_| parse_failure(&text, to))?
            }
            Value::Real(v) => v as i16,
            Value::Int32(v) => v as i16,
            Value::Bool(v) => v as i16,
            _ => return Err(RuntimeError::invalid_cast(from, to)),
        }),
        VmType::Real => Value::Real(match source {
            Value::Str(id) => {
                let text = ctx.program.resolve(id);
                text.trim()
                    .parse::<f32>()
                    .map_err(|_| parse_failure(&text, to))?
            }
            Value::Int32(v) => v as f32,
            Value::Int16(v) => v as f32,
            Value::Bool(v) => v as i32 as f32,
            _ => return Err(RuntimeError::invalid_cast(from, to)),
        }),
        _ => return Err(RuntimeError::invalid_cast(from, to)),
    })
}

pub(crate) fn cast_to_string(
    ctx: &mut ExecutionContext,
    from: VmType,
) -> Result<Value, RuntimeError> {
    let text = match from {
        VmType::Int32 => ctx.stack.pop_i32()?.to_string(),
        VmType::Int16 => ctx.stack.pop_i16()?.to_string(),
        VmType::Real => ctx.stack.pop_f32()?.to_string(),
        VmType::Bool => if ctx.stack.pop_bool()? { "true" } else { "false" }.to_string(),
        VmType::Str => {
            let id = StrId(ctx.stack.pop_handle()?);
            return Ok(Value::Str(id));
        }
        VmType::Buffer => {
            let handle = BufferHandle(ctx.stack.pop_handle()?);
            let data = ctx.program.buffers.get(handle)?;
            let bytes = data.read();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        other => return Err(RuntimeError::invalid_cast(other, VmType::Str)),
    };
    Ok(Value::Str(ctx.program.intern(&text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Console, ExecutionContext};
    use crate::program::Program;
    use crate::task::TaskRuntime;
    use crate::value::TaskId;
    use std::sync::Arc;

    fn test_context() -> ExecutionContext {
        let program = Arc::new(Program::new());
        let runtime = TaskRuntime::new(Arc::new(fugue_extension::ExtensionRegistry::new()));
        let (task, _) = runtime.register_task();
        let (console, _) = Console::capture();
        ExecutionContext::new(program, runtime, console, task, TaskId::NONE)
    }

    #[test]
    fn test_int_to_string() {
        let mut ctx = test_context();
        ctx.stack.push_i32(5).unwrap();
        let result = cast_to_string(&mut ctx, VmType::Int32).unwrap();
        assert_eq!(&*ctx.program.resolve(result.as_str().unwrap()), "5");
    }

    #[test]
    fn test_bool_to_string() {
        let mut ctx = test_context();
        ctx.stack.push_bool(true).unwrap();
        let result = cast_to_string(&mut ctx, VmType::Bool).unwrap();
        assert_eq!(&*ctx.program.resolve(result.as_str().unwrap()), "true");
    }

    #[test]
    fn test_string_to_int() {
        let mut ctx = test_context();
        let id = ctx.program.intern("123");
        ctx.stack.push_handle(id.0).unwrap();
        let result = type_cast(&mut ctx, VmType::Str, VmType::Int32).unwrap();
        assert_eq!(result, Value::Int32(123));
    }

    #[test]
    fn test_string_parse_failure() {
        let mut ctx = test_context();
        let id = ctx.program.intern("not a number");
        ctx.stack.push_handle(id.0).unwrap();
        assert!(matches!(
            type_cast(&mut ctx, VmType::Str, VmType::Int32),
            Err(RuntimeError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_real_truncation() {
        let mut ctx = test_context();
        ctx.stack.push_f32(3.9).unwrap();
        let result = type_cast(&mut ctx, VmType::Real, VmType::Int32).unwrap();
        assert_eq!(result, Value::Int32(3));
    }

    #[test]
    fn test_unsupported_cast_fails() {
        let mut ctx = test_context();
        ctx.stack.push_handle(1).unwrap();
        assert!(matches!(
            type_cast(&mut ctx, VmType::Task, VmType::Int32),
            Err(RuntimeError::InvalidCast { .. })
        ));
    }

    #[test]
    fn test_buffer_to_string() {
        let mut ctx = test_context();
        let handle = ctx.program.buffers.alloc(b"payload".to_vec());
        ctx.stack.push_handle(handle.0).unwrap();
        let result = cast_to_string(&mut ctx, VmType::Buffer).unwrap();
        assert_eq!(&*ctx.program.resolve(result.as_str().unwrap()), "payload");
    }
}
