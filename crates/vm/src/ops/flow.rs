//! Control flow: loops, the if/else-if/else chain and function
//! invocation.

use std::sync::Arc;

use crate::block::{Block, FlowSignal};
use crate::machine::{invoke_function, ExecutionContext};
use crate::ops::vars::resolve_function_binding;
use crate::ops::IfOp;
use crate::value::{FunctionId, RuntimeError, StrId, Value, VmType};

/// Body runs once unconditionally, then re-enters while the flag it
/// pushed is true.
pub(crate) fn do_while(
    ctx: &mut ExecutionContext,
    body: &Block,
) -> Result<FlowSignal, RuntimeError> {
    loop {
        match body.execute(ctx)? {
            FlowSignal::Break => return Ok(FlowSignal::Normal),
            FlowSignal::Return => return Ok(FlowSignal::Return),
            FlowSignal::Normal | FlowSignal::ExitIfChain => {}
        }
        if !ctx.stack.pop_bool()? {
            return Ok(FlowSignal::Normal);
        }
    }
}

/// Body begins with condition ops plus the while-condition marker that
/// breaks out when the popped flag is false.
pub(crate) fn while_loop(
    ctx: &mut ExecutionContext,
    body: &Block,
) -> Result<FlowSignal, RuntimeError> {
    loop {
        match body.execute(ctx)? {
            FlowSignal::Break => return Ok(FlowSignal::Normal),
            FlowSignal::Return => return Ok(FlowSignal::Return),
            FlowSignal::Normal | FlowSignal::ExitIfChain => {}
        }
    }
}

pub(crate) fn while_condition(ctx: &mut ExecutionContext) -> Result<FlowSignal, RuntimeError> {
    if ctx.stack.pop_bool()? {
        Ok(FlowSignal::Normal)
    } else {
        Ok(FlowSignal::Break)
    }
}

/// Evaluate the popped condition; on true run the true block, otherwise
/// walk the else-if chain and finally the false block. A taken else-if
/// branch reports `ExitIfChain`, which stops the walk and skips the
/// false block.
pub(crate) fn if_chain(ctx: &mut ExecutionContext, op: &IfOp) -> Result<FlowSignal, RuntimeError> {
    let condition = ctx.stack.pop_bool()?;
    if condition {
        if let Some(block) = &op.true_block {
            return absorb_chain_exit(block.execute(ctx)?);
        }
        return Ok(FlowSignal::Normal);
    }

    if let Some(chain) = &op.else_if_chain {
        match chain.execute(ctx)? {
            FlowSignal::ExitIfChain => return Ok(FlowSignal::Normal),
            FlowSignal::Break => return Ok(FlowSignal::Break),
            FlowSignal::Return => return Ok(FlowSignal::Return),
            FlowSignal::Normal => {}
        }
    }

    if let Some(block) = &op.false_block {
        return absorb_chain_exit(block.execute(ctx)?);
    }
    Ok(FlowSignal::Normal)
}

fn absorb_chain_exit(signal: FlowSignal) -> Result<FlowSignal, RuntimeError> {
    Ok(match signal {
        FlowSignal::ExitIfChain => FlowSignal::Normal,
        other => other,
    })
}

/// One else-if entry: pop its condition flag; when true, run the branch
/// (whose tail carries the exit-chain marker).
pub(crate) fn else_if(ctx: &mut ExecutionContext, body: &Block) -> Result<FlowSignal, RuntimeError> {
    if ctx.stack.pop_bool()? {
        body.execute(ctx)
    } else {
        Ok(FlowSignal::Normal)
    }
}

/// Invoke by id. The call pushes return values; the rvalue form pops
/// the first declared return back off the stack so expression use stays
/// stack-neutral.
pub(crate) fn invoke(ctx: &mut ExecutionContext, id: FunctionId) -> Result<Value, RuntimeError> {
    invoke_function(ctx, id)?;
    pop_returns(ctx, id)
}

fn pop_returns(ctx: &mut ExecutionContext, id: FunctionId) -> Result<Value, RuntimeError> {
    let program = Arc::clone(&ctx.program);
    let function = program.function(id)?;
    let signature = function.derive_signature(&program);
    if signature.returns.is_empty() {
        return Ok(Value::Null);
    }
    let mut values = Vec::with_capacity(signature.returns.len());
    for ty in signature.returns.iter().rev() {
        values.push(ctx.pop_value(*ty)?);
    }
    values.reverse();
    Ok(values.into_iter().next().unwrap_or(Value::Null))
}

/// Invoke by name, resolved against the scope at call time. A variable
/// holding a function binding is checked against its registered
/// signature before the call.
pub(crate) fn invoke_indirect(
    ctx: &mut ExecutionContext,
    name: StrId,
) -> Result<Value, RuntimeError> {
    if let Some(id) = resolve_function_binding(ctx, name)? {
        return invoke(ctx, id);
    }
    if let Some(id) = ctx.program.scopes().function(ctx.current_scope(), name) {
        return invoke(ctx, id);
    }
    match ctx.program.scopes().variable_type(ctx.current_scope(), name) {
        Some(other) if other != VmType::Function => {
            Err(RuntimeError::type_mismatch(VmType::Function, other))
        }
        _ => Err(RuntimeError::UnknownFunction(
            ctx.program.resolve(name).to_string(),
        )),
    }
}
