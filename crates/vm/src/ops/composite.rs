//! Tuple and structure member access, including the indirect chain used
//! for `a.b.c` reads and member reference bindings.

use crate::block::Block;
use crate::machine::ExecutionContext;
use crate::ops::Op;
use crate::program::Program;
use crate::scope::{ScopeId, Slot};
use crate::value::{
    AddressId, CompositeHint, RuntimeError, StrId, StructTypeId, Value, VmType,
};

fn unknown_member(program: &Program, kind: &str, member: StrId) -> RuntimeError {
    RuntimeError::UnknownMember {
        type_name: kind.to_string(),
        member: program.resolve(member).to_string(),
    }
}

pub(crate) fn tuple_member_type(
    program: &Program,
    scope: ScopeId,
    var: StrId,
    member: StrId,
) -> Result<VmType, RuntimeError> {
    let hint = program
        .scopes()
        .tuple_hint(scope, var)
        .ok_or_else(|| RuntimeError::UnknownVariable(program.resolve(var).to_string()))?;
    program
        .tuple_layout(hint)?
        .member(member)
        .map(|info| info.ty)
        .ok_or_else(|| unknown_member(program, "tuple", member))
}

pub(crate) fn structure_member_type(
    program: &Program,
    scope: ScopeId,
    var: StrId,
    member: StrId,
) -> Result<VmType, RuntimeError> {
    let hint = program
        .scopes()
        .structure_hint(scope, var)
        .ok_or_else(|| RuntimeError::UnknownVariable(program.resolve(var).to_string()))?;
    program
        .structure_layout(hint)?
        .member(member)
        .map(|info| info.ty)
        .ok_or_else(|| unknown_member(program, "structure", member))
}

/// Walk backwards along the member-access chain: the operation at
/// `prior` must be a pushed structure read whose result is the structure
/// the current operation reads from. The terminal read names the root
/// variable; every intermediate hop resolves the next member's hint.
pub(crate) fn walk_chain_for_struct(
    program: &Program,
    scope: ScopeId,
    block: &Block,
    prior: usize,
) -> Result<StructTypeId, RuntimeError> {
    let op = block.ops.get(prior).ok_or_else(|| {
        RuntimeError::InternalFailure("indirect structure read without a prior operation".into())
    })?;
    let inner = match op {
        Op::Push(inner) => &**inner,
        _ => {
            return Err(RuntimeError::InternalFailure(
                "indirect structure read requires a pushed prior read".into(),
            ))
        }
    };
    match inner {
        Op::ReadStructure { var, member } => {
            let root = program
                .scopes()
                .structure_hint(scope, *var)
                .ok_or_else(|| RuntimeError::UnknownVariable(program.resolve(*var).to_string()))?;
            member_struct_hint(program, root, *member)
        }
        Op::ReadStructureIndirect { member, prior } => {
            let root = walk_chain_for_struct(program, scope, block, *prior)?;
            member_struct_hint(program, root, *member)
        }
        _ => Err(RuntimeError::InternalFailure(
            "indirect structure read has an invalid previous operation".into(),
        )),
    }
}

fn member_struct_hint(
    program: &Program,
    id: StructTypeId,
    member: StrId,
) -> Result<StructTypeId, RuntimeError> {
    let info = program
        .structure_layout(id)?
        .member(member)
        .ok_or_else(|| unknown_member(program, "structure", member))?;
    match info.hint {
        Some(CompositeHint::Structure(id)) => Ok(id),
        _ => Err(RuntimeError::type_mismatch(VmType::Structure, info.ty)),
    }
}

fn variable_slot(ctx: &ExecutionContext, var: StrId) -> Result<Slot, RuntimeError> {
    ctx.lookup_slot(var)
        .ok_or_else(|| ctx.unknown_variable(var))
}

pub(crate) fn read_tuple(
    ctx: &mut ExecutionContext,
    var: StrId,
    member: StrId,
) -> Result<Value, RuntimeError> {
    variable_slot(ctx, var)?.member(member).read(&ctx.program)
}

pub(crate) fn read_structure(
    ctx: &mut ExecutionContext,
    var: StrId,
    member: StrId,
) -> Result<Value, RuntimeError> {
    variable_slot(ctx, var)?.member(member).read(&ctx.program)
}

/// Pop a value of the member's type and store it. Returns the written
/// value.
fn write_member(
    ctx: &mut ExecutionContext,
    var: StrId,
    member: StrId,
) -> Result<Value, RuntimeError> {
    let slot = variable_slot(ctx, var)?.member(member);
    let (ty, hint) = slot.target_type(&ctx.program)?;
    let value = ctx.pop_value(ty)?;
    check_composite_hint(&value, hint)?;
    slot.write(&ctx.program, value.clone())?;
    Ok(value)
}

fn check_composite_hint(
    value: &Value,
    hint: Option<CompositeHint>,
) -> Result<(), RuntimeError> {
    match (value, hint) {
        (Value::Structure(s), Some(CompositeHint::Structure(id))) if s.type_id != id => Err(
            RuntimeError::InternalFailure("structure type does not match the member layout".into()),
        ),
        (Value::Tuple(t), Some(CompositeHint::Tuple(id))) if t.type_id != id => Err(
            RuntimeError::InternalFailure("tuple type does not match the member layout".into()),
        ),
        _ => Ok(()),
    }
}

pub(crate) fn write_tuple(
    ctx: &mut ExecutionContext,
    var: StrId,
    member: StrId,
) -> Result<Value, RuntimeError> {
    write_member(ctx, var, member)
}

pub(crate) fn write_structure(
    ctx: &mut ExecutionContext,
    var: StrId,
    member: StrId,
) -> Result<Value, RuntimeError> {
    write_member(ctx, var, member)
}

/// Read a member of the structure currently on the stack, consuming the
/// whole structure.
pub(crate) fn read_structure_indirect(
    ctx: &mut ExecutionContext,
    member: StrId,
) -> Result<Value, RuntimeError> {
    let value = ctx.pop_value(VmType::Structure)?;
    let structure = match value {
        Value::Structure(s) => s,
        other => return Err(RuntimeError::type_mismatch(VmType::Structure, other.vm_type())),
    };
    let layout = ctx.program.structure_layout(structure.type_id)?;
    let index = layout
        .member_index(member)
        .ok_or_else(|| unknown_member(&ctx.program, "structure", member))?;
    Ok(structure.members[index].clone())
}

/// Write through a member address on the stack: pop the address, then
/// the value of the member's type, and store through the bound slot.
pub(crate) fn write_structure_indirect(
    ctx: &mut ExecutionContext,
    member: StrId,
) -> Result<Value, RuntimeError> {
    let address = AddressId(ctx.stack.pop_handle()?);
    let slot = ctx.address(address)?.member(member);
    let (ty, hint) = slot.target_type(&ctx.program)?;
    let value = ctx.pop_value(ty)?;
    check_composite_hint(&value, hint)?;
    slot.write(&ctx.program, value.clone())?;
    Ok(value)
}

/// Bind a reference to a structure member. The root form starts at a
/// named variable; the chained form extends the address on the stack by
/// one member hop.
pub(crate) fn bind_struct_member(
    ctx: &mut ExecutionContext,
    var: Option<StrId>,
    member: StrId,
) -> Result<Value, RuntimeError> {
    let slot = match var {
        Some(var) => variable_slot(ctx, var)?.member(member),
        None => {
            let address = AddressId(ctx.stack.pop_handle()?);
            ctx.address(address)?.member(member)
        }
    };
    let id = ctx.bind_address(slot);
    Ok(Value::Address(id))
}
