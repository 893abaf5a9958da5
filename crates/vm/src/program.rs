//! The loaded program: scope arena, function table, global init block,
//! interned pools and the tuple/structure owner maps.

use std::sync::Arc;

use crate::block::Block;
use crate::pool::{ArrayPool, BufferPool, StringPool};
use crate::scope::{ScopeArena, ScopeId};
use crate::value::{
    CompositeHint, CompositeLayout, FunctionId, FunctionSignature, RuntimeError, StrId,
    StructTypeId, StructValue, TupleTypeId, TupleValue, Value, VmType,
};

/// Name of the function the engine invokes after global init.
pub const ENTRYPOINT_NAME: &str = "entrypoint";

/// A callable function.
pub enum Function {
    /// Bytecode-defined: parameter and return scopes, the body's local
    /// scope, and the body block (bound to the local scope).
    Bytecode {
        params: ScopeId,
        returns: ScopeId,
        body: Block,
    },
    /// A call routed to a registered extension library. The VM pops
    /// arguments per the parameter scope and hands them across.
    Native {
        library: StrId,
        symbol: StrId,
        return_type: VmType,
        return_hint: u32,
        params: ScopeId,
    },
}

impl Function {
    /// Static result type: the first declared return variable's type, or
    /// null when the function returns nothing.
    pub fn result_type(&self, program: &Program) -> VmType {
        match self {
            Function::Bytecode { returns, .. } => {
                let desc = program.scopes.get(*returns);
                desc.member_order
                    .first()
                    .and_then(|name| desc.variables.get(name))
                    .map(|decl| decl.ty)
                    .unwrap_or(VmType::Null)
            }
            Function::Native { return_type, .. } => *return_type,
        }
    }

    /// Structural signature derived from the parameter/return scopes,
    /// used for dynamic-invocation checks.
    pub fn derive_signature(&self, program: &Program) -> FunctionSignature {
        let mut sig = FunctionSignature::new();
        match self {
            Function::Bytecode { params, returns, .. } => {
                let pdesc = program.scopes.get(*params);
                for name in &pdesc.member_order {
                    if let Some(decl) = pdesc.variables.get(name) {
                        sig.add_param(decl.ty, 0, None);
                        if decl.is_reference {
                            sig.set_last_param_reference();
                        }
                    }
                }
                let rdesc = program.scopes.get(*returns);
                for name in &rdesc.member_order {
                    if let Some(decl) = rdesc.variables.get(name) {
                        sig.add_return(decl.ty, 0);
                    }
                }
            }
            Function::Native {
                params,
                return_type,
                return_hint,
                ..
            } => {
                let pdesc = program.scopes.get(*params);
                for name in &pdesc.member_order {
                    if let Some(decl) = pdesc.variables.get(name) {
                        sig.add_param(decl.ty, 0, None);
                    }
                }
                if *return_type != VmType::Null {
                    sig.add_return(*return_type, *return_hint);
                }
            }
        }
        sig
    }
}

/// A fully-linked, executable program. Immutable once loading completes;
/// shared across tasks behind an `Arc`. The pools use interior
/// mutability and outlive any single execution.
pub struct Program {
    scopes: ScopeArena,
    global_scope: ScopeId,
    pub functions: Vec<Function>,
    pub global_init: Option<Block>,

    pub strings: StringPool,
    pub arrays: ArrayPool,
    pub buffers: BufferPool,

    /// Registered extension library names, in registration order.
    pub extensions: Vec<StrId>,
    /// Opaque per-library data blocks recorded in the bytecode.
    pub extension_data: Vec<(StrId, Vec<u8>)>,

    pub uses_console: bool,

    // Owner maps: type id -> owning scope. Written once during load,
    // read-only afterwards; imbl maps clone O(1) for hand-out.
    tuple_owners: imbl::HashMap<TupleTypeId, ScopeId>,
    structure_owners: imbl::HashMap<StructTypeId, ScopeId>,
}

impl Program {
    pub fn new() -> Self {
        let mut scopes = ScopeArena::new();
        let global_scope = scopes.alloc();
        Program {
            scopes,
            global_scope,
            functions: Vec::new(),
            global_init: None,
            strings: StringPool::new(),
            arrays: ArrayPool::new(),
            buffers: BufferPool::new(),
            extensions: Vec::new(),
            extension_data: Vec::new(),
            uses_console: false,
            tuple_owners: imbl::HashMap::new(),
            structure_owners: imbl::HashMap::new(),
        }
    }

    pub fn global_scope(&self) -> ScopeId {
        self.global_scope
    }

    pub fn scopes(&self) -> &ScopeArena {
        &self.scopes
    }

    pub fn scopes_mut(&mut self) -> &mut ScopeArena {
        &mut self.scopes
    }

    pub fn intern(&self, text: &str) -> StrId {
        self.strings.intern(text)
    }

    pub fn resolve(&self, id: StrId) -> Arc<str> {
        self.strings.resolve(id)
    }

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FunctionId) -> Result<&Function, RuntimeError> {
        self.functions
            .get(id.0 as usize)
            .ok_or_else(|| RuntimeError::UnknownFunction(format!("#{}", id.0)))
    }

    /// Record which scope owns a tuple type id. Load-time only.
    pub fn register_tuple_owner(&mut self, id: TupleTypeId, owner: ScopeId) {
        self.tuple_owners.insert(id, owner);
    }

    pub fn register_structure_owner(&mut self, id: StructTypeId, owner: ScopeId) {
        self.structure_owners.insert(id, owner);
    }

    pub fn tuple_owner(&self, id: TupleTypeId) -> Option<ScopeId> {
        self.tuple_owners.get(&id).copied()
    }

    pub fn structure_owner(&self, id: StructTypeId) -> Option<ScopeId> {
        self.structure_owners.get(&id).copied()
    }

    pub fn tuple_layout(&self, id: TupleTypeId) -> Result<&CompositeLayout, RuntimeError> {
        let owner = self
            .tuple_owners
            .get(&id)
            .ok_or(RuntimeError::UnknownTupleType(id.0))?;
        self.scopes
            .get(*owner)
            .tuple_layouts
            .get(&id)
            .ok_or(RuntimeError::UnknownTupleType(id.0))
    }

    pub fn structure_layout(&self, id: StructTypeId) -> Result<&CompositeLayout, RuntimeError> {
        let owner = self
            .structure_owners
            .get(&id)
            .ok_or(RuntimeError::UnknownStructureType(id.0))?;
        self.scopes
            .get(*owner)
            .structure_layouts
            .get(&id)
            .ok_or(RuntimeError::UnknownStructureType(id.0))
    }

    /// Layout lookup through a composite hint.
    pub fn layout_for_hint(&self, hint: CompositeHint) -> Result<&CompositeLayout, RuntimeError> {
        match hint {
            CompositeHint::Tuple(id) => self.tuple_layout(id),
            CompositeHint::Structure(id) => self.structure_layout(id),
        }
    }

    /// Operand-stack width of a type, resolving composites via hint.
    pub fn stack_width_of(
        &self,
        ty: VmType,
        hint: Option<CompositeHint>,
    ) -> Result<usize, RuntimeError> {
        if let Some(width) = ty.stack_width() {
            return Ok(width);
        }
        match hint {
            Some(h) => Ok(self.layout_for_hint(h)?.stack_width()),
            None => Err(RuntimeError::NotImplemented(
                "composite width requires a layout hint",
            )),
        }
    }

    /// Default value for a freshly-created variable slot. Primitives are
    /// zeroed; composites are built member-by-member from their layout;
    /// handle types start null and must be initialized before use.
    pub fn default_value(
        &self,
        ty: VmType,
        hint: Option<CompositeHint>,
    ) -> Result<Value, RuntimeError> {
        Ok(match ty {
            VmType::Int32 => Value::Int32(0),
            VmType::Int16 => Value::Int16(0),
            VmType::Real => Value::Real(0.0),
            VmType::Bool => Value::Bool(false),
            VmType::Str => Value::Str(self.intern("")),
            VmType::Tuple => {
                let id = match hint {
                    Some(CompositeHint::Tuple(id)) => id,
                    _ => {
                        return Err(RuntimeError::NotImplemented(
                            "tuple variable without a registered layout",
                        ))
                    }
                };
                let layout = self.tuple_layout(id)?.clone();
                let mut members = Vec::with_capacity(layout.len());
                for name in layout.member_order() {
                    let info = layout.member(*name).expect("member listed in order");
                    members.push(self.default_value(info.ty, info.hint)?);
                }
                Value::Tuple(TupleValue { type_id: id, members })
            }
            VmType::Structure => {
                let id = match hint {
                    Some(CompositeHint::Structure(id)) => id,
                    _ => {
                        return Err(RuntimeError::NotImplemented(
                            "structure variable without a registered layout",
                        ))
                    }
                };
                let layout = self.structure_layout(id)?.clone();
                let mut members = Vec::with_capacity(layout.len());
                for name in layout.member_order() {
                    let info = layout.member(*name).expect("member listed in order");
                    members.push(self.default_value(info.ty, info.hint)?);
                }
                Value::Structure(StructValue { type_id: id, members })
            }
            _ => Value::Null,
        })
    }

    /// Resolve the entrypoint function bound in the global scope.
    pub fn entrypoint(&self) -> Option<FunctionId> {
        let name = self.intern(ENTRYPOINT_NAME);
        self.scopes.function(self.global_scope, name)
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
