//! Lexical scope descriptors and activation records.
//!
//! A `ScopeDescription` is the static shape of a scope: variable
//! declarations, function bindings, registered layouts, constants,
//! response maps and futures. Descriptions live in the program's arena
//! and are immutable after load; parent links are arena indices, so the
//! scope tree carries no ownership cycles.
//!
//! A `Frame` is one activation of a description: live slots created on
//! entry and dropped on exit. Reference slots share the referent's cell,
//! so a referent outlives every reference by refcount.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use crate::block::Block;
use crate::ops::Op;
use crate::task::FutureCell;
use crate::value::{
    CompositeHint, CompositeLayout, FunctionSignature, RuntimeError, StrId, StructTypeId,
    TupleTypeId, Value, VmType,
};

/// Index into the program's scope arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// A declared variable slot shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableDecl {
    pub ty: VmType,
    pub is_reference: bool,
}

/// One `(message pattern -> response block)` association.
pub struct ResponseMapEntry {
    pub message: StrId,
    pub payload_types: Vec<VmType>,
    pub block: Block,
    /// Scope holding the message payload bindings, activated when the
    /// entry fires.
    pub aux_scope: ScopeId,
}

/// Named collection of response entries belonging to a scope.
#[derive(Default)]
pub struct ResponseMap {
    pub entries: Vec<ResponseMapEntry>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: ResponseMapEntry) {
        self.entries.push(entry);
    }
}

/// A future declared in a scope: its produced type and the operation the
/// spawning computation runs.
pub struct FutureDecl {
    pub ty: VmType,
    pub op: Arc<Op>,
}

/// Static description of a lexical scope.
#[derive(Default)]
pub struct ScopeDescription {
    pub parent: Option<ScopeId>,

    /// Variable declaration order; drives argument popping and default
    /// initialization.
    pub member_order: Vec<StrId>,
    pub variables: HashMap<StrId, VariableDecl>,

    /// Ghost set stack: name -> owning scope, exposing a foreign scope's
    /// names without copying.
    pub ghosts: Vec<HashMap<StrId, ScopeId>>,

    /// Function bindings in registration order.
    pub functions: Vec<(StrId, crate::value::FunctionId)>,

    pub signatures: HashMap<StrId, FunctionSignature>,

    /// Type-name registrations and per-variable layout hints.
    pub tuple_names: HashMap<StrId, TupleTypeId>,
    pub tuple_hints: HashMap<StrId, TupleTypeId>,
    pub tuple_layouts: HashMap<TupleTypeId, CompositeLayout>,
    pub structure_names: HashMap<StrId, StructTypeId>,
    pub structure_hints: HashMap<StrId, StructTypeId>,
    pub structure_layouts: HashMap<StructTypeId, CompositeLayout>,

    pub constants: HashSet<StrId>,

    pub response_maps: HashMap<StrId, ResponseMap>,
    pub futures: HashMap<StrId, FutureDecl>,

    /// Element-type hints for array variables.
    pub array_types: HashMap<StrId, VmType>,
}

impl ScopeDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: StrId, ty: VmType, is_reference: bool) {
        self.member_order.push(name);
        self.variables.insert(name, VariableDecl { ty, is_reference });
    }

    pub fn add_function(&mut self, name: StrId, id: crate::value::FunctionId) {
        self.functions.push((name, id));
    }

    pub fn function(&self, name: StrId) -> Option<crate::value::FunctionId> {
        self.functions
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    pub fn set_constant(&mut self, name: StrId) {
        self.constants.insert(name);
    }
}

/// Arena of scope descriptions. Owns every scope in a program; all
/// cross-scope links are `ScopeId` indices into this arena.
#[derive(Default)]
pub struct ScopeArena {
    scopes: Vec<ScopeDescription>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(ScopeDescription::new());
        id
    }

    pub fn get(&self, id: ScopeId) -> &ScopeDescription {
        &self.scopes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut ScopeDescription {
        &mut self.scopes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Walk a scope and its ancestors, returning the first hit of `f`.
    fn find_in_chain<T>(
        &self,
        start: ScopeId,
        mut f: impl FnMut(&ScopeDescription) -> Option<T>,
    ) -> Option<T> {
        let mut current = Some(start);
        while let Some(id) = current {
            let desc = self.get(id);
            if let Some(found) = f(desc) {
                return Some(found);
            }
            current = desc.parent;
        }
        None
    }

    /// Resolve a variable declaration, walking parents. Ghost entries
    /// participate: a ghost name resolves to its owner's declaration.
    pub fn variable(&self, start: ScopeId, name: StrId) -> Option<VariableDecl> {
        self.find_in_chain(start, |desc| {
            if let Some(decl) = desc.variables.get(&name) {
                return Some(*decl);
            }
            for ghost in &desc.ghosts {
                if let Some(owner) = ghost.get(&name) {
                    if let Some(decl) = self.get(*owner).variables.get(&name) {
                        return Some(*decl);
                    }
                }
            }
            None
        })
    }

    pub fn variable_type(&self, start: ScopeId, name: StrId) -> Option<VmType> {
        self.variable(start, name).map(|d| d.ty)
    }

    pub fn is_constant(&self, start: ScopeId, name: StrId) -> bool {
        self.find_in_chain(start, |desc| desc.constants.contains(&name).then_some(()))
            .is_some()
    }

    pub fn function(&self, start: ScopeId, name: StrId) -> Option<crate::value::FunctionId> {
        self.find_in_chain(start, |desc| desc.function(name))
    }

    pub fn signature(&self, start: ScopeId, name: StrId) -> Option<&FunctionSignature> {
        let mut current = Some(start);
        while let Some(id) = current {
            let desc = self.get(id);
            if let Some(sig) = desc.signatures.get(&name) {
                return Some(sig);
            }
            current = desc.parent;
        }
        None
    }

    pub fn tuple_hint(&self, start: ScopeId, name: StrId) -> Option<TupleTypeId> {
        self.find_in_chain(start, |desc| desc.tuple_hints.get(&name).copied())
    }

    pub fn structure_hint(&self, start: ScopeId, name: StrId) -> Option<StructTypeId> {
        self.find_in_chain(start, |desc| desc.structure_hints.get(&name).copied())
    }

    /// Composite layout hint for a declared variable, if any.
    pub fn variable_hint(&self, start: ScopeId, name: StrId) -> Option<CompositeHint> {
        if let Some(id) = self.structure_hint(start, name) {
            return Some(CompositeHint::Structure(id));
        }
        self.tuple_hint(start, name).map(CompositeHint::Tuple)
    }

    pub fn array_elem_type(&self, start: ScopeId, name: StrId) -> Option<VmType> {
        self.find_in_chain(start, |desc| desc.array_types.get(&name).copied())
    }

    pub fn response_map(&self, start: ScopeId, name: StrId) -> Option<&ResponseMap> {
        let mut current = Some(start);
        while let Some(id) = current {
            let desc = self.get(id);
            if let Some(map) = desc.response_maps.get(&name) {
                return Some(map);
            }
            current = desc.parent;
        }
        None
    }

    pub fn future_decl(&self, start: ScopeId, name: StrId) -> Option<&FutureDecl> {
        let mut current = Some(start);
        while let Some(id) = current {
            let desc = self.get(id);
            if let Some(decl) = desc.futures.get(&name) {
                return Some(decl);
            }
            current = desc.parent;
        }
        None
    }
}

/// A live variable cell, or a view into a member of one.
///
/// `root` is the owning cell; `path` descends through composite members.
/// An empty path addresses the whole variable. Cloning a slot shares the
/// cell, which is exactly the reference-binding semantics: writes through
/// either are visible through both.
#[derive(Clone)]
pub struct Slot {
    root: Rc<RefCell<Value>>,
    path: Vec<StrId>,
}

impl Slot {
    pub fn direct(value: Value) -> Slot {
        Slot {
            root: Rc::new(RefCell::new(value)),
            path: Vec::new(),
        }
    }

    /// A view one member deeper into the same cell.
    pub fn member(&self, name: StrId) -> Slot {
        let mut path = self.path.clone();
        path.push(name);
        Slot {
            root: Rc::clone(&self.root),
            path,
        }
    }

    pub fn path(&self) -> &[StrId] {
        &self.path
    }

    /// Read the addressed value (clone).
    pub fn read(&self, program: &crate::program::Program) -> Result<Value, RuntimeError> {
        let root = self.root.borrow();
        let mut current: &Value = &root;
        for name in &self.path {
            current = composite_member(current, program, *name)?;
        }
        Ok(current.clone())
    }

    /// Write the addressed value.
    pub fn write(
        &self,
        program: &crate::program::Program,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let mut root = self.root.borrow_mut();
        let mut current: &mut Value = &mut root;
        for name in &self.path {
            current = composite_member_mut(current, program, *name)?;
        }
        *current = value;
        Ok(())
    }

    /// Static type and layout hint of the addressed location, derived
    /// from the value currently stored there.
    pub fn target_type(
        &self,
        program: &crate::program::Program,
    ) -> Result<(VmType, Option<CompositeHint>), RuntimeError> {
        let value = self.read(program)?;
        let hint = match &value {
            Value::Tuple(t) => Some(CompositeHint::Tuple(t.type_id)),
            Value::Structure(s) => Some(CompositeHint::Structure(s.type_id)),
            _ => None,
        };
        Ok((value.vm_type(), hint))
    }
}

/// Resolve a member reference inside a composite value.
fn composite_member<'a>(
    value: &'a Value,
    program: &crate::program::Program,
    name: StrId,
) -> Result<&'a Value, RuntimeError> {
    match value {
        Value::Structure(s) => {
            let layout = program.structure_layout(s.type_id)?;
            let index = layout.member_index(name).ok_or_else(|| RuntimeError::UnknownMember {
                type_name: "structure".to_string(),
                member: program.resolve(name).to_string(),
            })?;
            Ok(&s.members[index])
        }
        Value::Tuple(t) => {
            let layout = program.tuple_layout(t.type_id)?;
            let index = layout.member_index(name).ok_or_else(|| RuntimeError::UnknownMember {
                type_name: "tuple".to_string(),
                member: program.resolve(name).to_string(),
            })?;
            Ok(&t.members[index])
        }
        other => Err(RuntimeError::type_mismatch(VmType::Structure, other.vm_type())),
    }
}

fn composite_member_mut<'a>(
    value: &'a mut Value,
    program: &crate::program::Program,
    name: StrId,
) -> Result<&'a mut Value, RuntimeError> {
    match value {
        Value::Structure(s) => {
            let layout = program.structure_layout(s.type_id)?;
            let index = layout.member_index(name).ok_or_else(|| RuntimeError::UnknownMember {
                type_name: "structure".to_string(),
                member: program.resolve(name).to_string(),
            })?;
            Ok(&mut s.members[index])
        }
        Value::Tuple(t) => {
            let layout = program.tuple_layout(t.type_id)?;
            let index = layout.member_index(name).ok_or_else(|| RuntimeError::UnknownMember {
                type_name: "tuple".to_string(),
                member: program.resolve(name).to_string(),
            })?;
            Ok(&mut t.members[index])
        }
        other => Err(RuntimeError::type_mismatch(VmType::Structure, other.vm_type())),
    }
}

/// One activation of a scope description.
pub struct Frame {
    pub desc: ScopeId,
    /// Function-call frames stop lexical lookup from reaching the
    /// caller's locals; only the global frame remains visible below.
    pub barrier: bool,
    slots: HashMap<StrId, Slot>,
    futures: HashMap<StrId, Arc<FutureCell>>,
}

impl Frame {
    pub fn new(desc: ScopeId, barrier: bool) -> Frame {
        Frame {
            desc,
            barrier,
            slots: HashMap::new(),
            futures: HashMap::new(),
        }
    }

    pub fn insert_slot(&mut self, name: StrId, slot: Slot) {
        self.slots.insert(name, slot);
    }

    pub fn slot(&self, name: StrId) -> Option<&Slot> {
        self.slots.get(&name)
    }

    pub fn insert_future(&mut self, name: StrId, cell: Arc<FutureCell>) {
        self.futures.insert(name, cell);
    }

    pub fn future(&self, name: StrId) -> Option<&Arc<FutureCell>> {
        self.futures.get(&name)
    }
}
