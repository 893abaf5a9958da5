//! Two-pass bytecode loader.
//!
//! Pass 1 (prepass) walks the whole image and declares every scope and
//! function so forward references resolve; pass 2 re-walks from offset
//! zero and builds scope contents, operation trees and code blocks.
//! Both passes consume exactly the same bytes.
//!
//! The loader owns everything it builds until `load` returns the
//! finished program; any error drops the partially-built structures
//! wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use fugue_extension::ExtensionRegistry;
use fugue_vm::{
    ArithmeticOp, Block, CompareKind, CompositeHint, CompositeLayout, FunctionId,
    FunctionSignature, FutureDecl, IfOp, Op, Program, ResponseMap, ResponseMapEntry, ScopeId,
    StrId, StructTypeId, TupleTypeId, VmType, Function,
};

use crate::opcodes as op;
use crate::reader::{ByteReader, LoadError};

/// Decode a bytecode image into an executable program.
pub fn load(buffer: &[u8]) -> Result<Program, LoadError> {
    load_with_extensions(buffer, None)
}

/// Decode a bytecode image, binding extension libraries and delivering
/// their data buffers through the given registry.
pub fn load_with_extensions(
    buffer: &[u8],
    registry: Option<&ExtensionRegistry>,
) -> Result<Program, LoadError> {
    let mut loader = Loader {
        reader: ByteReader::new(buffer),
        program: Program::new(),
        prepass: true,
        scope_ids: HashMap::new(),
        function_ids: HashMap::new(),
        registry,
    };

    loader.check_cookie()?;
    loader.check_flags()?;
    loader.check_extensions()?;
    loader.load_scope(true)?;
    // The init block's nested scopes must be declared here too; the
    // prepass guard inside keeps it from materializing the block.
    loader.load_global_init_block()?;
    log::debug!(
        "prepass complete: {} scopes, {} functions",
        loader.program.scopes().len(),
        loader.program.functions.len()
    );

    loader.reader = ByteReader::new(buffer);
    loader.prepass = false;
    loader.check_cookie()?;
    loader.check_flags()?;
    loader.check_extensions()?;
    loader.load_scope(true)?;

    loader.load_global_init_block()?;
    loader.load_extension_data()?;
    Ok(loader.program)
}

struct Loader<'a, 'r> {
    reader: ByteReader<'a>,
    program: Program,
    prepass: bool,
    /// Bytecode-local scope id -> arena id.
    scope_ids: HashMap<u32, ScopeId>,
    /// Bytecode-local function id -> function table id.
    function_ids: HashMap<u32, FunctionId>,
    registry: Option<&'r ExtensionRegistry>,
}

impl Loader<'_, '_> {
    fn check_cookie(&mut self) -> Result<(), LoadError> {
        self.reader.check_cookie(op::HEADER_COOKIE)
    }

    fn check_flags(&mut self) -> Result<(), LoadError> {
        let flags = self.reader.read_u32()?;
        if flags & op::FLAG_USES_CONSOLE != 0 {
            self.program.uses_console = true;
        }
        Ok(())
    }

    fn check_extensions(&mut self) -> Result<(), LoadError> {
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            if self.prepass {
                let id = self.program.intern(&name);
                self.program.extensions.push(id);
                match self.registry {
                    Some(registry) if registry.contains(&name) => {}
                    _ => log::warn!("bytecode references unregistered extension {}", name),
                }
            }
        }
        Ok(())
    }

    fn read_type(&mut self) -> Result<VmType, LoadError> {
        let offset = self.reader.offset();
        let raw = self.reader.read_u32()?;
        VmType::from_u32(raw).ok_or(LoadError::UnknownType { raw, offset })
    }

    fn intern(&self, text: &str) -> StrId {
        self.program.intern(text)
    }

    fn scope_for(&self, wire_id: u32) -> Result<ScopeId, LoadError> {
        self.scope_ids
            .get(&wire_id)
            .copied()
            .ok_or_else(|| LoadError::Malformed {
                detail: format!("reference to undeclared scope {}", wire_id),
                offset: self.reader.offset(),
            })
    }

    /// Load one scope record, recursively loading function bodies and
    /// their nested scopes.
    fn load_scope(&mut self, link_to_global: bool) -> Result<ScopeId, LoadError> {
        self.reader.expect(op::SCOPE)?;
        let wire_id = self.reader.read_u32()?;
        if link_to_global {
            self.scope_ids.insert(wire_id, self.program.global_scope());
        } else if self.prepass {
            let fresh = self.program.scopes_mut().alloc();
            self.scope_ids.insert(wire_id, fresh);
        }
        let scope_id = self.scope_for(wire_id)?;

        self.reader.expect(op::PARENT_SCOPE)?;
        let parent_wire = self.reader.read_u32()?;
        if parent_wire != 0 && !self.prepass {
            let parent = self.scope_for(parent_wire)?;
            self.program.scopes_mut().get_mut(scope_id).parent = Some(parent);
        }

        self.reader.expect(op::VARIABLES)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let is_reference = self.reader.read_flag()?;
            let name = self.reader.read_str0()?;
            let ty = self.read_type()?;
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .add_variable(name, ty, is_reference);
            }
        }

        self.reader.expect(op::GHOSTS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            self.reader.expect(op::GHOST_RECORD)?;
            if !self.prepass {
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .ghosts
                    .push(HashMap::new());
            }
            let entries = self.reader.read_u32()?;
            for _ in 0..entries {
                let name = self.reader.read_str0()?;
                let owner_wire = self.reader.read_u32()?;
                if !self.prepass {
                    let name = self.intern(&name);
                    let owner = self.scope_for(owner_wire)?;
                    self.program
                        .scopes_mut()
                        .get_mut(scope_id)
                        .ghosts
                        .last_mut()
                        .expect("record pushed above")
                        .insert(name, owner);
                }
            }
        }

        self.load_scope_functions(scope_id)?;

        self.reader.expect(op::FUNCTION_SIGNATURE_LIST)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            self.reader.expect(op::FUNCTION_SIGNATURE_BEGIN)?;
            let signature = self.load_function_signature()?;
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .signatures
                    .insert(name, signature);
            }
        }

        self.load_tuple_sections(scope_id)?;
        self.load_structure_sections(scope_id)?;

        self.reader.expect(op::CONSTANTS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            if !self.prepass {
                let name = self.intern(&name);
                self.program.scopes_mut().get_mut(scope_id).set_constant(name);
            }
        }

        self.load_response_maps(scope_id)?;

        self.reader.expect(op::FUTURES)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let ty = self.read_type()?;
            let operation = self.load_single_operation()?;
            if !self.prepass {
                let name = self.intern(&name);
                let operation = operation.ok_or_else(|| LoadError::Malformed {
                    detail: "future declaration carries no operation".to_string(),
                    offset: self.reader.offset(),
                })?;
                self.program.scopes_mut().get_mut(scope_id).futures.insert(
                    name,
                    FutureDecl {
                        ty,
                        op: Arc::new(operation),
                    },
                );
            }
        }

        self.reader.expect(op::ARRAY_HINTS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let ty = self.read_type()?;
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .array_types
                    .insert(name, ty);
            }
        }

        self.reader.expect(op::END_SCOPE)?;
        Ok(scope_id)
    }

    fn load_scope_functions(&mut self, scope_id: ScopeId) -> Result<(), LoadError> {
        self.reader.expect(op::FUNCTIONS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let wire_fid = self.reader.read_u32()?;
            let _reserved = self.reader.read_u32()?;

            if self.reader.peek_opcode()? == op::CALL_DLL {
                self.reader.read_opcode()?;
                let library = self.reader.read_str0()?;
                let symbol = self.reader.read_str0()?;
                let return_type = self.read_type()?;
                let return_hint = self.reader.read_u32()?;
                let params = self.load_scope(false)?;
                if self.prepass {
                    let function = Function::Native {
                        library: self.intern(&library),
                        symbol: self.intern(&symbol),
                        return_type,
                        return_hint,
                        params,
                    };
                    let id = self.program.add_function(function);
                    self.function_ids.insert(wire_fid, id);
                    let name = self.intern(&name);
                    self.program
                        .scopes_mut()
                        .get_mut(scope_id)
                        .add_function(name, id);
                }
            } else {
                let params = self.load_scope(false)?;
                let returns = self.load_scope(false)?;
                self.reader.expect(op::BEGIN_BLOCK)?;
                let locals = self.load_scope(false)?;
                let body = self.load_code_block()?;
                if self.prepass {
                    let function = Function::Bytecode {
                        params,
                        returns,
                        body: Block::new(),
                    };
                    let id = self.program.add_function(function);
                    self.function_ids.insert(wire_fid, id);
                    let name = self.intern(&name);
                    self.program
                        .scopes_mut()
                        .get_mut(scope_id)
                        .add_function(name, id);
                } else {
                    let mut body = body.ok_or_else(|| LoadError::Malformed {
                        detail: "function body missing in second pass".to_string(),
                        offset: self.reader.offset(),
                    })?;
                    body.bind_to_scope(locals);
                    let id = *self.function_ids.get(&wire_fid).ok_or_else(|| {
                        LoadError::Malformed {
                            detail: format!("reference to undeclared function {}", wire_fid),
                            offset: self.reader.offset(),
                        }
                    })?;
                    if let Function::Bytecode { body: slot, .. } =
                        &mut self.program.functions[id.0 as usize]
                    {
                        *slot = body;
                    }
                }
            }
        }
        Ok(())
    }

    fn load_function_signature(&mut self) -> Result<FunctionSignature, LoadError> {
        let param_count = self.reader.read_u32()?;
        let mut param_types = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            param_types.push(self.read_type()?);
        }

        let return_count = self.reader.read_u32()?;
        let mut return_types = Vec::with_capacity(return_count as usize);
        for _ in 0..return_count {
            return_types.push(self.read_type()?);
        }

        let hint_count = self.reader.read_u32()?;
        let mut param_hints = Vec::with_capacity(hint_count as usize);
        for _ in 0..hint_count {
            param_hints.push(self.reader.read_u32()?);
        }

        let flag_count = self.reader.read_u32()?;
        let mut param_flags = Vec::with_capacity(flag_count as usize);
        for _ in 0..flag_count {
            param_flags.push(self.reader.read_u32()?);
        }

        let sub_count = self.reader.read_u32()?;
        let mut sub_signatures = Vec::with_capacity(sub_count as usize);
        for _ in 0..sub_count {
            let offset = self.reader.offset();
            match self.reader.read_opcode()? {
                op::FUNCTION_SIGNATURE_END => sub_signatures.push(None),
                op::FUNCTION_SIGNATURE_BEGIN => {
                    sub_signatures.push(Some(Box::new(self.load_function_signature()?)));
                }
                found => {
                    return Err(LoadError::ExpectedInstruction {
                        expected: op::FUNCTION_SIGNATURE_BEGIN,
                        found,
                        offset,
                    })
                }
            }
        }

        let return_hint_count = self.reader.read_u32()?;
        let mut return_hints = Vec::with_capacity(return_hint_count as usize);
        for _ in 0..return_hint_count {
            return_hints.push(self.reader.read_u32()?);
        }

        self.reader.expect(op::FUNCTION_SIGNATURE_END)?;

        let mut signature = FunctionSignature::new();
        for (index, ty) in param_types.iter().enumerate() {
            let hint = param_hints.get(index).copied().unwrap_or(0);
            let sub = sub_signatures.get_mut(index).and_then(Option::take);
            signature.add_param(*ty, hint, sub);
            if param_flags.get(index).copied().unwrap_or(0) & fugue_vm::PARAM_FLAG_REFERENCE != 0 {
                signature.set_last_param_reference();
            }
        }
        for (index, ty) in return_types.iter().enumerate() {
            signature.add_return(*ty, return_hints.get(index).copied().unwrap_or(0));
        }
        Ok(signature)
    }

    fn load_tuple_sections(&mut self, scope_id: ScopeId) -> Result<(), LoadError> {
        self.reader.expect(op::TUPLE_TYPES)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let id = TupleTypeId(self.reader.read_u32()?);
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .tuple_names
                    .insert(name, id);
            }
        }

        self.reader.expect(op::TUPLE_HINTS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let id = TupleTypeId(self.reader.read_u32()?);
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .tuple_hints
                    .insert(name, id);
            }
        }

        self.reader.expect(op::TUPLE_TYPE_MAP)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let id = TupleTypeId(self.reader.read_u32()?);
            self.reader.expect(op::MEMBERS)?;
            let members = self.reader.read_u32()?;
            let mut layout = CompositeLayout::new();
            for _ in 0..members {
                let name = self.reader.read_str0()?;
                let ty = self.read_type()?;
                let _offset = self.reader.read_u32()?;
                if !self.prepass {
                    let name = self.intern(&name);
                    layout.add_member(name, ty).map_err(LoadError::from)?;
                }
            }
            if !self.prepass {
                layout.compute_offsets();
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .tuple_layouts
                    .insert(id, layout);
                self.program.register_tuple_owner(id, scope_id);
            }
        }
        Ok(())
    }

    fn load_structure_sections(&mut self, scope_id: ScopeId) -> Result<(), LoadError> {
        self.reader.expect(op::STRUCTURE_TYPES)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let id = StructTypeId(self.reader.read_u32()?);
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .structure_names
                    .insert(name, id);
            }
        }

        self.reader.expect(op::STRUCTURE_HINTS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let name = self.reader.read_str0()?;
            let id = StructTypeId(self.reader.read_u32()?);
            if !self.prepass {
                let name = self.intern(&name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .structure_hints
                    .insert(name, id);
            }
        }

        self.reader.expect(op::STRUCTURE_TYPE_MAP)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let id = StructTypeId(self.reader.read_u32()?);
            self.reader.expect(op::MEMBERS)?;
            let members = self.reader.read_u32()?;
            let mut layout = CompositeLayout::new();
            for _ in 0..members {
                let name = self.reader.read_str0()?;
                let ty = self.read_type()?;
                let _offset = self.reader.read_u32()?;
                let hint = if ty == VmType::Structure || ty == VmType::Tuple {
                    Some(self.reader.read_u32()?)
                } else {
                    None
                };
                if !self.prepass {
                    let name = self.intern(&name);
                    match (ty, hint) {
                        (VmType::Structure, Some(raw)) => {
                            let nested = StructTypeId(raw);
                            let width = self
                                .program
                                .structure_layout(nested)
                                .map_err(LoadError::from)?
                                .stack_width();
                            layout.add_composite_member(
                                name,
                                ty,
                                CompositeHint::Structure(nested),
                                width,
                            );
                        }
                        (VmType::Tuple, Some(raw)) => {
                            let nested = TupleTypeId(raw);
                            let width = self
                                .program
                                .tuple_layout(nested)
                                .map_err(LoadError::from)?
                                .stack_width();
                            layout.add_composite_member(
                                name,
                                ty,
                                CompositeHint::Tuple(nested),
                                width,
                            );
                        }
                        _ => layout.add_member(name, ty).map_err(LoadError::from)?,
                    }
                }
            }
            if !self.prepass {
                layout.compute_offsets();
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .structure_layouts
                    .insert(id, layout);
                self.program.register_structure_owner(id, scope_id);
            }
        }
        Ok(())
    }

    fn load_response_maps(&mut self, scope_id: ScopeId) -> Result<(), LoadError> {
        self.reader.expect(op::RESPONSE_MAPS)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let map_name = self.reader.read_str0()?;
            let entries = self.reader.read_u32()?;
            let mut map = ResponseMap::new();
            for _ in 0..entries {
                let message = self.reader.read_str0()?;
                let param_count = self.reader.read_u32()?;
                let mut payload_types = Vec::with_capacity(param_count as usize);
                for _ in 0..param_count {
                    payload_types.push(self.read_type()?);
                }

                self.reader.expect(op::BEGIN_BLOCK)?;
                let response_scope = self.load_scope(false)?;
                let block = self.load_code_block()?;
                let aux_scope = self.load_scope(false)?;

                if !self.prepass {
                    let mut block = block.ok_or_else(|| LoadError::Malformed {
                        detail: "response block missing in second pass".to_string(),
                        offset: self.reader.offset(),
                    })?;
                    block.bind_to_scope(response_scope);
                    map.add_entry(ResponseMapEntry {
                        message: self.intern(&message),
                        payload_types,
                        block,
                        aux_scope,
                    });
                }
            }
            if !self.prepass {
                let map_name = self.intern(&map_name);
                self.program
                    .scopes_mut()
                    .get_mut(scope_id)
                    .response_maps
                    .insert(map_name, map);
            }
        }
        Ok(())
    }

    /// Load one operation through a temporary block, as used by futures
    /// and compound sub-operation lists.
    fn load_single_operation(&mut self) -> Result<Option<Op>, LoadError> {
        let mut temp = if self.prepass { None } else { Some(Block::new()) };
        let opcode = self.reader.read_opcode()?;
        self.generate_op(opcode, &mut temp)?;
        Ok(temp.and_then(|mut block| block.pop_tail_operation()))
    }

    fn load_operation_list(&mut self) -> Result<Vec<Op>, LoadError> {
        let count = self.reader.read_u32()?;
        let mut operations = Vec::new();
        for _ in 0..count {
            if let Some(operation) = self.load_single_operation()? {
                operations.push(operation);
            }
        }
        Ok(operations)
    }

    /// Load a scope-bound block: `BeginBlock`, scope record, code block.
    fn load_bound_block(&mut self) -> Result<Option<(ScopeId, Block)>, LoadError> {
        self.reader.expect(op::BEGIN_BLOCK)?;
        let scope = self.load_scope(false)?;
        let block = self.load_code_block()?;
        Ok(block.map(|mut block| {
            block.bind_to_scope(scope);
            (scope, block)
        }))
    }

    /// Read instruction records until the block terminator.
    fn load_code_block(&mut self) -> Result<Option<Block>, LoadError> {
        let mut block = if self.prepass { None } else { Some(Block::new()) };
        loop {
            let opcode = self.reader.read_opcode()?;
            if opcode == op::END_BLOCK {
                return Ok(block);
            }
            self.generate_op(opcode, &mut block)?;
        }
    }

    fn push_op(&self, block: &mut Option<Block>, operation: Op) {
        if let Some(block) = block {
            block.add_operation(operation);
        }
    }

    /// Turn one instruction record into an operation node.
    fn generate_op(&mut self, instruction: u8, block: &mut Option<Block>) -> Result<(), LoadError> {
        let at = self.reader.offset().saturating_sub(1);
        match instruction {
            op::PUSH_OPERATION => {
                let inner = self.reader.read_opcode()?;
                self.generate_op(inner, block)?;
                if let Some(block) = block {
                    let inner = block.pop_tail_operation().ok_or(LoadError::Malformed {
                        detail: "push wraps no operation".to_string(),
                        offset: at,
                    })?;
                    block.add_operation(Op::Push(Box::new(inner)));
                }
            }
            op::PUSH_INTEGER_LITERAL => {
                let value = self.reader.read_i32()?;
                self.push_op(block, Op::PushInt(value));
            }
            op::PUSH_INTEGER16_LITERAL => {
                let value = self.reader.read_i32()? as i16;
                self.push_op(block, Op::PushInt16(value));
            }
            op::PUSH_REAL_LITERAL => {
                let value = self.reader.read_f32()?;
                self.push_op(block, Op::PushReal(value));
            }
            op::PUSH_BOOLEAN_LITERAL => {
                let value = self.reader.read_flag()?;
                self.push_op(block, Op::PushBool(value));
            }
            op::PUSH_STRING_LITERAL => {
                let value = self.reader.read_strn()?;
                let id = self.intern(&value);
                self.push_op(block, Op::PushStr(id));
            }
            op::INTEGER_LITERAL => {
                let value = self.reader.read_i32()?;
                self.push_op(block, Op::IntConstant(value));
            }
            op::BOOLEAN_LITERAL => {
                let value = self.reader.read_flag()?;
                self.push_op(block, Op::BoolConstant(value));
            }
            op::DEBUG_WRITE => self.push_op(block, Op::DebugWrite),
            op::DEBUG_READ => self.push_op(block, Op::DebugRead),

            op::GET_VALUE => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::GetValue(id));
            }
            op::ASSIGN_VALUE => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::AssignValue(id));
            }
            op::INIT => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::InitValue(id));
            }
            op::BIND_REFERENCE => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::BindReference(id));
            }
            op::BIND_FUNCTION_REFERENCE => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::BindFunctionReference(id));
            }
            op::SIZE_OF => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::SizeOf(id));
            }
            op::READ_ARRAY => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::ReadArray(id));
            }
            op::WRITE_ARRAY => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::WriteArray(id));
            }
            op::ARRAY_LENGTH => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::ArrayLength(id));
            }
            op::CONS_ARRAY_INDIRECT => {
                let elem_type = self.read_type()?;
                let count = self.load_single_operation()?;
                if let Some(block) = block {
                    let count = count.ok_or(LoadError::Malformed {
                        detail: "array constructor carries no count operation".to_string(),
                        offset: at,
                    })?;
                    block.add_operation(Op::ConsArrayIndirect {
                        elem_type,
                        count: Box::new(count),
                    });
                }
            }

            op::READ_TUPLE | op::WRITE_TUPLE | op::READ_STRUCTURE | op::WRITE_STRUCTURE => {
                let var = self.reader.read_str0()?;
                let member = self.reader.read_str0()?;
                if !self.prepass {
                    let var = self.intern(&var);
                    let member = self.intern(&member);
                    let operation = match instruction {
                        op::READ_TUPLE => Op::ReadTuple { var, member },
                        op::WRITE_TUPLE => Op::WriteTuple { var, member },
                        op::READ_STRUCTURE => Op::ReadStructure { var, member },
                        _ => Op::WriteStructure { var, member },
                    };
                    self.push_op(block, operation);
                }
            }
            op::READ_STRUCTURE_INDIRECT => {
                let member = self.reader.read_str0()?;
                if let Some(block) = block {
                    let prior = block.ops.len().checked_sub(1).ok_or(LoadError::Malformed {
                        detail: "indirect structure read without a prior operation".to_string(),
                        offset: at,
                    })?;
                    let member = self.intern(&member);
                    block.add_operation(Op::ReadStructureIndirect { member, prior });
                }
            }
            op::WRITE_STRUCTURE_INDIRECT => {
                let member = self.reader.read_str0()?;
                let id = self.intern(&member);
                self.push_op(block, Op::WriteStructureIndirect { member: id });
            }
            op::BIND_STRUCT => {
                let chained = self.reader.read_flag()?;
                let var = if chained {
                    None
                } else {
                    Some(self.reader.read_str0()?)
                };
                let member = self.reader.read_str0()?;
                if !self.prepass {
                    let var = var.map(|name| self.intern(&name));
                    let member = self.intern(&member);
                    self.push_op(block, Op::BindStructMember { var, member });
                }
            }

            op::ADD_INTEGERS | op::ADD_INTEGER16S | op::ADD_REALS | op::SUBTRACT_INTEGERS
            | op::SUBTRACT_INTEGER16S | op::SUBTRACT_REALS | op::MULTIPLY_INTEGERS
            | op::MULTIPLY_INTEGER16S | op::MULTIPLY_REALS | op::DIVIDE_INTEGERS
            | op::DIVIDE_INTEGER16S | op::DIVIDE_REALS => {
                let first_is_array = self.reader.read_flag()?;
                let second_is_array = self.reader.read_flag()?;
                let param_count = self.reader.read_u32()?;
                let (kind, ty) = op::arithmetic_for_opcode(instruction)
                    .expect("matched arithmetic opcode");
                self.push_op(
                    block,
                    Op::Arithmetic(ArithmeticOp {
                        kind,
                        ty,
                        first_is_array,
                        second_is_array,
                        param_count,
                    }),
                );
            }
            op::CONCAT => {
                let first_is_array = self.reader.read_flag()?;
                let second_is_array = self.reader.read_flag()?;
                let param_count = self.reader.read_u32()?;
                self.push_op(
                    block,
                    Op::Concat {
                        first_is_array,
                        second_is_array,
                        param_count,
                    },
                );
            }

            op::IS_EQUAL | op::IS_NOT_EQUAL | op::IS_LESSER | op::IS_LESSER_EQUAL
            | op::IS_GREATER | op::IS_GREATER_EQUAL => {
                let ty = self.read_type()?;
                let kind = match instruction {
                    op::IS_EQUAL => CompareKind::Equal,
                    op::IS_NOT_EQUAL => CompareKind::NotEqual,
                    op::IS_LESSER => CompareKind::Less,
                    op::IS_LESSER_EQUAL => CompareKind::LessEqual,
                    op::IS_GREATER => CompareKind::Greater,
                    _ => CompareKind::GreaterEqual,
                };
                self.push_op(block, Op::Compare { kind, ty });
            }

            op::LOGICAL_AND => {
                let operands = self.load_operation_list()?;
                self.push_op(block, Op::LogicalAnd { operands });
            }
            op::LOGICAL_OR => {
                let operands = self.load_operation_list()?;
                self.push_op(block, Op::LogicalOr { operands });
            }
            op::LOGICAL_XOR => self.push_op(block, Op::LogicalXor),
            op::LOGICAL_NOT => self.push_op(block, Op::LogicalNot),
            op::BITWISE_AND => {
                let ty = self.read_type()?;
                let operands = self.load_operation_list()?;
                self.push_op(block, Op::BitwiseAnd { ty, operands });
            }
            op::BITWISE_OR => {
                let ty = self.read_type()?;
                let operands = self.load_operation_list()?;
                self.push_op(block, Op::BitwiseOr { ty, operands });
            }
            op::BITWISE_XOR => {
                let ty = self.read_type()?;
                self.push_op(block, Op::BitwiseXor { ty });
            }
            op::BITWISE_NOT => {
                let ty = self.read_type()?;
                self.push_op(block, Op::BitwiseNot { ty });
            }

            op::DO_WHILE => {
                let body = self.load_bound_block()?;
                if let Some((_, body)) = body {
                    self.push_op(block, Op::DoWhile { body });
                }
            }
            op::WHILE => {
                let body = self.load_bound_block()?;
                if let Some((_, body)) = body {
                    self.push_op(block, Op::While { body });
                }
            }
            op::WHILE_CONDITION => self.push_op(block, Op::WhileCondition),
            op::BREAK => self.push_op(block, Op::Break),
            op::RETURN => self.push_op(block, Op::Return),
            op::IF => self.load_if(block)?,
            op::ELSE_IF => {
                let offset = self.reader.offset();
                let next = self.reader.read_opcode()?;
                if next != op::BEGIN_BLOCK {
                    return Err(LoadError::ExpectedInstruction {
                        expected: op::BEGIN_BLOCK,
                        found: next,
                        offset,
                    });
                }
                let scope = self.load_scope(false)?;
                let body = self.load_code_block()?;
                if let Some(mut body) = body {
                    body.bind_to_scope(scope);
                    self.push_op(block, Op::ElseIf { body });
                }
            }
            op::EXIT_IF_CHAIN => self.push_op(block, Op::ExitIfChain),
            op::BEGIN_BLOCK => {
                // An anonymous nested block.
                let scope = self.load_scope(false)?;
                let body = self.load_code_block()?;
                if let Some(mut body) = body {
                    body.bind_to_scope(scope);
                    self.push_op(block, Op::ExecuteBlock { body });
                }
            }

            op::INVOKE => {
                let wire_fid = self.reader.read_u32()?;
                if !self.prepass {
                    let id = *self.function_ids.get(&wire_fid).ok_or(LoadError::Malformed {
                        detail: format!("reference to undeclared function {}", wire_fid),
                        offset: at,
                    })?;
                    self.push_op(block, Op::Invoke(id));
                }
            }
            op::INVOKE_INDIRECT => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::InvokeIndirect(id));
            }

            op::FORK_TASK | op::FORK_THREAD => {
                let body = self.load_bound_block()?;
                if let Some((scope, body)) = body {
                    // Forked bodies resolve lexically against the global
                    // scope, never the forking context.
                    let global = self.program.global_scope();
                    self.program.scopes_mut().get_mut(scope).parent = Some(global);
                    let body = Arc::new(body);
                    let operation = if instruction == op::FORK_TASK {
                        Op::ForkTask { body }
                    } else {
                        Op::ForkThread { body }
                    };
                    self.push_op(block, operation);
                }
            }
            op::THREAD_POOL => self.push_op(block, Op::CreateThreadPool),
            op::FUTURE => {
                let name = self.reader.read_str0()?;
                let ty = self.read_type()?;
                let use_pool = self.reader.read_flag()?;
                if !self.prepass {
                    let name = self.intern(&name);
                    self.push_op(block, Op::ForkFuture { name, ty, use_pool });
                }
            }
            op::ACCEPT_MESSAGE => {
                let message = self.reader.read_str0()?;
                let param_count = self.reader.read_u32()?;
                let mut payload_types = Vec::with_capacity(param_count as usize);
                for _ in 0..param_count {
                    payload_types.push(self.read_type()?);
                }
                self.reader.expect(op::BEGIN_BLOCK)?;
                let response_scope = self.load_scope(false)?;
                let body = self.load_code_block()?;
                let aux_scope = self.load_scope(false)?;
                if !self.prepass {
                    let mut body = body.ok_or(LoadError::Malformed {
                        detail: "accept-message response block missing".to_string(),
                        offset: at,
                    })?;
                    body.bind_to_scope(response_scope);
                    let message = self.intern(&message);
                    self.push_op(
                        block,
                        Op::AcceptMessage {
                            message,
                            payload_types,
                            body,
                            aux_scope,
                        },
                    );
                }
            }
            op::ACCEPT_MESSAGE_FROM_MAP => {
                let name = self.reader.read_str0()?;
                let id = self.intern(&name);
                self.push_op(block, Op::AcceptMessageFromMap(id));
            }
            op::SEND_TASK_MESSAGE => {
                let by_name = self.reader.read_flag()?;
                let message = self.reader.read_str0()?;
                let param_count = self.reader.read_u32()?;
                let mut payload_types = Vec::with_capacity(param_count as usize);
                for _ in 0..param_count {
                    payload_types.push(self.read_type()?);
                }
                if !self.prepass {
                    let message = self.intern(&message);
                    self.push_op(
                        block,
                        Op::SendTaskMessage {
                            by_name,
                            message,
                            payload_types,
                        },
                    );
                }
            }
            op::GET_MESSAGE_SENDER => self.push_op(block, Op::GetMessageSender),
            op::GET_TASK_CALLER => self.push_op(block, Op::GetTaskCaller),
            op::PARALLEL_FOR => {
                let counter = self.reader.read_str0()?;
                let body = self.load_bound_block()?;
                if let Some((scope, body)) = body {
                    let counter = self.intern(&counter);
                    // The body scope always carries the counter variable.
                    let desc = self.program.scopes_mut().get_mut(scope);
                    if !desc.variables.contains_key(&counter) {
                        desc.add_variable(counter, VmType::Int32, false);
                    }
                    self.push_op(
                        block,
                        Op::ParallelFor {
                            counter,
                            body: Arc::new(body),
                        },
                    );
                }
            }
            op::HANDOFF => {
                let library = self.reader.read_str0()?;
                let code_handle = self.reader.read_u32()?;
                let body = self.load_bound_block()?;
                if let Some((_, body)) = body {
                    let library = self.intern(&library);
                    self.push_op(
                        block,
                        Op::Handoff {
                            library,
                            code_handle,
                            body: Arc::new(body),
                        },
                    );
                }
            }
            op::HANDOFF_CONTROL => {
                let library = self.reader.read_str0()?;
                let counter = self.reader.read_str0()?;
                let code_handle = self.reader.read_u32()?;
                let body = self.load_bound_block()?;
                if let Some((_, body)) = body {
                    let library = self.intern(&library);
                    let counter = self.intern(&counter);
                    self.push_op(
                        block,
                        Op::HandoffControl {
                            library,
                            counter,
                            code_handle,
                            body: Arc::new(body),
                        },
                    );
                }
            }

            op::TYPE_CAST => {
                let from_offset = self.reader.offset();
                let from_raw = self.reader.read_u32()?;
                let to_raw = self.reader.read_u32()?;
                let (from, to) = match (VmType::from_u32(from_raw), VmType::from_u32(to_raw)) {
                    (Some(from), Some(to)) if cast_supported(from, to) => (from, to),
                    _ => {
                        return Err(LoadError::UnknownCast {
                            from: from_raw,
                            to: to_raw,
                            offset: from_offset,
                        })
                    }
                };
                self.push_op(block, Op::TypeCast { from, to });
            }
            op::TYPE_CAST_TO_STRING => {
                let from_offset = self.reader.offset();
                let raw = self.reader.read_u32()?;
                let from = match VmType::from_u32(raw) {
                    Some(
                        from @ (VmType::Int32
                        | VmType::Int16
                        | VmType::Real
                        | VmType::Bool
                        | VmType::Buffer),
                    ) => from,
                    _ => {
                        return Err(LoadError::UnknownCast {
                            from: raw,
                            to: VmType::Str.as_u32(),
                            offset: from_offset,
                        })
                    }
                };
                self.push_op(block, Op::CastToString { from });
            }

            op::MAP => {
                let inner = self.load_single_operation()?;
                if let Some(inner) = inner {
                    self.push_op(block, Op::MapOperation(Box::new(inner)));
                }
            }
            op::REDUCE => {
                let inner = self.load_single_operation()?;
                if let Some(inner) = inner {
                    self.push_op(block, Op::ReduceOperation(Box::new(inner)));
                }
            }

            opcode => {
                return Err(LoadError::UnknownOpcode { opcode, offset: at });
            }
        }
        Ok(())
    }

    /// `If` record: optional true block, optional else-if wrapper,
    /// optional false block, each slot either a bound block or a no-op
    /// placeholder.
    fn load_if(&mut self, block: &mut Option<Block>) -> Result<(), LoadError> {
        let true_block = self.load_optional_bound_block()?;
        let else_if_chain = {
            let offset = self.reader.offset();
            match self.reader.read_opcode()? {
                op::ELSE_IF_WRAPPER => {
                    let loaded = self.load_bound_block()?;
                    loaded.map(|(_, body)| body)
                }
                op::NO_OP => None,
                found => {
                    return Err(LoadError::ExpectedInstruction {
                        expected: op::ELSE_IF_WRAPPER,
                        found,
                        offset,
                    })
                }
            }
        };
        let false_block = self.load_optional_bound_block()?;

        if !self.prepass {
            self.push_op(
                block,
                Op::If(IfOp {
                    true_block,
                    else_if_chain,
                    false_block,
                }),
            );
        }
        Ok(())
    }

    /// Either a scope-bound block or the `NoOp` placeholder.
    fn load_optional_bound_block(&mut self) -> Result<Option<Block>, LoadError> {
        let offset = self.reader.offset();
        match self.reader.read_opcode()? {
            op::BEGIN_BLOCK => {
                let scope = self.load_scope(false)?;
                let body = self.load_code_block()?;
                Ok(body.map(|mut body| {
                    body.bind_to_scope(scope);
                    body
                }))
            }
            op::NO_OP => Ok(None),
            found => Err(LoadError::ExpectedInstruction {
                expected: op::BEGIN_BLOCK,
                found,
                offset,
            }),
        }
    }

    fn load_global_init_block(&mut self) -> Result<(), LoadError> {
        self.reader.expect(op::GLOBAL_BLOCK)?;
        let offset = self.reader.offset();
        match self.reader.read_opcode()? {
            op::BEGIN_BLOCK => {
                let block = self.load_code_block()?;
                if !self.prepass {
                    self.program.global_init = block;
                }
            }
            op::NO_OP => {}
            found => {
                return Err(LoadError::ExpectedInstruction {
                    expected: op::BEGIN_BLOCK,
                    found,
                    offset,
                })
            }
        }
        Ok(())
    }

    fn load_extension_data(&mut self) -> Result<(), LoadError> {
        self.reader.expect(op::EXTENSION_DATA)?;
        let count = self.reader.read_u32()?;
        for _ in 0..count {
            let library = self.reader.read_str0()?;
            let size = self.reader.read_u32()?;
            let data = self.reader.read_bytes(size as usize)?;
            if let Some(registry) = self.registry {
                registry.deliver_data(&library, &data);
            }
            let library = self.intern(&library);
            self.program.extension_data.push((library, data));
        }
        Ok(())
    }
}

/// The cast combinations the engine implements. Anything else is a
/// static error at load time.
fn cast_supported(from: VmType, to: VmType) -> bool {
    let source_ok = matches!(
        from,
        VmType::Str | VmType::Real | VmType::Int32 | VmType::Int16 | VmType::Bool
    );
    let target_ok = matches!(to, VmType::Int32 | VmType::Int16 | VmType::Real);
    source_ok && target_ok && from != to
}
