//! Binary writer: serializes a program back into the bytecode format
//! the loader consumes.
//!
//! Sections backed by hash maps are emitted sorted by resolved name (or
//! numeric type id), so writing is deterministic and
//! `write(load(bytes)) == bytes` holds for writer-produced images.

use fugue_vm::{
    Block, CompositeLayout, Function, FunctionSignature, Op, Program, ResponseMapEntry, ScopeId,
    StrId, RuntimeError,
};

use crate::opcodes as op;

/// Serialize a program into a bytecode image.
pub fn write(program: &Program) -> Result<Vec<u8>, RuntimeError> {
    let mut writer = Writer {
        program,
        out: Vec::new(),
    };
    writer.write_program()?;
    Ok(writer.out)
}

struct Writer<'a> {
    program: &'a Program,
    out: Vec<u8>,
}

impl Writer<'_> {
    fn emit_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    fn emit_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_f32(&mut self, value: f32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_flag(&mut self, value: bool) {
        self.out.push(value as u8);
    }

    fn emit_str0(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(0);
    }

    fn emit_strn(&mut self, text: &str) {
        self.emit_i32(text.len() as i32);
        self.out.extend_from_slice(text.as_bytes());
    }

    fn emit_name(&mut self, id: StrId) {
        let text = self.program.resolve(id);
        self.emit_str0(&text);
    }

    fn scope_wire_id(&self, id: ScopeId) -> u32 {
        id.0 + 1
    }

    /// Collect `(name, value)` pairs sorted by resolved name content.
    fn by_name<T: Clone>(&self, entries: impl Iterator<Item = (StrId, T)>) -> Vec<(StrId, T)> {
        let mut collected: Vec<(String, StrId, T)> = entries
            .map(|(id, value)| (self.program.resolve(id).to_string(), id, value))
            .collect();
        collected.sort_by(|a, b| a.0.cmp(&b.0));
        collected
            .into_iter()
            .map(|(_, id, value)| (id, value))
            .collect()
    }

    fn write_program(&mut self) -> Result<(), RuntimeError> {
        self.out.extend_from_slice(op::HEADER_COOKIE);

        let flags = if self.program.uses_console {
            op::FLAG_USES_CONSOLE
        } else {
            0
        };
        self.emit_u32(flags);

        self.emit_u32(self.program.extensions.len() as u32);
        for extension in &self.program.extensions {
            self.emit_name(*extension);
        }

        self.write_scope(self.program.global_scope())?;

        self.emit_u8(op::GLOBAL_BLOCK);
        match &self.program.global_init {
            Some(block) => {
                self.emit_u8(op::BEGIN_BLOCK);
                for operation in &block.ops {
                    self.write_op(operation)?;
                }
                self.emit_u8(op::END_BLOCK);
            }
            None => self.emit_u8(op::NO_OP),
        }

        self.emit_u8(op::EXTENSION_DATA);
        self.emit_u32(self.program.extension_data.len() as u32);
        for (library, data) in &self.program.extension_data {
            self.emit_name(*library);
            self.emit_u32(data.len() as u32);
            self.out.extend_from_slice(data);
        }
        Ok(())
    }

    fn write_scope(&mut self, id: ScopeId) -> Result<(), RuntimeError> {
        // Copy the program reference out so scope borrows are
        // independent of `&mut self`.
        let program = self.program;
        let desc = program.scopes().get(id);

        self.emit_u8(op::SCOPE);
        self.emit_u32(self.scope_wire_id(id));

        self.emit_u8(op::PARENT_SCOPE);
        self.emit_u32(desc.parent.map(|p| self.scope_wire_id(p)).unwrap_or(0));

        self.emit_u8(op::VARIABLES);
        self.emit_u32(desc.member_order.len() as u32);
        for name in &desc.member_order {
            let decl = desc.variables.get(name).ok_or_else(|| {
                RuntimeError::InternalFailure("declared name lacks a variable record".into())
            })?;
            self.emit_flag(decl.is_reference);
            self.emit_name(*name);
            self.emit_u32(decl.ty.as_u32());
        }

        self.emit_u8(op::GHOSTS);
        self.emit_u32(desc.ghosts.len() as u32);
        for record in &desc.ghosts {
            self.emit_u8(op::GHOST_RECORD);
            self.emit_u32(record.len() as u32);
            for (name, owner) in self.by_name(record.iter().map(|(n, o)| (*n, *o))) {
                self.emit_name(name);
                self.emit_u32(self.scope_wire_id(owner));
            }
        }

        self.emit_u8(op::FUNCTIONS);
        self.emit_u32(desc.functions.len() as u32);
        for (name, fid) in &desc.functions {
            self.emit_name(*name);
            self.emit_u32(fid.0);
            self.emit_u32(0); // reserved
            match program.function(*fid)? {
                Function::Native {
                    library,
                    symbol,
                    return_type,
                    return_hint,
                    params,
                } => {
                    self.emit_u8(op::CALL_DLL);
                    self.emit_name(*library);
                    self.emit_name(*symbol);
                    self.emit_u32(return_type.as_u32());
                    self.emit_u32(*return_hint);
                    self.write_scope(*params)?;
                }
                Function::Bytecode {
                    params,
                    returns,
                    body,
                } => {
                    self.write_scope(*params)?;
                    self.write_scope(*returns)?;
                    self.emit_u8(op::BEGIN_BLOCK);
                    let locals = body.scope.ok_or_else(|| {
                        RuntimeError::InternalFailure("function body has no bound scope".into())
                    })?;
                    self.write_scope(locals)?;
                    for operation in &body.ops {
                        self.write_op(operation)?;
                    }
                    self.emit_u8(op::END_BLOCK);
                }
            }
        }

        self.emit_u8(op::FUNCTION_SIGNATURE_LIST);
        self.emit_u32(desc.signatures.len() as u32);
        let signature_names: Vec<StrId> = self
            .by_name(desc.signatures.keys().map(|n| (*n, ())))
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        for name in signature_names {
            let signature = &desc.signatures[&name];
            self.emit_name(name);
            self.emit_u8(op::FUNCTION_SIGNATURE_BEGIN);
            self.write_signature(signature);
        }

        self.emit_u8(op::TUPLE_TYPES);
        self.emit_u32(desc.tuple_names.len() as u32);
        for (name, id) in self.by_name(desc.tuple_names.iter().map(|(n, t)| (*n, *t))) {
            self.emit_name(name);
            self.emit_u32(id.0);
        }

        self.emit_u8(op::TUPLE_HINTS);
        self.emit_u32(desc.tuple_hints.len() as u32);
        for (name, id) in self.by_name(desc.tuple_hints.iter().map(|(n, t)| (*n, *t))) {
            self.emit_name(name);
            self.emit_u32(id.0);
        }

        self.emit_u8(op::TUPLE_TYPE_MAP);
        let mut tuple_layouts: Vec<(u32, &CompositeLayout)> = desc
            .tuple_layouts
            .iter()
            .map(|(id, layout)| (id.0, layout))
            .collect();
        tuple_layouts.sort_by_key(|(id, _)| *id);
        self.emit_u32(tuple_layouts.len() as u32);
        for (id, layout) in tuple_layouts {
            self.emit_u32(id);
            self.write_layout(layout, false);
        }

        self.emit_u8(op::STRUCTURE_TYPES);
        self.emit_u32(desc.structure_names.len() as u32);
        for (name, id) in self.by_name(desc.structure_names.iter().map(|(n, t)| (*n, *t))) {
            self.emit_name(name);
            self.emit_u32(id.0);
        }

        self.emit_u8(op::STRUCTURE_HINTS);
        self.emit_u32(desc.structure_hints.len() as u32);
        for (name, id) in self.by_name(desc.structure_hints.iter().map(|(n, t)| (*n, *t))) {
            self.emit_name(name);
            self.emit_u32(id.0);
        }

        self.emit_u8(op::STRUCTURE_TYPE_MAP);
        let mut structure_layouts: Vec<(u32, &CompositeLayout)> = desc
            .structure_layouts
            .iter()
            .map(|(id, layout)| (id.0, layout))
            .collect();
        structure_layouts.sort_by_key(|(id, _)| *id);
        self.emit_u32(structure_layouts.len() as u32);
        for (id, layout) in structure_layouts {
            self.emit_u32(id);
            self.write_layout(layout, true);
        }

        self.emit_u8(op::CONSTANTS);
        self.emit_u32(desc.constants.len() as u32);
        for (name, _) in self.by_name(desc.constants.iter().map(|n| (*n, ()))) {
            self.emit_name(name);
        }

        self.emit_u8(op::RESPONSE_MAPS);
        self.emit_u32(desc.response_maps.len() as u32);
        let map_names: Vec<StrId> = self
            .by_name(desc.response_maps.keys().map(|n| (*n, ())))
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        for name in map_names {
            let map = &desc.response_maps[&name];
            self.emit_name(name);
            self.emit_u32(map.entries.len() as u32);
            for entry in &map.entries {
                self.write_response_entry(entry)?;
            }
        }

        self.emit_u8(op::FUTURES);
        self.emit_u32(desc.futures.len() as u32);
        let future_names: Vec<StrId> = self
            .by_name(desc.futures.keys().map(|n| (*n, ())))
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        for name in future_names {
            let decl = &desc.futures[&name];
            self.emit_name(name);
            self.emit_u32(decl.ty.as_u32());
            self.write_op(&decl.op)?;
        }

        self.emit_u8(op::ARRAY_HINTS);
        self.emit_u32(desc.array_types.len() as u32);
        for (name, ty) in self.by_name(desc.array_types.iter().map(|(n, t)| (*n, *t))) {
            self.emit_name(name);
            self.emit_u32(ty.as_u32());
        }

        self.emit_u8(op::END_SCOPE);
        Ok(())
    }

    fn write_layout(&mut self, layout: &CompositeLayout, with_hints: bool) {
        self.emit_u8(op::MEMBERS);
        self.emit_u32(layout.len() as u32);
        for name in layout.member_order() {
            let info = layout.member(*name).expect("member listed in order");
            self.emit_name(*name);
            self.emit_u32(info.ty.as_u32());
            self.emit_u32(info.offset as u32);
            if with_hints {
                if let Some(hint) = info.hint {
                    self.emit_u32(hint.raw());
                }
            }
        }
    }

    fn write_signature(&mut self, signature: &FunctionSignature) {
        self.emit_u32(signature.params.len() as u32);
        for ty in &signature.params {
            self.emit_u32(ty.as_u32());
        }
        self.emit_u32(signature.returns.len() as u32);
        for ty in &signature.returns {
            self.emit_u32(ty.as_u32());
        }
        self.emit_u32(signature.param_hints.len() as u32);
        for hint in &signature.param_hints {
            self.emit_u32(*hint);
        }
        self.emit_u32(signature.param_flags.len() as u32);
        for flags in &signature.param_flags {
            self.emit_u32(*flags);
        }
        self.emit_u32(signature.sub_signatures.len() as u32);
        for sub in &signature.sub_signatures {
            match sub {
                Some(sub) => {
                    self.emit_u8(op::FUNCTION_SIGNATURE_BEGIN);
                    self.write_signature(sub);
                }
                None => self.emit_u8(op::FUNCTION_SIGNATURE_END),
            }
        }
        self.emit_u32(signature.return_hints.len() as u32);
        for hint in &signature.return_hints {
            self.emit_u32(*hint);
        }
        self.emit_u8(op::FUNCTION_SIGNATURE_END);
    }

    fn write_response_entry(&mut self, entry: &ResponseMapEntry) -> Result<(), RuntimeError> {
        self.emit_name(entry.message);
        self.emit_u32(entry.payload_types.len() as u32);
        for ty in &entry.payload_types {
            self.emit_u32(ty.as_u32());
        }
        self.write_bound_block(&entry.block)?;
        self.write_scope(entry.aux_scope)
    }

    /// `BeginBlock`, scope record, operations, `EndBlock`.
    fn write_bound_block(&mut self, block: &Block) -> Result<(), RuntimeError> {
        self.emit_u8(op::BEGIN_BLOCK);
        let scope = block.scope.ok_or_else(|| {
            RuntimeError::InternalFailure("cannot serialize a block with no bound scope".into())
        })?;
        self.write_scope(scope)?;
        for operation in &block.ops {
            self.write_op(operation)?;
        }
        self.emit_u8(op::END_BLOCK);
        Ok(())
    }

    fn write_optional_bound_block(&mut self, block: Option<&Block>) -> Result<(), RuntimeError> {
        match block {
            Some(block) => self.write_bound_block(block),
            None => {
                self.emit_u8(op::NO_OP);
                Ok(())
            }
        }
    }

    fn write_op(&mut self, operation: &Op) -> Result<(), RuntimeError> {
        match operation {
            Op::Push(inner) => {
                self.emit_u8(op::PUSH_OPERATION);
                self.write_op(inner)?;
            }
            Op::PushInt(value) => {
                self.emit_u8(op::PUSH_INTEGER_LITERAL);
                self.emit_i32(*value);
            }
            Op::PushInt16(value) => {
                self.emit_u8(op::PUSH_INTEGER16_LITERAL);
                self.emit_i32(*value as i32);
            }
            Op::PushReal(value) => {
                self.emit_u8(op::PUSH_REAL_LITERAL);
                self.emit_f32(*value);
            }
            Op::PushBool(value) => {
                self.emit_u8(op::PUSH_BOOLEAN_LITERAL);
                self.emit_flag(*value);
            }
            Op::PushStr(id) => {
                self.emit_u8(op::PUSH_STRING_LITERAL);
                let text = self.program.resolve(*id);
                self.emit_strn(&text);
            }
            Op::IntConstant(value) => {
                self.emit_u8(op::INTEGER_LITERAL);
                self.emit_i32(*value);
            }
            Op::BoolConstant(value) => {
                self.emit_u8(op::BOOLEAN_LITERAL);
                self.emit_flag(*value);
            }
            Op::DebugWrite => self.emit_u8(op::DEBUG_WRITE),
            Op::DebugRead => self.emit_u8(op::DEBUG_READ),

            Op::GetValue(name) => {
                self.emit_u8(op::GET_VALUE);
                self.emit_name(*name);
            }
            Op::AssignValue(name) => {
                self.emit_u8(op::ASSIGN_VALUE);
                self.emit_name(*name);
            }
            Op::InitValue(name) => {
                self.emit_u8(op::INIT);
                self.emit_name(*name);
            }
            Op::BindReference(name) => {
                self.emit_u8(op::BIND_REFERENCE);
                self.emit_name(*name);
            }
            Op::BindFunctionReference(name) => {
                self.emit_u8(op::BIND_FUNCTION_REFERENCE);
                self.emit_name(*name);
            }
            Op::SizeOf(name) => {
                self.emit_u8(op::SIZE_OF);
                self.emit_name(*name);
            }
            Op::ReadArray(name) => {
                self.emit_u8(op::READ_ARRAY);
                self.emit_name(*name);
            }
            Op::WriteArray(name) => {
                self.emit_u8(op::WRITE_ARRAY);
                self.emit_name(*name);
            }
            Op::ArrayLength(name) => {
                self.emit_u8(op::ARRAY_LENGTH);
                self.emit_name(*name);
            }
            Op::ConsArrayIndirect { elem_type, count } => {
                self.emit_u8(op::CONS_ARRAY_INDIRECT);
                self.emit_u32(elem_type.as_u32());
                self.write_op(count)?;
            }

            Op::ReadTuple { var, member } => {
                self.emit_u8(op::READ_TUPLE);
                self.emit_name(*var);
                self.emit_name(*member);
            }
            Op::WriteTuple { var, member } => {
                self.emit_u8(op::WRITE_TUPLE);
                self.emit_name(*var);
                self.emit_name(*member);
            }
            Op::ReadStructure { var, member } => {
                self.emit_u8(op::READ_STRUCTURE);
                self.emit_name(*var);
                self.emit_name(*member);
            }
            Op::WriteStructure { var, member } => {
                self.emit_u8(op::WRITE_STRUCTURE);
                self.emit_name(*var);
                self.emit_name(*member);
            }
            Op::ReadStructureIndirect { member, .. } => {
                // The prior link is implicit in the opcode stream order.
                self.emit_u8(op::READ_STRUCTURE_INDIRECT);
                self.emit_name(*member);
            }
            Op::WriteStructureIndirect { member } => {
                self.emit_u8(op::WRITE_STRUCTURE_INDIRECT);
                self.emit_name(*member);
            }
            Op::BindStructMember { var, member } => {
                self.emit_u8(op::BIND_STRUCT);
                self.emit_flag(var.is_none());
                if let Some(var) = var {
                    self.emit_name(*var);
                }
                self.emit_name(*member);
            }

            Op::Arithmetic(arith) => {
                let opcode = op::opcode_for_arithmetic(arith.kind, arith.ty).ok_or_else(|| {
                    RuntimeError::InternalFailure("arithmetic operation with invalid type".into())
                })?;
                self.emit_u8(opcode);
                self.emit_flag(arith.first_is_array);
                self.emit_flag(arith.second_is_array);
                self.emit_u32(arith.param_count);
            }
            Op::Concat {
                first_is_array,
                second_is_array,
                param_count,
            } => {
                self.emit_u8(op::CONCAT);
                self.emit_flag(*first_is_array);
                self.emit_flag(*second_is_array);
                self.emit_u32(*param_count);
            }
            Op::Compare { kind, ty } => {
                let opcode = match kind {
                    fugue_vm::CompareKind::Equal => op::IS_EQUAL,
                    fugue_vm::CompareKind::NotEqual => op::IS_NOT_EQUAL,
                    fugue_vm::CompareKind::Less => op::IS_LESSER,
                    fugue_vm::CompareKind::LessEqual => op::IS_LESSER_EQUAL,
                    fugue_vm::CompareKind::Greater => op::IS_GREATER,
                    fugue_vm::CompareKind::GreaterEqual => op::IS_GREATER_EQUAL,
                };
                self.emit_u8(opcode);
                self.emit_u32(ty.as_u32());
            }

            Op::LogicalAnd { operands } => {
                self.emit_u8(op::LOGICAL_AND);
                self.write_operation_list(operands)?;
            }
            Op::LogicalOr { operands } => {
                self.emit_u8(op::LOGICAL_OR);
                self.write_operation_list(operands)?;
            }
            Op::LogicalXor => self.emit_u8(op::LOGICAL_XOR),
            Op::LogicalNot => self.emit_u8(op::LOGICAL_NOT),
            Op::BitwiseAnd { ty, operands } => {
                self.emit_u8(op::BITWISE_AND);
                self.emit_u32(ty.as_u32());
                self.write_operation_list(operands)?;
            }
            Op::BitwiseOr { ty, operands } => {
                self.emit_u8(op::BITWISE_OR);
                self.emit_u32(ty.as_u32());
                self.write_operation_list(operands)?;
            }
            Op::BitwiseXor { ty } => {
                self.emit_u8(op::BITWISE_XOR);
                self.emit_u32(ty.as_u32());
            }
            Op::BitwiseNot { ty } => {
                self.emit_u8(op::BITWISE_NOT);
                self.emit_u32(ty.as_u32());
            }

            Op::DoWhile { body } => {
                self.emit_u8(op::DO_WHILE);
                self.write_bound_block(body)?;
            }
            Op::While { body } => {
                self.emit_u8(op::WHILE);
                self.write_bound_block(body)?;
            }
            Op::WhileCondition => self.emit_u8(op::WHILE_CONDITION),
            Op::Break => self.emit_u8(op::BREAK),
            Op::Return => self.emit_u8(op::RETURN),
            Op::If(if_op) => {
                self.emit_u8(op::IF);
                self.write_optional_bound_block(if_op.true_block.as_ref())?;
                match &if_op.else_if_chain {
                    Some(chain) => {
                        self.emit_u8(op::ELSE_IF_WRAPPER);
                        self.write_bound_block(chain)?;
                    }
                    None => self.emit_u8(op::NO_OP),
                }
                self.write_optional_bound_block(if_op.false_block.as_ref())?;
            }
            Op::ElseIf { body } => {
                self.emit_u8(op::ELSE_IF);
                self.write_bound_block(body)?;
            }
            Op::ExitIfChain => self.emit_u8(op::EXIT_IF_CHAIN),
            Op::ExecuteBlock { body } => {
                self.write_bound_block(body)?;
            }

            Op::Invoke(id) => {
                self.emit_u8(op::INVOKE);
                self.emit_u32(id.0);
            }
            Op::InvokeIndirect(name) => {
                self.emit_u8(op::INVOKE_INDIRECT);
                self.emit_name(*name);
            }

            Op::ForkTask { body } => {
                self.emit_u8(op::FORK_TASK);
                self.write_bound_block(body)?;
            }
            Op::ForkThread { body } => {
                self.emit_u8(op::FORK_THREAD);
                self.write_bound_block(body)?;
            }
            Op::CreateThreadPool => self.emit_u8(op::THREAD_POOL),
            Op::ForkFuture { name, ty, use_pool } => {
                self.emit_u8(op::FUTURE);
                self.emit_name(*name);
                self.emit_u32(ty.as_u32());
                self.emit_flag(*use_pool);
            }
            Op::AcceptMessage {
                message,
                payload_types,
                body,
                aux_scope,
            } => {
                self.emit_u8(op::ACCEPT_MESSAGE);
                self.emit_name(*message);
                self.emit_u32(payload_types.len() as u32);
                for ty in payload_types {
                    self.emit_u32(ty.as_u32());
                }
                self.write_bound_block(body)?;
                self.write_scope(*aux_scope)?;
            }
            Op::AcceptMessageFromMap(name) => {
                self.emit_u8(op::ACCEPT_MESSAGE_FROM_MAP);
                self.emit_name(*name);
            }
            Op::SendTaskMessage {
                by_name,
                message,
                payload_types,
            } => {
                self.emit_u8(op::SEND_TASK_MESSAGE);
                self.emit_flag(*by_name);
                self.emit_name(*message);
                self.emit_u32(payload_types.len() as u32);
                for ty in payload_types {
                    self.emit_u32(ty.as_u32());
                }
            }
            Op::GetMessageSender => self.emit_u8(op::GET_MESSAGE_SENDER),
            Op::GetTaskCaller => self.emit_u8(op::GET_TASK_CALLER),
            Op::ParallelFor { counter, body } => {
                self.emit_u8(op::PARALLEL_FOR);
                self.emit_name(*counter);
                self.write_bound_block(body)?;
            }
            Op::Handoff {
                library,
                code_handle,
                body,
            } => {
                self.emit_u8(op::HANDOFF);
                self.emit_name(*library);
                self.emit_u32(*code_handle);
                self.write_bound_block(body)?;
            }
            Op::HandoffControl {
                library,
                counter,
                code_handle,
                body,
            } => {
                self.emit_u8(op::HANDOFF_CONTROL);
                self.emit_name(*library);
                self.emit_name(*counter);
                self.emit_u32(*code_handle);
                self.write_bound_block(body)?;
            }

            Op::TypeCast { from, to } => {
                self.emit_u8(op::TYPE_CAST);
                self.emit_u32(from.as_u32());
                self.emit_u32(to.as_u32());
            }
            Op::CastToString { from } => {
                self.emit_u8(op::TYPE_CAST_TO_STRING);
                self.emit_u32(from.as_u32());
            }

            Op::MapOperation(inner) => {
                self.emit_u8(op::MAP);
                self.write_op(inner)?;
            }
            Op::ReduceOperation(inner) => {
                self.emit_u8(op::REDUCE);
                self.write_op(inner)?;
            }
        }
        Ok(())
    }

    fn write_operation_list(&mut self, operands: &[Op]) -> Result<(), RuntimeError> {
        self.emit_u32(operands.len() as u32);
        for operand in operands {
            self.write_op(operand)?;
        }
        Ok(())
    }
}
