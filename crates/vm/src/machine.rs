//! Execution engine: per-task contexts, activation frames, composite
//! stack traffic and function invocation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use fugue_extension::{ExtValue, ExtensionRegistry};

use crate::block::FlowSignal;
use crate::program::{Function, Program};
use crate::scope::{Frame, ScopeId, Slot};
use crate::stack::OperandStack;
use crate::task::{FutureCell, Mailbox, TaskRuntime};
use crate::value::{
    AddressId, ArrayHandle, BufferHandle, FunctionId, RuntimeError, StrId, StructTypeId,
    StructValue, TaskId, TupleTypeId, TupleValue, Value, VmType,
};

/// Console output destination for a running program.
#[derive(Clone)]
enum ConsoleSink {
    Stdout,
    Capture(Arc<Mutex<Vec<String>>>),
}

/// Console attached to an execution. Forked tasks inherit their
/// parent's console, so captured test runs see all task output.
#[derive(Clone)]
pub struct Console {
    sink: ConsoleSink,
    input: Arc<Mutex<VecDeque<String>>>,
}

impl Console {
    pub fn stdout() -> Console {
        Console {
            sink: ConsoleSink::Stdout,
            input: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// A console that records output instead of printing it.
    pub fn capture() -> (Console, Arc<Mutex<Vec<String>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (
            Console {
                sink: ConsoleSink::Capture(Arc::clone(&buffer)),
                input: Arc::new(Mutex::new(VecDeque::new())),
            },
            buffer,
        )
    }

    pub fn queue_input(&self, lines: impl IntoIterator<Item = String>) {
        self.input.lock().extend(lines);
    }

    pub fn write_line(&self, text: &str) {
        match &self.sink {
            ConsoleSink::Stdout => println!("{}", text),
            ConsoleSink::Capture(buffer) => buffer.lock().push(text.to_string()),
        }
    }

    pub fn read_line(&self) -> String {
        if let Some(line) = self.input.lock().pop_front() {
            return line;
        }
        match &self.sink {
            ConsoleSink::Stdout => {
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                line.trim_end_matches(['\r', '\n']).to_string()
            }
            ConsoleSink::Capture(_) => String::new(),
        }
    }
}

/// Per-task execution state: operand stack, activation frames, address
/// table, mailbox and message bookkeeping.
pub struct ExecutionContext {
    pub program: Arc<Program>,
    pub runtime: Arc<TaskRuntime>,
    pub stack: OperandStack,
    frames: Vec<Frame>,
    addresses: Vec<Slot>,
    pub mailbox: Arc<Mailbox>,
    pub task: TaskId,
    pub caller: TaskId,
    pub console: Console,
    /// Sender of the message currently being dispatched, if any.
    pub current_sender: Option<TaskId>,
}

impl ExecutionContext {
    pub fn new(
        program: Arc<Program>,
        runtime: Arc<TaskRuntime>,
        console: Console,
        task: TaskId,
        caller: TaskId,
    ) -> Self {
        let mailbox = runtime
            .mailbox(task)
            .unwrap_or_else(|| Arc::new(Mailbox::new()));
        ExecutionContext {
            program,
            runtime,
            stack: OperandStack::new(),
            frames: Vec::new(),
            addresses: Vec::new(),
            mailbox,
            task,
            caller,
            console,
            current_sender: None,
        }
    }

    /// Activate the global scope. Every task does this before running
    /// its body; variable slots are task-local and cross tasks only via
    /// message payloads.
    pub fn activate_globals(&mut self) -> Result<(), RuntimeError> {
        let frame = self.build_frame(self.program.global_scope(), false)?;
        self.frames.push(frame);
        Ok(())
    }

    /// The innermost active scope description.
    pub fn current_scope(&self) -> ScopeId {
        self.frames
            .last()
            .map(|f| f.desc)
            .unwrap_or_else(|| self.program.global_scope())
    }

    fn build_frame(&self, scope: ScopeId, barrier: bool) -> Result<Frame, RuntimeError> {
        let program = Arc::clone(&self.program);
        let desc = program.scopes().get(scope);
        let mut frame = Frame::new(scope, barrier);

        // Ghost names first: shared cells projected from the current
        // activation. An owned declaration below shadows them.
        for record in &desc.ghosts {
            for name in record.keys() {
                if let Some(slot) = self.lookup_slot(*name) {
                    frame.insert_slot(*name, slot);
                }
            }
        }

        for name in &desc.member_order {
            let decl = match desc.variables.get(name) {
                Some(decl) => decl,
                None => continue,
            };
            if decl.is_reference {
                // Reference slots are bound when an argument arrives.
                continue;
            }
            let hint = program.scopes().variable_hint(scope, *name);
            frame.insert_slot(*name, Slot::direct(program.default_value(decl.ty, hint)?));
        }

        for name in desc.futures.keys() {
            frame.insert_future(*name, Arc::new(FutureCell::new()));
        }

        Ok(frame)
    }

    pub fn enter_scope(&mut self, scope: ScopeId) -> Result<(), RuntimeError> {
        let frame = self.build_frame(scope, false)?;
        self.frames.push(frame);
        Ok(())
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn exit_scope(&mut self) {
        self.frames.pop();
    }

    /// Resolve a name to its live slot. Walks frames innermost-first;
    /// a call barrier hides everything below it except the global frame.
    pub fn lookup_slot(&self, name: StrId) -> Option<Slot> {
        let mut index = self.frames.len();
        while index > 0 {
            index -= 1;
            let frame = &self.frames[index];
            if let Some(slot) = frame.slot(name) {
                return Some(slot.clone());
            }
            if frame.barrier {
                break;
            }
        }
        if index > 0 {
            if let Some(frame) = self.frames.first() {
                return frame.slot(name).cloned();
            }
        }
        None
    }

    pub fn lookup_future(&self, name: StrId) -> Option<Arc<FutureCell>> {
        let mut index = self.frames.len();
        while index > 0 {
            index -= 1;
            let frame = &self.frames[index];
            if let Some(cell) = frame.future(name) {
                return Some(Arc::clone(cell));
            }
            if frame.barrier {
                break;
            }
        }
        if index > 0 {
            if let Some(frame) = self.frames.first() {
                return frame.future(name).cloned();
            }
        }
        None
    }

    pub fn unknown_variable(&self, name: StrId) -> RuntimeError {
        RuntimeError::UnknownVariable(self.program.resolve(name).to_string())
    }

    /// Read a variable. Future names resolve by blocking on the cell.
    pub fn read_variable(&self, name: StrId) -> Result<Value, RuntimeError> {
        if let Some(slot) = self.lookup_slot(name) {
            return slot.read(&self.program);
        }
        if let Some(cell) = self.lookup_future(name) {
            return Ok(cell.get());
        }
        Err(self.unknown_variable(name))
    }

    /// Write a variable. Constants reject writes after initialization.
    pub fn write_variable(
        &self,
        name: StrId,
        value: Value,
        is_init: bool,
    ) -> Result<(), RuntimeError> {
        if !is_init && self.program.scopes().is_constant(self.current_scope(), name) {
            return Err(RuntimeError::ConstantReassignment(
                self.program.resolve(name).to_string(),
            ));
        }
        let slot = self
            .lookup_slot(name)
            .ok_or_else(|| self.unknown_variable(name))?;
        slot.write(&self.program, value)
    }

    pub fn bind_address(&mut self, slot: Slot) -> AddressId {
        let id = AddressId(self.addresses.len() as u32);
        self.addresses.push(slot);
        id
    }

    pub fn address(&self, id: AddressId) -> Result<Slot, RuntimeError> {
        self.addresses
            .get(id.0 as usize)
            .cloned()
            .ok_or(RuntimeError::InvalidHandle(id.0))
    }

    /// Push a value in its natural width. Composites go member-by-member
    /// in reverse order, then the type-hint id.
    pub fn push_value(&mut self, value: &Value) -> Result<(), RuntimeError> {
        match value {
            Value::Null => Err(RuntimeError::NullValuePush),
            Value::Int32(v) => self.stack.push_i32(*v),
            Value::Int16(v) => self.stack.push_i16(*v),
            Value::Real(v) => self.stack.push_f32(*v),
            Value::Bool(v) => self.stack.push_bool(*v),
            Value::Str(id) => self.stack.push_handle(id.0),
            Value::Function(id) => self.stack.push_handle(id.0),
            Value::Address(id) => self.stack.push_handle(id.0),
            Value::Array(h) => self.stack.push_handle(h.0),
            Value::Task(t) => self.stack.push_handle(t.0),
            Value::Buffer(b) => self.stack.push_handle(b.0),
            Value::Tuple(tuple) => {
                for member in tuple.members.iter().rev() {
                    self.push_value(member)?;
                }
                self.stack.push_handle(tuple.type_id.0)
            }
            Value::Structure(structure) => {
                for member in structure.members.iter().rev() {
                    self.push_value(member)?;
                }
                self.stack.push_handle(structure.type_id.0)
            }
        }
    }

    /// Pop a value of a known type. Composites read the hint id from the
    /// top of the stack and rebuild members in declaration order.
    pub fn pop_value(&mut self, ty: VmType) -> Result<Value, RuntimeError> {
        Ok(match ty {
            VmType::Int32 => Value::Int32(self.stack.pop_i32()?),
            VmType::Int16 => Value::Int16(self.stack.pop_i16()?),
            VmType::Real => Value::Real(self.stack.pop_f32()?),
            VmType::Bool => Value::Bool(self.stack.pop_bool()?),
            VmType::Str => Value::Str(StrId(self.stack.pop_handle()?)),
            VmType::Function => Value::Function(FunctionId(self.stack.pop_handle()?)),
            VmType::Address => Value::Address(AddressId(self.stack.pop_handle()?)),
            VmType::Array => Value::Array(ArrayHandle(self.stack.pop_handle()?)),
            VmType::Task => Value::Task(TaskId(self.stack.pop_handle()?)),
            VmType::Buffer => Value::Buffer(BufferHandle(self.stack.pop_handle()?)),
            VmType::Tuple => {
                let type_id = TupleTypeId(self.stack.pop_handle()?);
                let layout = self.program.tuple_layout(type_id)?.clone();
                let mut members = Vec::with_capacity(layout.len());
                for name in layout.member_order() {
                    let info = layout.member(*name).expect("member listed in order");
                    members.push(self.pop_value(info.ty)?);
                }
                Value::Tuple(TupleValue { type_id, members })
            }
            VmType::Structure => {
                let type_id = StructTypeId(self.stack.pop_handle()?);
                let layout = self.program.structure_layout(type_id)?.clone();
                let mut members = Vec::with_capacity(layout.len());
                for name in layout.member_order() {
                    let info = layout.member(*name).expect("member listed in order");
                    members.push(self.pop_value(info.ty)?);
                }
                Value::Structure(StructValue { type_id, members })
            }
            VmType::Null | VmType::Error => {
                return Err(RuntimeError::NotImplemented("cannot pop a value of this type"))
            }
        })
    }

    /// Operand-stack width of a value as pushed by `push_value`.
    pub fn value_width(&self, value: &Value) -> Result<usize, RuntimeError> {
        match value {
            Value::Tuple(t) => Ok(self.program.tuple_layout(t.type_id)?.stack_width()),
            Value::Structure(s) => Ok(self.program.structure_layout(s.type_id)?.stack_width()),
            other => other
                .vm_type()
                .stack_width()
                .ok_or(RuntimeError::NullValuePush),
        }
    }
}

/// Call a function: pop arguments in reverse declaration order, activate
/// the parameter/return frame behind a lexical barrier, run the body and
/// push return values into the caller's stack.
pub fn invoke_function(ctx: &mut ExecutionContext, id: FunctionId) -> Result<(), RuntimeError> {
    let program = Arc::clone(&ctx.program);
    match program.function(id)? {
        Function::Native {
            library,
            symbol,
            return_type,
            params,
            ..
        } => {
            let pdesc = program.scopes().get(*params);
            let mut args = Vec::new();
            for name in pdesc.member_order.iter().rev() {
                let decl = pdesc
                    .variables
                    .get(name)
                    .ok_or_else(|| ctx.unknown_variable(*name))?;
                let value = ctx.pop_value(decl.ty)?;
                args.push(vm_to_ext(ctx, &value)?);
            }
            args.reverse();

            let lib_name = program.resolve(*library);
            let extension = ctx
                .runtime
                .extensions
                .get(&lib_name)
                .ok_or_else(|| RuntimeError::UnknownExtension(lib_name.to_string()))?;
            let symbol_name = program.resolve(*symbol);
            let result = extension
                .call(&symbol_name, &args)
                .map_err(RuntimeError::ExtensionFailure)?;
            if *return_type != VmType::Null {
                let value = ext_to_vm(ctx, &result);
                ctx.push_value(&value)?;
            }
            Ok(())
        }
        Function::Bytecode {
            params,
            returns,
            body,
        } => {
            let mut frame = build_call_frame(ctx, *params)?;

            // Default-initialized return slots live in the call frame so
            // the body can assign them by name.
            let rdesc = program.scopes().get(*returns);
            for name in &rdesc.member_order {
                if let Some(decl) = rdesc.variables.get(name) {
                    let hint = program.scopes().variable_hint(*returns, *name);
                    frame.insert_slot(*name, Slot::direct(program.default_value(decl.ty, hint)?));
                }
            }

            ctx.push_frame(frame);
            let result = body.execute(ctx);
            let signal = match result {
                Ok(signal) => signal,
                Err(err) => {
                    ctx.exit_scope();
                    return Err(err);
                }
            };
            debug_assert!(matches!(signal, FlowSignal::Normal | FlowSignal::Return));

            // Resolve returns into the caller's stack, in declaration order.
            let mut returned = Vec::new();
            for name in &rdesc.member_order {
                let slot = ctx
                    .lookup_slot(*name)
                    .ok_or_else(|| ctx.unknown_variable(*name))?;
                returned.push(slot.read(&ctx.program)?);
            }
            ctx.exit_scope();
            for value in &returned {
                ctx.push_value(value)?;
            }
            Ok(())
        }
    }
}

/// Build the activation for a parameter scope: pop arguments from the
/// caller's stack in reverse declaration order. Reference parameters
/// arrive as address handles and alias the caller's cell.
fn build_call_frame(ctx: &mut ExecutionContext, params: ScopeId) -> Result<Frame, RuntimeError> {
    let program = Arc::clone(&ctx.program);
    let pdesc = program.scopes().get(params);
    let mut frame = Frame::new(params, true);

    // Ghosts resolve against the caller's activation, before the frame
    // is pushed.
    for record in &pdesc.ghosts {
        for name in record.keys() {
            if let Some(slot) = ctx.lookup_slot(*name) {
                frame.insert_slot(*name, slot);
            }
        }
    }

    for name in pdesc.member_order.iter().rev() {
        let decl = pdesc
            .variables
            .get(name)
            .ok_or_else(|| ctx.unknown_variable(*name))?;
        if decl.is_reference {
            let id = AddressId(ctx.stack.pop_handle()?);
            frame.insert_slot(*name, ctx.address(id)?);
        } else {
            let value = ctx.pop_value(decl.ty)?;
            frame.insert_slot(*name, Slot::direct(value));
        }
    }

    for name in pdesc.futures.keys() {
        frame.insert_future(*name, Arc::new(FutureCell::new()));
    }

    Ok(frame)
}

/// Convert a VM value for the extension boundary.
pub fn vm_to_ext(ctx: &ExecutionContext, value: &Value) -> Result<ExtValue, RuntimeError> {
    Ok(match value {
        Value::Null => ExtValue::Null,
        Value::Int32(v) => ExtValue::Int32(*v),
        Value::Int16(v) => ExtValue::Int16(*v),
        Value::Real(v) => ExtValue::Real(*v),
        Value::Bool(v) => ExtValue::Bool(*v),
        Value::Str(id) => ExtValue::Str(ctx.program.resolve(*id).to_string()),
        Value::Buffer(handle) => {
            let data = ctx.program.buffers.get(*handle)?;
            let bytes = data.read().clone();
            ExtValue::Bytes(bytes)
        }
        other => {
            log::debug!("extension marshalling rejected {:?}", other.vm_type());
            return Err(RuntimeError::NotImplemented(
                "this value type does not cross the extension boundary",
            ));
        }
    })
}

/// Convert an extension value back into the VM.
pub fn ext_to_vm(ctx: &ExecutionContext, value: &ExtValue) -> Value {
    match value {
        ExtValue::Null => Value::Null,
        ExtValue::Int32(v) => Value::Int32(*v),
        ExtValue::Int16(v) => Value::Int16(*v),
        ExtValue::Real(v) => Value::Real(*v),
        ExtValue::Bool(v) => Value::Bool(*v),
        ExtValue::Str(s) => Value::Str(ctx.program.intern(s)),
        ExtValue::Bytes(b) => Value::Buffer(ctx.program.buffers.alloc(b.clone())),
    }
}

/// The engine: owns the program and the task runtime, starts at the
/// global init block and then invokes the entrypoint.
pub struct Machine {
    program: Arc<Program>,
    runtime: Arc<TaskRuntime>,
}

impl Machine {
    pub fn new(program: Program) -> Machine {
        Machine::with_registry(program, Arc::new(ExtensionRegistry::new()))
    }

    pub fn with_registry(program: Program, registry: Arc<ExtensionRegistry>) -> Machine {
        Machine {
            program: Arc::new(program),
            runtime: TaskRuntime::new(registry),
        }
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn runtime(&self) -> &Arc<TaskRuntime> {
        &self.runtime
    }

    /// Run the program with console output on stdout.
    pub fn run(&self) -> Result<(), RuntimeError> {
        self.run_with_console(Console::stdout())
    }

    /// Run the program with a capturing console; returns the output
    /// lines from every task once all tasks have completed.
    pub fn run_captured(
        &self,
        input: Vec<String>,
    ) -> Result<Vec<String>, RuntimeError> {
        let (console, buffer) = Console::capture();
        console.queue_input(input);
        self.run_with_console(console)?;
        let lines = buffer.lock().clone();
        Ok(lines)
    }

    fn run_with_console(&self, console: Console) -> Result<(), RuntimeError> {
        let (task, _mailbox) = self.runtime.register_task();
        let mut ctx = ExecutionContext::new(
            Arc::clone(&self.program),
            Arc::clone(&self.runtime),
            console,
            task,
            TaskId::NONE,
        );
        ctx.activate_globals()?;

        if let Some(init) = &self.program.global_init {
            log::debug!("running global init block");
            init.run_ops(&mut ctx)?;
        }

        if let Some(entry) = self.program.entrypoint() {
            log::debug!("invoking entrypoint");
            invoke_function(&mut ctx, entry)?;
        } else {
            log::warn!("program has no entrypoint function");
        }

        self.runtime.mark_finished(task);
        self.runtime.join_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CompositeLayout;

    fn test_context() -> ExecutionContext {
        let program = Arc::new(Program::new());
        let runtime = TaskRuntime::new(Arc::new(ExtensionRegistry::new()));
        let (task, _) = runtime.register_task();
        let (console, _) = Console::capture();
        ExecutionContext::new(program, runtime, console, task, TaskId::NONE)
    }

    #[test]
    fn test_push_pop_primitive_round_trip() {
        let mut ctx = test_context();
        ctx.push_value(&Value::Int32(7)).unwrap();
        ctx.push_value(&Value::Bool(true)).unwrap();

        assert_eq!(ctx.pop_value(VmType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(ctx.pop_value(VmType::Int32).unwrap(), Value::Int32(7));
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_composite_round_trip() {
        let mut program = Program::new();
        let global = program.global_scope();
        let a = program.intern("a");
        let b = program.intern("b");

        let mut layout = CompositeLayout::new();
        layout.add_member(a, VmType::Int32).unwrap();
        layout.add_member(b, VmType::Bool).unwrap();
        layout.compute_offsets();
        let id = StructTypeId(1);
        program
            .scopes_mut()
            .get_mut(global)
            .structure_layouts
            .insert(id, layout);
        program.register_structure_owner(id, global);

        let runtime = TaskRuntime::new(Arc::new(ExtensionRegistry::new()));
        let (task, _) = runtime.register_task();
        let (console, _) = Console::capture();
        let mut ctx =
            ExecutionContext::new(Arc::new(program), runtime, console, task, TaskId::NONE);

        let value = Value::Structure(StructValue {
            type_id: id,
            members: vec![Value::Int32(5), Value::Bool(true)],
        });
        ctx.push_value(&value).unwrap();
        // members (4 + 1 bytes) plus the hint id
        assert_eq!(ctx.stack.used(), 9);
        assert_eq!(ctx.pop_value(VmType::Structure).unwrap(), value);
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_null_push_rejected() {
        let mut ctx = test_context();
        assert!(matches!(
            ctx.push_value(&Value::Null),
            Err(RuntimeError::NullValuePush)
        ));
    }

    #[test]
    fn test_address_table() {
        let mut ctx = test_context();
        let slot = Slot::direct(Value::Int32(3));
        let id = ctx.bind_address(slot.clone());

        let fetched = ctx.address(id).unwrap();
        fetched.write(&ctx.program, Value::Int32(8)).unwrap();
        assert_eq!(slot.read(&ctx.program).unwrap(), Value::Int32(8));
    }

    #[test]
    fn test_console_capture() {
        let (console, buffer) = Console::capture();
        console.write_line("hello");
        console.queue_input(vec!["typed".to_string()]);
        assert_eq!(console.read_line(), "typed");
        assert_eq!(console.read_line(), "");
        assert_eq!(&*buffer.lock(), &["hello".to_string()]);
    }
}
