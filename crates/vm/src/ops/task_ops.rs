//! Concurrency operations: task forking, messaging, futures,
//! parallel-for and extension handoff.

use std::sync::Arc;

use fugue_extension::{ExtValue, ScopeExchange};

use crate::block::{Block, FlowSignal};
use crate::machine::{ext_to_vm, vm_to_ext, ExecutionContext};
use crate::scope::{Frame, ScopeId, Slot};
use crate::task::Message;
use crate::value::{RuntimeError, StrId, TaskId, Value, VmType};

/// Queue capacity multiplier for the bounded pool.
const POOL_QUEUE_PER_WORKER: usize = 8;

fn spawn_error(err: std::io::Error) -> RuntimeError {
    RuntimeError::InternalFailure(format!("failed to spawn worker thread: {}", err))
}

/// Fork a block into a new task. `to_pool` dispatches the body to the
/// thread pool; without a created pool it falls back to a dedicated
/// thread, exactly like a plain task fork.
pub(crate) fn fork_task(
    ctx: &mut ExecutionContext,
    body: &Arc<Block>,
    to_pool: bool,
) -> Result<Value, RuntimeError> {
    let (task, _mailbox) = ctx.runtime.register_task();
    let program = Arc::clone(&ctx.program);
    let runtime = Arc::clone(&ctx.runtime);
    let console = ctx.console.clone();
    let caller = ctx.task;
    let body = Arc::clone(body);

    let job = move || {
        let mut task_ctx =
            ExecutionContext::new(program, Arc::clone(&runtime), console, task, caller);
        let result = task_ctx
            .activate_globals()
            .and_then(|_| body.execute(&mut task_ctx));
        if let Err(err) = result {
            log::error!("task {} aborted: {}", task.0, err);
        }
        runtime.mark_finished(task);
    };

    if to_pool && ctx.runtime.has_pool() {
        log::debug!("forking task {} onto the thread pool", task.0);
        ctx.runtime.submit_to_pool(Box::new(job));
    } else {
        log::debug!("forking task {} on a dedicated thread", task.0);
        let handle = std::thread::Builder::new()
            .name(format!("fugue-task-{}", task.0))
            .spawn(job)
            .map_err(spawn_error)?;
        ctx.runtime.attach_join(task, handle);
    }
    Ok(Value::Task(task))
}

pub(crate) fn create_thread_pool(ctx: &mut ExecutionContext) -> Result<FlowSignal, RuntimeError> {
    let workers = ctx.stack.pop_i32()?.max(1) as usize;
    ctx.runtime
        .create_pool(workers, workers * POOL_QUEUE_PER_WORKER);
    Ok(FlowSignal::Normal)
}

/// Schedule the scope-declared future operation. The produced value
/// lands in the activation's write-once cell; readers block on it.
pub(crate) fn fork_future(
    ctx: &mut ExecutionContext,
    name: StrId,
    ty: VmType,
    use_pool: bool,
) -> Result<FlowSignal, RuntimeError> {
    let cell = ctx
        .lookup_future(name)
        .ok_or_else(|| ctx.unknown_variable(name))?;
    let op = ctx
        .program
        .scopes()
        .future_decl(ctx.current_scope(), name)
        .map(|decl| Arc::clone(&decl.op))
        .ok_or_else(|| ctx.unknown_variable(name))?;

    let (task, _mailbox) = ctx.runtime.register_task();
    let program = Arc::clone(&ctx.program);
    let runtime = Arc::clone(&ctx.runtime);
    let console = ctx.console.clone();
    let caller = ctx.task;

    let job = move || {
        let mut future_ctx =
            ExecutionContext::new(program, Arc::clone(&runtime), console, task, caller);
        let result = future_ctx
            .activate_globals()
            .and_then(|_| crate::ops::evaluate_operand(&op, &mut future_ctx));
        match result {
            Ok(value) => {
                if value.vm_type() != ty {
                    log::warn!(
                        "future {} produced {} but declared {}",
                        task.0,
                        value.vm_type().name(),
                        ty.name()
                    );
                }
                cell.set(value);
            }
            Err(err) => log::error!("future computation aborted: {}", err),
        }
        runtime.mark_finished(task);
    };

    if use_pool && ctx.runtime.has_pool() {
        ctx.runtime.submit_to_pool(Box::new(job));
    } else {
        let handle = std::thread::Builder::new()
            .name(format!("fugue-future-{}", task.0))
            .spawn(job)
            .map_err(spawn_error)?;
        ctx.runtime.attach_join(task, handle);
    }
    Ok(FlowSignal::Normal)
}

/// Bind message payload values into the auxiliary scope and run the
/// response block.
fn dispatch_response(
    ctx: &mut ExecutionContext,
    message: Message,
    aux_scope: ScopeId,
    body: &Block,
) -> Result<FlowSignal, RuntimeError> {
    ctx.current_sender = Some(message.sender);

    let program = Arc::clone(&ctx.program);
    let aux = program.scopes().get(aux_scope);
    let mut frame = Frame::new(aux_scope, false);
    for (name, value) in aux.member_order.iter().zip(message.payload) {
        frame.insert_slot(*name, Slot::direct(value));
    }
    ctx.push_frame(frame);
    let result = body.execute(ctx);
    ctx.exit_scope();
    result
}

/// Block until a message matching the inline pattern arrives, then run
/// the response block with payload values bound by name.
pub(crate) fn accept_message(
    ctx: &mut ExecutionContext,
    message: StrId,
    payload_types: &[VmType],
    body: &Block,
    aux_scope: ScopeId,
) -> Result<FlowSignal, RuntimeError> {
    let mailbox = Arc::clone(&ctx.mailbox);
    let received = mailbox.accept(message, payload_types);
    dispatch_response(ctx, received, aux_scope, body)
}

/// Block until any entry of the scope-registered response map matches a
/// queued message, then dispatch that entry.
pub(crate) fn accept_from_map(
    ctx: &mut ExecutionContext,
    map_name: StrId,
) -> Result<FlowSignal, RuntimeError> {
    let program = Arc::clone(&ctx.program);
    let map = program
        .scopes()
        .response_map(ctx.current_scope(), map_name)
        .ok_or_else(|| ctx.unknown_variable(map_name))?;

    let patterns: Vec<(StrId, Vec<VmType>)> = map
        .entries
        .iter()
        .map(|entry| (entry.message, entry.payload_types.clone()))
        .collect();

    let mailbox = Arc::clone(&ctx.mailbox);
    let (index, received) = mailbox.accept_any(&patterns);
    let entry = &map.entries[index];
    dispatch_response(ctx, received, entry.aux_scope, &entry.block)
}

/// Pop payload values then the target (task handle, or task name when
/// `by_name`), and enqueue the message. Sends to finished or unknown
/// targets are dropped.
pub(crate) fn send_message(
    ctx: &mut ExecutionContext,
    by_name: bool,
    message: StrId,
    payload_types: &[VmType],
) -> Result<FlowSignal, RuntimeError> {
    let mut payload = Vec::with_capacity(payload_types.len());
    for ty in payload_types.iter().rev() {
        payload.push(ctx.pop_value(*ty)?);
    }
    payload.reverse();

    let target = if by_name {
        let name = StrId(ctx.stack.pop_handle()?);
        match ctx.runtime.lookup_name(name) {
            Some(task) => task,
            None => {
                log::debug!(
                    "message {} to unregistered task name {} dropped",
                    ctx.program.resolve(message),
                    ctx.program.resolve(name)
                );
                return Ok(FlowSignal::Normal);
            }
        }
    } else {
        TaskId(ctx.stack.pop_handle()?)
    };

    ctx.runtime.send(
        target,
        Message {
            sender: ctx.task,
            name: message,
            payload,
        },
    );
    Ok(FlowSignal::Normal)
}

pub(crate) fn message_sender(ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
    let sender = ctx.current_sender.ok_or_else(|| {
        RuntimeError::InternalFailure("no message is currently being dispatched".into())
    })?;
    Ok(Value::Task(sender))
}

/// Run the body for each counter value in `[low, high)`, fanned out
/// across a transient worker group. Iteration order across workers is
/// unspecified; the group joins before the next operation runs.
pub(crate) fn parallel_for(
    ctx: &mut ExecutionContext,
    counter: StrId,
    body: &Arc<Block>,
) -> Result<FlowSignal, RuntimeError> {
    let high = ctx.stack.pop_i32()?;
    let low = ctx.stack.pop_i32()?;
    if low >= high {
        return Ok(FlowSignal::Normal);
    }

    let total = (high - low) as usize;
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(total);
    let chunk = (total + workers - 1) / workers;

    let mut results: Vec<Result<(), RuntimeError>> = Vec::with_capacity(workers);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let start = low + (worker * chunk) as i32;
            let end = (start + chunk as i32).min(high);
            if start >= end {
                break;
            }
            let program = Arc::clone(&ctx.program);
            let runtime = Arc::clone(&ctx.runtime);
            let console = ctx.console.clone();
            let body = Arc::clone(body);
            let caller = ctx.task;
            handles.push(scope.spawn(move || -> Result<(), RuntimeError> {
                let (task, _mailbox) = runtime.register_task();
                let mut worker_ctx =
                    ExecutionContext::new(program, Arc::clone(&runtime), console, task, caller);
                worker_ctx.activate_globals()?;
                let body_scope = body.scope.ok_or_else(|| {
                    RuntimeError::InternalFailure("parallel-for body has no bound scope".into())
                })?;
                for value in start..end {
                    worker_ctx.enter_scope(body_scope)?;
                    worker_ctx.write_variable(counter, Value::Int32(value), true)?;
                    let signal = body.run_ops(&mut worker_ctx)?;
                    worker_ctx.exit_scope();
                    if signal == FlowSignal::Break || signal == FlowSignal::Return {
                        break;
                    }
                }
                runtime.mark_finished(task);
                Ok(())
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(result) => results.push(result),
                Err(_) => results.push(Err(RuntimeError::InternalFailure(
                    "parallel-for worker panicked".into(),
                ))),
            }
        }
    });

    for result in results {
        result?;
    }
    Ok(FlowSignal::Normal)
}

/// Parameter exchange handed to extensions: scope lookups and block
/// execution over the calling task's context.
struct VmScopeExchange<'a, 'b> {
    ctx: &'a mut ExecutionContext,
    body: &'b Block,
}

impl ScopeExchange for VmScopeExchange<'_, '_> {
    fn read_variable(&self, name: &str) -> Option<ExtValue> {
        let id = self.ctx.program.intern(name);
        let value = self.ctx.read_variable(id).ok()?;
        vm_to_ext(self.ctx, &value).ok()
    }

    fn write_variable(&mut self, name: &str, value: ExtValue) -> Result<(), String> {
        let id = self.ctx.program.intern(name);
        let value = ext_to_vm(self.ctx, &value);
        self.ctx
            .write_variable(id, value, false)
            .map_err(|err| err.to_string())
    }

    fn run_block(&mut self) -> Result<(), String> {
        self.body
            .run_ops(self.ctx)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Transfer a code block to the named extension library. The extension
/// drives execution through the exchange; the engine resumes when it
/// returns.
pub(crate) fn handoff(
    ctx: &mut ExecutionContext,
    library: StrId,
    body: &Arc<Block>,
    counter: Option<StrId>,
) -> Result<FlowSignal, RuntimeError> {
    let lib_name = ctx.program.resolve(library);
    let extension = ctx
        .runtime
        .extensions
        .get(&lib_name)
        .ok_or_else(|| RuntimeError::UnknownExtension(lib_name.to_string()))?;

    let entered = body.scope;
    if let Some(scope) = entered {
        ctx.enter_scope(scope)?;
    }
    let result = {
        let mut exchange = VmScopeExchange {
            ctx: &mut *ctx,
            body,
        };
        match counter {
            Some(counter_name) => {
                let counter_name = extension_counter_name(&exchange, counter_name);
                extension.handoff_control(&mut exchange, &counter_name)
            }
            None => extension.handoff(&mut exchange),
        }
    };
    if entered.is_some() {
        ctx.exit_scope();
    }
    result.map_err(RuntimeError::ExtensionFailure)?;
    Ok(FlowSignal::Normal)
}

fn extension_counter_name(exchange: &VmScopeExchange<'_, '_>, counter: StrId) -> String {
    exchange.ctx.program.resolve(counter).to_string()
}
