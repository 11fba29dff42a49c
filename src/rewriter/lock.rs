//! `Monitor` based critical sections.

use crate::{
    metadata::{emitter::BodyEmitter, opcodes::OpCode, references::FieldHandle},
    rewriter::CoreRefs,
};

/// Emits `body` inside `Monitor.Enter(lock)` ... `finally { Monitor.Exit(lock) }`.
///
/// `body` must leave the stack empty; control continues after the handler.
pub fn locked<F>(e: &mut BodyEmitter, refs: &CoreRefs, lock: FieldHandle, body: F)
where
    F: FnOnce(&mut BodyEmitter),
{
    let try_start = e.define_label();
    let handler = e.define_label();
    let after = e.define_label();

    e.ldsfld(lock);
    e.call(refs.monitor_enter.clone());

    e.mark_label(try_start);
    body(e);
    e.leave(after);

    e.mark_label(handler);
    e.ldsfld(lock);
    e.call(refs.monitor_exit.clone());
    e.emit(OpCode::Endfinally);

    e.mark_label(after);
    e.finally_handler(try_start, handler, handler, after);
}
