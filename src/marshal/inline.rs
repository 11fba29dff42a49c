//! Splicing marshaler conversion bodies into call sites.
//!
//! A conversion body is split at its `ObjectInitialized` marker call. The instructions before
//! the marker form the pre segment, which leaves the converted value on the stack; the
//! instructions after it form the cleanup segment, which runs once the native call returned.
//! Branches may not cross the marker, and the pre segment may not return.

use std::collections::HashMap;

use crate::{
    interop::{INTEROP_NAMESPACE, MARKER_METHOD, MARSHAL_INITIALIZATION},
    metadata::{
        body::{Instruction, LocalVariable, MethodBody, Operand},
        emitter::{simplify_macros, BodyEmitter, Label},
        module::Module,
        opcodes::OpCode,
        references::{FieldHandle, MemberRef, MethodHandle},
        typesystem::TypeSig,
    },
    Error, Result,
};

/// Where the slot value lives at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datum {
    /// An argument of the rewritten method
    Arg(u16),
    /// A local of the rewritten method
    Local(u16),
}

/// Which half of a conversion to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Up to the marker, runs before the native call
    Pre,
    /// After the marker, runs after the native call
    Cleanup,
}

/// The call site locals a conversion was bound to.
#[derive(Debug, Clone)]
pub struct Binding {
    settings: u16,
    datum: Datum,
    locals: Vec<u16>,
}

/// A conversion body ready to be spliced.
#[derive(Debug, Clone)]
pub struct Conversion {
    method: String,
    pre: Vec<Instruction>,
    cleanup: Vec<Instruction>,
    marker: u32,
    locals: Vec<LocalVariable>,
}

fn is_marker(module: &Module, instr: &Instruction) -> bool {
    let Operand::Method(handle) = &instr.operand else {
        return false;
    };
    instr.opcode == OpCode::Call
        && module.method_name(handle) == Some(MARKER_METHOD)
        && module
            .method_parent(handle)
            .is_some_and(|parent| {
                module
                    .type_name(&parent)
                    .is_some_and(|name| name.is(INTEROP_NAMESPACE, MARSHAL_INITIALIZATION))
            })
}

fn substitute_method(module: &mut Module, handle: &MethodHandle, args: &[TypeSig]) -> MethodHandle {
    match handle {
        MethodHandle::Def(_) => handle.clone(),
        MethodHandle::Ref(id) => {
            let reference = module.member_ref(*id);
            if !reference.parent.is_open() {
                return handle.clone();
            }
            let substituted = MemberRef {
                parent: reference.parent.substitute(args, &[]),
                name: reference.name.clone(),
                signature: reference.signature.clone(),
            };
            MethodHandle::Ref(module.add_member_ref(substituted))
        }
        MethodHandle::Spec { method, args: method_args } => MethodHandle::Spec {
            method: Box::new(substitute_method(module, method, args)),
            args: method_args.iter().map(|arg| arg.substitute(args, &[])).collect(),
        },
    }
}

fn substitute_field(module: &mut Module, handle: FieldHandle, args: &[TypeSig]) -> FieldHandle {
    let FieldHandle::Ref(id) = handle else {
        return handle;
    };
    let reference = module.member_ref(id);
    if !reference.parent.is_open() {
        return handle;
    }
    let substituted = MemberRef {
        parent: reference.parent.substitute(args, &[]),
        name: reference.name.clone(),
        signature: reference.signature.clone(),
    };
    FieldHandle::Ref(module.add_member_ref(substituted))
}

fn substitute_operand(module: &mut Module, operand: Operand, args: &[TypeSig]) -> Operand {
    match operand {
        Operand::Type(sig) => Operand::Type(sig.substitute(args, &[])),
        Operand::Method(handle) => Operand::Method(substitute_method(module, &handle, args)),
        Operand::Field(handle) => Operand::Field(substitute_field(module, handle, args)),
        Operand::Sig(sig) => Operand::Sig(sig.substitute(args, &[])),
        other => other,
    }
}

impl Conversion {
    /// Prepares a conversion body already translated into `target`.
    ///
    /// `type_args` instantiates the generic parameters of the marshaler type.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMarshalerBody`] if the body has protected regions, does not call
    /// the marker exactly once, reads `this`, returns before the marker or branches across it.
    pub fn split(target: &mut Module, method: &str, mut body: MethodBody, type_args: &[TypeSig]) -> Result<Conversion> {
        let invalid = |reason: String| Error::InvalidMarshalerBody {
            method: method.to_string(),
            reason,
        };
        if !body.exception_handlers.is_empty() {
            return Err(invalid("protected regions cannot be inlined".to_string()));
        }
        simplify_macros(&mut body);

        let markers: Vec<usize> = body
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, instr)| is_marker(target, instr))
            .map(|(index, _)| index)
            .collect();
        let &[marker_index] = markers.as_slice() else {
            return Err(invalid(format!("expected one marker call, found {}", markers.len())));
        };
        let marker = body.instructions[marker_index].offset;

        for (index, instr) in body.instructions.iter().enumerate() {
            if let Operand::Arg(arg) = instr.operand {
                if arg == 0 || arg > 2 {
                    return Err(invalid(format!("IL_{:04x} uses argument {arg}", instr.offset)));
                }
            }
            if index < marker_index && instr.opcode == OpCode::Ret {
                return Err(invalid(format!("IL_{:04x} returns before the marker", instr.offset)));
            }
            let crossing = instr.targets().into_iter().any(|to| {
                if index < marker_index {
                    to > marker
                } else {
                    to <= marker
                }
            });
            if crossing {
                return Err(invalid(format!("IL_{:04x} branches across the marker", instr.offset)));
            }
        }

        let mut instructions = Vec::with_capacity(body.instructions.len());
        for instr in body.instructions {
            let operand = substitute_operand(target, instr.operand, type_args);
            instructions.push(Instruction { operand, ..instr });
        }
        let cleanup = instructions.split_off(marker_index + 1);
        instructions.pop();
        let locals = body
            .locals
            .into_iter()
            .map(|local| LocalVariable {
                local_type: local.local_type.substitute(type_args, &[]),
                pinned: local.pinned,
            })
            .collect();

        Ok(Conversion {
            method: method.to_string(),
            pre: instructions,
            cleanup,
            marker,
            locals,
        })
    }

    /// Name of the marshaler method the conversion came from.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Declares the conversion's own locals and binds its arguments.
    pub fn bind(&self, e: &mut BodyEmitter, settings: u16, datum: Datum) -> Binding {
        let locals = self
            .locals
            .iter()
            .map(|local| e.declare_local_variable(local.clone()))
            .collect();
        Binding {
            settings,
            datum,
            locals,
        }
    }

    /// Emits one segment.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMarshalerBody`] if the body reads a local it does not declare.
    pub fn emit(&self, e: &mut BodyEmitter, binding: &Binding, segment: Segment) -> Result<()> {
        let instructions = match segment {
            Segment::Pre => &self.pre,
            Segment::Cleanup => &self.cleanup,
        };
        let end = e.define_label();
        let mut labels: HashMap<u32, Label> = instructions
            .iter()
            .map(|instr| (instr.offset, e.define_label()))
            .collect();
        if segment == Segment::Pre {
            labels.insert(self.marker, end);
        }
        let label = |offset: u32| labels.get(&offset).copied().unwrap_or(end);

        for (index, instr) in instructions.iter().enumerate() {
            e.mark_label(label(instr.offset));
            match &instr.operand {
                Operand::Target(to) => e.branch(instr.opcode, label(*to)),
                Operand::Switch(targets) => e.switch(targets.iter().map(|to| label(*to)).collect()),
                Operand::Arg(1) => rebind_local(e, instr.opcode, binding.settings),
                Operand::Arg(_) => match binding.datum {
                    Datum::Arg(arg) => e.emit_operand(instr.opcode, Operand::Arg(arg)),
                    Datum::Local(local) => rebind_local(e, instr.opcode, local),
                },
                Operand::Local(local) => {
                    let Some(mapped) = binding.locals.get(usize::from(*local)) else {
                        return Err(Error::InvalidMarshalerBody {
                            method: self.method.clone(),
                            reason: format!("IL_{:04x} uses undeclared local {local}", instr.offset),
                        });
                    };
                    e.emit_operand(instr.opcode, Operand::Local(*mapped));
                }
                _ if instr.opcode == OpCode::Ret => {
                    if index + 1 != instructions.len() {
                        e.branch(OpCode::Br, end);
                    }
                }
                operand => e.emit_operand(instr.opcode, operand.clone()),
            }
        }
        e.mark_label(end);
        Ok(())
    }
}

/// An argument access turned into the same access of a local.
fn rebind_local(e: &mut BodyEmitter, opcode: OpCode, local: u16) {
    let opcode = match opcode {
        OpCode::Ldarga => OpCode::Ldloca,
        OpCode::Starg => OpCode::Stloc,
        _ => OpCode::Ldloc,
    };
    e.emit_operand(opcode, Operand::Local(local));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interop::{Imports, Support, CSTRING_MARSHALER, MARSHAL_MANAGED, MARSHAL_NATIVE},
        metadata::typesystem::MethodSig,
    };

    fn support_body(support: &Support, name: &str) -> Result<MethodBody> {
        let owner = support.require(CSTRING_MARSHALER)?;
        let method = support
            .module()
            .find_method(owner, name, None)
            .ok_or_else(|| Error::Error(name.to_string()))?;
        support
            .module()
            .method(method)
            .body
            .clone()
            .ok_or_else(|| Error::Error(name.to_string()))
    }

    fn marker(target: &mut Module) -> Result<MethodHandle> {
        let generic = target.core_type(INTEROP_NAMESPACE, MARSHAL_INITIALIZATION, false);
        let parent = TypeSig::generic_class(generic, vec![TypeSig::I, TypeSig::String]);
        target.method_on(&parent, MARKER_METHOD, MethodSig::new_static(TypeSig::Void, vec![TypeSig::Var(0)]))
    }

    #[test]
    fn string_conversion_splits_at_the_marker() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, false);
        let body = imports.body(&mut target, &support_body(&support, MARSHAL_MANAGED)?)?;
        let conversion = Conversion::split(&mut target, MARSHAL_MANAGED, body, &[])?;
        assert_eq!(conversion.locals.len(), 1);
        assert!(conversion.pre.iter().all(|instr| !is_marker(&target, instr)));
        // ldloc buffer; call FreeCoTaskMem; ret
        assert_eq!(conversion.cleanup.len(), 3);

        let mut e = BodyEmitter::new();
        let settings = e.declare_local(TypeSig::I4);
        let binding = conversion.bind(&mut e, settings, Datum::Arg(0));
        conversion.emit(&mut e, &binding, Segment::Pre)?;
        e.emit(OpCode::Pop);
        conversion.emit(&mut e, &binding, Segment::Cleanup)?;
        e.ret();
        let spliced = e.finish()?;
        assert!(!spliced
            .instructions
            .iter()
            .any(|instr| matches!(instr.operand, Operand::Arg(arg) if arg != 0)));
        assert_eq!(spliced.count(OpCode::Ret), 1);
        assert_eq!(spliced.count(OpCode::Ldloca), 2);
        Ok(())
    }

    #[test]
    fn branches_to_the_marker_land_after_the_pre_segment() -> Result<()> {
        let support = Support::builtin()?;
        let mut target = Module::new("App.dll", "App");
        let mut imports = Imports::new(&support, true);
        let body = imports.body(&mut target, &support_body(&support, MARSHAL_NATIVE)?)?;
        let conversion = Conversion::split(&mut target, MARSHAL_NATIVE, body, &[])?;
        assert!(conversion.cleanup.len() == 1 && conversion.cleanup[0].opcode == OpCode::Ret);

        let mut e = BodyEmitter::new();
        let settings = e.declare_local(TypeSig::I4);
        let native = e.declare_local(TypeSig::I);
        let binding = conversion.bind(&mut e, settings, Datum::Local(native));
        conversion.emit(&mut e, &binding, Segment::Pre)?;
        e.emit(OpCode::Pop);
        conversion.emit(&mut e, &binding, Segment::Cleanup)?;
        e.ret();
        let spliced = e.finish()?;
        let pop = spliced
            .instructions
            .iter()
            .find(|instr| instr.opcode == OpCode::Pop)
            .map(|instr| instr.offset);
        let into_pop = spliced
            .instructions
            .iter()
            .filter(|instr| instr.targets().into_iter().any(|to| Some(to) == pop))
            .count();
        assert!(into_pop >= 2);
        Ok(())
    }

    #[test]
    fn bodies_without_a_single_marker_are_rejected() -> Result<()> {
        let mut target = Module::new("App.dll", "App");
        let mut e = BodyEmitter::new();
        e.ldarg(2);
        e.emit(OpCode::Pop);
        e.ret();
        let body = e.finish()?;
        assert!(matches!(
            Conversion::split(&mut target, "M", body, &[]),
            Err(Error::InvalidMarshalerBody { .. })
        ));

        let call = marker(&mut target)?;
        let mut e = BodyEmitter::new();
        e.ldarg(2);
        e.call(call.clone());
        e.ldarg(2);
        e.call(call);
        e.ret();
        let body = e.finish()?;
        assert!(Conversion::split(&mut target, "M", body, &[]).is_err());
        Ok(())
    }

    #[test]
    fn this_and_early_returns_are_rejected() -> Result<()> {
        let mut target = Module::new("App.dll", "App");
        let call = marker(&mut target)?;

        let mut e = BodyEmitter::new();
        e.ldarg(0);
        e.call(call.clone());
        e.ret();
        let reads_this = e.finish()?;
        assert!(Conversion::split(&mut target, "M", reads_this, &[]).is_err());

        let mut e = BodyEmitter::new();
        let skip = e.define_label();
        e.ldarg(2);
        e.branch(OpCode::Brtrue, skip);
        e.ret();
        e.mark_label(skip);
        e.ldarg(2);
        e.call(call.clone());
        e.ret();
        let early = e.finish()?;
        assert!(Conversion::split(&mut target, "M", early, &[]).is_err());

        let mut e = BodyEmitter::new();
        let after = e.define_label();
        e.ldarg(2);
        e.branch(OpCode::Brtrue, after);
        e.ldarg(2);
        e.call(call);
        e.mark_label(after);
        e.ret();
        let crossing = e.finish()?;
        assert!(Conversion::split(&mut target, "M", crossing, &[]).is_err());
        Ok(())
    }

    #[test]
    fn generic_operands_are_instantiated() -> Result<()> {
        let mut target = Module::new("App.dll", "App");
        let call = marker(&mut target)?;
        let mut e = BodyEmitter::new();
        e.ldarg(1);
        e.emit_operand(OpCode::Box, Operand::Type(TypeSig::Var(0)));
        e.call(call);
        e.ret();
        let body = e.finish()?;
        let custom = target.core_type("App", "Custom", false);
        let conversion = Conversion::split(&mut target, "M", body, std::slice::from_ref(&custom))?;
        assert_eq!(conversion.pre[1].operand, Operand::Type(custom));
        Ok(())
    }
}
