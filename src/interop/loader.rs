//! The loader contract and the default loader.
//!
//! `LibLoader` forwards every call to a backend it picks once, in its constructor, from the
//! platform the module runs on:
//!
//! - `WinLibLoader` over `kernel32.dll` on Windows
//! - `BsdLibLoader` over `libc` on macOS and the BSDs
//! - `UnixLibLoader` over `libdl.so.2` everywhere else
//!
//! The backends declare their primitives as ordinary runtime-bound declarations and carry
//! `ImportFilter(false)`, so the rewriter never touches them.

use crate::{
    interop::{
        annotations::Annotations,
        builder::{ctor_flags, implementation, interface_slot, public_static, SupportBuilder},
        FACTORY_METHOD, LIBRARY_LOADER, LIB_LOADER, LOADER_SENTINEL,
    },
    metadata::{
        attributes::{FieldAttributes, MemberAccess, MethodAttributes, MethodImplAttributes, TypeAttributes},
        body::Operand,
        customattributes::{AttributeArgument, CustomAttribute},
        emitter::BodyEmitter,
        marshalling::{MarshalInfo, NATIVE_TYPE},
        members::FieldDef,
        opcodes::OpCode,
        pinvoke::{PInvokeAttributes, PInvokeInfo},
        references::{FieldHandle, MethodHandle},
        token::{MethodId, ModuleRefId, TypeId},
        typesystem::{MethodSig, TypeSig},
    },
    Result,
};

/// Library holding `dlopen` and friends on Linux.
pub const LIBDL_NAME: &str = "libdl.so.2";
/// Library holding `dlopen` and friends on macOS and the BSDs.
pub const LIBC_NAME: &str = "libc";
/// Library holding `LoadLibraryW` and friends on Windows.
pub const KERNEL32_NAME: &str = "kernel32.dll";

/// Backend used on Windows.
pub const WIN_LIB_LOADER: &str = "WinLibLoader";
/// Backend used on macOS and the BSDs.
pub const BSD_LIB_LOADER: &str = "BsdLibLoader";
/// Backend used on Linux and every other platform.
pub const UNIX_LIB_LOADER: &str = "UnixLibLoader";

/// `RTLD_NOW | RTLD_GLOBAL` on glibc
const UNIX_DLOPEN_FLAGS: i32 = 0x0002 | 0x0100;
/// `RTLD_NOW`; the value of `RTLD_GLOBAL` differs between Darwin and the BSDs
const BSD_DLOPEN_FLAGS: i32 = 0x0002;

struct Contract {
    ty: TypeId,
    load_library: MethodId,
    get_proc_address: MethodId,
    free_library: MethodId,
    get_error: MethodId,
    prepare: MethodId,
}

fn load_library_sig() -> MethodSig {
    MethodSig::new_instance(TypeSig::I, vec![TypeSig::String])
}

fn get_proc_address_sig() -> MethodSig {
    MethodSig::new_instance(TypeSig::I, vec![TypeSig::I, TypeSig::String])
}

fn free_library_sig() -> MethodSig {
    MethodSig::new_instance(TypeSig::Boolean, vec![TypeSig::I])
}

fn get_error_sig() -> MethodSig {
    MethodSig::new_instance(TypeSig::String, vec![])
}

fn prepare_sig() -> MethodSig {
    MethodSig::new_instance(TypeSig::Void, vec![])
}

fn contract(b: &mut SupportBuilder) -> Result<Contract> {
    let ty = b.class(
        LIBRARY_LOADER,
        TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
        None,
    );
    let slot = interface_slot();
    Ok(Contract {
        ty,
        load_library: b.declare(ty, "LoadLibrary", slot, load_library_sig())?,
        get_proc_address: b.declare(ty, "GetProcAddress", slot, get_proc_address_sig())?,
        free_library: b.declare(ty, "FreeLibrary", slot, free_library_sig())?,
        get_error: b.declare(ty, "GetError", slot, get_error_sig())?,
        prepare: b.declare(ty, "Prepare", slot, prepare_sig())?,
    })
}

/// Implementations of the contract's five slots, in contract order.
struct Slots<A, B, C, D, E> {
    load_library: A,
    get_proc_address: B,
    free_library: C,
    get_error: D,
    prepare: E,
}

impl<A, B, C, D, E> Slots<A, B, C, D, E>
where
    A: FnOnce(&mut BodyEmitter),
    B: FnOnce(&mut BodyEmitter),
    C: FnOnce(&mut BodyEmitter),
    D: FnOnce(&mut BodyEmitter),
    E: FnOnce(&mut BodyEmitter),
{
    fn define(self, b: &mut SupportBuilder, owner: TypeId) -> Result<()> {
        b.method(owner, "LoadLibrary", implementation(), load_library_sig(), Some(self.load_library))?;
        b.method(
            owner,
            "GetProcAddress",
            implementation(),
            get_proc_address_sig(),
            Some(self.get_proc_address),
        )?;
        b.method(owner, "FreeLibrary", implementation(), free_library_sig(), Some(self.free_library))?;
        b.method(owner, "GetError", implementation(), get_error_sig(), Some(self.get_error))?;
        b.method(owner, "Prepare", implementation(), prepare_sig(), Some(self.prepare))?;
        Ok(())
    }
}

/// A nested backend class and its parameterless constructor.
struct Backend {
    ty: TypeId,
    ctor: MethodId,
}

fn backend(
    b: &mut SupportBuilder,
    enclosing: TypeId,
    name: &str,
    contract: &Contract,
    annotations: &Annotations,
) -> Result<Backend> {
    let object = b.object.clone();
    let ty = b.nested(
        enclosing,
        name,
        TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    b.module.ty_mut(ty).interfaces.push(TypeSig::Def(contract.ty));
    // the loader's own primitives stay runtime bound
    b.module.ty_mut(ty).custom_attributes.push(CustomAttribute::new(
        annotations.import_filter.clone(),
        vec![AttributeArgument::Bool(false)],
    ));
    let base = b.object_ctor()?;
    let ctor = b.ctor(ty, vec![], base, |_| {})?;
    Ok(Backend { ty, ctor })
}

/// Declares static foreign functions of one library on a backend.
struct Natives<'b> {
    b: &'b mut SupportBuilder,
    owner: TypeId,
    library: ModuleRefId,
    flags: u16,
}

impl Natives<'_> {
    /// `strings` lists the parameters marshaled as C strings with their native type.
    fn declare(
        &mut self,
        name: &str,
        entry_point: Option<&str>,
        sig: MethodSig,
        strings: &[(usize, u8)],
    ) -> Result<MethodId> {
        let id = self.b.declare(
            self.owner,
            name,
            (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG | MethodAttributes::PINVOKE_IMPL)
                .with_access(MemberAccess::Private),
            sig,
        )?;
        let method = self.b.module.method_mut(id);
        method.impl_flags = MethodImplAttributes::PRESERVE_SIG;
        method.pinvoke = Some(PInvokeInfo {
            flags: self.flags,
            entry_point: entry_point.map(str::to_string),
            module: self.library,
        });
        for (index, native) in strings {
            let param = &mut method.params[*index];
            *param = param.clone().with_marshal(MarshalInfo::native(*native));
        }
        Ok(id)
    }
}

/// `dlopen` family backend shared by Linux and the BSDs.
fn dl_backend(
    b: &mut SupportBuilder,
    enclosing: TypeId,
    name: &str,
    library: &str,
    flags: i32,
    contract: &Contract,
    annotations: &Annotations,
) -> Result<Backend> {
    let backend = backend(b, enclosing, name, contract, annotations)?;
    let library = b.module.add_module_ref(library);
    let mut natives = Natives {
        b: &mut *b,
        owner: backend.ty,
        library,
        flags: PInvokeAttributes::CALL_CONV_CDECL | PInvokeAttributes::CHAR_SET_ANSI,
    };
    let lpstr = NATIVE_TYPE::LPSTR;
    let dlopen = natives.declare(
        "dlopen",
        None,
        MethodSig::new_static(TypeSig::I, vec![TypeSig::String, TypeSig::I4]),
        &[(0, lpstr)],
    )?;
    let dlsym = natives.declare(
        "dlsym",
        None,
        MethodSig::new_static(TypeSig::I, vec![TypeSig::I, TypeSig::String]),
        &[(1, lpstr)],
    )?;
    let dlclose =
        natives.declare("dlclose", None, MethodSig::new_static(TypeSig::I4, vec![TypeSig::I]), &[])?;
    let dlerror = natives.declare("dlerror", None, MethodSig::new_static(TypeSig::I, vec![]), &[])?;

    let string = b.core("System", "String");
    let equality = b.core_method(
        &string,
        "op_Equality",
        MethodSig::new_static(TypeSig::Boolean, vec![TypeSig::String, TypeSig::String]),
    )?;
    let marshal = b.core("System.Runtime.InteropServices", "Marshal");
    let ptr_to_string = b.core_method(
        &marshal,
        "PtrToStringAnsi",
        MethodSig::new_static(TypeSig::String, vec![TypeSig::I]),
    )?;

    let dlopen = MethodHandle::Def(dlopen);
    Slots {
        load_library: |e: &mut BodyEmitter| {
            let named = e.define_label();
            e.ldarg(1);
            e.ldstr(LOADER_SENTINEL);
            e.call(equality);
            e.branch(OpCode::Brfalse, named);
            e.ldnull();
            e.ldc_i4(flags);
            e.call(dlopen.clone());
            e.ret();
            e.mark_label(named);
            e.ldarg(1);
            e.ldc_i4(flags);
            e.call(dlopen);
            e.ret();
        },
        get_proc_address: |e: &mut BodyEmitter| {
            e.ldarg(1);
            e.ldarg(2);
            e.call(MethodHandle::Def(dlsym));
            e.ret();
        },
        free_library: |e: &mut BodyEmitter| {
            e.ldarg(1);
            e.call(MethodHandle::Def(dlclose));
            e.ldc_i4(0);
            e.emit(OpCode::Ceq);
            e.ret();
        },
        get_error: |e: &mut BodyEmitter| {
            e.call(MethodHandle::Def(dlerror));
            e.call(ptr_to_string);
            e.ret();
        },
        // binds dlerror before any resolver can race on it
        prepare: |e: &mut BodyEmitter| {
            e.call(MethodHandle::Def(dlerror));
            e.emit(OpCode::Pop);
            e.ret();
        },
    }
    .define(b, backend.ty)?;
    Ok(backend)
}

fn win_backend(
    b: &mut SupportBuilder,
    enclosing: TypeId,
    contract: &Contract,
    annotations: &Annotations,
) -> Result<Backend> {
    let backend = backend(b, enclosing, WIN_LIB_LOADER, contract, annotations)?;
    let library = b.module.add_module_ref(KERNEL32_NAME);
    let mut natives = Natives {
        b: &mut *b,
        owner: backend.ty,
        library,
        flags: PInvokeAttributes::CALL_CONV_WINAPI
            | PInvokeAttributes::CHAR_SET_UNICODE
            | PInvokeAttributes::SUPPORTS_LAST_ERROR,
    };
    let lpwstr = NATIVE_TYPE::LPWSTR;
    let load = natives.declare(
        "_LoadLibraryW",
        Some("LoadLibraryW"),
        MethodSig::new_static(TypeSig::I, vec![TypeSig::String]),
        &[(0, lpwstr)],
    )?;
    let module_handle = natives.declare(
        "_GetModuleHandleExW",
        Some("GetModuleHandleExW"),
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::String, TypeSig::I.by_ref()]),
        &[(1, lpwstr)],
    )?;
    let free = natives.declare(
        "_FreeLibrary",
        Some("FreeLibrary"),
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I]),
        &[],
    )?;
    // symbol names are always narrow on Windows
    natives.flags = PInvokeAttributes::CALL_CONV_WINAPI
        | PInvokeAttributes::CHAR_SET_ANSI
        | PInvokeAttributes::SUPPORTS_LAST_ERROR;
    let proc_address = natives.declare(
        "_GetProcAddress",
        Some("GetProcAddress"),
        MethodSig::new_static(TypeSig::I, vec![TypeSig::I, TypeSig::String]),
        &[(1, NATIVE_TYPE::LPSTR)],
    )?;

    let string = b.core("System", "String");
    let equality = b.core_method(
        &string,
        "op_Equality",
        MethodSig::new_static(TypeSig::Boolean, vec![TypeSig::String, TypeSig::String]),
    )?;
    let marshal = b.core("System.Runtime.InteropServices", "Marshal");
    let last_error =
        b.core_method(&marshal, "GetLastWin32Error", MethodSig::new_static(TypeSig::I4, vec![]))?;
    let win32_exception = b.core("System.ComponentModel", "Win32Exception");
    let describe = b.core_method(
        &win32_exception,
        ".ctor",
        MethodSig::new_instance(TypeSig::Void, vec![TypeSig::I4]),
    )?;
    let exception = b.core("System", "Exception");
    let message =
        b.core_method(&exception, "get_Message", MethodSig::new_instance(TypeSig::String, vec![]))?;

    Slots {
        load_library: |e: &mut BodyEmitter| {
            let named = e.define_label();
            e.ldarg(1);
            e.ldstr(LOADER_SENTINEL);
            e.call(equality);
            e.branch(OpCode::Brfalse, named);
            // flags 0 takes a reference, so FreeLibrary stays balanced
            let handle = e.declare_local(TypeSig::I);
            e.ldc_i4(0);
            e.ldnull();
            e.ldloca(handle);
            e.call(MethodHandle::Def(module_handle));
            e.emit(OpCode::Pop);
            e.ldloc(handle);
            e.ret();
            e.mark_label(named);
            e.ldarg(1);
            e.call(MethodHandle::Def(load));
            e.ret();
        },
        get_proc_address: |e: &mut BodyEmitter| {
            e.ldarg(1);
            e.ldarg(2);
            e.call(MethodHandle::Def(proc_address));
            e.ret();
        },
        free_library: |e: &mut BodyEmitter| {
            e.ldarg(1);
            e.call(MethodHandle::Def(free));
            e.ldc_i4(0);
            e.emit(OpCode::CgtUn);
            e.ret();
        },
        get_error: |e: &mut BodyEmitter| {
            e.call(last_error);
            e.newobj(describe);
            e.callvirt(message);
            e.ret();
        },
        // the last error is captured by the runtime, there is nothing to bind up front
        prepare: |e: &mut BodyEmitter| e.ret(),
    }
    .define(b, backend.ty)?;
    Ok(backend)
}

/// `CreatePlatformLoader`: Windows, then macOS or anything whose description names a BSD,
/// then the `libdl` backend.
fn select_platform(
    b: &mut SupportBuilder,
    loader: TypeId,
    contract: &Contract,
    backends: [&Backend; 3],
) -> Result<MethodId> {
    let [win, bsd, unix] = backends;
    let runtime = b.core("System.Runtime.InteropServices", "RuntimeInformation");
    let platform = b.core_value("System.Runtime.InteropServices", "OSPlatform");
    let windows = b.core_method(&platform, "get_Windows", MethodSig::new_static(platform.clone(), vec![]))?;
    let osx = b.core_method(&platform, "get_OSX", MethodSig::new_static(platform.clone(), vec![]))?;
    let is_platform = b.core_method(
        &runtime,
        "IsOSPlatform",
        MethodSig::new_static(TypeSig::Boolean, vec![platform]),
    )?;
    let description =
        b.core_method(&runtime, "get_OSDescription", MethodSig::new_static(TypeSig::String, vec![]))?;
    let string = b.core("System", "String");
    let lower =
        b.core_method(&string, "ToLowerInvariant", MethodSig::new_instance(TypeSig::String, vec![]))?;
    let contains = b.core_method(
        &string,
        "Contains",
        MethodSig::new_instance(TypeSig::Boolean, vec![TypeSig::String]),
    )?;

    let (win, bsd, unix) = (win.ctor, bsd.ctor, unix.ctor);
    b.method(
        loader,
        "CreatePlatformLoader",
        (MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG).with_access(MemberAccess::Private),
        MethodSig::new_static(TypeSig::Def(contract.ty), vec![]),
        Some(|e: &mut BodyEmitter| {
            let not_windows = e.define_label();
            let bsd_like = e.define_label();
            let other = e.define_label();
            e.call(windows);
            e.call(is_platform.clone());
            e.branch(OpCode::Brfalse, not_windows);
            e.newobj(MethodHandle::Def(win));
            e.ret();
            e.mark_label(not_windows);
            e.call(osx);
            e.call(is_platform);
            e.branch(OpCode::Brtrue, bsd_like);
            e.call(description);
            e.callvirt(lower);
            e.ldstr("bsd");
            e.callvirt(contains);
            e.branch(OpCode::Brfalse, other);
            e.mark_label(bsd_like);
            e.newobj(MethodHandle::Def(bsd));
            e.ret();
            e.mark_label(other);
            e.newobj(MethodHandle::Def(unix));
            e.ret();
        }),
    )
}

pub(super) fn define(b: &mut SupportBuilder, annotations: &Annotations) -> Result<()> {
    let contract = contract(b)?;
    let object = b.object.clone();
    let loader = b.class(
        LIB_LOADER,
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    b.module.ty_mut(loader).interfaces.push(TypeSig::Def(contract.ty));

    let unix =
        dl_backend(b, loader, UNIX_LIB_LOADER, LIBDL_NAME, UNIX_DLOPEN_FLAGS, &contract, annotations)?;
    let bsd =
        dl_backend(b, loader, BSD_LIB_LOADER, LIBC_NAME, BSD_DLOPEN_FLAGS, &contract, annotations)?;
    let win = win_backend(b, loader, &contract, annotations)?;
    let create = select_platform(b, loader, &contract, [&win, &bsd, &unix])?;

    let instance = b.module.add_field(FieldDef::new(
        loader,
        "s_instance",
        (FieldAttributes::STATIC | FieldAttributes::INIT_ONLY).with_access(MemberAccess::Private),
        TypeSig::Def(loader),
    ));
    let inner = FieldHandle::Def(b.module.add_field(FieldDef::new(
        loader,
        "_internal",
        FieldAttributes::INIT_ONLY.with_access(MemberAccess::Private),
        TypeSig::Def(contract.ty),
    )));

    let base = b.object_ctor()?;
    let field = inner.clone();
    let ctor = b.method(
        loader,
        ".ctor",
        ctor_flags(),
        MethodSig::new_instance(TypeSig::Void, vec![]),
        Some(|e: &mut BodyEmitter| {
            e.ldarg(0);
            e.call(base);
            e.ldarg(0);
            e.call(MethodHandle::Def(create));
            e.emit_operand(OpCode::Stfld, Operand::Field(field));
            e.ret();
        }),
    )?;
    b.method(
        loader,
        ".cctor",
        (MethodAttributes::STATIC
            | MethodAttributes::HIDE_BY_SIG
            | MethodAttributes::SPECIAL_NAME
            | MethodAttributes::RTSPECIAL_NAME)
            .with_access(MemberAccess::Private),
        MethodSig::new_static(TypeSig::Void, vec![]),
        Some(|e: &mut BodyEmitter| {
            e.newobj(MethodHandle::Def(ctor));
            e.stsfld(FieldHandle::Def(instance));
            e.ret();
        }),
    )?;
    b.method(
        loader,
        FACTORY_METHOD,
        public_static(),
        MethodSig::new_static(TypeSig::Def(contract.ty), vec![TypeSig::String]),
        Some(|e: &mut BodyEmitter| {
            e.ldsfld(FieldHandle::Def(instance));
            e.ret();
        }),
    )?;

    let forward = |slot: MethodId, args: u16| {
        let inner = inner.clone();
        move |e: &mut BodyEmitter| {
            e.ldarg(0);
            e.emit_operand(OpCode::Ldfld, Operand::Field(inner));
            for arg in 1..=args {
                e.ldarg(arg);
            }
            e.callvirt(MethodHandle::Def(slot));
            e.ret();
        }
    };
    Slots {
        load_library: forward(contract.load_library, 1),
        get_proc_address: forward(contract.get_proc_address, 2),
        free_library: forward(contract.free_library, 1),
        get_error: forward(contract.get_error, 0),
        prepare: forward(contract.prepare, 0),
    }
    .define(b, loader)
}
