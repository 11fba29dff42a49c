//! Benchmarks for module rewriting.
//!
//! - Lazy and eager rewrites of a module with many plain declarations
//! - Rewrites of string marshaled declarations
//! - Support embedding on its own

extern crate dotbind;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use dotbind::{interop::Imports, prelude::*};
use std::hint::black_box;

/// `count` declarations spread over eight types and four libraries.
fn sample(count: usize, marshaled: bool) -> Module {
    let mut module = Module::new("Bench.dll", "Bench");
    let object = module.core_type("System", "Object", false);
    let owners: Vec<TypeId> = (0..8)
        .map(|index| {
            module.add_type(TypeDef::new(
                "Bench",
                &format!("Native{index}"),
                TypeAttributes::PUBLIC,
                Some(object.clone()),
            ))
        })
        .collect();
    let libraries: Vec<ModuleRefId> = (0..4)
        .map(|index| module.add_module_ref(&format!("libbench{index}.so")))
        .collect();

    for index in 0..count {
        let (ret, params) = if marshaled {
            (TypeSig::String, vec![TypeSig::String])
        } else {
            (TypeSig::I4, vec![TypeSig::I4, TypeSig::I])
        };
        let mut def = MethodDef::new(
            owners[index % owners.len()],
            &format!("fn{index}"),
            (MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL).with_access(MemberAccess::Public),
            MethodSig::new_static(ret, params),
        );
        if marshaled {
            def.params = vec![ParamDef::new("value").with_marshal(MarshalInfo::native(NATIVE_TYPE::LPSTR))];
            def.return_param.marshal = Some(MarshalInfo::native(NATIVE_TYPE::LPSTR));
        }
        def.pinvoke = Some(PInvokeInfo {
            flags: PInvokeAttributes::CALL_CONV_CDECL,
            entry_point: None,
            module: libraries[index % libraries.len()],
        });
        module.add_method(def);
    }
    module
}

fn bench_rewrite(c: &mut Criterion, name: &str, config: &RewriteConfig, marshaled: bool) {
    let support = Support::builtin().unwrap();
    let module = sample(256, marshaled);
    let processor = ModuleProcessor::new(&support, config);

    c.bench_function(name, |b| {
        b.iter_batched(
            || module.clone(),
            |mut module| {
                let report = processor.process(&mut module).unwrap();
                black_box(report)
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_rewrite_lazy(c: &mut Criterion) {
    bench_rewrite(c, "rewrite_lazy_256", &RewriteConfig::lazy(), false);
}

fn bench_rewrite_eager(c: &mut Criterion) {
    bench_rewrite(c, "rewrite_eager_256", &RewriteConfig::eager(), false);
}

fn bench_rewrite_marshaled(c: &mut Criterion) {
    bench_rewrite(c, "rewrite_marshaled_256", &RewriteConfig::lazy(), true);
}

fn bench_embed_support(c: &mut Criterion) {
    let support = Support::builtin().unwrap();

    c.bench_function("embed_support", |b| {
        b.iter(|| {
            let mut target = Module::new("Bench.dll", "Bench");
            let mut imports = Imports::new(&support, true);
            let count = imports.embed_all(&mut target).unwrap();
            black_box((count, target))
        });
    });
}

criterion_group!(
    benches,
    bench_rewrite_lazy,
    bench_rewrite_eager,
    bench_rewrite_marshaled,
    bench_embed_support
);
criterion_main!(benches);
