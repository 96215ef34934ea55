#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use jinjate::{Context, Environment, MemoryBytecodeCache, MapLoader};

mod utils;

fn contexts() -> Vec<Context> {
    utils::generate_page_contexts(100)
        .iter()
        .map(to_context)
        .collect()
}

fn to_value(json: &serde_json::Value) -> jinjate::Value {
    use jinjate::Value;
    match json {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Value::from(n.as_f64().unwrap_or_default()), Value::from),
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::from(items.iter().map(to_value).collect::<Vec<_>>()),
        serde_json::Value::Object(map) => Value::from_map(map.iter().map(|(k, v)| (k.as_str(), to_value(v)))),
    }
}

fn to_context(json: &serde_json::Value) -> Context {
    json.as_object()
        .unwrap()
        .iter()
        .map(|(name, value)| (name.as_str(), to_value(value)))
        .collect()
}

fn jinjate_benchmark(c: &mut Criterion) {
    let mut env = Environment::new();
    for (name, source) in utils::TEMPLATES {
        env.add_template(name, source).unwrap();
    }
    let contexts = contexts();

    utils::print_binary_size();

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    group.bench_function("jinjate_render", |b| {
        b.iter(|| {
            let template = env.get_template("page.jinja").unwrap();
            for context in &contexts {
                black_box(template.render(context).unwrap());
            }
        });
    });

    group.bench_function("jinjate_compile", |b| {
        b.iter(|| black_box(env.from_string(utils::PAGE).unwrap()));
    });

    let cache = MemoryBytecodeCache::new();
    group.bench_function("jinjate_load_with_bytecode_cache", |b| {
        b.iter(|| {
            let mut env = Environment::new();
            env.set_loader(MapLoader::from_iter(utils::TEMPLATES));
            env.set_bytecode_cache(cache.clone());
            black_box(env.get_template("page.jinja").unwrap().render(&contexts[0]).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, jinjate_benchmark);
criterion_main!(benches);
