#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use minijinja::Environment;

mod utils;

fn minijinja_benchmark(c: &mut Criterion) {
    let mut env = Environment::new();
    for (name, source) in utils::TEMPLATES {
        env.add_template(name, source).unwrap();
    }

    let contexts = utils::generate_page_contexts(100);

    utils::print_binary_size();

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    group.bench_function("minijinja_render", |b| {
        b.iter(|| {
            let template = env.get_template("page.jinja").unwrap();
            for context in &contexts {
                black_box(template.render(context).unwrap());
            }
        });
    });

    group.bench_function("minijinja_compile", |b| {
        b.iter(|| black_box(env.template_from_str(utils::PAGE).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, minijinja_benchmark);
criterion_main!(benches);
