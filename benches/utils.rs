#![allow(dead_code, reason = "Each benchmark binary uses a different subset of the helpers.")]

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::{Map, Value, json};

pub const LAYOUT: &str = include_str!("layout.jinja");
pub const PAGE: &str = include_str!("page.jinja");

/// Templates in load order: the layout first, then the page extending it.
pub const TEMPLATES: [(&str, &str); 2] = [("layout.jinja", LAYOUT), ("page.jinja", PAGE)];

const SECTIONS: [&str; 4] = ["guides", "reference", "news", "archive"];

/// Seeded page contexts: a nested navigation tree for the recursive loop, articles spread over
/// the sections for the macro and call blocks, and a metadata map for `dictsort`.
pub fn generate_page_contexts(n: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| page_context(&mut rng)).collect()
}

fn page_context(rng: &mut StdRng) -> Value {
    let nav: Vec<Value> = (0..rng.random_range(3..6))
        .map(|_| nav_node(rng, 0))
        .collect();

    let articles: Vec<Value> = (0..rng.random_range(4..16))
        .map(|_| {
            json!({
                "title": words(rng, 2, 5),
                "section": SECTIONS[rng.random_range(0..SECTIONS.len())],
                "words": rng.random_range(200..4000),
                "draft": rng.random_bool(0.2),
            })
        })
        .collect();

    let mut meta = Map::new();
    for _ in 0..rng.random_range(2..6) {
        meta.insert(word(rng, 3, 8), json!(rng.random_range(1..100)));
    }

    json!({
        "site": {
            "title": words(rng, 1, 3),
            "year": rng.random_range(2000..2030),
            "nav": nav,
        },
        "page": {
            "title": words(rng, 3, 6),
            "author": {"name": word(rng, 4, 9), "email": format!("{}@example.com", word(rng, 3, 8))},
            "tags": (0..rng.random_range(1..5)).map(|_| word(rng, 3, 7)).collect::<Vec<_>>(),
            "meta": meta,
        },
        "sections": SECTIONS,
        "articles": articles,
    })
}

fn nav_node(rng: &mut StdRng, depth: usize) -> Value {
    let title = word(rng, 4, 10);
    let children: Vec<Value> = if depth < 3 && rng.random_bool(0.5) {
        (0..rng.random_range(1..4))
            .map(|_| nav_node(rng, depth + 1))
            .collect()
    } else {
        Vec::new()
    };
    json!({"title": title, "href": format!("/{}/", title), "children": children})
}

fn words(rng: &mut StdRng, min: usize, max: usize) -> String {
    (0..rng.random_range(min..=max))
        .map(|_| word(rng, 2, 9))
        .collect::<Vec<_>>()
        .join(" ")
}

fn word(rng: &mut StdRng, min_len: usize, max_len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    (0..rng.random_range(min_len..=max_len))
        .map(|_| char::from(CHARSET[rng.random_range(0..CHARSET.len())]))
        .collect()
}

/// Prints the size of the running benchmark binary.
pub fn print_binary_size() {
    let Ok(binary_path) = std::env::current_exe() else {
        return;
    };
    let Ok(metadata) = std::fs::metadata(&binary_path) else {
        return;
    };
    let size_bytes = metadata.len();
    let size_kb = size_bytes as f64 / 1024.0;
    println!(
        "Binary size: {:.2} MB ({:.2} KB, {} bytes) at {}",
        size_kb / 1024.0,
        size_kb,
        size_bytes,
        binary_path.display()
    );
}
