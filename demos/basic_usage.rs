// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic searchbox usage example.
//!
//! Demonstrates:
//! 1. Configuring an index (facets, numeric attributes, sort aliases)
//! 2. Seeding an in-memory SQLite catalog
//! 3. Compiling a disjunctive-facet request and printing the SQL
//! 4. Running the search, a facet value search and a multi-query
//! 5. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=searchbox=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use searchbox::{
    HookName, HookRegistry, IndexSettings, MultiSearchRequest, SearchConfig, SearchEngine, SearchExecutor,
    SearchRequest, SqlDialect, SqlFragment, SqlxExecutor,
};

const SCHEMA: &str = r#"CREATE TABLE "products" (
    "id" INTEGER PRIMARY KEY,
    "name" TEXT,
    "color" TEXT,
    "brand" TEXT,
    "price" REAL
)"#;

const ROWS: &str = r#"INSERT INTO "products" VALUES
    (1, 'Trail runner', 'red', 'Acme', 89.0),
    (2, 'Road runner', 'blue', 'Acme', 119.0),
    (3, 'Court classic', 'white', 'Zenith', 64.5),
    (4, 'Hiking boot', 'brown', 'Zenith', 149.0),
    (5, 'Runner lite', 'red', 'Nimbus', 74.0),
    (6, 'Slip-on', 'blue', 'Nimbus', 39.0)"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("searchbox=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             searchbox: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure the engine
    // ─────────────────────────────────────────────────────────────────────────
    let config = SearchConfig {
        dialect: SqlDialect::Sqlite,
        indices: vec![IndexSettings::new("products")
            .facet("color")
            .searchable_facet("brand")
            .numeric("price")
            .text("name")
            .sortable("price")],
    };

    let hooks = HookRegistry::new();
    hooks.register(HookName::AssembledQuery, "demo", |fragment, context| {
        tracing::debug!(label = %context.label, sql = %fragment.sql, "assembled");
        Ok(fragment)
    });
    let engine = SearchEngine::new(config, Arc::new(hooks))?;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Seed the catalog
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Seeding in-memory catalog...");
    let executor = SqlxExecutor::connect("sqlite::memory:").await?;
    executor
        .execute_batch(&[
            SqlFragment::query(SCHEMA, Vec::new()),
            SqlFragment::query(ROWS, Vec::new()),
        ])
        .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Compile and inspect
    // ─────────────────────────────────────────────────────────────────────────
    let request = SearchRequest::new("runner")
        .facet_filters(json!([["color:red", "color:blue"]]))
        .numeric_filters(json!(["price>=50"]))
        .facets(json!(["*"]))
        .hits_per_page(2);

    println!("\n🔧 Compiled statements:");
    let compiled = engine.compile("products?sort=price+asc", &request)?;
    for statement in compiled.statements() {
        println!("   {}", statement.inline());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Search
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Search response:");
    let response = engine.search(&executor, "products?sort=price+asc", &request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    println!("\n🔎 Facet value search (brand, 'ac'):");
    let mut facet_request = SearchRequest::default();
    facet_request.facet_query = Some("ac".into());
    let facet_hits = engine
        .search_for_facet_values(&executor, "products", "brand", &facet_request)
        .await?;
    println!("{}", serde_json::to_string_pretty(&facet_hits)?);

    println!("\n📚 Multi-query:");
    let body = MultiSearchRequest::from_value(json!({
        "requests": [
            { "indexName": "products", "params": { "query": "boot" } },
            { "indexName": "products?sort=price+desc", "params": { "hitsPerPage": 1 } }
        ]
    }))?;
    let multi = engine.multi_search(&executor, &body).await?;
    for (i, result) in multi.results.iter().enumerate() {
        println!("   [{}] {} nbHits={} hits={}", i, result.index, result.nb_hits, result.hits.len());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n✅ Done\n");
    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = vec![];
    let mut gauges = vec![];
    let mut histograms = vec![];

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, value) in &counters {
        println!("   counter   {} = {}", name, value);
    }
    for (name, value) in &gauges {
        println!("   gauge     {} = {:.2}", name, value);
    }
    for (name, count, sum) in &histograms {
        println!("   histogram {} count={} sum={:.4}", name, count, sum);
    }
}
