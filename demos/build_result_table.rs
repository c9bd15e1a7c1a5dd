//! Build Result Table Example
//!
//! One-time setup script: creates the result table and its categories.
//! Running it a second time fails instead of wiping existing results.
//!
//! Run with: cargo run --example build_result_table -- results/resultTable.json

use anyhow::Context;
use result_table::TableBuilder;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "results/resultTable.json".to_string());

    println!("=== Building result table at {path} ===\n");

    let table = TableBuilder::new(["accuracy", "crossEntropy"], &path)
        .round_decimal(3)
        .build()
        .with_context(|| format!("could not build {path}"))?;

    for category in ["CNN", "Transformer"] {
        table.add_category(category)?;
        println!("   Added category: {category}");
    }

    println!("\n   Metrics: {:?}", table.metrics());
    println!("   Categories: {:?}", table.categories());
    Ok(())
}
