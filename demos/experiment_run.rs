//! Experiment Run Example
//!
//! What a training script does with a result table:
//! 1. Install the crash handler so a failed run leaves no phantom row
//! 2. Register the run before training (duplicates stop here)
//! 3. Write the final metrics exactly once
//! 4. Export the compiled report
//!
//! Run with: cargo run --example experiment_run

use anyhow::Context;
use result_table::{Error, Hyperparameters, ResultTable, TableBuilder};
use tracing_subscriber::EnvFilter;

const TABLE: &str = "results/demoTable.json";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if !std::path::Path::new(TABLE).exists() {
        let table = TableBuilder::new(["accuracy", "crossEntropy"], TABLE).build()?;
        table.add_category("CNN")?;
    }

    let table = ResultTable::open(TABLE).context("open result table")?;
    table.install_crash_handler();

    // -------------------------------------------------------------------------
    // 1. Register the run
    // -------------------------------------------------------------------------
    let hyper = Hyperparameters::new()
        .with("lr", 0.001)
        .with("batch_size", 64)
        .with("dataset", "Huge");

    let socket = match table.register("experiment1", "config.yaml", Some("CNN"), &hyper) {
        Ok(socket) => socket,
        Err(Error::DuplicateExperiment { run_id, .. }) => {
            println!("Experiment already recorded as RunId {run_id}; nothing to do.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("Registered RunId {}", socket.run_id());

    // -------------------------------------------------------------------------
    // 2. Train (simulated)
    // -------------------------------------------------------------------------
    let mut loss = 2.3_f64;
    let mut accuracy = 0.1_f64;
    for epoch in 0..10 {
        loss *= 0.7;
        accuracy += (1.0 - accuracy) * 0.3;
        println!("   epoch {epoch}: loss={loss:.4} accuracy={accuracy:.4}");
    }

    // -------------------------------------------------------------------------
    // 3. Commit and report
    // -------------------------------------------------------------------------
    socket.write([("accuracy", accuracy), ("crossEntropy", loss)])?;
    println!("\n{socket}\n");

    table.to_text("results/CompiledResults.txt")?;
    println!("{table}");
    Ok(())
}
