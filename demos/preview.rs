//! Dry runs: expand a pipeline, see what would execute, render the graph.

use anyhow::Result;
use karakuri::{Artifact, Derive, MemoryStore, Outputs, ParamKind, Pipeline, Registry};

fn main() -> Result<()> {
    let mut registry: Registry<()> = Registry::new();

    registry
        .task("universe")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .output("members")
        .run(|ctx| {
            let symbols = ctx.params.strings("symbols")?;
            Ok(Outputs::one("members", Artifact::encode(&symbols)?))
        })?;

    registry
        .task("screen")
        .param("symbols", ParamKind::list(ParamKind::Str))
        .param_default("min_volume", ParamKind::Int, 1_000_000)
        .requires("universe", Derive::inherit())
        .output("members")
        .run(|ctx| {
            let members: Vec<String> = ctx.decode("universe", "members")?;
            Ok(Outputs::one("members", Artifact::encode(&members)?))
        })?;

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline.instance(
        "screen",
        [("symbols", vec!["SPY", "QQQ"].into()), ("min_volume", 500_000.into())],
    )?;

    let plan = pipeline.preview(&instance)?;
    println!("{plan}");
    println!("{}", plan.to_mermaid());

    // After a run the same preview is a no-op.
    pipeline.run(&instance)?;
    let plan = pipeline.preview(&instance)?;
    assert!(plan.is_noop());
    println!("after running, {} nodes are stale", plan.stale().count());

    Ok(())
}
