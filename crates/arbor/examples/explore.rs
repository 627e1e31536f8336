//! Offline exploration demo against a scripted backend.
//!
//! Builds an engine over canned logits, runs SMC generation followed by an
//! exploration pass, and prints the resulting tree as JSON.
//!
//! Run with: cargo run --example explore

use arbor::model::ScriptedBackend;
use arbor::prelude::*;
use std::sync::Arc;

const VOCAB: usize = 27;

/// Logits strongly favoring the given (token, weight) pairs.
fn peaked(entries: &[(usize, f32)]) -> Vec<f32> {
    let mut logits = vec![-30.0; VOCAB];
    for &(i, v) in entries {
        logits[i] = v;
    }
    logits
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // A model that mostly wants to spell "cab...": token 2 ('c') leads,
    // token 0 ('a') and token 1 ('b') trail behind.
    let backend = Arc::new(
        ScriptedBackend::new(VOCAB).with_default(peaked(&[(2, 6.0), (0, 5.0), (1, 4.0)])),
    );
    let tokenizer = Arc::new(AsciiTokenizer::new(VOCAB));
    let loader = Arc::new(StaticLoader::new(backend, tokenizer));

    let (events, mut rx) = EventSink::channel();
    let engine = Engine::builder()
        .family(ModelFamily::Llama)
        .loader(loader)
        .events(events)
        .explore_depth(2)
        .smc(SmcOptions {
            particle_count: 6,
            max_tokens: 4,
            ..SmcOptions::default()
        })
        .build()?;

    let result = engine.generate("demo", "tell me a story", None).await?;
    println!("SMC result:\n{}", serde_json::to_string_pretty(&result)?);

    engine.explore("demo", None).await?;
    let explored = engine
        .tree("demo")
        .expect("tree exists after generation")
        .snapshot(NodeId::ROOT)?;
    println!(
        "After exploration: {} nodes",
        engine.tree("demo").unwrap().node_count()
    );
    println!("{}", serde_json::to_string_pretty(&explored)?);

    // Show what the serving layer would have seen.
    let mut updates = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::Update { .. }) {
            updates += 1;
        }
    }
    println!("progress updates emitted: {updates}");

    Ok(())
}
