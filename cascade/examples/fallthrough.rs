//! Fallthrough across OpenAI and DeepSeek, lenient structured output, and an
//! SSE relay of a streamed turn.
//!
//! Set `OPENAI_API_KEY` and/or `DEEPSEEK_API_KEY`. A backend whose key is
//! missing fails at construction and the next one is tried; the attempt
//! ledger printed at the end shows what happened.

use anyhow::Context;
use cascade::prelude::*;
use cascade::schemars::JsonSchema;
use futures::StreamExt;
use serde::Deserialize;

/// Research brief extracted from a free-form request
#[derive(Debug, Deserialize, JsonSchema)]
struct Brief {
    /// What the research is about
    topic: String,
    /// Why it is being done
    purpose: String,
    /// Questions the research should answer
    questions: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env()?;
    let runtime = Runtime::builder()
        .config(config.clone())
        .backend(
            LayeredDescriptor::new(OpenAiDescriptor::new("gpt-4o-mini"))
                .layer(RetryLayer::new().with_max_retries(2))
                .layer(LoggingLayer::new()),
        )
        .backend(LayeredDescriptor::new(deepseek("deepseek-chat")).layer(LoggingLayer::new()))
        .build()?;

    // A brief without a purpose is still usable
    runtime.policies().set_policy::<Brief>(
        SchemaPolicy::new()
            .require("topic")
            .default_value("purpose", serde_json::json!("unspecified")),
    );

    println!("=== Structured output ===\n");
    let params = TextParams::new(vec![Message::user(
        "Turn this into a research brief: how do small teams adopt Rust for backend services?",
    )])
    .with_temperature(0.2);

    match runtime.generate_object::<Brief>(params).await {
        Ok(brief) => {
            println!("{:#?}", brief.value);
            if !brief.repaired.is_empty() {
                println!("repaired fields: {:?}", brief.repaired);
            }
        }
        Err(e) => println!("no backend produced a brief: {e}"),
    }
    print_ledger(&runtime);

    println!("\n=== Streamed turn over SSE ===\n");
    let mut harness = StreamHarness::for_model("demo");
    let rx = harness
        .take_receiver()
        .context("fresh harness always has a receiver")?;
    let relay = Relay::from_config(&config);
    let printer = tokio::spawn(async move {
        let frames = relay.into_stream(rx);
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            print!("{}", frame.to_sse());
        }
    });

    let params = TextParams::new(vec![Message::user("Explain ownership in Rust in two sentences.")]);
    if let Err(e) = runtime.stream_text(params, &mut harness).await {
        println!("stream failed: {e}");
    }
    printer.await?;

    if let Some(summary) = harness.summary() {
        println!("\nfinal text: {}", summary.text);
    }
    print_ledger(&runtime);

    Ok(())
}

fn print_ledger(runtime: &Runtime) {
    let session = runtime.engine().session();
    for attempt in session.attempts() {
        println!(
            "  {} {:?} ok={} in {:?}{}",
            attempt.backend_id,
            attempt.stage,
            attempt.success,
            attempt.duration,
            attempt
                .error
                .as_ref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }
}
