//! `reflector ask`: run one query through the reflection loop.

use reflector_config::AppConfig;
use reflector_core::event::EventBus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

pub async fn run(
    query: String,
    max_iterations: Option<u32>,
    json: bool,
    events: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(max) = max_iterations {
        config.reflection.max_iterations = max;
        config.validate()?;
    }

    // Check for API key early, give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    GEMINI_API_KEY=...     (default provider)");
        eprintln!("    OPENAI_API_KEY=...     (with REFLECTOR_PROVIDER=openai)");
        eprintln!("    REFLECTOR_API_KEY=...  (generic)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let mut agent = reflector_gateway::build_agent(&config)?;

    let printer = if events {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        agent = agent.with_observer(bus);
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(line) = serde_json::to_string(event.as_ref()) {
                            eprintln!("{line}");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        eprintln!("{{\"event\":\"lagged\",\"skipped\":{skipped}}}");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    let outcome = agent.run(&query).await;

    // Dropping the agent closes the bus so the printer drains and exits
    drop(agent);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.response);
        println!("\n({} iteration(s))", outcome.iterations);
    }

    if let Some(error) = &outcome.error {
        tracing::error!(error = %error, "Run failed");
    }

    Ok(())
}
