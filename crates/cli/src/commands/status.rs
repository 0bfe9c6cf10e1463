//! `reflector status`: show the effective configuration.

use reflector_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let api_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| reflector_providers::default_base_url(&config.provider));

    println!("Reflector Status");
    println!("================");
    println!("  Config dir:     {}", AppConfig::config_dir().display());
    println!("  Provider:       {} ({api_url})", config.provider);
    println!("  API key:        {}", if config.has_api_key() { "set" } else { "missing" });
    println!("  Main model:     {} (temperature {})", config.primary.model, config.primary.temperature);
    println!("  Critic model:   {} (temperature {})", config.critic.model, config.critic.temperature);
    println!("  Max iterations: {}", config.reflection.max_iterations);
    println!(
        "  Retries:        {} (base delay {}s)",
        config.reflection.max_retries, config.reflection.base_delay_secs
    );
    println!("  Critic policy:  {:?}", config.reflection.critic_policy);
    println!("  Gateway:        {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "  Tracing:        {}",
        if config.tracing.enabled { "enabled" } else { "disabled" }
    );

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  Config file found");
    } else {
        println!("\n  No config file, using defaults (run `reflector init` to create one)");
    }

    Ok(())
}
