//! `reflector init`: write a default config file.

use reflector_config::AppConfig;

pub async fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    }

    if config_path.exists() && !force {
        println!("Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force to overwrite.");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Wrote config.toml at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Set api_key in {} (or export GEMINI_API_KEY)", config_path.display());
    println!("   2. Run: reflector ask \"What is 2+2?\"");
    println!("   3. Or start the server: reflector serve");

    Ok(())
}
