use std::fs::File;

use nextup::cli;
use nextup::config::{Config, ConfigError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Log to a file so the console stays readable
    let log_path = std::env::temp_dir().join("nextup.log");
    let log_file = File::create(&log_path).ok();

    if let Some(file) = log_file {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(true)
            .with_ansi(false)
            .with_writer(file)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            if let ConfigError::NotFound(path) = &e {
                eprintln!("\nCreate a config file at: {}", path.display());
                eprintln!("\nExample config.toml:");
                eprintln!(
                    r#"
[server]
url = "http://127.0.0.1:43211"

[library]
auto_play_next_episode = true

[player]
command = "mpv"

[debrid]
auto_select_file = false
"#
                );
            }
            std::process::exit(1);
        }
    };

    if let Err(e) = cli::run(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
