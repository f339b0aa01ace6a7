use std::path::Path;
use std::sync::Arc;

use mail_orders::config::{AppConfig, ERROR_LOG_FILE};
use mail_orders::shell::TerminalShell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    setup_logging(&config.output.log_dir);

    eprintln!("📬 Mail Orders v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   IMAP: {}:{} ({})",
        if config.mail.host.is_empty() {
            "(not set)"
        } else {
            config.mail.host.as_str()
        },
        config.mail.port,
        config.mail.folder
    );
    eprintln!(
        "   Model: {}",
        if config.llm.model.is_empty() {
            "(not set)"
        } else {
            config.llm.model.as_str()
        }
    );
    eprintln!("   Output: {}", config.output.dir.display());
    eprintln!("   Workers: {}\n", config.max_parallel);

    let shell = TerminalShell::new(Arc::new(config));
    shell.run().await
}

/// Stderr logging filtered by `RUST_LOG`, plus an error-only log file.
fn setup_logging(log_dir: &Path) {
    use tracing_subscriber::Layer;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter);

    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(log_dir, ERROR_LOG_FILE);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender)
            .with_filter(LevelFilter::ERROR);

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
    }
}
