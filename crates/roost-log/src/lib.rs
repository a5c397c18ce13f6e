// ABOUTME: Shared logging setup for all roost binaries
// ABOUTME: init_file() for terminal front-ends that own the screen, init_for() for one-shot commands

use tracing_subscriber::EnvFilter;

/// File-based logging for terminal front-ends that own the screen.
/// Default: WARN level, RUST_LOG override.
/// Logs to ~/.config/roost/{app_name}/{app_name}.log
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = log_dir(app_name).ok_or("could not determine config directory")?;
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_ansi(false)
        .init();

    Ok(())
}

/// Directory that holds the log file for `app_name`.
pub fn log_dir(app_name: &str) -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("roost").join(app_name))
}

/// Crate-filtered logging to stderr. Default: INFO for the named crate, WARN for everything else.
pub fn init_for(crate_name: &str) {
    let directive = format!("{crate_name}=info");
    let filter = EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        );

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
