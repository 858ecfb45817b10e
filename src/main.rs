use tracing_subscriber::EnvFilter;

/// Defaults used when no `.env` is present.
const BUNDLED_CONFIG: &str = include_str!("../assets/config.env");

fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    load_bundled_config();
}

fn load_bundled_config() {
    for line in BUNDLED_CONFIG.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            // Explicit environment wins
            if std::env::var(key).is_err() {
                // SAFETY: called before the runtime starts any threads
                unsafe {
                    std::env::set_var(key, value.trim());
                }
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docchat=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    load_dotenv();
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(docchat::ui::run())
}
