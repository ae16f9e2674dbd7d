use vigil_client::logging::{setup_logger, LogFormat, LoggingConfig};
use vigil_service::{env, load_config, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let format = env::LOG_FORMAT.default(LogFormat::Plain);
    setup_logger(LoggingConfig::default().use_format(format));

    let config = load_config()?;
    run(config).await
}
