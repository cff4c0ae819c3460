use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use costwatch::config::{Config, Settings};
use costwatch_core::MonitorError;

/// Exit code for unusable configuration
const EXIT_INVALID_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Setup logging
    setup_logging(cli.debug);

    // Load settings
    let mut settings = match Settings::load(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };
    settings.merge_cli(&cli);
    if let Err(err) = settings.validate() {
        error!("Invalid configuration: {:#}", err);
        return ExitCode::from(EXIT_INVALID_CONFIG);
    }

    match costwatch::app::execute(cli.command(), &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            let code = err
                .downcast_ref::<MonitorError>()
                .map_or(1, MonitorError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn setup_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("costwatch=debug,costwatch_core=debug")
        } else {
            EnvFilter::new("costwatch=info,costwatch_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
