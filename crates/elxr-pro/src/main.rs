use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use elxr_pro::cli::{Cli, Commands, ConfigAction};
use elxr_pro::commands::{self, build_client};
use elxr_pro::guards::{check_json_assume_yes, confirm, is_root, require_root};
use elxr_pro::output::Events;
use elxr_pro_core::config::{client_environment, load_config};
use elxr_pro_core::tracing_init::{LogSettings, init_logging, user_log_file};
use elxr_pro_core::{Config, Error, SecretRegistry};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = writeln!(io::stderr(), "failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(cli));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(cli: Cli) -> i32 {
    let secrets = Arc::new(SecretRegistry::new());
    // Before logging starts, so argv never reaches the log in clear.
    if let Some(token) = cli.command.token() {
        secrets.register(token);
    }
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = writeln!(io::stderr(), "{e}");
            return e.exit_code();
        }
    };

    let log_path = log_path(&config);
    let settings = LogSettings {
        filter: config.log_filter().to_string(),
        log_file: log_path.clone(),
        stderr: cli.debug,
    };
    if let Err(e) = init_logging(&settings, &secrets) {
        let _ = writeln!(io::stderr(), "Unable to write to the log file: {e}");
    }
    for key in &config.invalid_keys {
        tracing::warn!("Ignoring invalid key in config file: {key}");
    }
    tracing::debug!(argv = ?std::env::args().collect::<Vec<_>>(), "executed with arguments");
    for (key, value) in client_environment() {
        tracing::debug!("{key}={value}");
    }

    let mut events = Events::stdio(cli.command.format()).with_secrets(Arc::clone(&secrets));
    let result = tokio::select! {
        result = dispatch(cli.command, &config, &secrets, &mut events) => result,
        // `dispatch` only yields before repositories are touched, so
        // dropping it here never leaves a half-configured join behind.
        _ = tokio::signal::ctrl_c() => {
            tracing::error!("KeyboardInterrupt");
            let _ = writeln!(io::stderr(), "Interrupt received; exiting.");
            return 1;
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => report_error(&e, &mut events, log_path.as_deref()),
    };
    if let Err(e) = events.finish(code == 0) {
        tracing::error!("failed to write output: {e}");
    }
    code
}

fn log_path(config: &Config) -> Option<PathBuf> {
    if is_root() {
        Some(config.log_file.clone())
    } else {
        user_log_file()
    }
}

fn report_error<O: Write, E: Write>(
    err: &anyhow::Error,
    events: &mut Events<O, E>,
    log_path: Option<&std::path::Path>,
) -> i32 {
    if let Some(core) = err.downcast_ref::<Error>() {
        tracing::error!(code = core.code(), "{core}");
        let _ = events.error(core);
        return core.exit_code();
    }
    tracing::error!("unexpected error: {err:?}");
    let log = log_path.map_or_else(|| "<none>".to_string(), |p| p.display().to_string());
    let _ = events.error_message(
        &format!("An unexpected error occurred: {err}\nFor more details, see the log: {log}"),
        "unexpected-error",
    );
    1
}

async fn dispatch<O: Write, E: Write>(
    command: Commands,
    config: &Config,
    secrets: &Arc<SecretRegistry>,
    events: &mut Events<O, E>,
) -> anyhow::Result<i32> {
    match command {
        Commands::Join(args) => {
            require_root()?;
            let mut client = build_client(config, secrets)?;
            commands::join::run(args, &mut client, events).await
        }
        Commands::Leave(args) => {
            check_json_assume_yes(args.format, args.assume_yes)?;
            require_root()?;
            let mut client = build_client(config, secrets)?;
            commands::leave::run(args, &mut client, events, confirm).await
        }
        Commands::Test(args) => {
            check_json_assume_yes(args.format, args.assume_yes)?;
            let mut client = build_client(config, secrets)?;
            commands::test::run(args, &mut client, events).await
        }
        Commands::Config { action } => {
            if !matches!(action, ConfigAction::Show { .. }) {
                require_root()?;
            }
            commands::config::run(action, config, is_root(), &mut io::stdout(), &mut io::stderr())
        }
    }
}
