use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::ArgMatches;

use spotify_skip_tracker::clock::SystemClock;
use spotify_skip_tracker::config::{self, Config, Settings};
use spotify_skip_tracker::core::{Core, DataPaths};
use spotify_skip_tracker::events::{Command, Reply};
use spotify_skip_tracker::log_store::LogStore;
use spotify_skip_tracker::{BIN_NAME, cli, panic as panic_hook, program_arguments};

const CLIENT_ID_ENV: &str = "SPOTIFY_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "SPOTIFY_CLIENT_SECRET";

#[tokio::main]
async fn main() -> ExitCode {
    panic_hook::register_backtrace_panic_handler();

    let matches = program_arguments().get_matches();
    config::set_base_path(matches.get_one::<PathBuf>("basepath").cloned());

    match matches.subcommand() {
        Some(("info", _)) => {
            cli::info();
            return ExitCode::SUCCESS;
        }
        Some(("login", sub)) => {
            let redirect_uri = sub
                .get_one::<String>("redirect-uri")
                .expect("has a default value")
                .clone();
            return run_login(&matches, redirect_uri).await;
        }
        Some(("logout", _)) => return run_logout(&matches).await,
        Some(("status", _)) => return run_status(&matches).await,
        _ => {}
    }

    if !matches.get_flag("foreground") {
        eprintln!(
            "{BIN_NAME} must be run with --foreground: there is no background-daemonizing \
             mode built in, run it unattended under a service supervisor such as systemd \
             instead."
        );
        return ExitCode::FAILURE;
    }

    run_foreground(&matches).await
}

fn data_paths() -> DataPaths {
    DataPaths {
        data_dir: config::data_dir(),
        settings_path: config::data_path("settings.json"),
    }
}

fn init_logs(matches: &ArgMatches) -> Result<Arc<LogStore>, String> {
    let settings = Settings::load(&config::data_path("settings.json"));
    let debug_file = matches.get_one::<PathBuf>("debug").cloned();
    LogStore::init(config::logs_dir(), settings.log_level, debug_file.as_deref(), Arc::new(SystemClock))
        .map_err(|e| e.to_string())
}

/// Wire up a [`Core`] the way every subcommand needs it: logging installed first (several
/// components log during construction), then the static [`Config`] (HTTP retry policy) read
/// from the `--config` file.
async fn build_core(matches: &ArgMatches) -> Result<Arc<Core>, String> {
    let logs = init_logs(matches)?;
    let config_filename = matches.get_one::<String>("config").expect("has a default value");
    let config = Config::load(config_filename);
    Core::new(data_paths(), Arc::new(SystemClock), logs, config).map_err(|e| e.to_string())
}

/// Pull the authorization `code` query parameter out of either a full redirect URL or a bare
/// code pasted directly, so a user can paste whichever one the browser's address bar shows.
fn extract_code(input: &str) -> String {
    if let Ok(url) = url::Url::parse(input) {
        if let Some((_, code)) = url.query_pairs().find(|(key, _)| key == "code") {
            return code.into_owned();
        }
    }
    input.to_string()
}

async fn run_login(matches: &ArgMatches, redirect_uri: String) -> ExitCode {
    let core = match build_core(matches).await {
        Ok(core) => core,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client_id = std::env::var(CLIENT_ID_ENV).ok();
    let client_secret = match std::env::var(CLIENT_SECRET_ENV) {
        Ok(secret) => secret,
        Err(_) => {
            eprintln!("{CLIENT_SECRET_ENV} must be set to run the authorization flow");
            return ExitCode::FAILURE;
        }
    };

    let url = match core
        .dispatch(Command::Authenticate {
            client_id,
            client_secret: Some(client_secret),
            redirect_uri: redirect_uri.clone(),
            force: true,
        })
        .await
    {
        Ok(Reply::AuthorizationUrl(url)) => url,
        Ok(other) => {
            eprintln!("unexpected reply from Authenticate: {other:?}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("could not start authentication: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Open this URL in a browser and authorize access:\n\n  {url}\n");
    println!("Paste the redirect URL (or just the \"code\" query parameter) below:");

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        eprintln!("could not read authorization code from stdin");
        return ExitCode::FAILURE;
    }
    let code = extract_code(input.trim());

    match core.dispatch(Command::CompleteAuthentication { code, redirect_uri }).await {
        Ok(_) => {
            println!("authenticated");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("authentication failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_logout(matches: &ArgMatches) -> ExitCode {
    let core = match build_core(matches).await {
        Ok(core) => core,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match core.dispatch(Command::Logout).await {
        Ok(_) => {
            println!("logged out");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("logout failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_status(matches: &ArgMatches) -> ExitCode {
    let core = match build_core(matches).await {
        Ok(core) => core,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let authenticated = matches!(core.dispatch(Command::IsAuthenticated).await, Ok(Reply::Bool(true)));
    let monitoring = matches!(core.dispatch(Command::IsMonitoring).await, Ok(Reply::Bool(true)));
    println!("authenticated: {authenticated}");
    println!("monitoring: {monitoring}");
    ExitCode::SUCCESS
}

/// Install credentials from the environment, the only place credentials are ever populated
/// from at process startup (they are never persisted). Missing credentials are a warning, not
/// a hard failure: a token already on disk may stay valid for a while yet.
fn load_credentials_from_env(core: &Core) {
    let client_secret = match std::env::var(CLIENT_SECRET_ENV) {
        Ok(secret) => secret,
        Err(_) => {
            log::warn!(
                "{CLIENT_SECRET_ENV} not set; token refresh will fail once the current access token expires"
            );
            return;
        }
    };
    let client_id = std::env::var(CLIENT_ID_ENV).unwrap_or_else(|_| config::CLIENT_ID.to_string());
    if let Err(e) = core.credentials.set(client_id, client_secret) {
        log::error!("invalid credentials in environment: {e}");
    }
}

async fn run_foreground(matches: &ArgMatches) -> ExitCode {
    let core = match build_core(matches).await {
        Ok(core) => core,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    load_credentials_from_env(&core);

    match core.dispatch(Command::IsAuthenticated).await {
        Ok(Reply::Bool(true)) => log::info!("starting with valid stored tokens"),
        _ => log::warn!("not authenticated yet; run `{BIN_NAME} login` first"),
    }

    if let Err(e) = core.dispatch(Command::StartMonitoring).await {
        log::error!("could not start monitor: {e}");
        return ExitCode::FAILURE;
    }
    log::info!("{BIN_NAME} running in foreground, waiting for SIGINT/SIGTERM");

    wait_for_shutdown_signal().await;

    log::info!("shutting down");
    core.shutdown().await;
    ExitCode::SUCCESS
}

/// Install a SIGTERM/SIGINT handler that triggers the same orderly shutdown path as an
/// explicit `StopMonitoring` command. Polled on an interval rather than delivered through an
/// async-signal channel, the same idiom this codebase already used for its synchronous UI step
/// loop, just driven by a timer instead of a screen redraw tick.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGTERM, SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            log::error!("could not register signal handler: {e}, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        for signal in signals.pending() {
            if signal == SIGTERM || signal == SIGINT {
                log::info!("caught signal {signal}");
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("caught ctrl-c");
}
