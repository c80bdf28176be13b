use clap::builder::PathBufValueParser;

pub const AUTHOR: &str = "Henrik Friedrichsen <henrik@affekt.org> and contributors";
pub const BIN_NAME: &str = "spotify-skip-tracker";

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod core;
pub mod credentials;
pub mod error;
pub mod events;
pub mod http_client;
pub mod log_store;
pub mod monitor;
pub mod panic;
pub mod persist;
pub mod skip_store;
pub mod statistics;
pub mod token_manager;
pub mod token_store;

/// Return the [Command](clap::Command) that models the program's command line arguments. The
/// command can be used to parse the actual arguments passed to the program, or to automatically
/// generate a man page using clap's mangen package.
pub fn program_arguments() -> clap::Command {
    clap::Command::new(BIN_NAME)
        .version(env!("CARGO_PKG_VERSION"))
        .author(AUTHOR)
        .about("personal Spotify listening-analytics daemon")
        .arg(
            clap::Arg::new("debug")
                .short('d')
                .long("debug")
                .value_name("FILE")
                .value_parser(PathBufValueParser::new())
                .help("Enable debug logging to the specified file"),
        )
        .arg(
            clap::Arg::new("basepath")
                .short('b')
                .long("basepath")
                .value_name("PATH")
                .value_parser(PathBufValueParser::new())
                .help("custom basepath to config/cache/data files"),
        )
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Filename of config file in basepath")
                .default_value("config.toml"),
        )
        .arg(
            clap::Arg::new("foreground")
                .short('f')
                .long("foreground")
                .action(clap::ArgAction::SetTrue)
                .help("Run in the foreground instead of daemonizing"),
        )
        .subcommand(clap::Command::new("info").about("Print resolved configuration/cache/data paths and exit"))
        .subcommand(
            clap::Command::new("login")
                .about("Run the OAuth2 authorization-code flow and persist the resulting tokens")
                .arg(
                    clap::Arg::new("redirect-uri")
                        .long("redirect-uri")
                        .value_name("URI")
                        .default_value("http://127.0.0.1:8888/callback")
                        .help("Redirect URI registered with the Spotify application"),
                ),
        )
        .subcommand(clap::Command::new("logout").about("Forget stored tokens and require re-authorization"))
        .subcommand(clap::Command::new("status").about("Print authentication and monitoring status"))
}
