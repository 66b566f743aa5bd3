use std::{error::Error, process, sync::Arc};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::mpsc;

use joyful::{
    client::Client,
    config::Config,
    error::ErrorKind,
    events::Event,
    protocol::auth::LoginPayload,
    request::Param,
    storage::FileStorage,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// When the file does not exist, the API root is read from the
    /// `API_BASE_URL` environment variable.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("joyful.toml"))]
    config: String,

    /// Session state file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the credentials of your session.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("state.json"))]
    state: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        /// Account name, e-mail address or phone number
        #[arg(short, long)]
        account: String,

        /// Password
        #[arg(short, long, env = "JOYFUL_PASSWORD", hide_env_values = true)]
        password: String,

        /// Login channel
        #[arg(long, default_value_t = 1)]
        channel: u32,

        /// Login type
        #[arg(long = "type", default_value_t = 1)]
        kind: u32,
    },

    /// Sign out and clear the session
    Logout,

    /// Show the session state
    Status,

    /// GET an endpoint and print its data
    Get {
        /// Endpoint path, such as `/api/v1/user/info`
        path: String,

        /// Query parameter as `key=value`; may be repeated
        #[arg(short = 'q', long = "query", value_name = "KEY=VALUE", value_parser = parse_pair)]
        query: Vec<(String, String)>,
    },

    /// POST to an endpoint and print its data
    Post {
        /// Endpoint path
        path: String,

        /// JSON body
        #[arg(long, value_name = "BODY")]
        json: Option<String>,
    },
}

fn parse_pair(pair: &str) -> Result<(String, String), String> {
    pair.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got \"{pair}\""))
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("joyful", level);
    }

    logger.init();
}

/// Loads the configuration file, falling back to `API_BASE_URL`, and applies
/// the environment overrides.
fn load_config(path: &str) -> joyful::error::Result<Config> {
    let mut config = match Config::from_file(path) {
        Ok(config) => config,
        Err(e) if e.kind == ErrorKind::NotFound => {
            info!("{path} not found, reading the API root from API_BASE_URL");
            let base_url = std::env::var("API_BASE_URL").map_err(|_| {
                joyful::error::Error::not_found(format!(
                    "{path} does not exist and API_BASE_URL is not set"
                ))
            })?;
            Config::new(&base_url)?
        }
        Err(e) => return Err(e),
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn log_event(event: &Event) {
    match event {
        Event::LoggedIn => info!("session started"),
        Event::LoggedOut => info!("session ended"),
        Event::TokenRefreshed => debug!("session token refreshed"),
        Event::SessionTerminated(info) => {
            warn!("signed out by the server ({}): {}", info.code, info.message);
        }
    }
}

/// Runs the command.
///
/// # Errors
///
/// This function returns an error when configuration or state cannot be
/// loaded, or the request fails.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config)?;
    let storage = Arc::new(FileStorage::open(&args.state)?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    });

    let client = Client::builder(config)
        .storage(storage)
        .events(tx)
        .build()?;

    let result = match args.command {
        Command::Login {
            account,
            password,
            channel,
            kind,
        } => {
            let payload = LoginPayload {
                account,
                password,
                channel,
                kind,
            };
            client.login(&payload).await.map_err(Into::into)
        }

        Command::Logout => {
            client.logout().await;
            Ok(())
        }

        Command::Status => {
            let credential = client.credentials().credential();
            println!(
                "signed in: {}",
                if credential.token.is_some() { "yes" } else { "no" }
            );
            println!(
                "signing secret: {}",
                if credential.signing_secret.is_some() {
                    "present"
                } else {
                    "absent"
                }
            );
            if let Some(info) = client.session().logout_info() {
                println!("last forced logout ({}): {}", info.code, info.message);
            }
            Ok(())
        }

        Command::Get { path, query } => {
            let mut request = client.request(reqwest::Method::GET, &path)?;
            for (key, value) in query {
                request = request.param(key, Param::from(value));
            }
            print_data(client.execute(request).await)
        }

        Command::Post { path, json } => {
            let mut request = client.request(reqwest::Method::POST, &path)?;
            if let Some(json) = json {
                let body: serde_json::Value = serde_json::from_str(&json)?;
                request = request.json(&body)?;
            }
            print_data(client.execute(request).await)
        }
    };

    // Close the event channel and drain it before exiting.
    drop(client);
    listener.await?;

    result
}

fn print_data(data: joyful::error::Result<serde_json::Value>) -> Result<(), Box<dyn Error>> {
    let data = data?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the command.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more, leaving out
    // the password.
    if let Command::Login { account, .. } = &args.command {
        debug!("Command login {{ account: {account:?} }}");
    } else {
        debug!("Command {:#?}", args.command);
    }

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
