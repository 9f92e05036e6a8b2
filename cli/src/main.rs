use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use stalk::config::{ConfigError, parse_data_source};
use stalk::net::types::{DuplicateField, ProfileUpdate};
use stalk::services::signup::CheckState;
use stalk::validation::DEFAULT_EMAIL_DOMAIN;
use stalk::{
    ApiError, AuthApi, AuthContext, AuthService, ClientConfig, DataSourceKind, FakeAuthApi, FileTokenStorage,
    HttpAuthApi, RefreshOutcome, SessionStore, SignupError, SignupFlow, TokenStorage, UserService,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{}", .0.user_message())]
    Api(#[from] ApiError),
    #[error("{0}")]
    Signup(#[from] SignupError),
    #[error("not logged in; run `stalk-cli login` first")]
    NotLoggedIn,
    #[error("{0} is not available")]
    Unavailable(&'static str),
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "stalk-cli", about = "Stalk account and session CLI")]
struct Cli {
    #[arg(long, env = "STALK_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "STALK_TOKEN_FILE", help = "Where the refresh token is persisted")]
    token_file: Option<PathBuf>,

    #[arg(long, env = "STALK_DATA_SOURCE", help = "http or fake")]
    data_source: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and persist the refresh token.
    Login {
        user_id: String,
        #[arg(long, env = "STALK_PASSWORD")]
        password: String,
    },
    /// Notify the server and clear stored credentials.
    Logout,
    /// Restore the session if possible and print the login state.
    Status,
    /// Exchange the stored refresh token for a new access token.
    Refresh,
    Profile(ProfileCommand),
    /// Check whether a user id is free.
    CheckId { user_id: String },
    /// Check whether a nickname is free.
    CheckNickname { nickname: String },
    /// Register a new account.
    Signup(SignupArgs),
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Show,
    Update {
        #[arg(long)]
        name: String,
        #[arg(long)]
        contact: String,
    },
}

#[derive(Args, Debug)]
struct SignupArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    nickname: String,
    #[arg(long, env = "STALK_PASSWORD")]
    password: String,
    #[arg(long, help = "Defaults to --password")]
    password_confirm: Option<String>,
    #[arg(long)]
    contact: String,
    #[arg(long, help = "Local part of the e-mail address")]
    email: String,
    #[arg(long, default_value = DEFAULT_EMAIL_DOMAIN)]
    domain: String,
    #[arg(long, help = "Verification code; prompted for when omitted")]
    code: Option<String>,
    #[arg(long, default_value_t = false)]
    agree_terms: bool,
    #[arg(long, default_value_t = false)]
    agree_privacy: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stalk=info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling in-flight requests");
            on_signal.cancel();
        }
    });

    let api = build_api(&config)?;
    let ctx = build_context(api.clone(), &config, cancel.clone());
    match cli.command {
        Command::Login { user_id, password } => {
            let user = ctx.sign_in(&user_id, &password).await?;
            print_json(&user)
        }
        Command::Logout => {
            ctx.init().await;
            ctx.logout().await;
            println!("logged out");
            Ok(())
        }
        Command::Status => {
            let logged_in = ctx.init().await;
            print_json(&json!({ "loggedIn": logged_in, "user": ctx.snapshot().user_info }))
        }
        Command::Refresh => run_refresh(ctx.service()).await,
        Command::Profile(profile) => {
            if !ctx.init().await {
                return Err(CliError::NotLoggedIn);
            }
            run_profile(ctx.users(), profile).await
        }
        Command::CheckId { user_id } => run_check(api, &config, DuplicateField::UserId, user_id, cancel).await,
        Command::CheckNickname { nickname } => run_check(api, &config, DuplicateField::Nickname, nickname, cancel).await,
        Command::Signup(args) => run_signup(api, &config, args, cancel).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_owned();
    }
    if let Some(token_file) = &cli.token_file {
        config.token_file.clone_from(token_file);
    }
    if cli.data_source.is_some() {
        config.data_source = parse_data_source(cli.data_source.as_deref())?;
    }
    Ok(config)
}

fn build_api(config: &ClientConfig) -> Result<Arc<dyn AuthApi>, CliError> {
    match config.data_source {
        DataSourceKind::Http => {
            tracing::debug!(base_url = %config.base_url, "using HTTP backend");
            Ok(Arc::new(HttpAuthApi::new(&config.base_url, config.timeouts)?))
        }
        DataSourceKind::Fake => {
            tracing::info!("using in-memory backend; state lasts for this process only");
            Ok(Arc::new(FakeAuthApi::seeded()))
        }
    }
}

fn build_context(api: Arc<dyn AuthApi>, config: &ClientConfig, cancel: CancellationToken) -> AuthContext {
    let storage: Arc<dyn TokenStorage> = Arc::new(FileTokenStorage::new(&config.token_file));
    let session = Arc::new(SessionStore::new(storage));
    let service = AuthService::new(api, session).with_cancellation(cancel);
    AuthContext::new(Arc::new(service))
}

async fn run_refresh(service: &AuthService) -> Result<(), CliError> {
    match service.refresh_token().await {
        RefreshOutcome::Refreshed(_) => {
            println!("access token refreshed");
            Ok(())
        }
        RefreshOutcome::NoRefreshToken | RefreshOutcome::Rejected | RefreshOutcome::Superseded => {
            Err(CliError::NotLoggedIn)
        }
        RefreshOutcome::Unreachable => Err(CliError::Unavailable("the server")),
        RefreshOutcome::Failed(e) => Err(e.into()),
    }
}

async fn run_profile(users: &UserService, profile: ProfileCommand) -> Result<(), CliError> {
    match profile.command {
        ProfileSubcommand::Show => print_json(&users.me().await?),
        ProfileSubcommand::Update { name, contact } => {
            users.update_me(&ProfileUpdate { name, contact }).await?;
            print_json(&users.me().await?)
        }
    }
}

async fn run_check(
    api: Arc<dyn AuthApi>,
    config: &ClientConfig,
    field: DuplicateField,
    value: String,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let mut flow = SignupFlow::new(api, config.retry).with_cancellation(cancel);
    let state = match field {
        DuplicateField::UserId => {
            flow.set_user_id(value);
            flow.check_user_id().await?
        }
        DuplicateField::Nickname => {
            flow.set_nickname(value);
            flow.check_nickname().await?
        }
    };
    print_json(&json!({ "available": state == CheckState::Available }))
}

async fn run_signup(
    api: Arc<dyn AuthApi>,
    config: &ClientConfig,
    args: SignupArgs,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let mut flow = SignupFlow::new(api, config.retry).with_cancellation(cancel);
    let confirm = args.password_confirm.unwrap_or_else(|| args.password.clone());
    flow.set_name(args.name);
    flow.set_user_id(args.user_id);
    flow.set_nickname(args.nickname);
    flow.set_password(args.password, confirm);
    flow.set_contact(args.contact);
    flow.set_email(args.email, args.domain);
    flow.set_agreements(args.agree_terms, args.agree_privacy);

    if flow.check_user_id().await? == CheckState::Taken {
        return Err(CliError::Unavailable("that user id"));
    }
    if flow.check_nickname().await? == CheckState::Taken {
        return Err(CliError::Unavailable("that nickname"));
    }

    flow.send_verification_code().await?;
    let code = match args.code {
        Some(code) => code,
        None => prompt("verification code: ")?,
    };
    flow.set_code(code);
    flow.verify_email_code().await?;

    let reply = flow.submit().await?;
    println!("{}", reply.message.unwrap_or_else(|| "signup completed".to_owned()));
    Ok(())
}

fn prompt(label: &str) -> Result<String, CliError> {
    let mut stderr = io::stderr();
    write!(stderr, "{label}")?;
    stderr.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_owned())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
