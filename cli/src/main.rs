use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dietly::error::ErrorCode;
use dietly::routes::{self, Route};
use dietly::types::{CalorieEntry, ProfileUpdate, RegisterRequest};
use dietly::validation::{self, FormValues};
use dietly::{ApiClient, ApiError, ClientConfig, FileStorage, SessionEvent, SessionStore};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[cfg(test)]
#[path = "main_test.rs"]
mod main_test;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("not signed in; run `dietly login` ({redirect})")]
    NotSignedIn { redirect: Route },
    #[error("could not read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read from stdin: {0}")]
    Stdin(std::io::Error),
    #[error("{0}")]
    Usage(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl ErrorCode for CliError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Api(e) => e.error_code(),
            Self::NotSignedIn { .. } => "E_NOT_SIGNED_IN",
            Self::ReadFile { .. } => "E_READ_FILE",
            Self::Stdin(_) => "E_STDIN",
            Self::Usage(_) => "E_USAGE",
            Self::InvalidJson(_) => "E_INVALID_JSON",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Api(e) if e.retryable())
    }
}

#[derive(Parser, Debug)]
#[command(name = "dietly", about = "Dietly meal tracking from the terminal")]
struct Cli {
    #[arg(long, env = "DIETLY_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "DIETLY_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with username and password.
    Login(LoginArgs),
    /// Create an account; a verification email follows.
    Register(RegisterArgs),
    /// Forget the stored session.
    Logout,
    /// Show the signed-in profile.
    Whoami,
    /// Show the local session state without calling the backend.
    Status,
    VerifyEmail {
        #[arg(long)]
        token: String,
    },
    Password(PasswordCommand),
    Google(GoogleCommand),
    Profile(ProfileCommand),
    Image(ImageCommand),
    Meal(MealCommand),
    Calories(CaloriesCommand),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    username: String,
    /// Read from stdin when omitted.
    #[arg(long, env = "DIETLY_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    full_name: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    confirm_password: String,
}

#[derive(Args, Debug)]
struct PasswordCommand {
    #[command(subcommand)]
    command: PasswordSubcommand,
}

#[derive(Subcommand, Debug)]
enum PasswordSubcommand {
    ResetRequest {
        #[arg(long)]
        email: String,
    },
    ResetConfirm {
        #[arg(long)]
        token: String,
        #[arg(long)]
        new_password: String,
        #[arg(long)]
        confirm_password: String,
    },
    Change {
        #[arg(long)]
        current_password: String,
        #[arg(long)]
        new_password: String,
        #[arg(long)]
        confirm_password: String,
    },
}

#[derive(Args, Debug)]
struct GoogleCommand {
    #[command(subcommand)]
    command: GoogleSubcommand,
}

#[derive(Subcommand, Debug)]
enum GoogleSubcommand {
    /// Print the URL that starts Google sign-in.
    LoginUrl,
    /// Finish Google sign-in with the parameters the provider redirected with.
    Callback {
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Get {
        user_id: i64,
    },
    Update(ProfileUpdateArgs),
    Avatar {
        file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct ProfileUpdateArgs {
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    age: Option<String>,
    #[arg(long)]
    gender: Option<String>,
    /// Centimetres.
    #[arg(long)]
    height: Option<String>,
    /// Kilograms.
    #[arg(long)]
    weight: Option<String>,
    #[arg(long)]
    activity_level: Option<String>,
}

#[derive(Args, Debug)]
struct ImageCommand {
    #[command(subcommand)]
    command: ImageSubcommand,
}

#[derive(Subcommand, Debug)]
enum ImageSubcommand {
    Upload { file: PathBuf },
    Get { image_id: i64 },
    Delete { image_id: i64 },
}

#[derive(Args, Debug)]
struct MealCommand {
    #[command(subcommand)]
    command: MealSubcommand,
}

#[derive(Subcommand, Debug)]
enum MealSubcommand {
    /// Upload a photo (or reuse an uploaded image) and get a nutrition estimate.
    Analyze {
        #[arg(long, conflicts_with = "image_id", required_unless_present = "image_id")]
        file: Option<PathBuf>,
        #[arg(long)]
        image_id: Option<i64>,
    },
    List,
    Get { meal_id: i64 },
    Delete { meal_id: i64 },
}

#[derive(Args, Debug)]
struct CaloriesCommand {
    #[command(subcommand)]
    command: CaloriesSubcommand,
}

#[derive(Subcommand, Debug)]
enum CaloriesSubcommand {
    List {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    Log {
        #[arg(long)]
        date: String,
        #[arg(long)]
        consumed: Option<f64>,
        #[arg(long)]
        burned: Option<f64>,
    },
    Summary {
        #[arg(long)]
        date: String,
    },
}

struct CliContext {
    store: Arc<SessionStore>,
    api: ApiClient,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let hint = if e.retryable() { " (try again)" } else { "" };
            eprintln!("error[{}]: {e}{hint}", e.error_code());
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let config = build_config(cli.api_url.as_deref(), cli.storage_path)?;
    tracing::debug!(api_url = %config.api_url, storage = %config.storage_path.display(), "dietly config");

    let store = Arc::new(SessionStore::new(Arc::new(FileStorage::new(&config.storage_path))));
    let api = ApiClient::new(&config)?.with_session(store.clone());
    let ctx = CliContext { store, api };
    let mut events = ctx.store.subscribe();

    let result = run(&ctx, cli.command).await;
    report_session_events(&mut events);
    result
}

fn build_config(api_url: Option<&str>, storage_path: Option<PathBuf>) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = api_url {
        config.api_url = ClientConfig::new(url)?.api_url;
    }
    if let Some(path) = storage_path {
        config.storage_path = path;
    }
    Ok(config)
}

async fn run(ctx: &CliContext, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login(args) => run_login(ctx, args).await,
        Command::Register(args) => run_register(ctx, args).await,
        Command::Logout => {
            ctx.store.logout();
            println!("signed out");
            Ok(())
        }
        Command::Whoami => {
            let token = require_session(ctx, Route::Profile)?;
            let user = ctx.store.fetch_current_user(&ctx.api, &token).await?;
            print_json(&serde_json::to_value(&user)?)
        }
        Command::Status => {
            let state = ctx.store.snapshot();
            println!("{:?}", state.phase());
            Ok(())
        }
        Command::VerifyEmail { token } => {
            let resp = ctx.api.verify_email(&token).await?;
            println!("{}", resp.message.as_deref().unwrap_or("email verified"));
            Ok(())
        }
        Command::Password(password) => run_password(ctx, password).await,
        Command::Google(google) => run_google(ctx, google).await,
        Command::Profile(profile) => run_profile(ctx, profile).await,
        Command::Image(image) => run_image(ctx, image).await,
        Command::Meal(meal) => run_meal(ctx, meal).await,
        Command::Calories(calories) => run_calories(ctx, calories).await,
    }
}

async fn run_login(ctx: &CliContext, args: LoginArgs) -> Result<(), CliError> {
    let password = match args.password {
        Some(password) => password,
        None => read_stdin_line().await?,
    };
    let form = FormValues::new().with("username", &args.username).with("password", &password);
    validation::validate(&validation::LOGIN, &form).map_err(ApiError::Validation)?;

    ctx.store.clear_error();
    ctx.store.login(&ctx.api, args.username.trim(), &password).await?;
    let token = require_session(ctx, Route::Dashboard)?;
    let user = ctx.store.fetch_current_user(&ctx.api, &token).await?;
    println!("signed in as {}", user.display_name());
    Ok(())
}

async fn run_register(ctx: &CliContext, args: RegisterArgs) -> Result<(), CliError> {
    let form = FormValues::new()
        .with("email", &args.email)
        .with("username", &args.username)
        .with("full_name", &args.full_name)
        .with("password", &args.password)
        .with("confirm_password", &args.confirm_password);
    validation::validate(&validation::REGISTER, &form).map_err(ApiError::Validation)?;

    let request = RegisterRequest {
        email: args.email.trim().to_owned(),
        username: args.username.trim().to_owned(),
        full_name: args.full_name.trim().to_owned(),
        password: args.password,
    };
    ctx.store.clear_error();
    ctx.store.register(&ctx.api, &request).await?;
    if let Some(message) = ctx.store.snapshot().register_success {
        println!("{message}");
    }
    Ok(())
}

async fn run_password(ctx: &CliContext, password: PasswordCommand) -> Result<(), CliError> {
    let resp = match password.command {
        PasswordSubcommand::ResetRequest { email } => {
            let form = FormValues::new().with("email", &email);
            validation::validate(&validation::PASSWORD_RESET_REQUEST, &form).map_err(ApiError::Validation)?;
            ctx.api.request_password_reset(email.trim()).await?
        }
        PasswordSubcommand::ResetConfirm { token, new_password, confirm_password } => {
            let form = FormValues::new()
                .with("token", &token)
                .with("new_password", &new_password)
                .with("confirm_password", &confirm_password);
            validation::validate(&validation::PASSWORD_RESET_CONFIRM, &form).map_err(ApiError::Validation)?;
            ctx.api.confirm_password_reset(token.trim(), &new_password).await?
        }
        PasswordSubcommand::Change { current_password, new_password, confirm_password } => {
            require_session(ctx, Route::Profile)?;
            let form = FormValues::new()
                .with("current_password", &current_password)
                .with("new_password", &new_password)
                .with("confirm_password", &confirm_password);
            validation::validate(&validation::CHANGE_PASSWORD, &form).map_err(ApiError::Validation)?;
            ctx.api.change_password(&current_password, &new_password).await?
        }
    };
    println!("{}", resp.message.as_deref().unwrap_or("done"));
    Ok(())
}

async fn run_google(ctx: &CliContext, google: GoogleCommand) -> Result<(), CliError> {
    match google.command {
        GoogleSubcommand::LoginUrl => {
            println!("{}", ctx.api.google_login_url());
            Ok(())
        }
        GoogleSubcommand::Callback { code, state } => {
            let resp = ctx.api.google_callback(&code, state.as_deref()).await?;
            let Some(token) = resp.access_token.filter(|t| !t.is_empty()) else {
                let message = resp.detail.map_or_else(|| dietly::api::LOGIN_FAILED.to_owned(), |d| d.message());
                return Err(ApiError::Auth(message).into());
            };
            ctx.store.set_token(Some(token.clone()));
            let user = ctx.store.fetch_current_user(&ctx.api, &token).await?;
            println!("signed in as {}", user.display_name());
            Ok(())
        }
    }
}

async fn run_profile(ctx: &CliContext, profile: ProfileCommand) -> Result<(), CliError> {
    let token = require_session(ctx, Route::Profile)?;
    match profile.command {
        ProfileSubcommand::Get { user_id } => print_json(&ctx.api.get_user(user_id).await?),
        ProfileSubcommand::Update(args) => {
            let update = profile_update_from_args(&args)?;
            if ctx.store.user().is_none() {
                // The rename check compares against the loaded profile.
                ctx.store.fetch_current_user(&ctx.api, &token).await?;
            }
            let user = ctx.store.update_profile(&ctx.api, &update).await?;
            print_json(&serde_json::to_value(&user)?)
        }
        ProfileSubcommand::Avatar { file } => {
            let (name, bytes) = read_upload(&file).await?;
            let user = ctx.api.upload_avatar(&name, bytes, content_type_for(&file)).await?;
            print_json(&serde_json::to_value(&user)?)
        }
    }
}

async fn run_image(ctx: &CliContext, image: ImageCommand) -> Result<(), CliError> {
    require_session(ctx, Route::Upload)?;
    let value = match image.command {
        ImageSubcommand::Upload { file } => {
            let (name, bytes) = read_upload(&file).await?;
            ctx.api.upload_image(&name, bytes, content_type_for(&file)).await?
        }
        ImageSubcommand::Get { image_id } => ctx.api.get_image(image_id).await?,
        ImageSubcommand::Delete { image_id } => ctx.api.delete_image(image_id).await?,
    };
    print_json(&value)
}

async fn run_meal(ctx: &CliContext, meal: MealCommand) -> Result<(), CliError> {
    let value = match meal.command {
        MealSubcommand::Analyze { file, image_id } => {
            require_session(ctx, Route::Upload)?;
            let image_id = match (image_id, file) {
                (Some(id), _) => id,
                (None, Some(file)) => {
                    let (name, bytes) = read_upload(&file).await?;
                    let uploaded = ctx.api.upload_image(&name, bytes, content_type_for(&file)).await?;
                    uploaded
                        .get("id")
                        .and_then(Value::as_i64)
                        .ok_or_else(|| ApiError::Parse("upload response has no `id`".to_owned()))?
                }
                (None, None) => return Err(CliError::Usage("pass --file or --image-id")),
            };
            ctx.api.analyze_meal(image_id).await?
        }
        MealSubcommand::List => {
            require_session(ctx, Route::Meals)?;
            ctx.api.list_meals().await?
        }
        MealSubcommand::Get { meal_id } => {
            require_session(ctx, Route::MealDetail(meal_id))?;
            ctx.api.get_meal(meal_id).await?
        }
        MealSubcommand::Delete { meal_id } => {
            require_session(ctx, Route::MealDetail(meal_id))?;
            ctx.api.delete_meal(meal_id).await?
        }
    };
    print_json(&value)
}

async fn run_calories(ctx: &CliContext, calories: CaloriesCommand) -> Result<(), CliError> {
    require_session(ctx, Route::Calories)?;
    let value = match calories.command {
        CaloriesSubcommand::List { start, end } => ctx.api.list_calories(start.as_deref(), end.as_deref()).await?,
        CaloriesSubcommand::Log { date, consumed, burned } => {
            let entry = CalorieEntry { date, calories_consumed: consumed, calories_burned: burned };
            ctx.api.log_calories(&entry).await?
        }
        CaloriesSubcommand::Summary { date } => ctx.api.calorie_summary(&date).await?,
    };
    print_json(&value)
}

/// Resolve `route` through the auth guard; anonymous users get redirected.
fn require_session(ctx: &CliContext, route: Route) -> Result<String, CliError> {
    let state = ctx.store.snapshot();
    let resolved = routes::guard(route.clone(), &state);
    match state.token {
        Some(token) if resolved == route => Ok(token),
        _ => Err(CliError::NotSignedIn { redirect: resolved }),
    }
}

fn profile_update_from_args(args: &ProfileUpdateArgs) -> Result<ProfileUpdate, CliError> {
    let mut form = FormValues::new();
    for (field, value) in [
        ("username", &args.username),
        ("email", &args.email),
        ("age", &args.age),
        ("height", &args.height),
        ("weight", &args.weight),
    ] {
        if let Some(value) = value {
            form.set(field, value.as_str());
        }
    }
    validation::validate(&validation::PROFILE_UPDATE, &form).map_err(ApiError::Validation)?;

    let number = |field: &str| form.non_blank(field).and_then(|v| v.parse::<f64>().ok());
    Ok(ProfileUpdate {
        username: form.non_blank("username").map(str::to_owned),
        email: form.non_blank("email").map(str::to_owned),
        full_name: trimmed(args.full_name.as_deref()),
        age: form.non_blank("age").and_then(|v| v.parse::<f64>().ok()).map(age_from_f64),
        gender: trimmed(args.gender.as_deref()),
        height: number("height"),
        weight: number("weight"),
        activity_level: trimmed(args.activity_level.as_deref()),
    })
}

/// Free-text profile field; blank means "leave unchanged".
fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn age_from_f64(age: f64) -> u32 {
    // Range-checked by the profile schema.
    age.round() as u32
}

fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Expired { redirect } = event {
            eprintln!("session expired; sign in again with `dietly login` ({redirect})");
        }
    }
}

async fn read_stdin_line() -> Result<String, CliError> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(CliError::Stdin)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn read_upload(path: &Path) -> Result<(String, Vec<u8>), CliError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CliError::ReadFile { path: path.display().to_string(), source })?;
    let name = path
        .file_name()
        .map_or_else(|| "upload".to_owned(), |n| n.to_string_lossy().into_owned());
    Ok((name, bytes))
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
