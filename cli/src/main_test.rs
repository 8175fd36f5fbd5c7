use super::*;
use dietly::MemoryStorage;
use dietly::storage::ACCESS_TOKEN_KEY;

fn context(storage: MemoryStorage) -> CliContext {
    let store = Arc::new(SessionStore::new(Arc::new(storage)));
    let config = ClientConfig::new("http://127.0.0.1:9").expect("config");
    let api = ApiClient::new(&config).expect("client").with_session(store.clone());
    CliContext { store, api }
}

#[test]
fn content_type_follows_extension() {
    assert_eq!(content_type_for(Path::new("lunch.JPG")), "image/jpeg");
    assert_eq!(content_type_for(Path::new("a/b/dinner.png")), "image/png");
    assert_eq!(content_type_for(Path::new("snack.webp")), "image/webp");
    assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
}

#[test]
fn require_session_redirects_anonymous_to_sign_in() {
    let ctx = context(MemoryStorage::new());
    let err = require_session(&ctx, Route::Meals).expect_err("anonymous");
    assert!(matches!(err, CliError::NotSignedIn { redirect: Route::SignIn }));
    assert_eq!(err.error_code(), "E_NOT_SIGNED_IN");
}

#[test]
fn require_session_returns_restored_token() {
    let ctx = context(MemoryStorage::new().with_entry(ACCESS_TOKEN_KEY, "tok-1"));
    assert_eq!(require_session(&ctx, Route::Calories).expect("token"), "tok-1");
}

#[test]
fn profile_update_parses_numeric_fields() {
    let args = ProfileUpdateArgs {
        full_name: Some("  Ann Lee ".to_owned()),
        age: Some("34".to_owned()),
        height: Some("172.5".to_owned()),
        weight: Some("".to_owned()),
        ..ProfileUpdateArgs::default()
    };
    let update = profile_update_from_args(&args).expect("valid");
    assert_eq!(update.full_name.as_deref(), Some("Ann Lee"));
    assert_eq!(update.age, Some(34));
    assert_eq!(update.height, Some(172.5));
    assert_eq!(update.weight, None);
    assert_eq!(update.username, None);
}

#[test]
fn profile_update_drops_blank_free_text_fields() {
    let args = ProfileUpdateArgs {
        gender: Some("   ".to_owned()),
        activity_level: Some(" moderate ".to_owned()),
        ..ProfileUpdateArgs::default()
    };
    let update = profile_update_from_args(&args).expect("valid");
    assert_eq!(update.gender, None);
    assert_eq!(update.activity_level.as_deref(), Some("moderate"));
}

#[test]
fn profile_update_rejects_out_of_range_values() {
    let args = ProfileUpdateArgs {
        age: Some("0".to_owned()),
        username: Some("ab".to_owned()),
        ..ProfileUpdateArgs::default()
    };
    let err = profile_update_from_args(&args).expect_err("invalid");
    let CliError::Api(ApiError::Validation(errors)) = err else {
        panic!("expected validation error, got {err:?}");
    };
    let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
    assert!(fields.contains(&"age"));
    assert!(fields.contains(&"username"));
}

#[test]
fn explicit_api_url_must_be_http() {
    let err = build_config(Some("ftp://example.com"), None).expect_err("scheme");
    assert!(matches!(err, CliError::Api(ApiError::ConfigParse(_))));
}

#[test]
fn explicit_storage_path_overrides_environment() {
    let config = build_config(Some("http://api.example.com/"), Some(PathBuf::from("/tmp/dietly.json"))).expect("config");
    assert_eq!(config.api_url, "http://api.example.com");
    assert_eq!(config.storage_path, PathBuf::from("/tmp/dietly.json"));
}

#[test]
fn meal_analyze_requires_a_source() {
    assert!(Cli::try_parse_from(["dietly", "meal", "analyze"]).is_err());
    assert!(Cli::try_parse_from(["dietly", "meal", "analyze", "--image-id", "7"]).is_ok());
    assert!(Cli::try_parse_from(["dietly", "meal", "analyze", "--image-id", "7", "--file", "x.jpg"]).is_err());
}

#[test]
fn login_parses_username_and_password() {
    let cli = Cli::try_parse_from(["dietly", "login", "--username", "bob", "--password", "secret123"]).expect("parse");
    let Command::Login(args) = cli.command else {
        panic!("expected login");
    };
    assert_eq!(args.username, "bob");
    assert_eq!(args.password.as_deref(), Some("secret123"));
}

#[test]
fn retryable_follows_api_error() {
    assert!(CliError::Api(ApiError::Request("timeout".to_owned())).retryable());
    assert!(!CliError::Usage("x").retryable());
}
