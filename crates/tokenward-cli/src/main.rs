//! tokenward - terminal front-end for the tokenward session layer.
//!
//! Signs in against the identity server, keeps the token pair in the
//! configured store, and sends protected requests through the refresh
//! coordinator.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenward_core::api::IdentityClient;
use tokenward_core::auth::{evaluate, Claims};
use tokenward_core::{
    ApiClient, AuthContext, BroadcastHub, Config, GuardOutcome, Navigator, RefreshCoordinator,
    RequiredCapability, RouteGuard,
};

const USAGE: &str = "\
Usage: tokenward <command> [args]

Commands:
  login <email>                 Sign in (password from TOKENWARD_PASSWORD or prompt)
  logout                        Sign out and clear stored tokens
  whoami                        Restore the session from stored tokens
  get <path>                    GET a protected endpoint
  post <path> <json>            POST a JSON body to a protected endpoint
  burst <count> <path>          Issue <count> concurrent GETs sharing one refresh
  visit <path> [--permissions a,b] [--roles x,y]
                                Render <path> behind the route guard
  can [--permissions a,b] [--roles x,y]
                                Check the stored token's capabilities

Sign-in/sign-out events are broadcast within this process only; other
tokenward processes pick up changes from the shared credential store.";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = tracing_appender::non_blocking(io::stderr());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

/// Navigation for a terminal: there is nothing to render, so just report it.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, path: &str) {
        println!("-> {}", path);
    }

    fn reload(&self) {
        println!("-> (reload)");
    }
}

struct App {
    config: Config,
    ctx: Arc<AuthContext>,
    api: ApiClient,
    guard: RouteGuard,
    _hub: BroadcastHub,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let store = config.token_store()?;
        let identity = Arc::new(IdentityClient::new(&config.base_url)?);

        let hub = BroadcastHub::new();
        let broadcast = hub.open(&config.channel_name);

        let mut coordinator =
            RefreshCoordinator::new(store.clone(), identity.clone(), Some(broadcast.clone()));
        if let Some(timeout) = config.refresh_timeout() {
            coordinator = coordinator.with_timeout(timeout);
        }

        let api = ApiClient::new(identity.http().clone(), &config.base_url, coordinator.clone());
        let guard = RouteGuard::new(store, config.routes.clone());
        let ctx = Arc::new(AuthContext::new(
            identity,
            coordinator,
            broadcast,
            Arc::new(TerminalNavigator),
            config.routes.clone(),
        ));

        Ok(Self {
            config,
            ctx,
            api,
            guard,
            _hub: hub,
        })
    }
}

/// Values of `--name a,b` in `args`, split on commas.
fn flag_values(args: &[String], name: &str) -> Vec<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn required_from(args: &[String]) -> RequiredCapability {
    RequiredCapability::new()
        .permissions(flag_values(args, "--permissions"))
        .roles(flag_values(args, "--roles"))
}

fn arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| format!("missing {}\n\n{}", what, USAGE))
}

async fn login(app: &App, email: &str) -> Result<()> {
    let password = match std::env::var("TOKENWARD_PASSWORD") {
        Ok(p) => p,
        Err(_) => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };
    let session = app.ctx.sign_in(email, &password).await?;
    println!("Signed in as {}", session.subject_email);
    Ok(())
}

async fn whoami(app: &App) -> Result<()> {
    match app.ctx.restore().await {
        Some(session) => {
            println!("{}", session.subject_email);
            let mut permissions: Vec<_> = session.permissions.iter().collect();
            let mut roles: Vec<_> = session.roles.iter().collect();
            permissions.sort();
            roles.sort();
            println!("  permissions: {:?}", permissions);
            println!("  roles:       {:?}", roles);
        }
        None => println!("Not signed in"),
    }
    Ok(())
}

async fn get(app: &App, path: &str) -> Result<()> {
    let value: serde_json::Value = app.api.get(path).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn post(app: &App, path: &str, body: &str) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(body).context("body must be valid JSON")?;
    let value: serde_json::Value = app.api.post(path, &body).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn burst(app: &App, count: usize, path: &str) -> Result<()> {
    let calls = (0..count).map(|_| app.api.get::<serde_json::Value>(path));
    let results = join_all(calls).await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        warn!(error = %err, "Burst request failed");
    }
    println!("{} succeeded, {} failed", count - failed, failed);
    Ok(())
}

async fn visit(app: &App, path: &str, required: &RequiredCapability) -> Result<()> {
    let api = &app.api;
    let outcome = app
        .guard
        .protect(Some(required), |_credential| async move {
            api.get::<serde_json::Value>(path).await
        })
        .await;

    match outcome {
        GuardOutcome::Render(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        GuardOutcome::Redirect(redirect) => println!("redirect -> {}", redirect.destination),
    }
    Ok(())
}

fn can(app: &App, required: &RequiredCapability) -> Result<()> {
    let store = app.config.token_store()?;
    let Some(credential) = store.load()? else {
        println!("Not signed in");
        return Ok(());
    };
    let claims = Claims::decode(&credential.access_token)
        .context("Stored access token has no readable claims")?;
    println!("{}", if evaluate(&claims, required) { "allowed" } else { "denied" });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };
    if let Ok(base_url) = std::env::var("TOKENWARD_BASE_URL") {
        config.base_url = base_url;
    }
    info!(base_url = %config.base_url, store = ?config.store, "tokenward starting");

    let app = App::new(config)?;
    let _subscription = app.ctx.attach();

    match command.as_str() {
        "login" => login(&app, arg(&args, 1, "email")?).await,
        "logout" => {
            app.ctx.sign_out();
            Ok(())
        }
        "whoami" => whoami(&app).await,
        "get" => get(&app, arg(&args, 1, "path")?).await,
        "post" => post(&app, arg(&args, 1, "path")?, arg(&args, 2, "body")?).await,
        "burst" => {
            let count: usize = arg(&args, 1, "count")?
                .parse()
                .context("count must be a positive integer")?;
            burst(&app, count, arg(&args, 2, "path")?).await
        }
        "visit" => visit(&app, arg(&args, 1, "path")?, &required_from(&args)).await,
        "can" => can(&app, &required_from(&args)),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("unknown command: {}\n\n{}", other, USAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flag_values() {
        let a = args(&["visit", "/metrics", "--permissions", "metrics.list, users.list", "--roles", "administrator"]);
        assert_eq!(flag_values(&a, "--permissions"), vec!["metrics.list", "users.list"]);
        assert_eq!(flag_values(&a, "--roles"), vec!["administrator"]);
        assert!(flag_values(&a, "--missing").is_empty());
        assert!(flag_values(&args(&["can", "--roles"]), "--roles").is_empty());
    }

    #[test]
    fn test_required_from_args() {
        let required = required_from(&args(&["can", "--roles", "editor,administrator"]));
        assert!(required.permissions.is_empty());
        assert_eq!(required.roles.len(), 2);
    }

    #[test]
    fn test_usage_documents_commands_and_broadcast_scope() {
        for command in ["login", "logout", "whoami", "get", "post", "burst", "visit", "can"] {
            assert!(USAGE.contains(&format!("  {} ", command)), "{} missing", command);
        }
        assert!(USAGE.contains("within this process only"));
    }

    #[test]
    fn test_arg_reports_missing_value() {
        let a = args(&["login"]);
        let err = arg(&a, 1, "email").unwrap_err();
        assert!(err.to_string().contains("missing email"));
    }
}
