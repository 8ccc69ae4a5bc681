//! printdesk - terminal host for a print-shop portal session.
//!
//! Restores the stored session (or prompts for a sign-in), then keeps it
//! alive until Ctrl-C. Lines typed on stdin count as activity; a few of them
//! are commands (`status`, `refresh`, `logout`, `forget`, `name`, `phone`).

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use printdesk_core::{
    ActivitySignal, ApiClient, AuthState, Config, FileStore, LoginRequest, PortalKind,
    ProfileUpdate, SessionController, SessionEvent, SystemClock,
};

const USAGE: &str = "Usage: printdesk [--portal staff|customer] [--once]";

/// Log file name prefix inside `PRINTDESK_LOG_DIR`
const LOG_FILE_PREFIX: &str = "printdesk.log";

struct Args {
    portal: Option<PortalKind>,
    /// Restore, report, and exit without prompting
    once: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        portal: None,
        once: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--once" => args.once = true,
            "--portal" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--portal needs a value\n{}", USAGE))?;
                args.portal = Some(value.parse()?);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => match other.strip_prefix("--portal=") {
                Some(value) => args.portal = Some(value.parse()?),
                None => bail!("Unknown argument {:?}\n{}", other, USAGE),
            },
        }
    }
    Ok(args)
}

/// Initialize the tracing subscriber. Logs go to stderr, and additionally to
/// a daily rolling file when `PRINTDESK_LOG_DIR` is set. The returned guard
/// flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // RUST_LOG controls the level (e.g. RUST_LOG=printdesk_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var("PRINTDESK_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = parse_args()?;
    let _log_guard = init_tracing();

    let mut config = Config::load()?;
    if let Ok(url) = std::env::var("PRINTDESK_API_URL") {
        config.api_base_url = Some(url);
    }
    let portal = match args.portal {
        Some(portal) => portal,
        None => match std::env::var("PRINTDESK_PORTAL") {
            Ok(value) => value.parse()?,
            Err(_) => config.portal.unwrap_or(PortalKind::Customer),
        },
    };

    let profile = config.profile(portal)?;
    let store = FileStore::new(config.storage_dir(portal)?)
        .context("Failed to open session storage")?;
    let api = ApiClient::new(config.api_base_url()).context("Failed to create HTTP client")?;
    let controller = SessionController::new(
        profile,
        Arc::new(api),
        Arc::new(store),
        Arc::new(SystemClock),
    );
    info!(portal = %portal, api = config.api_base_url(), "printdesk starting");

    let mut events = controller.subscribe();
    controller.restore().await;
    print_pending(&mut events);

    if args.once {
        report(&controller);
        return Ok(());
    }

    if !controller.state().is_signed_in() {
        sign_in(&controller, &mut config).await?;
        print_pending(&mut events);
    }
    report(&controller);

    println!("Session active. Type `help` for commands, Ctrl-C to exit.");
    let result = run(&controller, &mut events).await;

    controller.shutdown();
    print_pending(&mut events);
    info!("printdesk shutting down");
    result
}

async fn run(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    controller.record_activity(ActivitySignal::Key);
                    handle_command(controller, line.trim()).await;
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(AuthState::Unauthenticated)) => {
                    println!("Signed out.");
                    return Ok(());
                }
                Ok(SessionEvent::IdentityChanged(user)) => {
                    println!("Now signed in as {} ({})", user.name, user.role.display_name());
                }
                Ok(SessionEvent::Notice(notice)) => eprintln!("{}", notice),
                Ok(SessionEvent::StateChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn handle_command(controller: &SessionController, line: &str) {
    let (command, rest) = line
        .split_once(char::is_whitespace)
        .map(|(c, r)| (c, r.trim()))
        .unwrap_or((line, ""));

    match command {
        "" => {}
        "status" => report(controller),
        "refresh" => {
            controller.refresh().await;
            report(controller);
        }
        "logout" => controller.logout().await,
        "forget" => {
            controller.forget_login();
            println!("Remembered login removed.");
        }
        "name" | "phone" if !rest.is_empty() => {
            let update = if command == "name" {
                ProfileUpdate {
                    name: Some(rest.to_string()),
                    ..Default::default()
                }
            } else {
                ProfileUpdate {
                    phone: Some(rest.to_string()),
                    ..Default::default()
                }
            };
            match controller.update_profile(update).await {
                Ok(user) => println!("Profile updated for {}", user.name),
                Err(e) => eprintln!("Profile update failed: {}", e),
            }
        }
        "help" => {
            println!("status            show the current session");
            println!("refresh           re-fetch your profile now");
            println!("name <name>       change your display name");
            println!("phone <number>    change your phone number");
            println!("forget            remove the remembered login");
            println!("logout            sign out and exit");
        }
        other => eprintln!("Unknown command {:?}. Type `help` for commands.", other),
    }
}

async fn sign_in(controller: &SessionController, config: &mut Config) -> Result<()> {
    let remembered = controller.remembered_login();
    let suggested = std::env::var("PRINTDESK_LOGIN")
        .ok()
        .or_else(|| remembered.as_ref().map(|r| r.login.clone()))
        .or_else(|| config.last_login.clone());

    let login = prompt_login(suggested.as_deref())?;
    let password = match std::env::var("PRINTDESK_PASSWORD") {
        Ok(password) => password,
        Err(_) => match &remembered {
            Some(r) if r.login == login && confirm("Use the remembered password? [Y/n] ", true)? => {
                r.password.clone()
            }
            _ => rpassword::prompt_password("Password: ")?,
        },
    };
    let remember_me = controller.profile().has_remember_me()
        && confirm("Remember me on this computer? [y/N] ", false)?;

    match controller
        .login(LoginRequest::new(login.clone(), password, remember_me))
        .await
    {
        Ok(user) => {
            config.last_login = Some(login);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Welcome, {}!", user.first_name());
            Ok(())
        }
        Err(e) => bail!("Sign-in failed: {}", e),
    }
}

fn prompt_login(suggested: Option<&str>) -> Result<String> {
    match suggested {
        Some(s) => print!("Email [{}]: ", s),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    match (input.is_empty(), suggested) {
        (true, Some(s)) => Ok(s.to_string()),
        _ => Ok(input.to_string()),
    }
}

fn confirm(question: &str, default: bool) -> Result<bool> {
    print!("{}", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(match input.trim().to_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    })
}

fn report(controller: &SessionController) {
    let portal = controller.profile().kind;
    match (controller.current_user(), controller.session()) {
        (Some(user), Some(session)) => {
            let expires = session.expires_at().with_timezone(&chrono::Local);
            println!(
                "{} portal: {} <{}>, {} - session expires {}",
                portal,
                user.name,
                user.email,
                user.role.display_name(),
                expires.format("%Y-%m-%d %H:%M")
            );
        }
        _ => println!("{} portal: not signed in", portal),
    }
}

/// Print notices queued before the event loop started.
fn print_pending(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Notice(notice)) => eprintln!("{}", notice),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
