use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use clinic_session::cli::{self, Command};
use clinic_session::config::ClientConfig;
use clinic_session::identity::rest::RestGateway;
use clinic_session::identity::{EventReconciler, SessionHandle, SignupOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut args: Vec<String> = std::env::args().collect();
    let program = if args.is_empty() { "clinic-session".to_string() } else { args.remove(0) };
    let parsed = match cli::parse_args(args) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", cli::usage(&program));
            std::process::exit(2);
        }
    };
    if parsed.help {
        println!("{}", cli::usage(&program));
        return Ok(());
    }

    let config = ClientConfig::load(parsed.config.as_deref())?;
    let gateway = Arc::new(RestGateway::new(&config)?);
    let directory = Arc::new(gateway.directory());
    info!(
        target: "clinic",
        "clinic-session starting: backend='{}', oauth_provider={}, profile_table={}",
        config.backend_url, config.oauth_provider, config.profile_table
    );

    let handle = EventReconciler::start(gateway.clone(), directory, config.reconciler_options()).await;
    let _printer = handle.subscribe(|state| println!("[session] {}", cli::describe_state(state)));

    run_repl(&handle, &gateway).await;
    handle.shutdown().await;
    Ok(())
}

async fn run_repl(handle: &SessionHandle, gateway: &RestGateway) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("clinic-session interpreter. Type 'help' for commands.");
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "clinic", "stdin read failed: {}", e);
                break;
            }
        };
        let cmd = match cli::parse_command(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(msg) => {
                eprintln!("{}", msg);
                continue;
            }
        };
        match cmd {
            Command::Login { email, password, role } => match handle.login(&email, &password, role).await {
                Ok(p) => println!("welcome, {}", p.display_name),
                Err(e) => eprintln!("login failed: {}", e),
            },
            Command::Signup { email, password, name, role } => match handle.signup(&email, &password, &name, role).await {
                Ok(SignupOutcome::Authenticated(p)) => println!("account created; welcome, {}", p.display_name),
                Ok(SignupOutcome::PendingConfirmation(_)) => println!("account created; confirm your email, then log in"),
                Err(e) => eprintln!("signup failed: {}", e),
            },
            Command::OAuth { role } => match handle.login_with_oauth(role).await {
                Ok(()) => println!("finish in the browser, then paste the redirect with: callback <url>"),
                Err(e) => eprintln!("oauth failed: {}", e),
            },
            Command::Callback { url } => {
                if let Err(e) = gateway.complete_oauth_redirect(&url).await {
                    eprintln!("callback rejected: {}", e);
                }
            }
            Command::Logout => {
                let _ = handle.logout().await;
            }
            Command::WhoAmI => println!("{}", cli::describe_state(&handle.current())),
            Command::Help => println!("{}", cli::REPL_HELP),
            Command::Quit => break,
        }
    }
}
