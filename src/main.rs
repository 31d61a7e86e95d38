//! Command-line broker client.
//!
//! Drives a [`BrokerService`] through the event channel: interactive
//! runs prompt on each authentication challenge, unattended runs answer
//! only from pre-supplied credentials and lean on [`RetryPolicy`] to
//! survive broker outages. Once a desktop connection is negotiated the
//! external remoting client is launched and monitored until it exits.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use vdi_broker::prefs::{self, JsonFileStore, PrefStore, PREF_LAST_DESKTOP};
use vdi_broker::{
    BrokerError, BrokerErrorKind, BrokerResult, BrokerService, Desktop, DesktopConnection,
    EventReceiver, RetryPolicy, SessionConfig, SessionEvent, WindowGeometry,
};
use vdi_launcher::RemotingLauncher;

/// Environment variables consulted for unattended credentials.
const ENV_PASSWORD: &str = "VDI_PASSWORD";
const ENV_PASSCODE: &str = "VDI_PASSCODE";

#[derive(Parser, Debug)]
#[command(name = "vdi-client", version, about = "Connect to a desktop broker and launch a remote desktop")]
struct Args {
    /// Broker address (host or host:port). Defaults to the most
    /// recently used broker.
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// User name to authenticate as.
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Authentication domain.
    #[arg(short = 'd', long)]
    domain: Option<String>,

    /// Desktop to connect to. Defaults to the last desktop used.
    #[arg(short = 'n', long)]
    desktop: Option<String>,

    /// Never prompt; answer challenges only from flags and the
    /// VDI_PASSWORD / VDI_PASSCODE environment variables.
    #[arg(long)]
    non_interactive: bool,

    /// With --non-interactive, exit after the first failure instead of
    /// retrying.
    #[arg(long)]
    once: bool,

    /// Seconds to wait before the first unattended reconnect.
    #[arg(long, default_value_t = 30)]
    initial_retry_period: u64,

    /// Ceiling on the unattended reconnect backoff, in seconds.
    #[arg(long, default_value_t = 240)]
    maximum_retry_period: u64,

    /// Broker HTTPS port.
    #[arg(short = 'p', long, default_value_t = 443)]
    port: u16,

    /// Accept the broker's TLS certificate without verification.
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Run the remoting client fullscreen.
    #[arg(long)]
    fullscreen: bool,

    /// Window geometry as WIDTHxHEIGHT when not fullscreen.
    #[arg(long, default_value = "1024x768")]
    geometry: String,

    /// Preference file. Defaults to vdi-client/prefs.json under the
    /// user configuration directory.
    #[arg(long)]
    prefs: Option<PathBuf>,

    /// Session cookie file, enabling reconnection without
    /// re-authentication while the broker session is still valid.
    #[arg(long)]
    cookie_file: Option<PathBuf>,

    /// Per-request broker timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

/// How one connect-and-run attempt ended.
enum Outcome {
    /// The remoting client ran and exited, or the user logged out.
    Finished,
    /// Transport-level failure; unattended mode may retry.
    Failed(String),
    /// Unanswerable challenge or bad input. Retrying cannot help.
    Fatal(String),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("vdi-client: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> BrokerResult<()> {
    let geometry = if args.fullscreen {
        WindowGeometry::Fullscreen
    } else {
        parse_geometry(&args.geometry)?
    };

    let store = open_pref_store(args.prefs.clone())?;

    let broker = match &args.server {
        Some(addr) => addr.clone(),
        None => match prefs::recent_brokers(store.as_ref()).into_iter().next() {
            Some(addr) => addr,
            None if args.non_interactive => {
                return Err(BrokerError::validation(
                    "No broker address given and none remembered; pass --server",
                ))
            }
            None => prompt("Broker address")?,
        },
    };

    let config = SessionConfig {
        default_broker: broker,
        port: args.port,
        default_user: args.user.clone().unwrap_or_default(),
        default_domain: args.domain.clone().unwrap_or_default(),
        non_interactive: args.non_interactive,
        once: args.once,
        initial_retry_period: args.initial_retry_period,
        maximum_retry_period: args.maximum_retry_period,
        insecure: args.insecure,
        timeout_secs: args.timeout,
        cookie_file: args
            .cookie_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
    };

    let (service, mut receiver) = BrokerService::new(config.clone())?;
    let launcher = RemotingLauncher::new();
    let mut retry = RetryPolicy::from_periods(
        config.initial_retry_period,
        config.maximum_retry_period,
        config.once,
    );

    loop {
        let outcome = run_attempt(
            &service,
            &mut receiver,
            store.as_ref(),
            &launcher,
            &args,
            geometry,
            &mut retry,
        )
        .await;

        match outcome {
            Outcome::Finished => return Ok(()),
            Outcome::Fatal(message) => {
                return Err(BrokerError::new(BrokerErrorKind::Other, message))
            }
            Outcome::Failed(message) => {
                if !config.non_interactive {
                    return Err(BrokerError::transport(message));
                }
                match retry.next_delay() {
                    Some(delay) => {
                        log::warn!(
                            "Connection failed ({message}); retrying in {}s (attempt {})",
                            delay.as_secs(),
                            retry.attempts()
                        );
                        tokio::time::sleep(delay).await;
                        // Resets the session from Failed back to Idle.
                        service.cancel_requests();
                    }
                    None => return Err(BrokerError::transport(message)),
                }
            }
        }
    }
}

/// One connect attempt: drive the event channel until the session ends
/// one way or the other.
async fn run_attempt(
    service: &BrokerService,
    receiver: &mut EventReceiver,
    store: &dyn PrefStore,
    launcher: &RemotingLauncher,
    args: &Args,
    geometry: WindowGeometry,
    retry: &mut RetryPolicy,
) -> Outcome {
    // Drop anything left over from a previous attempt.
    while receiver.try_recv().is_ok() {}

    if let Err(e) = service.connect().await {
        return failure_outcome(e);
    }

    let unattended = args.non_interactive;
    let mut pending_connection: Option<DesktopConnection> = None;

    while let Some(event) = receiver.recv().await {
        // Rejected credentials leave the session parked in the same
        // challenge step without a fresh event, so the same event is
        // re-answered until it succeeds or the user gives up.
        loop {
            let step = match event.clone() {
                SessionEvent::BrokerRequested => {
                    log::info!("Contacting broker {}", service.session().address());
                    Ok(())
                }
                SessionEvent::PasscodeRequested { username, .. } => {
                    answer_passcode(service, args, &username, unattended).await
                }
                SessionEvent::NextTokencodeRequested { username } => {
                    if unattended {
                        return Outcome::Fatal(
                            "Broker requires the token's next code; cannot answer unattended".into(),
                        );
                    }
                    println!("The server needs the next code from {username}'s token.");
                    match prompt("Next tokencode") {
                        Ok(code) => service.submit_next_tokencode(&code).await,
                        Err(e) => Err(e),
                    }
                }
                SessionEvent::PinChangeRequested { pin, message, .. } => {
                    if unattended {
                        return Outcome::Fatal(
                            "Broker requires a PIN change; cannot answer unattended".into(),
                        );
                    }
                    answer_pin_change(service, &pin, &message).await
                }
                SessionEvent::DisclaimerRequested { text } => {
                    println!("{text}");
                    if unattended {
                        log::info!("Accepting disclaimer (unattended)");
                        service.accept_disclaimer().await
                    } else {
                        match prompt("Accept? [y/N]") {
                            Ok(answer) if answer.eq_ignore_ascii_case("y") => {
                                service.accept_disclaimer().await
                            }
                            Ok(_) => {
                                let _ = service.logout().await;
                                return Outcome::Finished;
                            }
                            Err(e) => Err(e),
                        }
                    }
                }
                SessionEvent::CertificateRequested { issuers } => {
                    if unattended {
                        return Outcome::Fatal(
                            "Broker requires a certificate identity; cannot answer unattended".into(),
                        );
                    }
                    println!("Accepted certificate issuers: {}", issuers.join(", "));
                    match prompt("Certificate identity") {
                        Ok(identity) => service.submit_certificate_identity(&identity).await,
                        Err(e) => Err(e),
                    }
                }
                SessionEvent::PasswordRequested {
                    username,
                    domains,
                    suggested_domain,
                    ..
                } => {
                    answer_password(service, args, &username, &domains, &suggested_domain, unattended)
                        .await
                }
                SessionEvent::PasswordChangeRequested { username, domain } => {
                    if unattended {
                        return Outcome::Fatal(
                            "Broker requires a password change; cannot answer unattended".into(),
                        );
                    }
                    println!("Password change required for {username}@{domain}.");
                    answer_password_change(service).await
                }
                SessionEvent::DesktopsRequested => {
                    log::info!("Authenticated; fetching desktops");
                    Ok(())
                }
                SessionEvent::DesktopsUpdated => {
                    prefs::remember_broker(store, &service.config().default_broker);
                    retry.record_success();
                    match choose_desktop(service, store, args, unattended).await {
                        Ok(Some(connection)) => {
                            pending_connection = Some(connection);
                            Ok(())
                        }
                        Ok(None) => {
                            let _ = service.logout().await;
                            return Outcome::Finished;
                        }
                        Err(e) => Err(e),
                    }
                }
                SessionEvent::LaunchDesktop(desktop) => {
                    let connection = match pending_connection.take() {
                        Some(connection) => connection,
                        None => {
                            return Outcome::Fatal(
                                "Desktop launch announced without a negotiated connection".into(),
                            )
                        }
                    };
                    return run_remote_client(service, launcher, &desktop, &connection, geometry)
                        .await;
                }
                SessionEvent::Disconnected => {
                    log::info!("Broker session ended");
                    return Outcome::Finished;
                }
                SessionEvent::TunnelDisconnected { reason } => {
                    return Outcome::Failed(format!("Tunnel disconnected: {reason}"));
                }
                SessionEvent::Failed { message } => {
                    return Outcome::Failed(message);
                }
            };

            match step {
                Ok(()) => break,
                Err(e) if e.kind == BrokerErrorKind::AuthenticationRejected && !unattended => {
                    println!("Authentication failed: {}", e.message);
                    // Drop stale environment credentials or the same
                    // wrong answer would be resubmitted forever.
                    std::env::remove_var(ENV_PASSWORD);
                    std::env::remove_var(ENV_PASSCODE);
                }
                Err(e) => return failure_outcome(e),
            }
        }
    }

    Outcome::Failed("Session event channel closed".into())
}

fn failure_outcome(e: BrokerError) -> Outcome {
    if e.is_retryable() {
        Outcome::Failed(e.to_string())
    } else {
        Outcome::Fatal(e.to_string())
    }
}

// ── Challenge answers ───────────────────────────────────────────────

async fn answer_passcode(
    service: &BrokerService,
    args: &Args,
    suggested_user: &str,
    unattended: bool,
) -> BrokerResult<()> {
    let username = match &args.user {
        Some(user) => user.clone(),
        None if !suggested_user.is_empty() => suggested_user.to_string(),
        None if unattended => {
            return Err(BrokerError::validation("Passcode challenge needs --user"))
        }
        None => prompt("User name")?,
    };
    let passcode = match std::env::var(ENV_PASSCODE) {
        Ok(code) if !code.is_empty() => code,
        _ if unattended => {
            return Err(BrokerError::validation(format!(
                "Passcode challenge needs {ENV_PASSCODE}"
            )))
        }
        _ => prompt(&format!("Passcode for {username}"))?,
    };
    service.submit_username_passcode(&username, &passcode).await
}

async fn answer_pin_change(
    service: &BrokerService,
    suggested_pin: &str,
    message: &str,
) -> BrokerResult<()> {
    if !message.is_empty() {
        println!("{message}");
    }
    let pin1 = if suggested_pin.is_empty() {
        prompt("New PIN")?
    } else {
        match prompt(&format!("New PIN [{suggested_pin}]"))? {
            pin if pin.is_empty() => suggested_pin.to_string(),
            pin => pin,
        }
    };
    let pin2 = prompt("Confirm PIN")?;
    service.submit_pin(&pin1, &pin2).await
}

async fn answer_password(
    service: &BrokerService,
    args: &Args,
    suggested_user: &str,
    domains: &[String],
    suggested_domain: &str,
    unattended: bool,
) -> BrokerResult<()> {
    let username = match &args.user {
        Some(user) => user.clone(),
        None if !suggested_user.is_empty() => suggested_user.to_string(),
        None if unattended => {
            return Err(BrokerError::validation("Password challenge needs --user"))
        }
        None => prompt("User name")?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(pw) if !pw.is_empty() => pw,
        _ if unattended => {
            return Err(BrokerError::validation(format!(
                "Password challenge needs {ENV_PASSWORD}"
            )))
        }
        _ => prompt(&format!("Password for {username}"))?,
    };
    let domain = match &args.domain {
        Some(domain) => domain.clone(),
        None if !suggested_domain.is_empty() => suggested_domain.to_string(),
        None if domains.len() == 1 => domains[0].clone(),
        None if unattended => {
            return Err(BrokerError::validation("Password challenge needs --domain"))
        }
        None => {
            if !domains.is_empty() {
                println!("Domains: {}", domains.join(", "));
            }
            prompt("Domain")?
        }
    };
    service.submit_username_password(&username, &password, &domain).await
}

async fn answer_password_change(service: &BrokerService) -> BrokerResult<()> {
    let old = prompt("Old password")?;
    let new = prompt("New password")?;
    let confirm = prompt("Confirm new password")?;
    service.submit_password_change(&old, &new, &confirm).await
}

// ── Desktop selection ───────────────────────────────────────────────

/// Pick a desktop and negotiate its connection. `Ok(None)` means the
/// user chose to quit instead.
async fn choose_desktop(
    service: &BrokerService,
    store: &dyn PrefStore,
    args: &Args,
    unattended: bool,
) -> BrokerResult<Option<DesktopConnection>> {
    let desktops = service.desktops();
    if desktops.is_empty() {
        return Err(BrokerError::not_found("No desktops entitled to this account"));
    }

    let name = match &args.desktop {
        Some(name) => {
            if !desktops.iter().any(|d| d.name == *name) {
                return Err(BrokerError::not_found(format!(
                    "Desktop '{name}' not entitled; available: {}",
                    desktop_names(&desktops)
                )));
            }
            name.clone()
        }
        None => {
            let remembered = store
                .get(PREF_LAST_DESKTOP)
                .filter(|last| desktops.iter().any(|d| d.name == *last));
            match remembered {
                Some(name) => name,
                None if unattended => {
                    // With exactly one connectable desktop the choice
                    // is unambiguous.
                    let mut connectable = desktops.iter().filter(|d| d.can_connect());
                    match (connectable.next(), connectable.next()) {
                        (Some(only), None) => only.name.clone(),
                        _ => {
                            return Err(BrokerError::validation(format!(
                                "Cannot pick a desktop unattended; pass --desktop (available: {})",
                                desktop_names(&desktops)
                            )))
                        }
                    }
                }
                None => match prompt_desktop(&desktops)? {
                    Some(name) => name,
                    None => return Ok(None),
                },
            }
        }
    };

    store.set(PREF_LAST_DESKTOP, &name);
    let connection = service.connect_desktop(&name).await?;
    Ok(Some(connection))
}

fn prompt_desktop(desktops: &[Desktop]) -> BrokerResult<Option<String>> {
    println!("Available desktops:");
    for (i, desktop) in desktops.iter().enumerate() {
        let marker = if desktop.can_connect() { ' ' } else { '!' };
        println!("  {}{} {} ({:?})", i + 1, marker, desktop.name, desktop.status);
    }
    loop {
        let answer = prompt("Desktop number (or q to quit)")?;
        if answer.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        match answer.parse::<usize>() {
            Ok(n) if n >= 1 && n <= desktops.len() => {
                return Ok(Some(desktops[n - 1].name.clone()))
            }
            _ => println!("Enter a number between 1 and {}.", desktops.len()),
        }
    }
}

fn desktop_names(desktops: &[Desktop]) -> String {
    desktops
        .iter()
        .map(|d| d.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Remoting client ─────────────────────────────────────────────────

/// Launch the remoting client and watch it until it exits.
async fn run_remote_client(
    service: &BrokerService,
    launcher: &RemotingLauncher,
    desktop: &Desktop,
    connection: &DesktopConnection,
    geometry: WindowGeometry,
) -> Outcome {
    let launched = match launcher.launch_rdp(&desktop.name, connection, geometry).await {
        Ok(launched) => launched,
        Err(e) => return Outcome::Fatal(e.to_string()),
    };
    service.session().mark_connected(&desktop.name);
    log::info!(
        "Remoting client running for '{}' (pid {})",
        desktop.name,
        launched.process_id
    );

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        match launcher.is_session_alive(&launched.session_id).await {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
    }
    launcher.prune_dead_sessions().await;
    service.session().mark_disconnected(&desktop.name);
    log::info!("Remoting client for '{}' exited", desktop.name);

    let _ = service.logout().await;
    Outcome::Finished
}

// ── Small helpers ───────────────────────────────────────────────────

fn parse_geometry(raw: &str) -> BrokerResult<WindowGeometry> {
    let (w, h) = raw
        .split_once('x')
        .ok_or_else(|| BrokerError::validation(format!("Bad geometry '{raw}'; expected WIDTHxHEIGHT")))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| BrokerError::validation(format!("Bad geometry width '{w}'")))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| BrokerError::validation(format!("Bad geometry height '{h}'")))?;
    if width == 0 || height == 0 {
        return Err(BrokerError::validation("Geometry must be non-zero"));
    }
    Ok(WindowGeometry::Windowed { width, height })
}

fn open_pref_store(override_path: Option<PathBuf>) -> BrokerResult<Arc<JsonFileStore>> {
    let path = match override_path {
        Some(path) => path,
        None => {
            let base = dirs::config_dir()
                .ok_or_else(|| {
                    BrokerError::new(BrokerErrorKind::Other, "No user configuration directory")
                })?
                .join("vdi-client");
            if let Err(e) = std::fs::create_dir_all(&base) {
                log::warn!("Cannot create {}: {e}", base.display());
            }
            base.join("prefs.json")
        }
    };
    Ok(Arc::new(JsonFileStore::open(path)?))
}

fn prompt(label: &str) -> BrokerResult<String> {
    print!("{label}: ");
    io::stdout()
        .flush()
        .map_err(|e| BrokerError::new(BrokerErrorKind::Other, format!("Terminal write: {e}")))?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| BrokerError::new(BrokerErrorKind::Other, format!("Terminal read: {e}")))?;
    Ok(line.trim().to_string())
}
