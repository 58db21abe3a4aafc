//! Operator console – a line-oriented shell over a running [`Agent`].
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /status                    – connection, queue, capabilities, location
//!   /apps                      – allow-list, visible apps and kiosk pin
//!   /rename <password> <name>  – rename the device (admin password required)
//!   /support <text>            – send a support message to the controller
//!   /touch                     – record a local user interaction
//!   /confirm <notification_id> – acknowledge a controller notification
//!   /schema                    – print the inbound command JSON Schema
//!   /quit | /exit              – stop the agent and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use custodian_runtime::Agent;
use custodian_types::PlatformSignal;
use custodian_types::wire::inbound_command_schema;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Apps,
    Rename { password: String, name: String },
    Support(String),
    Touch,
    Confirm(String),
    Schema,
    Quit,
}

/// Parse one console line.  `Ok(None)` for blank input.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    let cmd = match head {
        "/help" => ConsoleCommand::Help,
        "/status" => ConsoleCommand::Status,
        "/apps" => ConsoleCommand::Apps,
        "/touch" => ConsoleCommand::Touch,
        "/schema" => ConsoleCommand::Schema,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        "/rename" => match rest.split_once(char::is_whitespace) {
            Some((password, name)) if !name.trim().is_empty() => ConsoleCommand::Rename {
                password: password.to_string(),
                name: name.trim().to_string(),
            },
            _ => return Err("usage: /rename <password> <name>".to_string()),
        },
        "/support" if !rest.is_empty() => ConsoleCommand::Support(rest.to_string()),
        "/support" => return Err("usage: /support <text>".to_string()),
        "/confirm" if !rest.is_empty() => ConsoleCommand::Confirm(rest.to_string()),
        "/confirm" => return Err("usage: /confirm <notification_id>".to_string()),
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(cmd))
}

/// Run the console until `/quit` or until `shutdown` is set.
///
/// Stdin is read on its own thread so Ctrl-C is honoured without waiting
/// for a line.  When stdin closes the agent keeps running until Ctrl-C.
pub fn run(agent: &Agent, shutdown: Arc<AtomicBool>) {
    let (tx, rx) = mpsc::channel::<String>();
    let spawned = std::thread::Builder::new()
        .name("custodian-console".into())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
    if let Err(e) = spawned {
        eprintln!("{}: {}", "Console unavailable".red(), e);
    }

    let mut console_open = true;
    prompt();
    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                match parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => {
                        println!("{}", "Goodbye.".green());
                        shutdown.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(Some(cmd)) => execute(agent, cmd),
                    Ok(None) => {}
                    Err(msg) => println!(
                        "{} {}. Type {} for available commands.",
                        "Error:".red(),
                        msg.yellow(),
                        "/help".bold()
                    ),
                }
                prompt();
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if console_open {
                    console_open = false;
                    println!();
                    println!("  {}", "Console closed; press Ctrl-C to stop the agent.".dimmed());
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn prompt() {
    print!("{} ", "custodian>".bold().cyan());
    io::stdout().flush().ok();
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(agent: &Agent, cmd: ConsoleCommand) {
    match cmd {
        ConsoleCommand::Help => cmd_help(),
        ConsoleCommand::Status => cmd_status(agent),
        ConsoleCommand::Apps => cmd_apps(agent),
        ConsoleCommand::Rename { password, name } => match agent.rename_device(&password, &name) {
            Ok(()) => println!("{} {}", "✓ Device renamed to".green(), name.bold()),
            Err(e) => println!("{}: {}", "Rename refused".red(), e),
        },
        ConsoleCommand::Support(text) => match agent.send_support_message(&text) {
            Ok(()) => println!("{}", "✓ Support message queued.".green()),
            Err(e) => println!("{}: {}", "Support message not sent".red(), e),
        },
        ConsoleCommand::Touch => report(agent.report_user_interaction(), "User interaction recorded."),
        ConsoleCommand::Confirm(notification_id) => report(
            agent.publish_signal(PlatformSignal::NotificationConfirmed { notification_id }),
            "Confirmation forwarded.",
        ),
        ConsoleCommand::Schema => match serde_json::to_string_pretty(&inbound_command_schema()) {
            Ok(s) => println!("{s}"),
            Err(e) => println!("{}: {}", "Schema error".red(), e),
        },
        ConsoleCommand::Quit => {}
    }
}

fn report<E: std::fmt::Display>(result: Result<(), E>, ok: &str) {
    match result {
        Ok(()) => println!("{} {}", "✓".green(), ok),
        Err(e) => println!("{}: {}", "Failed".red(), e),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Custodian Commands".bold().underline());
    println!("  {}                    – agent status", "/status".bold().cyan());
    println!("  {}                      – allow-list and visible apps", "/apps".bold().cyan());
    println!("  {} – rename the device", "/rename <password> <name>".bold().cyan());
    println!("  {}            – message the controller", "/support <text>".bold().cyan());
    println!("  {}                     – record a user interaction", "/touch".bold().cyan());
    println!("  {}   – acknowledge a notification", "/confirm <notification_id>".bold().cyan());
    println!("  {}                    – inbound command JSON Schema", "/schema".bold().cyan());
    println!("  {}              – stop the agent and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(agent: &Agent) {
    let status = agent.status();
    println!("{}", "Agent Status".bold().underline());
    println!("  Device name    : {}", status.device_name.bold());
    println!("  Connection     : {}", status.connection.to_string().yellow());
    println!("  Queued messages: {}", status.queued_messages);
    if status.missing_capabilities.is_empty() {
        println!("  Capabilities   : {}", "all granted".green());
    } else {
        println!("  Capabilities   : {} {:?}", "missing".red(), status.missing_capabilities);
    }
    let tracking = if status.location_tracking { "on".green() } else { "off".dimmed() };
    println!("  Tracking       : {}", tracking);
    match status.last_location {
        Some(fix) => println!(
            "  Last location  : {:.5}, {:.5} (±{:.0} m, {})",
            fix.lat, fix.lon, fix.accuracy_m, fix.timestamp
        ),
        None => println!("  Last location  : {}", "unknown".dimmed()),
    }
}

fn cmd_apps(agent: &Agent) {
    let status = agent.status();
    println!("{}", "Applications".bold().underline());
    if let Some(pkg) = &status.kiosk_package {
        println!("  Kiosk pinned to {}", pkg.bold().yellow());
    }
    println!("  Allow-list ({}):", status.allow_list.len());
    for pkg in &status.allow_list {
        let marker = if status.visible_apps.contains(pkg) { "▶".green() } else { " ".normal() };
        println!("    {} {}", marker, pkg);
    }
    if status.allow_list.is_empty() {
        println!("    {}", "(empty; nothing is visible)".dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn simple_commands_parse() {
        assert_eq!(parse("/status"), Ok(Some(ConsoleCommand::Status)));
        assert_eq!(parse(" /apps "), Ok(Some(ConsoleCommand::Apps)));
        assert_eq!(parse("/exit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(parse("/touch"), Ok(Some(ConsoleCommand::Touch)));
    }

    #[test]
    fn rename_keeps_spaces_in_name() {
        assert_eq!(
            parse("/rename s3cret Front Desk 2"),
            Ok(Some(ConsoleCommand::Rename {
                password: "s3cret".into(),
                name: "Front Desk 2".into(),
            }))
        );
        assert!(parse("/rename s3cret").is_err());
        assert!(parse("/rename").is_err());
    }

    #[test]
    fn support_and_confirm_need_an_argument() {
        assert_eq!(
            parse("/support printer is jammed"),
            Ok(Some(ConsoleCommand::Support("printer is jammed".into())))
        );
        assert_eq!(parse("/confirm n-42"), Ok(Some(ConsoleCommand::Confirm("n-42".into()))));
        assert!(parse("/support").is_err());
        assert!(parse("/confirm  ").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        let err = parse("/reboot now").unwrap_err();
        assert!(err.contains("/reboot"));
    }
}
