//! Terminal presentation for the client: banner, request log lines, error
//! blocks. The data plane never prints; everything arrives through the
//! [`Events`] interface.

use std::time::Duration;

use chrono::{DateTime, Local};

use crate::client::{ClientError, Events, RequestLog};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const ITALIC: &str = "\x1b[3m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const MAGENTA: &str = "\x1b[35m";

pub struct ConsoleUi {
    local_addr: String,
}

impl ConsoleUi {
    pub fn new(local_addr: String) -> Self {
        Self { local_addr }
    }
}

impl Events for ConsoleUi {
    fn on_connected(&self, url: &str) {
        print_banner(url, &self.local_addr);
    }

    fn on_request(&self, log: &RequestLog) {
        print_request(log);
    }
}

fn print_banner(tunnel_url: &str, local_addr: &str) {
    println!();
    println!(
        "  {BOLD}{MAGENTA}openport{RESET} {DIM}v{}{RESET}",
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!(
        "  {DIM}Forwarding{RESET}  {BOLD}{CYAN}{tunnel_url}{RESET}  {DIM}\u{2192}{RESET}  {BOLD}{CYAN}http://{local_addr}{RESET}"
    );
    println!();
    println!("  {DIM}{ITALIC}Press Ctrl+C to stop{RESET}");
    println!("  {DIM}{}{RESET}", "\u{2500}".repeat(52));
    println!();
}

fn print_request(log: &RequestLog) {
    let color = status_color(log.status);
    let timestamp: DateTime<Local> = log.timestamp.into();
    println!(
        "  {color}\u{25cf}{RESET} {DIM}{}{RESET} {color}{}{RESET} {BOLD}{:<7}{RESET} {} {DIM}{}{RESET}",
        timestamp.format("%H:%M:%S"),
        log.status,
        log.method,
        log.path,
        format_duration(log.duration),
    );
}

/// One styled block per failure category, with a hint on what to do next.
pub fn print_error(err: &ClientError) {
    println!();
    match err {
        ClientError::LocalNotReachable { detail, .. } => print_error_block(
            "Port not reachable",
            &format!("Nothing is running on {detail}."),
            "Start your local server first, then try again.",
        ),
        ClientError::ServerUnreachable { addr, .. } => print_error_block(
            "Cannot reach server",
            &format!("Could not connect to the openport server at {addr}."),
            "Make sure the server is running and the address is correct.",
        ),
        ClientError::SubdomainTaken { subdomain } => print_error_block(
            "Subdomain unavailable",
            &format!("The subdomain \"{subdomain}\" is already in use."),
            "Try a different subdomain with --subdomain or omit it for a random one.",
        ),
        ClientError::ConnectionLost { .. } => print_error_block(
            "Connection lost",
            "The tunnel connection was interrupted.",
            "Check your network and try reconnecting.",
        ),
    }
    println!();
}

fn print_error_block(title: &str, message: &str, hint: &str) {
    println!("  {BOLD}{RED}\u{2715} {title}{RESET}");
    println!("    {message}");
    if !hint.is_empty() {
        println!("    {DIM}{ITALIC}{hint}{RESET}");
    }
}

pub fn print_shutdown() {
    println!();
    println!("  {GREEN}\u{2713}{RESET} {DIM}Tunnel closed.{RESET}");
    println!();
}

fn status_color(status: u16) -> &'static str {
    match status {
        200..=299 => GREEN,
        300..=399 => YELLOW,
        _ => RED,
    }
}

fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
