//! LAN Peer Node
//!
//! A console host for the peer network that:
//! - Announces itself over multicast and links to every peer it hears
//! - Shares each line typed on stdin as clipboard text with all peers
//! - Sends `/msg <text>` lines as plain text messages
//! - Applies clipboard updates from peers to a local clipboard buffer

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peer_net::{
    Clipboard, Connection, ConnectionManager, CoreHandler, ErrorMessage, FileContent, HostSink,
    NetConfig, ProtocolMessage, TextMessage,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

// ============================================================================
// Constants
// ============================================================================

/// How long each dispatch pass waits for network events
const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Prefix that turns a stdin line into a text message
const TEXT_PREFIX: &str = "/msg ";

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --config <path>       JSON settings file
    // --stream-port <port>  TCP port to listen on (0 picks one)
    // --hostname <name>     Name announced to peers
    // --no-discovery        Do not join the multicast group

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => NetConfig::load(&path)?,
        None => NetConfig::default(),
    };
    if let Some(port) = parse_arg(&args, "--stream-port") {
        config.stream_port = port.parse().map_err(|_| "Invalid stream port")?;
    }
    if let Some(hostname) = parse_arg(&args, "--hostname") {
        config.hostname = hostname;
    }
    if args.iter().any(|a| a == "--no-discovery") {
        config.discovery_enabled = false;
    }

    log::info!("LAN Peer Node starting...");
    log::info!("  Stream:    {}:{}", config.stream_ip, config.stream_port);
    log::info!(
        "  Discovery: {}",
        if config.discovery_enabled {
            format!("{}:{}", config.discovery_group, config.discovery_port)
        } else {
            "disabled".to_string()
        }
    );

    let manager = ConnectionManager::new(config);
    let sink = Arc::new(ConsoleSink::default());
    CoreHandler::install(&manager, sink.clone());
    manager.startup()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown))?;
    spawn_stdin_reader(manager.clone(), Arc::clone(&shutdown))?;

    while !shutdown.load(Ordering::Relaxed) {
        manager.dispatch_for(DISPATCH_INTERVAL);
    }

    log::info!("Shutting down...");
    manager.shutdown();
    // Deliver the CLOSED events raised by shutdown
    manager.dispatch_pending();

    if let Some(text) = sink.clipboard.lock().as_deref() {
        log::info!("Final clipboard: {} characters", text.chars().count());
    }
    log::info!("Final metrics:\n{}", manager.render_metrics());
    Ok(())
}

/// Parse a command line argument value
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Map a stdin line to the message it should broadcast.
fn line_to_message(line: &str) -> Option<ProtocolMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    match line.strip_prefix(TEXT_PREFIX) {
        Some(text) => Some(TextMessage::new(text).into()),
        None => Some(Clipboard::new(line).into()),
    }
}

// ============================================================================
// Background Threads
// ============================================================================

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {}, initiating shutdown...", sig);
                shutdown.store(true, Ordering::Relaxed);
            }
        })?;
    Ok(())
}

/// Broadcast stdin lines until EOF, which also ends the node.
fn spawn_stdin_reader(manager: ConnectionManager, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("stdin read failed: {}", e);
                        break;
                    }
                };
                if let Some(message) = line_to_message(&line) {
                    log::debug!("Broadcasting {} to {} peers", message, manager.connection_count());
                    manager.broadcast(&message);
                }
            }
            shutdown.store(true, Ordering::Relaxed);
        })?;
    Ok(())
}

// ============================================================================
// Console Host
// ============================================================================

/// Host sink that writes to the log and keeps the clipboard in memory.
#[derive(Default)]
struct ConsoleSink {
    clipboard: Mutex<Option<String>>,
}

impl HostSink for ConsoleSink {
    fn log_line(&self, line: &str) {
        log::info!("{}", line);
    }

    fn set_clipboard(&self, text: &str) {
        *self.clipboard.lock() = Some(text.to_string());
    }

    fn file_received(&self, from: &Connection, file: &FileContent) {
        log::info!(
            "{} sent {} ({} bytes)",
            from.hostname(),
            file.relative_name,
            file.content.len()
        );
    }

    fn text_received(&self, from: &Connection, message: &TextMessage) {
        println!("<{}> {}", from.hostname(), message.text);
    }

    fn error_received(&self, from: &Connection, error: &ErrorMessage) {
        log::warn!("{} reported error {}: {}", from.hostname(), error.code, error.text);
    }
}
