//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod keygen;
mod send;
mod serve;

pub use keygen::KeygenCommand;
pub use send::{MessageCommand, RequestCommand, RespondCommand};
pub use serve::ServeCommand;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use onionlink::lifecycle::ThreadManager;
use onionlink::store::NonceHistory;
use onionlink::transport::{result_queue, ClientRole, ClientWidget, Dialer, ResultEvent};
use onionlink::{Envelope, NodeConfig};

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Load `path`, or the default config location when none is given.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => NodeConfig::default_path()?,
    };
    NodeConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Split `host:port`.
fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Expected <host>:<port>, got {:?}", target))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in {:?}", target))?;
    Ok((host.to_string(), port))
}

fn dialer(config: &NodeConfig, direct: bool) -> Dialer {
    if direct {
        Dialer::Direct
    } else {
        Dialer::Socks5 {
            proxy: config.socks_proxy,
        }
    }
}

/// Everything needed to run one client exchange.
struct Delivery {
    target: String,
    envelope: Envelope,
    dialer: Dialer,
    history: Option<Arc<dyn NonceHistory>>,
    config: NodeConfig,
}

impl Delivery {
    /// Run the exchange on a client thread, print its event as JSON and
    /// fail if it was an error.
    fn run(self) -> Result<()> {
        let (host, port) = parse_target(&self.target)?;
        let (queue, mut events) = result_queue();

        let Delivery {
            envelope,
            dialer,
            history,
            config,
            ..
        } = self;
        let manager = ThreadManager::new("client", move || {
            let mut role = ClientRole::new(host.clone(), port, envelope.clone(), dialer.clone())
                .with_reply_timeout(config.reply_timeout());
            if let Some(history) = &history {
                role = role.with_history(Arc::clone(history));
            }
            Ok(ClientWidget::new(role, queue.clone()))
        });

        manager.start()?;
        let event = events
            .recv_blocking()
            .ok_or_else(|| anyhow!("Client finished without reporting"))?;
        manager.stop();

        println!("{}", event.to_json());
        match event {
            ResultEvent::ClientError { error, .. } => Err(anyhow!(error)),
            _ => Ok(()),
        }
    }
}
