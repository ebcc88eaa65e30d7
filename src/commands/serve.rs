//! Run the three server endpoints and their hidden services.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use onionlink::crypto::{Ed25519Agent, KeyAgent};
use onionlink::lifecycle::ThreadManager;
use onionlink::onion::{ControlConnector, HiddenService, OnionMode, PortMapping, TorConnector};
use onionlink::store::{JsonNonceHistory, NonceHistory};
use onionlink::transport::{
    result_queue, ContactRequestServer, ContactResponseServer, MessageServer, ResultQueue,
    ServerRole, ServerWidget,
};
use onionlink::NodeConfig;

use super::{load_config, CommandExecutor};

/// Serve contact requests, contact responses and messages.
///
/// Every result event is printed to stdout as one JSON line. Close stdin
/// (Ctrl-D) to shut down cleanly.
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen locally only; do not publish hidden services
    #[arg(long)]
    pub no_onion: bool,
}

impl CommandExecutor for ServeCommand {
    fn execute(&self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let (queue, mut events) = result_queue();

        let agent: Arc<dyn KeyAgent> = Arc::new(Ed25519Agent::verifier());
        let history: Arc<dyn NonceHistory> =
            Arc::new(JsonNonceHistory::open(config.nonce_file()?));

        let endpoints: Vec<(u16, Arc<dyn ServerRole>)> = vec![
            (
                config.request_port,
                Arc::new(ContactRequestServer::new(agent)) as Arc<dyn ServerRole>,
            ),
            (
                config.response_port,
                Arc::new(ContactResponseServer::new(history)) as Arc<dyn ServerRole>,
            ),
            (config.message_port, Arc::new(MessageServer) as Arc<dyn ServerRole>),
        ];

        let mut servers = Vec::new();
        let mut services = Vec::new();
        for (port, role) in endpoints {
            let addr = config.bind_addr(port);
            let server = server_manager(addr, Arc::clone(&role), queue.clone());
            server
                .start()
                .with_context(|| format!("Failed to start {} on {}", role.name(), addr))?;
            servers.push(server);

            if !self.no_onion {
                let service = onion_manager(&config, role.name(), addr, queue.clone())?;
                service.start()?;
                services.push(service);
            }
        }
        drop(queue);

        let closed = Arc::new(AtomicBool::new(false));
        let watcher = Arc::clone(&closed);
        thread::spawn(move || {
            let _ = io::stdin().read_to_end(&mut Vec::new());
            watcher.store(true, Ordering::SeqCst);
        });

        while !closed.load(Ordering::SeqCst) {
            if let Some(event) = events.recv_timeout(Duration::from_millis(250)) {
                println!("{}", event.to_json());
            }
        }

        info!("shutting down");
        for service in &services {
            service.stop();
        }
        for server in &servers {
            server.stop();
        }
        while let Some(event) = events.try_recv() {
            println!("{}", event.to_json());
        }
        Ok(())
    }
}

fn server_manager(
    addr: SocketAddr,
    role: Arc<dyn ServerRole>,
    queue: ResultQueue,
) -> ThreadManager<ServerWidget> {
    ThreadManager::new(role.name(), move || {
        ServerWidget::bind(addr, Arc::clone(&role), queue.clone())
    })
}

fn onion_manager(
    config: &NodeConfig,
    name: &'static str,
    addr: SocketAddr,
    queue: ResultQueue,
) -> Result<ThreadManager<HiddenService>> {
    let mode = if config.persistent_onions {
        OnionMode::Persistent {
            key_dir: config.key_dir()?,
        }
    } else {
        OnionMode::Ephemeral
    };
    let connector: Arc<dyn ControlConnector> = Arc::new(TorConnector::new(
        config.control_addr(),
        config.control_auth.clone(),
    ));
    let poll_interval = config.poll_interval();
    // Tor needs a concrete target even when listening on all interfaces.
    let target = if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    };
    let ports = vec![PortMapping::same_port(target)];

    Ok(ThreadManager::new(format!("{}-onion", name), move || {
        Ok(HiddenService::new(
            name,
            ports.clone(),
            mode.clone(),
            Arc::clone(&connector),
            queue.clone(),
        )
        .with_poll_interval(poll_interval))
    }))
}
