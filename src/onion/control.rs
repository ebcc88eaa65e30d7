//! Tor control-protocol client.
//!
//! Replies are parsed per the Tor control protocol: `250-` continues a reply, `250 `
//! ends it, `250+` opens a data block terminated by a lone `.`.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::onion::{
    ControlConnector, ControlPort, ControllerError, OnionDescriptor, OnionKey, PortMapping,
};

/// How to prove ourselves to the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAuth {
    /// No credentials (`CookieAuthentication 0`, no password).
    #[default]
    Null,
    /// `HashedControlPassword`.
    Password(String),
    /// Contents of the controller's auth cookie file.
    Cookie(PathBuf),
}

impl ControlAuth {
    fn command(&self) -> Result<String, ControllerError> {
        match self {
            ControlAuth::Null => Ok("AUTHENTICATE".to_string()),
            ControlAuth::Password(password) => Ok(format!(
                "AUTHENTICATE \"{}\"",
                password.replace('\\', "\\\\").replace('"', "\\\"")
            )),
            ControlAuth::Cookie(path) => {
                let cookie = fs::read(path).map_err(|e| {
                    ControllerError::Auth(format!("cookie {}: {}", path.display(), e))
                })?;
                Ok(format!("AUTHENTICATE {}", hex::encode(cookie)))
            }
        }
    }
}

/// One controller connection.
pub struct TorControl {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    auth: ControlAuth,
}

impl TorControl {
    pub fn connect(addr: SocketAddr, auth: ControlAuth) -> Result<Self, ControllerError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| ControllerError::Connect(format!("{}: {}", addr, e)))?;
        let writer = stream.try_clone()?;
        debug!(%addr, "controller connected");
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            auth,
        })
    }

    /// Send one command and collect the lines of a successful reply.
    fn command(&mut self, line: &str) -> Result<Vec<String>, ControllerError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;

        let mut lines = Vec::new();
        loop {
            let reply = self.read_line()?;
            let (Some(code), Some(&kind), Some(text)) =
                (reply.get(..3), reply.as_bytes().get(3), reply.get(4..))
            else {
                return Err(ControllerError::Protocol(reply));
            };
            let code: u16 = code
                .parse()
                .map_err(|_| ControllerError::Protocol(reply.clone()))?;
            let text = text.to_string();

            match kind {
                b'-' => lines.push(text),
                b'+' => {
                    lines.push(text);
                    loop {
                        let data = self.read_line()?;
                        if data == "." {
                            break;
                        }
                        lines.push(data);
                    }
                }
                b' ' => {
                    if code != 250 {
                        return Err(ControllerError::Rejected {
                            code,
                            message: text,
                        });
                    }
                    lines.push(text);
                    return Ok(lines);
                }
                _ => return Err(ControllerError::Protocol(reply)),
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ControllerError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ControllerError::Protocol("controller closed the connection".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn add_onion(
        &mut self,
        key_spec: &str,
        flags: Option<&str>,
        ports: &[PortMapping],
    ) -> Result<OnionDescriptor, ControllerError> {
        let mut line = format!("ADD_ONION {}", key_spec);
        if let Some(flags) = flags {
            line.push_str(" Flags=");
            line.push_str(flags);
        }
        for port in ports {
            line.push_str(&format!(" Port={},{}", port.virtual_port, port.target));
        }
        parse_add_onion(&self.command(&line)?)
    }
}

impl ControlPort for TorControl {
    fn authenticate(&mut self) -> Result<(), ControllerError> {
        let line = self.auth.command()?;
        self.command(&line).map_err(|e| match e {
            ControllerError::Rejected { message, .. } => ControllerError::Auth(message),
            other => other,
        })?;
        info!("controller authenticated");
        Ok(())
    }

    fn create_ephemeral(
        &mut self,
        ports: &[PortMapping],
    ) -> Result<OnionDescriptor, ControllerError> {
        self.add_onion("NEW:ED25519-V3", None, ports)
    }

    fn create_from_key(
        &mut self,
        key: &OnionKey,
        ports: &[PortMapping],
    ) -> Result<OnionDescriptor, ControllerError> {
        let mut descriptor = self.add_onion(&key.to_string(), Some("DiscardPK"), ports)?;
        descriptor.private_key = Some(key.clone());
        Ok(descriptor)
    }

    fn remove(&mut self, service_id: &str) -> Result<(), ControllerError> {
        self.command(&format!("DEL_ONION {}", service_id))?;
        Ok(())
    }
}

fn parse_add_onion(lines: &[String]) -> Result<OnionDescriptor, ControllerError> {
    let mut service_id = None;
    let mut private_key = None;
    for line in lines {
        if let Some(id) = line.strip_prefix("ServiceID=") {
            service_id = Some(id.to_string());
        } else if let Some(key) = line.strip_prefix("PrivateKey=") {
            private_key = Some(OnionKey::parse(key).map_err(|_| {
                ControllerError::Protocol("unparseable PrivateKey in ADD_ONION reply".into())
            })?);
        }
    }
    let service_id = service_id
        .ok_or_else(|| ControllerError::Protocol("ADD_ONION reply lacks ServiceID".into()))?;
    Ok(OnionDescriptor {
        service_id,
        private_key,
    })
}

/// Opens [`TorControl`] connections to a fixed control port.
#[derive(Debug, Clone)]
pub struct TorConnector {
    addr: SocketAddr,
    auth: ControlAuth,
}

impl TorConnector {
    pub fn new(addr: SocketAddr, auth: ControlAuth) -> Self {
        Self { addr, auth }
    }
}

impl ControlConnector for TorConnector {
    fn connect(&self) -> Result<Box<dyn ControlPort>, ControllerError> {
        Ok(Box::new(TorControl::connect(self.addr, self.auth.clone())?))
    }
}
