//! Broker assembly: the shared connection state, the listeners, and the
//! single-threaded executor they run on.

use crate::config::{ListenerConfig, RuntimeConfig};
use crate::conn::{Connection, Registry};
use crate::policy::Policy;
use crate::transport::byte::{ByteReader, ByteWriter};
use crate::transport::frame;

use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;

/// The state every connection shares: the live-connection registry and the
/// installed policy.
pub struct Broker {
    registry: Registry,
    policy: Box<dyn Policy>,
}

impl Broker {
    pub fn new(policy: Box<dyn Policy>) -> Rc<Broker> {
        Rc::new(Broker {
            registry: Registry::new(),
            policy,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }
}

/// Binds the configured listeners and drives all connections on one
/// current-thread executor. The whole broker is cooperatively scheduled;
/// nothing here is safe to drive from multiple threads.
pub struct Runtime {
    config: RuntimeConfig,
    broker: Rc<Broker>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, policy: Box<dyn Policy>) -> Runtime {
        Runtime {
            config,
            broker: Broker::new(policy),
        }
    }

    pub fn broker(&self) -> Rc<Broker> {
        Rc::clone(&self.broker)
    }

    /// Runs the broker until the process is stopped.
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, self.serve())
    }

    async fn serve(self) -> Result<()> {
        if self.config.tcp.is_empty() && self.config.websocket.is_empty() {
            anyhow::bail!("no listeners configured");
        }
        for listener in self.config.tcp.clone() {
            let socket = TcpListener::bind(listener.address.as_str())
                .await
                .with_context(|| format!("failed to bind tcp://{}", listener.address))?;
            log::info!("listening on tcp://{}", listener.address);
            tokio::task::spawn_local(accept_byte_streams(
                Rc::clone(&self.broker),
                socket,
                listener,
            ));
        }
        for listener in self.config.websocket.clone() {
            let socket = TcpListener::bind(listener.address.as_str())
                .await
                .with_context(|| format!("failed to bind ws://{}", listener.address))?;
            log::info!("listening on ws://{}", listener.address);
            tokio::task::spawn_local(accept_frame_streams(
                Rc::clone(&self.broker),
                socket,
                listener,
            ));
        }
        futures_util::future::pending().await
    }
}

async fn accept_byte_streams(broker: Rc<Broker>, socket: TcpListener, listener: ListenerConfig) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                log::debug!("accepted byte-stream connection from {}", peer);
                let (read, write) = stream.into_split();
                Connection::spawn(
                    Rc::clone(&broker),
                    Box::new(ByteReader::new(read)),
                    Box::new(ByteWriter::new(write)),
                    true,
                    listener.server_id,
                );
            }
            Err(err) => {
                log::error!("accept failed on tcp://{}: {}", listener.address, err);
                return;
            }
        }
    }
}

async fn accept_frame_streams(broker: Rc<Broker>, socket: TcpListener, listener: ListenerConfig) {
    loop {
        match socket.accept().await {
            Ok((stream, peer)) => {
                log::debug!("accepted frame-stream connection from {}", peer);
                tokio::task::spawn_local(upgrade_frame_stream(
                    Rc::clone(&broker),
                    stream,
                    listener.server_id,
                ));
            }
            Err(err) => {
                log::error!("accept failed on ws://{}: {}", listener.address, err);
                return;
            }
        }
    }
}

async fn upgrade_frame_stream(broker: Rc<Broker>, stream: TcpStream, server_id: usize) {
    match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => {
            let (reader, writer) = frame::split(ws);
            Connection::spawn(broker, Box::new(reader), Box::new(writer), false, server_id);
        }
        Err(err) => log::warn!("websocket handshake failed: {}", err),
    }
}
