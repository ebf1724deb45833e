use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    announce::Announcer,
    directory::Directory,
    wire::{ControlMessage, EventMessage, Member, read_line, write_control},
};

/// The registry: owns the listening socket, the membership directory and the
/// announce worker.
pub struct Server {
    listener: TcpListener,
    state: Arc<RegistryState>,
    announce_worker: JoinHandle<()>,
}

impl Server {
    /// Must be called from within a Tokio runtime; the announce worker is
    /// spawned immediately.
    pub fn new(listener: TcpListener, announce_socket: UdpSocket) -> Self {
        let (announcer, announce_worker) = Announcer::spawn(announce_socket);
        Self {
            listener,
            state: Arc::new(RegistryState::new(announcer)),
            announce_worker,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            announce_worker,
        } = self;
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut handlers);
                }
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    reap_handler(finished);
                }
            }
        }

        handle_shutdown(state, handlers, announce_worker).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(
    state: Arc<RegistryState>,
    mut handlers: JoinSet<()>,
    announce_worker: JoinHandle<()>,
) {
    let members = state.directory.count().await;
    info!(members, connections = handlers.len(), "registry shutting down");
    handlers.shutdown().await;

    // The last Announcer handle lives in the state; dropping it lets the
    // worker drain its queue and stop.
    drop(state);
    if let Err(err) = announce_worker.await {
        warn!(error = ?err, "announce worker ended abnormally");
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RegistryState>,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn reap_handler(result: Result<(), JoinError>) {
    match result {
        Err(err) if err.is_panic() => warn!(error = ?err, "connection handler panicked"),
        _ => {}
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RegistryState>,
    handlers: &mut JoinSet<()>,
) {
    debug!(%peer, "accepted connection");
    let state = Arc::clone(state);
    handlers.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    });
}

pub(crate) struct RegistryState {
    directory: Directory,
    announcer: Announcer,
}

impl RegistryState {
    pub(crate) fn new(announcer: Announcer) -> Self {
        Self {
            directory: Directory::new(),
            announcer,
        }
    }
}

enum Handshake {
    Accepted(Member),
    Rejected(String),
    Abandoned,
}

enum Departure {
    Graceful,
    Disconnected,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RegistryState>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    serve_connection(BufReader::new(reader), writer, peer, &state).await
    // Both halves are dropped here, closing the socket on every path.
}

/// Drives one participant through `AwaitingHandshake -> Established -> Closed`.
///
/// Once a member has been admitted, every way out of the established state
/// removes it from the directory and announces its exit exactly once.
async fn serve_connection<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    state: &RegistryState,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let member = match await_handshake(&mut reader, &mut writer, peer, state).await? {
        Handshake::Accepted(member) => member,
        Handshake::Rejected(name) => {
            info!(%peer, name, "rejected duplicate screen name");
            return Ok(());
        }
        Handshake::Abandoned => {
            debug!(%peer, "connection closed before handshake");
            return Ok(());
        }
    };

    let outcome = serve_member(&mut reader, &mut writer, &member, state).await;
    depart(state, &member.name, &outcome).await;
    outcome.map(|_| ())
}

async fn await_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    state: &RegistryState,
) -> Result<Handshake>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(line) = read_line(reader).await? else {
        return Ok(Handshake::Abandoned);
    };

    let member = match ControlMessage::decode(&line)? {
        ControlMessage::Helo(member) => member,
        other => bail!("expected HELO, got {other}"),
    };

    // Datagram delivery uses the declared endpoint, so it must be an ip
    // literal; the TCP peer address is only checked against it.
    let endpoint = member.endpoint()?;
    if endpoint.ip() != peer.ip() {
        debug!(%peer, declared = %endpoint, "declared ip differs from connection peer");
    }

    if !state.directory.try_add(member.clone()).await {
        write_control(
            writer,
            &ControlMessage::Rjct {
                name: member.name.clone(),
            },
        )
        .await?;
        return Ok(Handshake::Rejected(member.name));
    }

    Ok(Handshake::Accepted(member))
}

async fn serve_member<R, W>(
    reader: &mut R,
    writer: &mut W,
    member: &Member,
    state: &RegistryState,
) -> Result<Departure>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let snapshot = state.directory.snapshot().await;
    let records = snapshot.values().cloned().collect();
    write_control(writer, &ControlMessage::Acpt(records)).await?;

    info!(name = member.name, ip = member.ip, udp_port = member.udp_port, "member joined");
    state
        .announcer
        .announce(&EventMessage::Join(member.clone()), snapshot);

    loop {
        let Some(line) = read_line(reader).await? else {
            return Ok(Departure::Disconnected);
        };
        match ControlMessage::decode(&line)? {
            ControlMessage::Exit => return Ok(Departure::Graceful),
            other => warn!(name = member.name, line = %other, "ignoring unexpected control message"),
        }
    }
}

async fn depart(state: &RegistryState, name: &str, outcome: &Result<Departure>) {
    if state.directory.remove(name).await.is_none() {
        return;
    }

    match outcome {
        Ok(Departure::Graceful) => info!(name, "member left"),
        Ok(Departure::Disconnected) => info!(name, "member disconnected without EXIT"),
        Err(err) => info!(name, error = %err, "member dropped after connection fault"),
    }

    let recipients = state.directory.snapshot().await;
    state.announcer.announce(
        &EventMessage::Exit {
            name: name.to_string(),
        },
        recipients,
    );
}
