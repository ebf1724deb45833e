use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, watch},
};
use tracing::{debug, info, warn};

use crate::{
    announce::deliver,
    cli::ClientArgs,
    directory::Roster,
    error::ClientError,
    wire::{ControlMessage, EventMessage, Member, read_frame, read_line, write_control},
};

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

/// Pause after a receive error that is not a stray ICMP report.
const RECV_BACKOFF: Duration = Duration::from_millis(200);

type SharedOutput<O> = Arc<Mutex<O>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let session = Session::connect(&args.name, args.server, args.advertise_ip).await?;
    session
        .run(BufReader::new(io::stdin()), io::stdout())
        .await
}

/// One participant's connection to the chat: its identity, the control
/// connection to the registry, its datagram socket and its mirror of the
/// other members.
pub struct Session {
    screen_name: String,
    control_reader: BufReader<OwnedReadHalf>,
    control_writer: OwnedWriteHalf,
    socket: Arc<UdpSocket>,
    udp_port: u16,
    peers: watch::Sender<Roster>,
}

impl Session {
    /// Binds the datagram socket, connects to the registry and completes the
    /// handshake. A taken name comes back as [`ClientError::NameConflict`].
    pub async fn connect(
        screen_name: &str,
        server: SocketAddr,
        advertise_ip: Ipv4Addr,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind((advertise_ip, 0)).await?;
        let udp_port = socket.local_addr()?.port();

        let stream = TcpStream::connect(server).await?;
        let (reader, mut control_writer) = stream.into_split();
        let mut control_reader = BufReader::new(reader);
        debug!(%server, udp_port, "connected to registry");

        let me = Member::new(screen_name, advertise_ip.to_string(), udp_port);
        let peers = handshake(&mut control_reader, &mut control_writer, &me).await?;
        info!(name = screen_name, peers = peers.len(), "handshake accepted");

        let (peers, _) = watch::channel(peers);
        Ok(Self {
            screen_name: screen_name.to_string(),
            control_reader,
            control_writer,
            socket: Arc::new(socket),
            udp_port,
            peers,
        })
    }

    pub fn screen_name(&self) -> &str {
        &self.screen_name
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn peers(&self) -> Roster {
        self.peers.borrow().clone()
    }

    /// Watches the peer mirror; stays valid after [`Session::run`] consumes
    /// the session.
    pub fn subscribe_peers(&self) -> watch::Receiver<Roster> {
        self.peers.subscribe()
    }

    /// Runs the receive loop in a background task and the send loop on the
    /// current one until the user quits or the registry goes away.
    pub async fn run<I, O>(self, input: I, output: O) -> Result<()>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            screen_name,
            mut control_reader,
            mut control_writer,
            socket,
            peers,
            ..
        } = self;
        let output = Arc::new(Mutex::new(output));

        emit(&output, &format!("*** connected as {screen_name}")).await?;
        let online = online_summary(&peers.borrow());
        if let Some(online) = online {
            emit(&output, &online).await?;
        }

        let outbox = peers.subscribe();
        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            screen_name.clone(),
            peers,
            Arc::clone(&output),
        ));

        let sender = SendLoop {
            screen_name: &screen_name,
            socket: &socket,
            peers: outbox,
        };
        let result = match sender.run(input, &mut control_reader).await {
            Ok(SendLoopExit::Quit) => leave(&mut control_writer, &output).await,
            Ok(SendLoopExit::ServerClosed) => {
                emit(&output, "*** server closed the connection")
                    .await
                    .map_err(anyhow::Error::from)
            }
            Err(err) => Err(err),
        };

        receiver.abort();
        let _ = receiver.await;
        result
    }
}

/// Sends HELO and waits for the registry's verdict. On acceptance returns
/// the current members, minus ourselves.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    me: &Member,
) -> Result<Roster, ClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_control(writer, &ControlMessage::Helo(me.clone())).await?;
    let line = read_line(reader)
        .await?
        .ok_or(ClientError::ConnectionClosed)?;

    match ControlMessage::decode(&line)? {
        ControlMessage::Acpt(records) => Ok(records
            .into_iter()
            .filter(|member| member.name != me.name)
            .map(|member| (member.name.clone(), member))
            .collect()),
        ControlMessage::Rjct { name } => Err(ClientError::NameConflict(name)),
        other => Err(ClientError::UnexpectedReply(other.to_string())),
    }
}

fn online_summary(peers: &Roster) -> Option<String> {
    if peers.is_empty() {
        return None;
    }
    let mut names: Vec<&str> = peers.keys().map(String::as_str).collect();
    names.sort_unstable();
    Some(format!("*** currently online: {}", names.join(", ")))
}

enum SendLoopExit {
    Quit,
    ServerClosed,
}

/// Reads user lines and fans each one out to the current peer snapshot.
struct SendLoop<'a> {
    screen_name: &'a str,
    socket: &'a UdpSocket,
    peers: watch::Receiver<Roster>,
}

impl SendLoop<'_> {
    async fn run<I, R>(&self, mut input: I, control: &mut R) -> Result<SendLoopExit>
    where
        I: AsyncBufRead + Unpin,
        R: AsyncBufRead + Unpin,
    {
        // Both reads may lose the race to another branch mid-line; the bytes
        // read so far stay in these buffers for the next pass.
        let mut typed = Vec::new();
        let mut control_frame = Vec::new();
        loop {
            select! {
                bytes_read = input.read_until(b'\n', &mut typed) => {
                    let keep_going = self.handle_input(bytes_read, &typed).await?;
                    typed.clear();
                    if !keep_going {
                        return Ok(SendLoopExit::Quit);
                    }
                }
                control_message = read_frame(control, &mut control_frame) => {
                    if !handle_control_message(control_message) {
                        return Ok(SendLoopExit::ServerClosed);
                    }
                }
                ctrl_c = tokio::signal::ctrl_c() => {
                    if let Err(error) = ctrl_c {
                        warn!(?error, "ctrl-c handler failed");
                    }
                    return Ok(SendLoopExit::Quit);
                }
            }
        }
    }

    async fn handle_input(&self, bytes_read: io::Result<usize>, input: &[u8]) -> Result<bool> {
        if bytes_read? == 0 && input.is_empty() {
            return Ok(false);
        }

        let input = String::from_utf8_lossy(input);
        let text = input.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Ok(true);
        }
        if text.eq_ignore_ascii_case("/quit") {
            return Ok(false);
        }

        self.broadcast_chat(text).await;
        Ok(true)
    }

    async fn broadcast_chat(&self, text: &str) {
        let recipients = self.peers.borrow().clone();
        let message = EventMessage::Mesg {
            sender: self.screen_name.to_string(),
            text: text.to_string(),
        };

        let report = deliver(self.socket, message.encode().as_bytes(), recipients.values()).await;
        for (name, error) in &report.failures {
            warn!(peer = %name, error = %error, "failed to send chat message");
        }
    }
}

/// The registry sends nothing after ACPT, so any readable outcome other
/// than an unexpected line means the control connection is gone.
fn handle_control_message(message: io::Result<Option<String>>) -> bool {
    match message {
        Ok(Some(line)) => {
            warn!(line, "ignoring unexpected control message");
            true
        }
        Ok(None) => false,
        Err(error) => {
            debug!(?error, "control connection failed");
            false
        }
    }
}

async fn leave<W, O>(control: &mut W, output: &SharedOutput<O>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    emit(output, "*** leaving chat").await?;
    if let Err(error) = write_control(control, &ControlMessage::Exit).await {
        warn!(?error, "failed to send EXIT to registry");
    }
    if let Err(error) = control.shutdown().await {
        warn!(?error, "failed to shutdown control connection cleanly");
    }
    Ok(())
}

async fn receive_loop<O>(
    socket: Arc<UdpSocket>,
    screen_name: String,
    peers: watch::Sender<Roster>,
    output: SharedOutput<O>,
) where
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                match receive_backoff(&error) {
                    Some(pause) => {
                        warn!(?error, "failed to receive datagram");
                        tokio::time::sleep(pause).await;
                    }
                    None => debug!(?error, "ignoring transient receive error"),
                }
                continue;
            }
        };

        let event = match EventMessage::from_datagram(&buf[..len]) {
            Ok(event) => event,
            Err(error) => {
                warn!(%from, %error, "dropping undecodable datagram");
                continue;
            }
        };

        if let Some(notice) = apply_event(&screen_name, &peers, event) {
            if let Err(error) = emit(&output, &notice).await {
                debug!(?error, "output closed; stopping receive loop");
                return;
            }
        }
    }
}

/// How long to wait before receiving again after `error`. Reports of an
/// unreachable peer surface on some platforms as reset/refused errors and do
/// not affect the socket itself.
fn receive_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(RECV_BACKOFF),
    }
}

/// Updates the peer mirror for one event and returns the line to show the
/// user, if any. Repeated JOIN/EXIT events for the same state are silent.
fn apply_event(
    screen_name: &str,
    peers: &watch::Sender<Roster>,
    event: EventMessage,
) -> Option<String> {
    match event {
        EventMessage::Mesg { sender, text } => Some(format!("{sender}: {text}")),
        EventMessage::Join(member) if member.name == screen_name => {
            Some(format!("*** joined the chat as {screen_name}"))
        }
        EventMessage::Join(member) => {
            let notice = format!("*** {} joined the chat", member.name);
            let added = peers.send_if_modified(|peers| {
                let previous = peers.insert(member.name.clone(), member.clone());
                previous.as_ref() != Some(&member)
            });
            added.then_some(notice)
        }
        EventMessage::Exit { name } => {
            let removed = peers.send_if_modified(|peers| peers.remove(&name).is_some());
            removed.then(|| format!("*** {name} left the chat"))
        }
    }
}

async fn emit<O>(output: &SharedOutput<O>, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    let mut output = output.lock().await;
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
