use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use chat_relay::{
    client::Session,
    error::ClientError,
    server::Server,
    wire::read_line,
};
use tokio::{
    io::{AsyncWriteExt, BufReader, DuplexStream, duplex},
    net::{TcpListener, UdpSocket},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);

async fn start_registry() -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener, UdpSocket::bind("127.0.0.1:0").await?);
    let addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let _ = server
            .run_until(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    Ok((addr, shutdown_tx, task))
}

/// A session running in the background, driven through in-memory pipes.
struct RunningSession {
    input: DuplexStream,
    output: BufReader<DuplexStream>,
    task: JoinHandle<Result<()>>,
}

impl RunningSession {
    fn start(session: Session) -> Self {
        let (input, session_input) = duplex(4096);
        let (session_output, output) = duplex(4096);
        let task = tokio::spawn(session.run(BufReader::new(session_input), session_output));
        Self {
            input,
            output: BufReader::new(output),
            task,
        }
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.input.write_all(line.as_bytes()).await?;
        self.input.write_all(b"\n").await?;
        self.input.flush().await?;
        Ok(())
    }

    /// Signals end-of-input, as closing stdin would.
    async fn end_input(&mut self) -> Result<()> {
        self.input.shutdown().await?;
        Ok(())
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = timeout(WAIT, read_line(&mut self.output))
            .await
            .with_context(|| format!("timed out waiting for {expected:?}"))??
            .context("session output closed")?;
        assert_eq!(line, expected);
        Ok(())
    }

    async fn finish(self) -> Result<()> {
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

#[tokio::test]
async fn two_sessions_converge_chat_and_leave() -> Result<()> {
    let (addr, shutdown, registry) = start_registry().await?;

    let alice = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await?;
    assert_eq!(alice.screen_name(), "alice");
    assert_ne!(alice.udp_port(), 0);
    assert!(alice.peers().is_empty());
    let mut alice_peers = alice.subscribe_peers();
    let mut alice = RunningSession::start(alice);
    alice.expect_line("*** connected as alice").await?;
    alice.expect_line("*** joined the chat as alice").await?;

    let bob = Session::connect("bob", addr, Ipv4Addr::LOCALHOST).await?;
    assert_eq!(bob.peers().keys().collect::<Vec<_>>(), vec!["alice"]);
    let mut bob_peers = bob.subscribe_peers();
    let mut bob = RunningSession::start(bob);
    bob.expect_line("*** connected as bob").await?;
    bob.expect_line("*** currently online: alice").await?;
    bob.expect_line("*** joined the chat as bob").await?;

    alice.expect_line("*** bob joined the chat").await?;
    timeout(WAIT, alice_peers.wait_for(|peers| peers.contains_key("bob"))).await??;

    bob.say("hi").await?;
    alice.expect_line("bob: hi").await?;

    alice.say("meet at 10:30").await?;
    bob.expect_line("alice: meet at 10:30").await?;

    alice.say("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    alice.finish().await?;

    bob.expect_line("*** alice left the chat").await?;
    timeout(WAIT, bob_peers.wait_for(|peers| peers.is_empty())).await??;

    bob.end_input().await?;
    bob.expect_line("*** leaving chat").await?;
    bob.finish().await?;

    let _ = shutdown.send(());
    let _ = registry.await;
    Ok(())
}

#[tokio::test]
async fn taken_name_fails_before_any_loop_starts() -> Result<()> {
    let (addr, shutdown, registry) = start_registry().await?;

    let _alice = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await?;
    let rejected = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await;
    assert!(
        matches!(rejected, Err(ClientError::NameConflict(ref name)) if name == "alice"),
        "expected a name conflict"
    );

    let _ = shutdown.send(());
    let _ = registry.await;
    Ok(())
}

#[tokio::test]
async fn session_ends_when_registry_goes_away() -> Result<()> {
    let (addr, shutdown, registry) = start_registry().await?;

    let session = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await?;
    let mut alice = RunningSession::start(session);
    alice.expect_line("*** connected as alice").await?;
    alice.expect_line("*** joined the chat as alice").await?;

    let _ = shutdown.send(());
    let _ = registry.await;

    alice.expect_line("*** server closed the connection").await?;
    alice.finish().await
}

#[tokio::test]
async fn undecodable_datagrams_are_skipped() -> Result<()> {
    let (addr, shutdown, registry) = start_registry().await?;

    let session = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await?;
    let alice_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, session.udp_port()));
    let mut alice = RunningSession::start(session);
    alice.expect_line("*** connected as alice").await?;
    alice.expect_line("*** joined the chat as alice").await?;

    let stranger = UdpSocket::bind("127.0.0.1:0").await?;
    let junk: [&[u8]; 4] = [b"BOGUS\n", b"\xff\xfe", b"JOIN x", b"MESG nocolon\n"];
    for datagram in junk {
        stranger.send_to(datagram, alice_addr).await?;
    }
    stranger.send_to(b"MESG bob: still here\n", alice_addr).await?;
    alice.expect_line("bob: still here").await?;

    alice.end_input().await?;
    alice.expect_line("*** leaving chat").await?;
    alice.finish().await?;

    let _ = shutdown.send(());
    let _ = registry.await;
    Ok(())
}

#[tokio::test]
async fn partial_input_survives_control_chatter() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    let bob_port = bob.local_addr()?.port();

    // A registry that admits alice next to bob and keeps the connection open.
    let registry = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut control = BufReader::new(stream);
        read_line(&mut control).await?.context("expected HELO")?;
        control
            .get_mut()
            .write_all(format!("ACPT bob 127.0.0.1 {bob_port}\n").as_bytes())
            .await?;
        anyhow::Ok(control)
    });

    let session = Session::connect("alice", addr, Ipv4Addr::LOCALHOST).await?;
    let mut control = registry.await??;
    let mut alice = RunningSession::start(session);
    alice.expect_line("*** connected as alice").await?;
    alice.expect_line("*** currently online: bob").await?;

    alice.input.write_all(b"hel").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    control.get_mut().write_all(b"NOISE\n").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.say("lo").await?;

    let mut buf = [0u8; 1024];
    let (len, _) = timeout(WAIT, bob.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..len], b"MESG alice: hello\n");

    alice.say("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    alice.finish().await?;

    let exit = timeout(WAIT, read_line(&mut control)).await??;
    assert_eq!(exit.as_deref(), Some("EXIT"));
    Ok(())
}
