use anyhow::Result;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    directory::Roster,
    wire::{EventMessage, Member},
};

/// Outcome of one best-effort fan-out.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Sends `payload` to every recipient's datagram endpoint.
///
/// A failed send is recorded and the loop moves on to the next recipient.
pub async fn deliver<'a, I>(socket: &UdpSocket, payload: &[u8], recipients: I) -> BroadcastReport
where
    I: IntoIterator<Item = &'a Member>,
{
    let mut report = BroadcastReport::default();
    for member in recipients {
        match send_to_member(socket, payload, member).await {
            Ok(()) => report.delivered.push(member.name.clone()),
            Err(err) => report.failures.push((member.name.clone(), err)),
        }
    }
    report
}

async fn send_to_member(socket: &UdpSocket, payload: &[u8], member: &Member) -> Result<()> {
    let endpoint = member.endpoint()?;
    socket.send_to(payload, endpoint).await?;
    Ok(())
}

struct Announcement {
    payload: String,
    recipients: Roster,
}

/// Handle to the background worker that pushes membership events.
///
/// Announcements are queued and delivered in the order they were made, so a
/// member's JOIN always goes out before its EXIT.
#[derive(Clone)]
pub struct Announcer {
    queue: mpsc::UnboundedSender<Announcement>,
}

impl Announcer {
    pub fn spawn(socket: UdpSocket) -> (Self, JoinHandle<()>) {
        let (queue, inbox) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(socket, inbox));
        (Self { queue }, worker)
    }

    /// Queues `event` for every member of `recipients` and returns at once.
    pub fn announce(&self, event: &EventMessage, recipients: Roster) {
        let announcement = Announcement {
            payload: event.encode(),
            recipients,
        };
        if self.queue.send(announcement).is_err() {
            warn!(%event, "announce worker has stopped; dropping event");
        }
    }
}

async fn run_worker(socket: UdpSocket, mut inbox: mpsc::UnboundedReceiver<Announcement>) {
    while let Some(Announcement {
        payload,
        recipients,
    }) = inbox.recv().await
    {
        let report = deliver(&socket, payload.as_bytes(), recipients.values()).await;
        debug!(
            event = payload.trim_end(),
            delivered = report.delivered.len(),
            "announce sent"
        );
        for (name, error) in &report.failures {
            warn!(recipient = %name, error = %error, "announce delivery failed");
        }
    }
    debug!("announce worker stopped");
}
