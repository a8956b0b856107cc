//! One peer link: routes channel frames and user commands to the two engines.
//!
//! ```text
//! ChannelEvent ──┐                    ┌─▶ ReceiveEngine  (meta, chunk, done, cancel*)
//!                ├─▶ PeerSession::run ┤
//! SessionCommand ┘                    └─▶ SendEngine     (ack, resume_req, pause_req, cancel*)
//! ```
//!
//! `cancel` goes to the receive side while it has an inbound transfer,
//! otherwise to the send side. Events are handled one at a time, so every
//! store write finishes before the next frame is looked at.

use std::sync::Arc;

use peerlink_db::ChunkStore;
use peerlink_types::{ChannelMessage, ControlFrame, Frame};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, DataChannel};
use crate::error::{Result, TransferError};
use crate::logging::TransferLogger;
use crate::receiver::{ReceiveEngine, ReceiveSnapshot};
use crate::sender::{EntryId, EntrySnapshot, SendEngine};
use crate::source::FileSource;

/// User-side requests for a running session.
pub enum SessionCommand {
    Enqueue {
        source: Box<dyn FileSource>,
        reply: Option<oneshot::Sender<Result<EntryId>>>,
    },
    Pause(EntryId),
    Resume(EntryId),
    Cancel(EntryId),
    ClearQueue,
    PauseIncoming,
    CancelIncoming,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub outgoing: Vec<EntrySnapshot>,
    pub incoming: Option<ReceiveSnapshot>,
}

pub struct PeerSession {
    room_id: String,
    channel: Box<dyn DataChannel>,
    sender: SendEngine,
    receiver: ReceiveEngine,
}

impl PeerSession {
    pub fn new(
        room_id: impl Into<String>,
        channel: Box<dyn DataChannel>,
        store: Arc<dyn ChunkStore>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        let room_id = room_id.into();
        Self {
            sender: SendEngine::new(room_id.clone(), store.clone(), logger.clone()),
            receiver: ReceiveEngine::new(room_id.clone(), store, logger),
            room_id,
            channel,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn sender(&self) -> &SendEngine {
        &self.sender
    }

    pub fn receiver(&self) -> &ReceiveEngine {
        &self.receiver
    }

    /// Pick up an inbound transfer left over from a previous run.
    pub fn rehydrate(&mut self) -> Result<Option<ReceiveSnapshot>> {
        self.receiver.rehydrate()
    }

    pub fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Open => {
                info!(room_id = %self.room_id, "Data channel open");
                self.sender.on_channel_open(self.channel.as_ref())
            }
            ChannelEvent::Close => {
                info!(room_id = %self.room_id, "Data channel closed");
                self.sender.on_channel_closed();
                self.receiver.on_channel_closed();
                Ok(())
            }
            ChannelEvent::Message(msg) => self.handle_frame(msg),
        }
    }

    pub fn handle_frame(&mut self, msg: ChannelMessage) -> Result<()> {
        let frame = Frame::try_from(msg)?;
        debug!(room_id = %self.room_id, frame = frame.kind(), "Frame received");
        let channel = self.channel.as_ref();

        match frame {
            Frame::Chunk(_)
            | Frame::Control(ControlFrame::Meta { .. })
            | Frame::Control(ControlFrame::Done) => self.receiver.handle_frame(channel, frame),

            Frame::Control(ControlFrame::Cancel) => {
                if self.receiver.has_active() {
                    self.receiver.on_cancel()
                } else {
                    self.sender.on_remote_cancel()?;
                    self.sender.drive_queue(channel)
                }
            }

            Frame::Control(control) => {
                let result = self.sender.handle_frame(channel, &control);
                if result.is_err() {
                    // A failed entry gives up the slot.
                    self.sender.drive_queue(channel)?;
                }
                result
            }
        }
    }

    pub fn handle_command(&mut self, command: SessionCommand) -> Result<()> {
        let channel = self.channel.as_ref();

        match command {
            SessionCommand::Enqueue { source, reply } => {
                let result = self.sender.enqueue(source);
                match reply {
                    Some(reply) => {
                        let queued = result.is_ok();
                        let _ = reply.send(result);
                        if queued {
                            self.sender.drive_queue(channel)?;
                        }
                        Ok(())
                    }
                    None => {
                        result?;
                        self.sender.drive_queue(channel)
                    }
                }
            }
            SessionCommand::Pause(id) => {
                self.sender.pause(id)?;
                self.sender.drive_queue(channel)
            }
            SessionCommand::Resume(id) => self.sender.resume(channel, id),
            SessionCommand::Cancel(id) => {
                self.sender.cancel(channel, id)?;
                self.sender.drive_queue(channel)
            }
            SessionCommand::ClearQueue => self.sender.clear_queue(channel).map(|_| ()),
            SessionCommand::PauseIncoming => self.receiver.request_pause(channel),
            SessionCommand::CancelIncoming => self.receiver.cancel(channel),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                Ok(())
            }
            SessionCommand::Shutdown => Ok(()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            outgoing: self.sender.entries(),
            incoming: self.receiver.current(),
        }
    }

    /// Process events and commands until shutdown. Returns the session so
    /// callers can inspect its final state.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let mut events_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if events_open => {
                    let event = match event {
                        Some(event) => event,
                        None => {
                            events_open = false;
                            ChannelEvent::Close
                        }
                    };
                    if let Err(e) = self.handle_event(event) {
                        warn!(room_id = %self.room_id, "Frame rejected: {}", e);
                    }
                }
                command = commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Shutdown) => break,
                        Some(command) => {
                            if let Err(e) = self.handle_command(command) {
                                warn!(room_id = %self.room_id, "Command failed: {}", e);
                            }
                        }
                    }
                }
            }
        }

        info!(room_id = %self.room_id, "Peer session stopped");
        self
    }

    /// Run the session on the tokio runtime.
    pub fn spawn(
        self,
        events: UnboundedReceiver<ChannelEvent>,
    ) -> (SessionHandle, JoinHandle<PeerSession>) {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(events, rx));
        (SessionHandle { commands: tx }, task)
    }
}

/// Cloneable front end for a spawned session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn enqueue(&self, source: Box<dyn FileSource>) -> Result<EntryId> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Enqueue {
            source,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn pause(&self, id: EntryId) -> Result<()> {
        self.send(SessionCommand::Pause(id)).await
    }

    pub async fn resume(&self, id: EntryId) -> Result<()> {
        self.send(SessionCommand::Resume(id)).await
    }

    pub async fn cancel(&self, id: EntryId) -> Result<()> {
        self.send(SessionCommand::Cancel(id)).await
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.send(SessionCommand::ClearQueue).await
    }

    pub async fn pause_incoming(&self) -> Result<()> {
        self.send(SessionCommand::PauseIncoming).await
    }

    pub async fn cancel_incoming(&self) -> Result<()> {
        self.send(SessionCommand::CancelIncoming).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> TransferError {
    TransferError::InvalidState("peer session has stopped".into())
}
