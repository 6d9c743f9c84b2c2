//! The sync engine: one task that owns all client-side chat state.
//!
//! Commands from [`EngineHandle`] and results from background tasks arrive
//! on a single inbox and are handled one at a time, to completion, so no two
//! handlers ever race on the feed, the typing set or the unread cache.
//! Anything that waits on the data service runs in a spawned task and posts
//! its result back to the inbox.

use std::future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parlor_types::events::{
    Broadcast, ChangeEvent, ChangeFilter, ChangeKind, TYPING_EVENT, Table, TypingPayload,
};
use parlor_types::models::{FeedEntry, Message, TypingUser, UnreadMark};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::decode;
use crate::error::{Result, SyncError};
use crate::service::DataService;
use crate::session::{FeedView, RoomSession, StreamToken};
use crate::unread::{RefreshTicket, UnreadCounter, UnreadView};
use crate::watermark::{WatermarkSnapshot, WatermarkStore, Watermarks};

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub name: String,
}

enum Command {
    OpenRoom(Uuid),
    CloseRoom,
    Resync,
    SignalTyping,
    MarkRead(Uuid),
    RefreshUnread(Option<oneshot::Sender<Result<UnreadView>>>),
    SendMessage {
        body: String,
        reply: oneshot::Sender<Result<Message>>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Inbox {
    Command(Command),

    // Open room streams
    Backfill {
        token: StreamToken,
        result: anyhow::Result<Vec<FeedEntry>>,
    },
    LiveUp {
        token: StreamToken,
    },
    RoomChange {
        token: StreamToken,
        event: ChangeEvent,
    },
    LiveEnded {
        token: StreamToken,
        reason: String,
    },
    TypingJoined {
        token: StreamToken,
        sender: crate::service::TypingSender,
    },
    TypingReceived {
        token: StreamToken,
        broadcast: Broadcast,
    },
    ProfileResolved {
        session: u64,
        user_id: Uuid,
        name: Option<String>,
    },
    MessageSent {
        room_id: Uuid,
        result: anyhow::Result<Message>,
        reply: oneshot::Sender<Result<Message>>,
    },

    // Unread tracking
    GlobalReady,
    GlobalChange(ChangeEvent),
    GlobalEnded {
        reason: String,
        resubscribe: bool,
    },
    UnreadRefreshed {
        ticket: RefreshTicket,
        result: anyhow::Result<Vec<(Uuid, Vec<UnreadMark>)>>,
        reply: Option<oneshot::Sender<Result<UnreadView>>>,
    },
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Inbox>,
    feed: watch::Receiver<FeedView>,
    typing: watch::Receiver<Vec<TypingUser>>,
    unread: watch::Receiver<UnreadView>,
}

impl EngineHandle {
    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(Inbox::Command(command))
            .map_err(|_| SyncError::EngineClosed)
    }

    /// Opens a room: marks it read, then starts its backfill and live
    /// streams. Any room already open is closed first.
    pub fn open_room(&self, room_id: Uuid) -> Result<()> {
        self.command(Command::OpenRoom(room_id))
    }

    /// Closes the open room, if any, and stamps it read.
    pub fn close_room(&self) -> Result<()> {
        self.command(Command::CloseRoom)
    }

    /// Re-runs backfill and re-subscribes the open room, keeping what the
    /// feed already holds. The way out of a Stale or Failed feed.
    pub fn resync(&self) -> Result<()> {
        self.command(Command::Resync)
    }

    pub fn signal_typing(&self) -> Result<()> {
        self.command(Command::SignalTyping)
    }

    pub fn mark_read(&self, room_id: Uuid) -> Result<()> {
        self.command(Command::MarkRead(room_id))
    }

    /// Recounts every room and returns the resulting view.
    pub async fn refresh_unread(&self) -> Result<UnreadView> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RefreshUnread(Some(reply)))?;
        rx.await.map_err(|_| SyncError::EngineClosed)?
    }

    /// Posts to the open room. The body is trimmed first.
    pub async fn send_message(&self, body: impl Into<String>) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendMessage {
            body: body.into(),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::EngineClosed)?
    }

    /// Waits until every command sent before this one has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.command(Command::Flush(ack))?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Stops the engine after closing the open room and persisting
    /// outstanding watermarks.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.command(Command::Shutdown(ack))?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub fn feed(&self) -> watch::Receiver<FeedView> {
        self.feed.clone()
    }

    pub fn typing(&self) -> watch::Receiver<Vec<TypingUser>> {
        self.typing.clone()
    }

    pub fn unread(&self) -> watch::Receiver<UnreadView> {
        self.unread.clone()
    }
}

pub struct Engine<S: DataService, W: WatermarkStore, C: Clock> {
    identity: Identity,
    config: EngineConfig,
    service: S,
    clock: C,
    watermarks: Watermarks<W>,
    counter: UnreadCounter,
    session: Option<RoomSession>,
    next_token: u64,
    global_task: Option<JoinHandle<()>>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
    feed_tx: watch::Sender<FeedView>,
    typing_tx: watch::Sender<Vec<TypingUser>>,
    unread_tx: watch::Sender<UnreadView>,
}

impl<S: DataService, W: WatermarkStore, C: Clock> Engine<S, W, C> {
    /// Starts the engine on the current tokio runtime.
    pub fn spawn(
        identity: Identity,
        config: EngineConfig,
        service: S,
        store: Arc<W>,
        clock: C,
    ) -> EngineHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed) = watch::channel(FeedView::idle());
        let (typing_tx, typing) = watch::channel(Vec::new());
        let (unread_tx, unread) = watch::channel(UnreadView::default());

        let handle = EngineHandle {
            tx: inbox_tx.clone(),
            feed,
            typing,
            unread,
        };

        let mut engine = Self {
            watermarks: Watermarks::new(identity.user_id, store),
            counter: UnreadCounter::new(identity.user_id),
            identity,
            config,
            service,
            clock,
            session: None,
            next_token: 0,
            global_task: None,
            inbox_tx,
            inbox_rx,
            feed_tx,
            typing_tx,
            unread_tx,
        };
        engine.start_global_stream();
        tokio::spawn(engine.run());

        handle
    }

    async fn run(mut self) {
        self.watermarks.load().await;
        info!("{} ({}) sync engine started", self.identity.name, self.identity.user_id);
        let mut shutdown_ack = None;

        loop {
            let deadline = self.session.as_ref().and_then(RoomSession::next_typing_deadline);

            tokio::select! {
                item = self.inbox_rx.recv() => {
                    let Some(item) = item else {
                        break;
                    };
                    if let ControlFlow::Break(ack) = self.handle(item) {
                        shutdown_ack = Some(ack);
                        break;
                    }
                }
                _ = wait_until(deadline) => self.expire_typing(),
            }
        }

        self.inbox_rx.close();
        self.close_room();
        if let Some(task) = self.global_task.take() {
            task.abort();
        }
        self.watermarks.close().await;
        info!("{} ({}) sync engine stopped", self.identity.name, self.identity.user_id);

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Breaks with the acknowledgement channel when asked to shut down.
    fn handle(&mut self, item: Inbox) -> ControlFlow<oneshot::Sender<()>> {
        match item {
            Inbox::Command(command) => return self.handle_command(command),

            Inbox::Backfill { token, result } => self.on_backfill(token, result),
            Inbox::LiveUp { token } => {
                if let Some(session) = self.session_for(token) {
                    session.live_up();
                    self.publish_feed();
                }
            }
            Inbox::RoomChange { token, event } => self.on_room_change(token, event),
            Inbox::LiveEnded { token, reason } => {
                if let Some(session) = self.session_for(token) {
                    let room_id = session.room_id;
                    session.live_lost(reason.clone());
                    warn!("{}", SyncError::SubscriptionLost { room_id: Some(room_id), reason });
                    self.publish_feed();
                }
            }
            Inbox::TypingJoined { token, sender } => {
                if let Some(session) = self.session_for(token) {
                    session.set_typing_sender(sender);
                }
            }
            Inbox::TypingReceived { token, broadcast } => self.on_typing(token, broadcast),
            Inbox::ProfileResolved { session, user_id, name } => {
                let changed = match self.session.as_mut() {
                    Some(current) if current.owns(session) => current.resolve_name(user_id, name),
                    _ => false,
                };
                if changed {
                    self.publish_feed();
                }
            }
            Inbox::MessageSent { room_id, result, reply } => self.on_message_sent(room_id, result, reply),

            Inbox::GlobalReady => {
                debug!("Unread tracker subscribed to all rooms");
                self.refresh_unread(None);
            }
            Inbox::GlobalChange(event) => self.on_global_change(event),
            Inbox::GlobalEnded { reason, resubscribe } => {
                warn!("{}", SyncError::SubscriptionLost { room_id: None, reason });
                self.global_task = None;
                if resubscribe {
                    // GlobalReady recounts everything the dropped stream missed.
                    self.start_global_stream();
                }
            }
            Inbox::UnreadRefreshed { ticket, result, reply } => self.on_unread_refreshed(ticket, result, reply),
        }
        ControlFlow::Continue(())
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::OpenRoom(room_id) => self.open_room(room_id),
            Command::CloseRoom => self.close_room(),
            Command::Resync => self.resync(),
            Command::SignalTyping => self.signal_typing(),
            Command::MarkRead(room_id) => self.mark_read(room_id),
            Command::RefreshUnread(reply) => self.refresh_unread(reply),
            Command::SendMessage { body, reply } => self.send_message(body, reply),
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    // -- Room lifecycle --

    fn open_room(&mut self, room_id: Uuid) {
        self.close_room();

        let session_id = self.next_token();
        let token = StreamToken {
            session: session_id,
            stream: session_id,
        };

        // Zero and stamp before anything else for this room is handled, so a
        // message landing during the switch is either before the watermark or
        // shown in the open feed, never both.
        self.counter.set_open_room(Some(room_id));
        self.mark_read(room_id);

        self.session = Some(RoomSession::new(room_id, token, &self.config));
        self.start_room_streams();

        info!("{} opened room {} (session {})", self.identity.name, room_id, session_id);
        self.publish_feed();
        self.publish_typing();
    }

    fn close_room(&mut self) {
        let Some(session) = self.session.take() else {
            trace!("close_room with no room open");
            return;
        };
        let room_id = session.room_id;
        drop(session);

        self.counter.set_open_room(None);
        self.mark_read(room_id);

        info!("{} closed room {}", self.identity.name, room_id);
        self.publish_feed();
        self.publish_typing();
    }

    fn resync(&mut self) {
        let stream = self.next_token();
        let Some(session) = self.session.as_mut() else {
            debug!("resync with no room open");
            return;
        };
        session.restart(stream);
        info!("Resyncing room {}", session.room_id);
        self.start_room_streams();
        self.publish_feed();
    }

    fn start_room_streams(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let room_id = session.room_id;
        let token = session.token();

        // Subscribe and backfill concurrently; the feed's id dedup absorbs
        // whatever both of them deliver.
        session.track(tokio::spawn(forward_room_changes(
            self.service.clone(),
            room_id,
            token,
            self.inbox_tx.clone(),
        )));
        session.track(tokio::spawn(fetch_backfill(
            self.service.clone(),
            room_id,
            self.config.backfill_limit,
            token,
            self.inbox_tx.clone(),
        )));
        session.track(tokio::spawn(forward_typing(
            self.service.clone(),
            room_id,
            token,
            self.inbox_tx.clone(),
        )));
    }

    fn session_for(&mut self, token: StreamToken) -> Option<&mut RoomSession> {
        match self.session.as_mut() {
            Some(session) if session.accepts(token) => Some(session),
            _ => {
                trace!("Dropping event from stale stream {:?}", token);
                None
            }
        }
    }

    fn on_backfill(&mut self, token: StreamToken, result: anyhow::Result<Vec<FeedEntry>>) {
        let Some(session) = self.session_for(token) else {
            return;
        };
        match result {
            Ok(entries) => {
                session.apply_backfill(entries);
            }
            Err(e) => {
                let err = SyncError::fetch(format!("backfill for room {}", session.room_id), e);
                warn!("{}", err);
                session.fail_backfill(err.to_string());
            }
        }
        self.publish_feed();
    }

    fn on_room_change(&mut self, token: StreamToken, event: ChangeEvent) {
        let Some(session) = self.session_for(token) else {
            return;
        };

        match event.kind {
            ChangeKind::Insert => {
                let message = match decode::message(&event) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping room event: {}", e);
                        return;
                    }
                };
                if message.room_id != session.room_id {
                    warn!("Dropping message {} for room {} on room {} stream", message.id, message.room_id, session.room_id);
                    return;
                }

                let session_id = session.token().session;
                let outcome = session.apply_insert(message);
                if let Some(user_id) = outcome.lookup {
                    self.lookup_profile(session_id, user_id);
                }
                if outcome.feed_changed {
                    self.publish_feed();
                }
                if outcome.typing_changed {
                    self.publish_typing();
                }
            }
            ChangeKind::Delete => match decode::deleted_id(&event) {
                Ok(message_id) => {
                    if session.apply_delete(message_id) {
                        self.publish_feed();
                    }
                }
                Err(e) => warn!("Dropping room event: {}", e),
            },
        }
    }

    fn lookup_profile(&self, session: u64, user_id: Uuid) {
        let service = self.service.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let name = match service.profile_name(user_id).await {
                Ok(name) => name,
                Err(e) => {
                    warn!("Profile lookup for {} failed: {}", user_id, e);
                    None
                }
            };
            let _ = tx.send(Inbox::ProfileResolved { session, user_id, name });
        });
    }

    // -- Typing --

    fn on_typing(&mut self, token: StreamToken, broadcast: Broadcast) {
        let self_id = self.identity.user_id;
        let Some(session) = self.session_for(token) else {
            return;
        };
        let payload = match decode::typing(&broadcast) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping typing signal: {}", e);
                return;
            }
        };
        if session.apply_typing(&payload, self_id, Instant::now()) {
            self.publish_typing();
        }
    }

    fn signal_typing(&mut self) {
        let Some(session) = self.session.as_mut() else {
            debug!("signal_typing with no room open");
            return;
        };
        let Some(sender) = session.typing_slot(Instant::now()) else {
            trace!("Typing signal suppressed");
            return;
        };

        let payload = TypingPayload {
            user_id: self.identity.user_id,
            name: self.identity.name.clone(),
            room_id: session.room_id,
            emitted_at: self.clock.now(),
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => sender.send(Broadcast {
                event: TYPING_EVENT.to_string(),
                payload,
            }),
            Err(e) => warn!("Could not encode typing signal: {}", e),
        }
    }

    fn expire_typing(&mut self) {
        let expired = self
            .session
            .as_mut()
            .is_some_and(|session| session.expire_typing(Instant::now()));
        if expired {
            self.publish_typing();
        }
    }

    // -- Sending --

    fn send_message(&mut self, body: String, reply: oneshot::Sender<Result<Message>>) {
        let body = body.trim().to_string();
        if body.is_empty() {
            let _ = reply.send(Err(SyncError::EmptyMessage));
            return;
        }
        let Some(session) = self.session.as_ref() else {
            let _ = reply.send(Err(SyncError::NoRoomOpen));
            return;
        };

        let room_id = session.room_id;
        let author_id = self.identity.user_id;
        let service = self.service.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = service.insert_message(room_id, author_id, body).await;
            let _ = tx.send(Inbox::MessageSent { room_id, result, reply });
        });
    }

    fn on_message_sent(
        &mut self,
        room_id: Uuid,
        result: anyhow::Result<Message>,
        reply: oneshot::Sender<Result<Message>>,
    ) {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                let err = SyncError::fetch(format!("sending message to room {}", room_id), e);
                warn!("{}", err);
                let _ = reply.send(Err(err));
                return;
            }
        };

        // Our own insert also comes back on the live stream; whichever
        // arrives second is dropped by the feed.
        let name = self.identity.name.clone();
        if let Some(session) = self.session.as_mut().filter(|s| s.room_id == room_id) {
            if !session.feed().contains(message.id) {
                session.resolve_name(message.author_id, Some(name));
                if session.apply_insert(message.clone()).feed_changed {
                    self.publish_feed();
                }
            }
        }
        let _ = reply.send(Ok(message));
    }

    // -- Unread tracking --

    fn start_global_stream(&mut self) {
        let service = self.service.clone();
        let tx = self.inbox_tx.clone();
        self.global_task = Some(tokio::spawn(async move {
            let mut subscription = match service.subscribe(ChangeFilter::table(Table::ChatMessages)).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = tx.send(Inbox::GlobalEnded {
                        reason: format!("{:#}", e),
                        resubscribe: false,
                    });
                    return;
                }
            };
            if tx.send(Inbox::GlobalReady).is_err() {
                return;
            }
            let ended = loop {
                match subscription.next().await {
                    Ok(Some(event)) => {
                        if tx.send(Inbox::GlobalChange(event)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        break Inbox::GlobalEnded {
                            reason: "stream closed".to_string(),
                            resubscribe: false,
                        };
                    }
                    Err(e) => {
                        break Inbox::GlobalEnded {
                            reason: lost_reason(e),
                            resubscribe: true,
                        };
                    }
                }
            };
            let _ = tx.send(ended);
        }));
    }

    fn on_global_change(&mut self, event: ChangeEvent) {
        if event.kind != ChangeKind::Insert {
            return;
        }
        let message = match decode::message(&event) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unread event: {}", e);
                return;
            }
        };
        if !self.counter.is_candidate(&message) {
            return;
        }

        let watermark = self.watermarks.get(message.room_id);
        if self.counter.on_insert(&message, watermark) {
            trace!("Room {} unread now {}", message.room_id, self.counter.count(message.room_id));
            self.publish_unread();
        }
    }

    fn mark_read(&mut self, room_id: Uuid) {
        self.counter.mark_read(room_id);
        let now = self.clock.now();
        self.watermarks.stamp(room_id, now);
        debug!("Room {} marked read at {}", room_id, now);
        self.publish_unread();
    }

    fn refresh_unread(&mut self, reply: Option<oneshot::Sender<Result<UnreadView>>>) {
        if self.global_task.is_none() {
            info!("Resubscribing unread tracker");
            // GlobalReady triggers its own refresh; this one still answers
            // the caller.
            self.start_global_stream();
        }

        let ticket = self.counter.begin_refresh();
        let service = self.service.clone();
        let store = self.watermarks.store();
        let snapshot = self.watermarks.snapshot();
        let user_id = self.identity.user_id;
        let tx = self.inbox_tx.clone();

        tokio::spawn(async move {
            let result = count_unread(service, store, snapshot, user_id).await;
            let _ = tx.send(Inbox::UnreadRefreshed { ticket, result, reply });
        });
    }

    fn on_unread_refreshed(
        &mut self,
        ticket: RefreshTicket,
        result: anyhow::Result<Vec<(Uuid, Vec<UnreadMark>)>>,
        reply: Option<oneshot::Sender<Result<UnreadView>>>,
    ) {
        match result {
            Ok(rooms) => {
                let watermarks = &mut self.watermarks;
                self.counter.apply_refresh(ticket, rooms, |room_id| watermarks.get(room_id));
                let view = self.publish_unread();
                debug!("Unread refreshed: {} total", view.total);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(view));
                }
            }
            Err(e) => {
                // Keep the last known counts.
                let err = SyncError::fetch("refreshing unread counts", e);
                warn!("{}", err);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    // -- Publishing --

    fn publish_feed(&self) {
        let view = match &self.session {
            Some(session) => session.view(),
            None => FeedView::idle(),
        };
        self.feed_tx.send_replace(view);
    }

    fn publish_typing(&mut self) {
        let users = match self.session.as_mut() {
            Some(session) => session.typing(Instant::now()),
            None => Vec::new(),
        };
        self.typing_tx.send_if_modified(|current| {
            if *current == users {
                false
            } else {
                *current = users;
                true
            }
        });
    }

    fn publish_unread(&self) -> UnreadView {
        let view = self.counter.view();
        self.unread_tx.send_replace(view.clone());
        view
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn fetch_backfill<S: DataService>(
    service: S,
    room_id: Uuid,
    limit: u32,
    token: StreamToken,
    tx: mpsc::UnboundedSender<Inbox>,
) {
    let result = service.recent_messages(room_id, limit).await;
    let _ = tx.send(Inbox::Backfill { token, result });
}

async fn forward_room_changes<S: DataService>(
    service: S,
    room_id: Uuid,
    token: StreamToken,
    tx: mpsc::UnboundedSender<Inbox>,
) {
    let mut subscription = match service.subscribe(ChangeFilter::room(Table::ChatMessages, room_id)).await {
        Ok(subscription) => subscription,
        Err(e) => {
            let _ = tx.send(Inbox::LiveEnded {
                token,
                reason: format!("{:#}", e),
            });
            return;
        }
    };
    if tx.send(Inbox::LiveUp { token }).is_err() {
        return;
    }
    let reason = loop {
        match subscription.next().await {
            Ok(Some(event)) => {
                if tx.send(Inbox::RoomChange { token, event }).is_err() {
                    return;
                }
            }
            Ok(None) => break "stream closed".to_string(),
            Err(e) => break lost_reason(e),
        }
    };
    let _ = tx.send(Inbox::LiveEnded { token, reason });
}

fn lost_reason(err: SyncError) -> String {
    match err {
        SyncError::SubscriptionLost { reason, .. } => reason,
        other => other.to_string(),
    }
}

async fn forward_typing<S: DataService>(
    service: S,
    room_id: Uuid,
    token: StreamToken,
    tx: mpsc::UnboundedSender<Inbox>,
) {
    let (sender, mut receiver) = match service.join_typing(room_id).await {
        Ok(channel) => channel,
        Err(e) => {
            // Presence is best effort; the feed is unaffected.
            warn!("Joining typing channel for room {} failed: {:#}", room_id, e);
            return;
        }
    };
    if tx.send(Inbox::TypingJoined { token, sender }).is_err() {
        return;
    }
    while let Some(broadcast) = receiver.recv().await {
        if tx.send(Inbox::TypingReceived { token, broadcast }).is_err() {
            return;
        }
    }
}

/// Recounts every room. Watermarks come from the engine's cache when it has
/// them (it may hold stamps not yet written) and from the store otherwise.
async fn count_unread<S: DataService, W: WatermarkStore>(
    service: S,
    store: Arc<W>,
    snapshot: WatermarkSnapshot,
    user_id: Uuid,
) -> anyhow::Result<Vec<(Uuid, Vec<UnreadMark>)>> {
    let rooms = service.list_rooms().await?;

    let mut results = Vec::with_capacity(rooms.len());
    for room in rooms {
        let after = match snapshot.entries.get(&room.id) {
            Some(cached) => *cached,
            None if snapshot.complete => None,
            None => {
                let store = store.clone();
                let room_id = room.id;
                tokio::task::spawn_blocking(move || store.get(user_id, room_id)).await??
            }
        };
        let marks = service.unread_messages(room.id, user_id, after).await?;
        results.push((room.id, marks));
    }
    Ok(results)
}
