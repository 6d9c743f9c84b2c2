mod command;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use parlor_db::Database;
use parlor_sync::clock::SystemClock;
use parlor_sync::config::EngineConfig;
use parlor_sync::local::LocalService;
use parlor_sync::presence::typing_label;
use parlor_sync::service::DataService;
use parlor_sync::session::{FeedStatus, FeedView};
use parlor_sync::unread::{UnreadView, badge};
use parlor_sync::{Engine, EngineHandle, Identity};
use parlor_types::models::{Room, TypingUser};

use crate::command::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging; stdout belongs to the chat
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=info,parlor_sync=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("PARLOR_DB_PATH").unwrap_or_else(|_| "parlor.db".into());
    let user = std::env::var("PARLOR_USER").context("PARLOR_USER must be set to a display name")?;
    let config = EngineConfig::from_env();

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);
    let service = LocalService::new(db.clone());
    let profile = service.ensure_profile(&user)?;
    info!("Signed in as {} ({}) using {}", profile.name, profile.id, db_path);

    let engine = Engine::spawn(
        Identity {
            user_id: profile.id,
            name: profile.name,
        },
        config,
        service.clone(),
        db,
        SystemClock,
    );

    tokio::spawn(print_feed(engine.feed()));
    tokio::spawn(print_typing(engine.typing()));
    tokio::spawn(print_unread(engine.unread()));

    println!("Commands: /rooms, /join <room>, /leave, /resync, /typing, /quit. Anything else is sent.");
    let result = repl(&engine, &service).await;

    engine.shutdown().await?;
    result
}

async fn repl(engine: &EngineHandle, service: &LocalService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<Room> = None;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => return Ok(()),
            Command::Rooms => {
                let unread = engine.unread().borrow().clone();
                for room in service.list_rooms().await? {
                    let marker = if current.as_ref().is_some_and(|c| c.id == room.id) { "*" } else { " " };
                    match badge(unread.count(room.id)) {
                        Some(badge) => println!("{} {} ({})", marker, room.name, badge),
                        None => println!("{} {}", marker, room.name),
                    }
                }
            }
            Command::Join(name) => {
                let rooms = service.list_rooms().await?;
                match rooms.into_iter().find(|r| r.name.eq_ignore_ascii_case(&name)) {
                    Some(room) => {
                        engine.open_room(room.id)?;
                        current = Some(room);
                    }
                    None => println!("No room named '{}'", name),
                }
            }
            Command::Leave => {
                engine.close_room()?;
                current = None;
            }
            Command::Resync => engine.resync()?,
            Command::Typing => engine.signal_typing()?,
            Command::Say(body) => {
                if let Err(e) = engine.send_message(body).await {
                    println!("! {}", e);
                }
            }
            Command::Unknown(input) => println!("Unknown command: {}", input),
        }
    }
}

async fn print_feed(mut rx: watch::Receiver<FeedView>) {
    let mut session = 0;
    let mut status = FeedStatus::Idle;
    let mut shown: HashSet<Uuid> = HashSet::new();

    while rx.changed().await.is_ok() {
        let view = rx.borrow_and_update().clone();
        if view.session != session {
            session = view.session;
            shown.clear();
        }
        if view.status != status {
            match &view.status {
                FeedStatus::Idle => println!("-- left room"),
                FeedStatus::Loading => println!("-- loading..."),
                FeedStatus::Live => println!("-- live"),
                FeedStatus::Stale(reason) => println!("-- realtime lost ({}); /resync to retry", reason),
                FeedStatus::Failed(reason) => println!("-- could not load messages ({}); /resync to retry", reason),
            }
            status = view.status.clone();
        }
        for entry in &view.entries {
            if shown.insert(entry.message.id) {
                println!(
                    "[{}] {}: {}",
                    entry.message.created_at.format("%H:%M"),
                    entry.sender_name,
                    entry.message.body
                );
            }
        }
    }
}

async fn print_typing(mut rx: watch::Receiver<Vec<TypingUser>>) {
    while rx.changed().await.is_ok() {
        let users = rx.borrow_and_update().clone();
        if let Some(label) = typing_label(&users) {
            println!("   {}", label);
        }
    }
}

async fn print_unread(mut rx: watch::Receiver<UnreadView>) {
    let mut total = 0;
    while rx.changed().await.is_ok() {
        let view = rx.borrow_and_update().clone();
        if view.total != total {
            total = view.total;
            match badge(total) {
                Some(badge) => println!("   ({} unread elsewhere)", badge),
                None => info!("All rooms read"),
            }
        }
    }
    warn!("Unread view closed");
}
