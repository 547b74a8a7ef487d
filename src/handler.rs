use anyhow::{Context, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, warn};
use serde::Deserialize;
use warp::{
    filters::ws::{Message, WebSocket, Ws},
    reject::Rejection,
    reply::Reply,
    Filter,
};

use crate::{
    auth,
    connection::{ConnId, Identity},
    coordinator::Coordinator,
    outbox::Inbox,
    protocol::ClientMessage,
    GlobalState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
    room: Option<String>,
}

pub fn routes(
    state: GlobalState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let state = warp::any().map(move || state.clone());
    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<ConnectQuery>())
        .and(warp::header::optional::<String>("authorization"))
        .and(state)
        .and_then(socket_handler);
    let health = warp::path("health").and(warp::path::end()).map(|| "ok");
    ws.or(health)
}

pub async fn socket_handler(
    ws: Ws,
    query: ConnectQuery,
    authorization: Option<String>,
    state: GlobalState,
) -> Result<impl Reply, Rejection> {
    let token = query.token.or_else(|| {
        authorization.map(|value| {
            value
                .strip_prefix("Bearer ")
                .map(str::to_string)
                .unwrap_or(value)
        })
    });
    let room = query.room;

    Ok(ws.on_upgrade(move |socket| async move {
        let identity = auth::identify(state.verifier.as_ref(), token.as_deref()).await;
        if let Err(e) = on_connection(&state.coordinator, identity, room, socket).await {
            warn!("connection terminated because of {e:#}");
        }
    }))
}

enum Ended {
    Reader(Result<()>),
    Writer(std::result::Result<Result<()>, tokio::task::JoinError>),
}

/// Runs one player from registration to teardown. The writer task never
/// outlives this call.
pub async fn on_connection(
    coordinator: &Coordinator,
    identity: Identity,
    room: Option<String>,
    socket: WebSocket,
) -> Result<()> {
    let (id, inbox) = coordinator.connect(identity);
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, inbox));

    if let Some(room) = room {
        coordinator.handle(id, ClientMessage::Join { room });
    }

    let ended = tokio::select! {
        result = read_pump(coordinator, id, stream) => Ended::Reader(result),
        joined = &mut writer => Ended::Writer(joined),
    };
    // Drops the outbox, so a still-running writer flushes and stops.
    coordinator.disconnect(id);

    match ended {
        Ended::Reader(result) => {
            writer.await.context("writer task panicked")??;
            result
        }
        Ended::Writer(joined) => joined.context("writer task panicked")?,
    }
}

async fn read_pump(
    coordinator: &Coordinator,
    id: ConnId,
    mut stream: SplitStream<WebSocket>,
) -> Result<()> {
    while let Some(message) = stream.next().await {
        let message = message.context("read failed")?;
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        match ClientMessage::decode(text) {
            Ok(message) => coordinator.handle(id, message),
            Err(e) => debug!("dropping message from {id}: {e}"),
        }
    }
    Ok(())
}

async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut inbox: Inbox) -> Result<()> {
    while let Some(message) = inbox.recv().await {
        sink.send(message).await.context("write failed")?;
    }
    let _ = sink.send(Message::close()).await;
    let _ = sink.close().await;
    Ok(())
}
