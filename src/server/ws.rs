use super::AppState;
use crate::agents::{spawn_turn, TurnHandle, TurnSignal};
use crate::protocol::{ClientEvent, Event};
use crate::session::{ChatSession, SessionParams};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
}

enum Outbound {
    Frame(Event),
    Pong(Bytes),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: String, query: ConnectQuery) {
    let buffer = state.config.session.outbound_buffer.max(1);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(buffer);

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let result = match outbound {
                Outbound::Frame(event) => match event.to_json() {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(error) => {
                        tracing::error!(error = %error, "failed to serialize outbound frame");
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                tracing::debug!("socket send failed, client disconnected");
                break;
            }
        }
    });

    let params = SessionParams {
        client_id: client_id.clone(),
        thread_id: query.thread_id,
        user_id: query.user_id,
    };
    let mut session = match ChatSession::open(params, state.session_context()) {
        Ok(session) => session,
        Err(error) => {
            tracing::warn!(client_id = %client_id, error = %error, "failed to open chat session");
            let _ = outbound_tx
                .send(Outbound::Frame(Event::error(error.message(), None)))
                .await;
            drop(outbound_tx);
            let _ = send_task.await;
            return;
        }
    };
    let session_id = state
        .sessions
        .open_session(&client_id, session.thread_id(), session.user_id())
        .await;
    let connection_agent = query.agent_id;

    let (signals_tx, mut signals_rx) = mpsc::channel::<TurnSignal>(buffer);
    let mut turn: Option<TurnHandle> = None;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = outbound_tx.send(Outbound::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        tracing::warn!(client_id = %client_id, error = %error, "socket error");
                        break;
                    }
                };

                let submit = match ClientEvent::parse(text.as_str()) {
                    Ok(ClientEvent::Submit(payload)) => payload,
                    Err(error) => {
                        tracing::warn!(client_id = %client_id, error = %error, "dropping malformed client frame");
                        let frame = session.error_frame(&error);
                        if !send(&outbound_tx, frame).await {
                            break;
                        }
                        continue;
                    }
                };

                let previous_thread = session.thread_id().to_string();
                let agent_id = submit.agent_id.clone().or_else(|| connection_agent.clone());
                let started = state
                    .agents
                    .resolve(agent_id.as_deref())
                    .and_then(|agent| session.submit(submit).map(|request| (agent, request)));
                match started {
                    Ok((agent, request)) => {
                        if session.thread_id() != previous_thread {
                            if let Err(error) = state.sessions.update_thread(&client_id, &session_id, session.thread_id()).await {
                                tracing::debug!(client_id = %client_id, error = %error, "session registration already replaced");
                            }
                        }
                        tracing::debug!(client_id = %client_id, thread_id = %request.thread_id, agent_id = %agent.info().id, "turn started");
                        turn = Some(spawn_turn(agent, request, signals_tx.clone(), buffer));
                    }
                    Err(error) => {
                        tracing::debug!(client_id = %client_id, error = %error, "submit rejected");
                        let frame = session.error_frame(&error);
                        if !send(&outbound_tx, frame).await {
                            break;
                        }
                    }
                }
            }
            Some(signal) = signals_rx.recv() => {
                let frames = match signal {
                    TurnSignal::Event(event) => match session.handle_event(event) {
                        Ok(frames) => frames,
                        Err(error) => {
                            tracing::warn!(client_id = %client_id, error = %error, "failed to apply agent event");
                            vec![session.error_frame(&error)]
                        }
                    },
                    TurnSignal::Finished(result) => {
                        turn = None;
                        session.finish_turn(result)
                    }
                };
                let mut delivered = true;
                for frame in frames {
                    if !send(&outbound_tx, frame).await {
                        delivered = false;
                        break;
                    }
                }
                if !delivered {
                    break;
                }
            }
        }
    }

    if let Some(turn) = turn.take() {
        turn.abort();
    }
    session.close();
    state.sessions.close_session(&client_id, &session_id).await;
    drop(outbound_tx);
    send_task.abort();
}

async fn send(outbound: &mpsc::Sender<Outbound>, event: Event) -> bool {
    outbound.send(Outbound::Frame(event)).await.is_ok()
}
