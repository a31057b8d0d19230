use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, StreamHandler};
use actix_web_actors::ws;

use crate::connection::ConnectionId;

use super::{
    actor::{Connect, Disconnect, Inbound, RelayActor},
    message::{ReceivedMessage, SendingMessage},
};

/// One client's signaling socket. It parses frames into [`ReceivedMessage`]s for the
/// [`RelayActor`] and writes every [`SendingMessage`] it is handed back as JSON text.
#[derive(Debug)]
pub struct WebSocketSession {
    connection: ConnectionId,
    relay: Addr<RelayActor>,
}

impl WebSocketSession {
    pub fn new(relay: Addr<RelayActor>) -> Self {
        Self {
            connection: ConnectionId::new(),
            relay,
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }
}

impl Actor for WebSocketSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("New WebSocket connection {} is started", self.connection);
        self.relay.do_send(Connect {
            connection: self.connection.clone(),
            session: ctx.address().recipient(),
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("The WebSocket connection {} is stopped", self.connection);
        self.relay.do_send(Disconnect {
            connection: self.connection.clone(),
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocketSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::debug!("pong received"),
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ReceivedMessage>(&text) {
                Ok(message) => self.relay.do_send(Inbound {
                    connection: self.connection.clone(),
                    message,
                }),
                Err(error) => {
                    tracing::error!("failed to parse client message: {}\n{}", error, text);
                    ctx.address().do_send(SendingMessage::Error {
                        message: format!("Malformed message: {}", error),
                    });
                }
            },
            Ok(ws::Message::Binary(_)) => tracing::warn!("binary frames are not supported"),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(error) => {
                tracing::error!("WebSocket protocol error on {}: {}", self.connection, error);
                ctx.stop();
            }
            _ => (),
        }
    }
}

impl Handler<SendingMessage> for WebSocketSession {
    type Result = ();

    fn handle(&mut self, msg: SendingMessage, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("sending message to {}: {:?}", self.connection, msg);
        match serde_json::to_string(&msg) {
            Ok(text) => ctx.text(text),
            Err(error) => tracing::error!("failed to serialize SendingMessage: {}", error),
        }
    }
}
