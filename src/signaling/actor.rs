use std::{collections::HashMap, time::Instant};

use actix::{Actor, AsyncContext, Context, Handler, Message, MessageResult, Recipient};
use uuid::Uuid;

use crate::{allocation::BandwidthStatus, connection::ConnectionId};

use super::{
    message::{ReceivedMessage, SendingMessage, StreamInfo},
    relay::{Effect, SignalingRelay},
};

/// Owns the [`SignalingRelay`] and delivers its effects. The mailbox serializes every
/// mutation, so admissions never interleave.
#[derive(Debug)]
pub struct RelayActor {
    relay: SignalingRelay,
    sessions: HashMap<ConnectionId, Recipient<SendingMessage>>,
}

impl RelayActor {
    pub fn new(relay: SignalingRelay) -> Self {
        Self {
            relay,
            sessions: HashMap::new(),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>, ctx: &mut Context<Self>) {
        for effect in effects {
            match effect {
                Effect::Send(connection, message) => match self.sessions.get(&connection) {
                    Some(session) => session.do_send(message),
                    None => tracing::warn!("Session {} is gone, dropping message", connection),
                },
                Effect::Broadcast(message) => {
                    for session in self.sessions.values() {
                        session.do_send(message.clone());
                    }
                }
                Effect::ScheduleProbeDeadline {
                    connection,
                    probe_id,
                    after,
                } => {
                    ctx.notify_later(
                        ProbeDeadline {
                            connection,
                            probe_id,
                        },
                        after,
                    );
                }
            }
        }
    }
}

impl Actor for RelayActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("Signaling relay started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.relay.reset();
        self.sessions.clear();
        tracing::info!("Signaling relay stopped");
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Connect {
    pub connection: ConnectionId,
    pub session: Recipient<SendingMessage>,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub connection: ConnectionId,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Inbound {
    pub connection: ConnectionId,
    pub message: ReceivedMessage,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
struct ProbeDeadline {
    connection: ConnectionId,
    probe_id: Uuid,
}

#[derive(Message, Debug)]
#[rtype(result = "Vec<StreamInfo>")]
pub struct GetStreams;

#[derive(Message, Debug)]
#[rtype(result = "BandwidthStatus")]
pub struct GetStatus;

impl Handler<Connect> for RelayActor {
    type Result = ();

    fn handle(&mut self, msg: Connect, _ctx: &mut Self::Context) -> Self::Result {
        self.relay.connect(msg.connection.clone());
        self.sessions.insert(msg.connection, msg.session);
    }
}

impl Handler<Disconnect> for RelayActor {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, ctx: &mut Self::Context) -> Self::Result {
        self.sessions.remove(&msg.connection);
        let effects = self.relay.disconnect(&msg.connection);
        self.apply(effects, ctx);
    }
}

impl Handler<Inbound> for RelayActor {
    type Result = ();

    fn handle(&mut self, msg: Inbound, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("received message from {}: {:?}", msg.connection, msg.message);
        let effects = self
            .relay
            .handle(&msg.connection, msg.message, Instant::now());
        self.apply(effects, ctx);
    }
}

impl Handler<ProbeDeadline> for RelayActor {
    type Result = ();

    fn handle(&mut self, msg: ProbeDeadline, ctx: &mut Self::Context) -> Self::Result {
        let effects = self
            .relay
            .probe_deadline(&msg.connection, msg.probe_id, Instant::now());
        self.apply(effects, ctx);
    }
}

impl Handler<GetStreams> for RelayActor {
    type Result = MessageResult<GetStreams>;

    fn handle(&mut self, _msg: GetStreams, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.relay.streams())
    }
}

impl Handler<GetStatus> for RelayActor {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.relay.status())
    }
}
