//! Session registry
//!
//! Connection → session map with at most one live session per connection.
//! Removal is idempotent and always runs the full teardown: detach from the
//! engine, close the transport, release the listener count.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::engine::{AudioEngine, Feed};
use crate::session::{ConnId, ListenerCount, Session, SessionId};
use crate::signaling::message::OutboundMessage;
use crate::transport::{PeerTransport, TransportSink};

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_conn: DashMap<ConnId, SessionId>,
    engine: Arc<AudioEngine>,
    listeners: Arc<ListenerCount>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<AudioEngine>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_conn: DashMap::new(),
            engine,
            listeners: Arc::new(ListenerCount::default()),
        }
    }

    /// Register a fresh session for `conn`, tearing down any previous one
    pub fn create(
        &self,
        conn: ConnId,
        feed: Feed,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(conn, feed, outbound));
        self.sessions.insert(session.id(), session.clone());
        if let Some(previous) = self.by_conn.insert(conn, session.id()) {
            tracing::debug!("Connection {} replaced session {}", conn, previous);
            self.remove(previous);
        }
        tracing::info!(
            "Session {} created for connection {} ({} feed)",
            session.id(),
            conn,
            feed.as_str()
        );
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// The live session of a connection, if any
    pub fn session_for(&self, conn: ConnId) -> Option<Arc<Session>> {
        let id = *self.by_conn.get(&conn)?.value();
        self.get(id)
    }

    /// Remove and tear down. Returns `false` if nothing was registered.
    pub fn remove(&self, id: SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return false;
        };
        let transport = session.close();
        self.finish(&session, transport);
        true
    }

    /// Remove only if `epoch` is still the session's current round
    pub fn remove_if_epoch(&self, id: SessionId, epoch: u64) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        let transport = match session.close_if_epoch(epoch) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::debug!("Skipping removal of session {}: {}", id, e);
                return false;
            }
        };
        self.sessions.remove_if(&id, |_, s| Arc::ptr_eq(s, &session));
        self.finish(&session, transport);
        true
    }

    fn finish(&self, session: &Arc<Session>, transport: Option<Arc<dyn PeerTransport>>) {
        let id = session.id();
        self.by_conn.remove_if(&session.conn_id(), |_, v| *v == id);
        self.engine.detach(id);
        if let Some(transport) = transport {
            transport.close();
        }
        session.release_listener(&self.listeners);
        tracing::info!(
            "Session {} removed ({} listeners, {} sessions)",
            id,
            self.listeners.get(),
            self.sessions.len()
        );
    }

    /// Start feeding engine output for the session's feed into `transport`
    pub fn attach_media(&self, session: &Session, transport: Arc<dyn PeerTransport>) {
        self.engine
            .attach(session.id(), session.feed(), Arc::new(TransportSink(transport)));
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    /// Queue `message` on every session; returns how many accepted it
    pub fn broadcast(&self, message: &OutboundMessage) -> usize {
        let mut sent = 0;
        self.for_each(|session| {
            if session.send(message.clone()) {
                sent += 1;
            }
        });
        sent
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Current listener count
    pub fn listeners(&self) -> usize {
        self.listeners.get()
    }

    pub fn listener_count(&self) -> &ListenerCount {
        &self.listeners
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    /// Remove every session
    pub fn clear(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }
}
