//! Identity-addressed message routing.
//!
//! The [`Router`] owns the transport's event stream and is the only writer of
//! the route table. Sending goes through a [`RouterHandle`], which is cheap to
//! clone and can be used from any task or blocking worker thread.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use pony_types::{Identity, Role};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::backoff::Backoff;
use crate::error::{Result, RouterError, TransportError};
use crate::protocol::{Message, Packet};
use crate::transport::{ConnectionId, EventReceiver, Link, Transport, TransportEvent};

#[derive(Debug)]
struct Route {
    conn: ConnectionId,
    link: Link,
}

/// Identity to connection mapping plus the reverse index.
///
/// A connection id appears in `by_connection` only while it is the current
/// route for its identity.
#[derive(Debug, Default)]
pub struct RouteTable {
    by_identity: HashMap<Identity, Route>,
    by_connection: HashMap<ConnectionId, Identity>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` on `conn`. Returns the link of the connection it
    /// replaces, if the identity was already connected.
    pub fn insert(&mut self, identity: Identity, conn: ConnectionId, link: Link) -> Option<Link> {
        let previous = self
            .by_identity
            .insert(identity.clone(), Route { conn, link });
        if let Some(route) = &previous {
            self.by_connection.remove(&route.conn);
        }
        self.by_connection.insert(conn, identity);
        previous.map(|route| route.link)
    }

    /// Forget `conn`. Returns its identity only if `conn` was still the
    /// current route, so a replaced connection's late disconnect is a no-op.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<Identity> {
        let identity = self.by_connection.remove(&conn)?;
        if self
            .by_identity
            .get(&identity)
            .is_some_and(|route| route.conn == conn)
        {
            self.by_identity.remove(&identity);
        }
        Some(identity)
    }

    #[must_use]
    pub fn identity_of(&self, conn: ConnectionId) -> Option<&Identity> {
        self.by_connection.get(&conn)
    }

    #[must_use]
    pub fn link(&self, identity: &Identity) -> Option<&Link> {
        self.by_identity.get(identity).map(|route| &route.link)
    }

    #[must_use]
    pub fn contains(&self, identity: &Identity) -> bool {
        self.by_identity.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.by_identity.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    fn drain_links(&mut self) -> Vec<Link> {
        self.by_connection.clear();
        self.by_identity
            .drain()
            .map(|(_, route)| route.link)
            .collect()
    }
}

/// Inbound events, delivered in arrival order to a single consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    PeerConnected(Identity),
    PeerDisconnected(Identity),
    Message(Message),
}

#[derive(Debug)]
struct Shared {
    role: Role,
    local: RwLock<Option<Identity>>,
    default_recipient: Option<Identity>,
    routes: RwLock<RouteTable>,
}

/// Send side of a router.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    shared: Arc<Shared>,
}

impl RouterHandle {
    fn new(role: Role, local: Option<Identity>, default_recipient: Option<Identity>) -> Self {
        Self {
            shared: Arc::new(Shared {
                role,
                local: RwLock::new(local),
                default_recipient,
                routes: RwLock::new(RouteTable::new()),
            }),
        }
    }

    fn routes(&self) -> RwLockReadGuard<'_, RouteTable> {
        self.shared
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn routes_mut(&self) -> RwLockWriteGuard<'_, RouteTable> {
        self.shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_local(&self, identity: Identity) {
        *self
            .shared
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    /// Send one message.
    ///
    /// `to` falls back to the default recipient (the hub, on agents).
    /// Delivery is at most once: nothing is queued for peers that are not
    /// connected.
    ///
    /// # Errors
    ///
    /// - `RouterError::NoRecipient` if `to` is `None` and there is no default
    /// - `RouterError::UnknownRecipient` if the recipient is not connected
    pub fn send(&self, kind: &str, payload: Value, to: Option<&Identity>) -> Result<()> {
        let recipient = to
            .or(self.shared.default_recipient.as_ref())
            .ok_or(RouterError::NoRecipient)?;

        let Some(sender) = self.local_identity() else {
            return Err(RouterError::UnknownRecipient(recipient.clone()));
        };

        let routes = self.routes();
        let link = routes
            .link(recipient)
            .ok_or_else(|| RouterError::UnknownRecipient(recipient.clone()))?;

        let message = Message::new(sender, Some(recipient.clone()), kind, payload);
        link.send(Packet::Message(message))
            .map_err(|_| RouterError::UnknownRecipient(recipient.clone()))?;

        trace!("Sent {} to {}", kind, recipient);
        Ok(())
    }

    /// Send one message to every connected peer. Returns how many peers it
    /// was handed to.
    #[must_use = "the count tells whether anyone was reached"]
    pub fn broadcast(&self, kind: &str, payload: &Value) -> usize {
        let Some(sender) = self.local_identity() else {
            return 0;
        };

        let routes = self.routes();
        let mut reached = 0;
        for identity in routes.identities() {
            let Some(link) = routes.link(identity) else {
                continue;
            };
            let message = Message::new(
                sender.clone(),
                Some(identity.clone()),
                kind,
                payload.clone(),
            );
            if link.send(Packet::Message(message)).is_ok() {
                reached += 1;
            } else {
                debug!("Broadcast {} skipped closed link to {}", kind, identity);
            }
        }
        reached
    }

    #[must_use]
    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.routes()
            .link(identity)
            .is_some_and(|link| !link.is_closed())
    }

    /// Identities of all connected peers, sorted.
    #[must_use]
    pub fn peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.routes().identities().cloned().collect();
        peers.sort();
        peers
    }

    /// This endpoint's identity. On agents it is known once the hub has
    /// welcomed us.
    #[must_use]
    pub fn local_identity(&self) -> Option<Identity> {
        self.shared
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn default_recipient(&self) -> Option<&Identity> {
        self.shared.default_recipient.as_ref()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }
}

/// Parameters for an agent-side router.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: String,
    pub identity: Option<Identity>,
    /// Where un-addressed sends go; normally the hub's identity.
    pub default_recipient: Identity,
    pub backoff: Backoff,
}

#[derive(Debug)]
pub struct Router {
    handle: RouterHandle,
    transport: Transport,
    events: EventReceiver,
}

impl Router {
    /// Start a hub router listening on `address`.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Bind` if the address is invalid or cannot be
    /// bound.
    pub async fn bind(address: &str, identity: Identity) -> Result<Self> {
        let address: Address = address
            .parse()
            .map_err(|e| RouterError::Bind(TransportError::Address(e)))?;

        let (transport, events) = Transport::bind(&address, identity.clone())
            .await
            .map_err(RouterError::Bind)?;

        Ok(Self {
            handle: RouterHandle::new(Role::Hub, Some(identity), None),
            transport,
            events,
        })
    }

    /// Start an agent router. Dialing runs in the background and never fails
    /// here; only an unusable address does.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Connect` if the address is invalid.
    pub fn connect(options: ConnectOptions) -> Result<Self> {
        let address: Address = options
            .address
            .parse()
            .map_err(|e| RouterError::Connect(TransportError::Address(e)))?;

        let (transport, events) =
            Transport::connect(address, options.identity.clone(), options.backoff);

        Ok(Self {
            handle: RouterHandle::new(
                Role::Agent,
                options.identity,
                Some(options.default_recipient),
            ),
            transport,
            events,
        })
    }

    #[must_use]
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        self.transport.address()
    }

    /// Next inbound event, or `None` once the router is closed.
    ///
    /// Route table updates happen here, so sends only see a peer after its
    /// `PeerConnected` has been produced.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        loop {
            let event = self.events.recv().await?;
            if let Some(event) = self.apply(event) {
                return Some(event);
            }
        }
    }

    fn apply(&mut self, event: TransportEvent) -> Option<RouterEvent> {
        match event {
            TransportEvent::Connected {
                conn,
                peer,
                local,
                link,
            } => {
                if let Some(local) = local {
                    self.handle.set_local(local);
                }
                let stale = self.handle.routes_mut().insert(peer.clone(), conn, link);
                if let Some(stale) = stale {
                    warn!("Peer {} reconnected, dropping its previous connection", peer);
                    stale.close();
                }
                info!("Peer {} connected", peer);
                Some(RouterEvent::PeerConnected(peer))
            }
            TransportEvent::Received { conn, mut message } => {
                let Some(identity) = self.handle.routes().identity_of(conn).cloned() else {
                    debug!("[conn {}] Dropping message from replaced connection", conn);
                    return None;
                };
                message.sender = identity;
                Some(RouterEvent::Message(message))
            }
            TransportEvent::Disconnected { conn } => {
                let identity = self.handle.routes_mut().remove_connection(conn)?;
                info!("Peer {} disconnected", identity);
                Some(RouterEvent::PeerDisconnected(identity))
            }
        }
    }

    /// Close every connection and the transport. Idempotent.
    pub fn close(&mut self) {
        for link in self.handle.routes_mut().drain_links() {
            link.close();
        }
        self.transport.close();
        self.events.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}
