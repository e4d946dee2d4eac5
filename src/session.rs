use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use rand::{Rng, SeedableRng};
use sha1::Sha1;
use snafu::OptionExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::document::{Document, OverlayKey};
use crate::error::{
    AlreadySharedSnafu, AuthSnafu, OutOfRangeSnafu, ProtocolSnafu, Result, SitesExhaustedSnafu,
    UnknownBufferSnafu, WrongRoleSnafu,
};
use crate::error::Error;
use crate::id::Id;
use crate::message::Message;
use crate::sexp::Value;

/// Connection identity inside one session. The client's single link to the
/// server is connection 0.
pub type ConnId = u64;

const CLIENT_CONN: ConnId = 0;

type HmacSha1 = Hmac<Sha1>;

fn challenge_response(password: &str, salt: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
    mac.update(salt);
    mac.finalize().into_bytes().to_vec()
}

fn verify_response(password: &str, salt: &[u8], response: &[u8]) -> bool {
    let mut mac =
        HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
    mac.update(salt);
    mac.verify_slice(response).is_ok()
}

/// Session parameters. Prompting is the host's business; by the time a
/// session starts, names and passwords are plain values here.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub session_name: String,
    pub display_name: String,
    pub password: Option<String>,
}

/// Where a frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Conn(ConnId),
    All,
    AllExcept(ConnId),
}

/// What the host should be told after applying a message.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    LoggedIn {
        site: u16,
        session: String,
    },
    Synced {
        buffer: String,
        mode: Option<String>,
        content: String,
    },
    Desynced {
        buffer: String,
    },
    Inserted {
        buffer: String,
        pos: usize,
        text: String,
    },
    Deleted {
        buffer: String,
        pos: usize,
        len: usize,
    },
    Cursor {
        buffer: String,
        site: u16,
        point: Option<usize>,
        mark: Option<usize>,
    },
    Contact {
        site: u16,
        name: Option<String>,
    },
    Focus {
        site: u16,
        buffer: String,
    },
    Overlay {
        buffer: String,
        key: OverlayKey,
        range: Option<(usize, usize)>,
    },
}

/// Frames to write and host notifications produced by one engine step.
#[derive(Debug, Default)]
pub struct Effects {
    pub frames: Vec<(Target, Message)>,
    pub events: Vec<HostEvent>,
}

impl Effects {
    fn frame(mut self, target: Target, msg: Message) -> Effects {
        self.frames.push((target, msg));
        self
    }

    fn event(mut self, event: HostEvent) -> Effects {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Default)]
struct Peer {
    site: Option<u16>,
    name: Option<String>,
    authed: bool,
    challenge: Option<Vec<u8>>,
}

#[derive(Debug)]
enum Role {
    Server { next_site: u32 },
    Client { logged_in: bool },
}

/// The session state machine. Frames and host commands go in, frames and
/// host events come out; all socket work stays in the async shell, so every
/// step here is atomic with respect to every other.
pub struct Engine {
    role: Role,
    site: u16,
    session_name: String,
    display_name: String,
    password: Option<String>,
    clock: u32,
    buffers: BTreeMap<String, Document>,
    contacts: BTreeMap<u16, String>,
    focus: BTreeMap<u16, String>,
    peers: HashMap<ConnId, Peer>,
    applying_remote: bool,
    rng: rand::rngs::StdRng,
}

impl Engine {
    pub fn server(opts: SessionOptions) -> Engine {
        let mut contacts = BTreeMap::new();
        contacts.insert(0, opts.display_name.clone());
        Engine {
            role: Role::Server { next_site: 1 },
            site: 0,
            session_name: opts.session_name,
            display_name: opts.display_name,
            password: opts.password,
            clock: 0,
            buffers: BTreeMap::new(),
            contacts,
            focus: BTreeMap::new(),
            peers: HashMap::new(),
            applying_remote: false,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    pub fn client(opts: SessionOptions) -> Engine {
        Engine {
            role: Role::Client { logged_in: false },
            site: 0,
            session_name: String::new(),
            display_name: opts.display_name,
            password: opts.password,
            clock: 0,
            buffers: BTreeMap::new(),
            contacts: BTreeMap::new(),
            focus: BTreeMap::new(),
            peers: HashMap::new(),
            applying_remote: false,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    pub fn site(&self) -> u16 {
        self.site
    }

    pub fn buffer_text(&self, name: &str) -> Option<String> {
        self.buffers.get(name).map(|doc| doc.content())
    }

    fn hub_target(&self) -> Target {
        if self.is_client() {
            Target::Conn(CLIENT_CONN)
        } else {
            Target::All
        }
    }

    /// Server side: a transport-level connection appeared.
    pub fn register(&mut self, conn: ConnId) {
        self.peers.insert(conn, Peer::default());
    }

    /// Client side: the link to the server is up; introduce ourselves.
    pub fn client_connected(&self) -> Effects {
        Effects::default().frame(
            Target::Conn(CLIENT_CONN),
            Message::Hello {
                name: self.display_name.clone(),
                response: None,
            },
        )
    }

    /// A peer or the server vanished. On the server this synthesizes the
    /// cursor and contact clears the departed site leaves behind.
    pub fn disconnect(&mut self, conn: ConnId) -> Effects {
        let mut effects = Effects::default();
        let Some(peer) = self.peers.remove(&conn) else {
            return effects;
        };
        let Some(site) = peer.site else {
            return effects;
        };
        info!(conn, site, "peer disconnected");
        self.contacts.remove(&site);
        self.focus.remove(&site);
        for doc in self.buffers.values_mut() {
            doc.set_remote_cursor(site, None, 0, None, 0);
            effects.frames.push((
                Target::All,
                Message::Cursor {
                    buffer: doc.name().to_owned(),
                    site,
                    point_hint: 0,
                    point: None,
                    mark_hint: 0,
                    mark: None,
                },
            ));
            effects.events.push(HostEvent::Cursor {
                buffer: doc.name().to_owned(),
                site,
                point: None,
                mark: None,
            });
        }
        effects
            .frames
            .push((Target::All, Message::Contact { site, name: None }));
        effects.events.push(HostEvent::Contact { site, name: None });
        effects
    }

    /// One inbound frame. An error return means the connection (server) or
    /// the session (client) must be torn down.
    pub fn handle_frame(&mut self, conn: ConnId, msg: Message) -> Result<Effects> {
        if self.is_client() {
            self.client_frame(msg)
        } else {
            self.server_frame(conn, msg)
        }
    }

    // ------------------------------------------------------------------
    // server side

    fn server_frame(&mut self, conn: ConnId, msg: Message) -> Result<Effects> {
        if let Message::Hello { name, response } = msg {
            return self.server_hello(conn, name, response);
        }
        let site = self.authed_site(conn)?;
        let echo = msg.clone();
        let rebroadcast = Target::AllExcept(conn);
        match msg {
            Message::Insert {
                buffer,
                id,
                hint,
                content,
            } => {
                let mut effects = self.apply_remote_insert(&buffer, &id, hint, &content)?;
                effects.frames.push((rebroadcast, echo));
                Ok(effects)
            }
            Message::Delete {
                buffer,
                hint,
                spans,
            } => {
                let mut effects = self.apply_remote_delete(&buffer, hint, &spans)?;
                effects.frames.push((rebroadcast, echo));
                Ok(effects)
            }
            Message::Cursor {
                buffer,
                site: claimed,
                point_hint,
                point,
                mark_hint,
                mark,
            } => {
                if claimed != site {
                    return ProtocolSnafu {
                        detail: format!("cursor for site {claimed} from site {site}"),
                    }
                    .fail();
                }
                let mut effects =
                    self.apply_remote_cursor(&buffer, claimed, point, point_hint, mark, mark_hint)?;
                effects.frames.push((rebroadcast, echo));
                Ok(effects)
            }
            Message::Focus {
                site: claimed,
                buffer,
            } => {
                if claimed != site {
                    return ProtocolSnafu {
                        detail: format!("focus for site {claimed} from site {site}"),
                    }
                    .fail();
                }
                let effects = self.apply_remote_focus(claimed, buffer);
                Ok(effects.frame(rebroadcast, echo))
            }
            Message::OverlayAdd { .. }
            | Message::OverlayMove { .. }
            | Message::OverlayPut { .. }
            | Message::OverlayRemove { .. } => {
                let (applied, effects) = self.apply_remote_overlay(msg, true)?;
                if applied {
                    Ok(effects.frame(rebroadcast, echo))
                } else {
                    Ok(effects)
                }
            }
            Message::Get { buffer } => {
                debug!(conn, %buffer, "get is reserved; ignoring");
                Ok(Effects::default())
            }
            other => ProtocolSnafu {
                detail: format!("client may not send {other:?}"),
            }
            .fail(),
        }
    }

    fn server_hello(
        &mut self,
        conn: ConnId,
        name: String,
        response: Option<Vec<u8>>,
    ) -> Result<Effects> {
        let registered = self.peers.get(&conn).context(ProtocolSnafu {
            detail: "hello from unregistered connection",
        })?;
        if registered.authed {
            return ProtocolSnafu {
                detail: "second hello on an authenticated connection",
            }
            .fail();
        }
        match (self.password.clone(), response) {
            (None, _) => self.admit(conn, name),
            (Some(_), None) => {
                let salt: [u8; 32] = self.rng.gen();
                let peer = self.peers.get_mut(&conn).context(ProtocolSnafu {
                    detail: "connection vanished mid-handshake",
                })?;
                peer.challenge = Some(salt.to_vec());
                Ok(Effects::default().frame(
                    Target::Conn(conn),
                    Message::Challenge {
                        salt: salt.to_vec(),
                    },
                ))
            }
            (Some(password), Some(response)) => {
                let peer = self.peers.get_mut(&conn).context(ProtocolSnafu {
                    detail: "connection vanished mid-handshake",
                })?;
                let salt = peer.challenge.take().context(ProtocolSnafu {
                    detail: "response without a pending challenge",
                })?;
                if verify_response(&password, &salt, &response) {
                    self.admit(conn, name)
                } else {
                    warn!(conn, "rejecting peer: bad challenge response");
                    AuthSnafu.fail()
                }
            }
        }
    }

    /// Allocate a site and replay the whole session to the newcomer:
    /// login, buffer snapshots, cursors, contacts, focus, then overlays;
    /// finally announce the newcomer to everyone else.
    fn admit(&mut self, conn: ConnId, name: String) -> Result<Effects> {
        let Role::Server { next_site } = &mut self.role else {
            return WrongRoleSnafu { role: "server" }.fail();
        };
        if *next_site > u16::MAX as u32 {
            return SitesExhaustedSnafu.fail();
        }
        let site = *next_site as u16;
        *next_site += 1;

        let peer = self.peers.get_mut(&conn).context(ProtocolSnafu {
            detail: "connection vanished mid-handshake",
        })?;
        peer.authed = true;
        peer.site = Some(site);
        peer.name = Some(name.clone());
        self.contacts.insert(site, name.clone());
        info!(conn, site, %name, "peer admitted");

        let to_peer = Target::Conn(conn);
        let mut effects = Effects::default().frame(
            to_peer,
            Message::Login {
                site,
                session: self.session_name.clone(),
            },
        );
        for doc in self.buffers.values() {
            effects.frames.push((to_peer, doc.sync_message()));
        }
        for doc in self.buffers.values() {
            for cursor in doc.cursor_replay() {
                effects.frames.push((to_peer, cursor));
            }
        }
        for (other, other_name) in &self.contacts {
            if *other != site {
                effects.frames.push((
                    to_peer,
                    Message::Contact {
                        site: *other,
                        name: Some(other_name.clone()),
                    },
                ));
            }
        }
        for (focus_site, buffer) in &self.focus {
            effects.frames.push((
                to_peer,
                Message::Focus {
                    site: *focus_site,
                    buffer: buffer.clone(),
                },
            ));
        }
        for doc in self.buffers.values() {
            for replay in doc.overlay_replay() {
                effects.frames.push((to_peer, replay));
            }
        }
        effects.frames.push((
            Target::AllExcept(conn),
            Message::Contact {
                site,
                name: Some(name.clone()),
            },
        ));
        effects.events.push(HostEvent::Contact {
            site,
            name: Some(name),
        });
        Ok(effects)
    }

    fn authed_site(&self, conn: ConnId) -> Result<u16> {
        self.peers
            .get(&conn)
            .and_then(|p| if p.authed { p.site } else { None })
            .context(ProtocolSnafu {
                detail: "operation before authentication",
            })
    }

    // ------------------------------------------------------------------
    // client side

    fn client_frame(&mut self, msg: Message) -> Result<Effects> {
        let logged_in = match self.role {
            Role::Client { logged_in } => logged_in,
            Role::Server { .. } => return WrongRoleSnafu { role: "client" }.fail(),
        };
        match msg {
            Message::Challenge { salt } => {
                if logged_in {
                    return ProtocolSnafu {
                        detail: "challenge after login",
                    }
                    .fail();
                }
                let Some(password) = self.password.clone() else {
                    warn!("server demands a password but none is configured");
                    return AuthSnafu.fail();
                };
                Ok(Effects::default().frame(
                    Target::Conn(CLIENT_CONN),
                    Message::Hello {
                        name: self.display_name.clone(),
                        response: Some(challenge_response(&password, &salt)),
                    },
                ))
            }
            Message::Login { site, session } => {
                self.role = Role::Client { logged_in: true };
                self.site = site;
                self.session_name = session.clone();
                info!(site, %session, "logged in");
                Ok(Effects::default().event(HostEvent::LoggedIn { site, session }))
            }
            Message::Sync {
                buffer,
                mode,
                content,
                runs,
            } => {
                self.require_login(logged_in)?;
                let doc =
                    Document::from_sync(buffer.clone(), self.site, mode.clone(), &content, &runs)?;
                self.buffers.insert(buffer.clone(), doc);
                Ok(Effects::default().event(HostEvent::Synced {
                    buffer,
                    mode,
                    content,
                }))
            }
            Message::Desync { buffer } => {
                self.require_login(logged_in)?;
                if self.buffers.remove(&buffer).is_some() {
                    Ok(Effects::default().event(HostEvent::Desynced { buffer }))
                } else {
                    Ok(Effects::default())
                }
            }
            Message::Insert {
                buffer,
                id,
                hint,
                content,
            } => {
                self.require_login(logged_in)?;
                if !self.buffers.contains_key(&buffer) {
                    debug!(%buffer, "insert for a buffer we no longer hold");
                    return Ok(Effects::default());
                }
                self.apply_remote_insert(&buffer, &id, hint, &content)
            }
            Message::Delete {
                buffer,
                hint,
                spans,
            } => {
                self.require_login(logged_in)?;
                if !self.buffers.contains_key(&buffer) {
                    debug!(%buffer, "delete for a buffer we no longer hold");
                    return Ok(Effects::default());
                }
                self.apply_remote_delete(&buffer, hint, &spans)
            }
            Message::Cursor {
                buffer,
                site,
                point_hint,
                point,
                mark_hint,
                mark,
            } => {
                self.require_login(logged_in)?;
                if !self.buffers.contains_key(&buffer) {
                    return Ok(Effects::default());
                }
                self.apply_remote_cursor(&buffer, site, point, point_hint, mark, mark_hint)
            }
            Message::Contact { site, name } => {
                self.require_login(logged_in)?;
                match &name {
                    Some(n) => {
                        self.contacts.insert(site, n.clone());
                    }
                    None => {
                        self.contacts.remove(&site);
                        self.focus.remove(&site);
                    }
                }
                Ok(Effects::default().event(HostEvent::Contact { site, name }))
            }
            Message::Focus { site, buffer } => {
                self.require_login(logged_in)?;
                Ok(self.apply_remote_focus(site, buffer))
            }
            msg @ (Message::OverlayAdd { .. }
            | Message::OverlayMove { .. }
            | Message::OverlayPut { .. }
            | Message::OverlayRemove { .. }) => {
                self.require_login(logged_in)?;
                let (_, effects) = self.apply_remote_overlay(msg, false)?;
                Ok(effects)
            }
            Message::Get { buffer } => {
                debug!(%buffer, "get is reserved; ignoring");
                Ok(Effects::default())
            }
            other => ProtocolSnafu {
                detail: format!("server may not send {other:?}"),
            }
            .fail(),
        }
    }

    fn require_login(&self, logged_in: bool) -> Result<()> {
        if logged_in {
            Ok(())
        } else {
            ProtocolSnafu {
                detail: "operation before login",
            }
            .fail()
        }
    }

    // ------------------------------------------------------------------
    // remote application shared by both roles

    fn apply_remote_insert(
        &mut self,
        buffer: &str,
        id: &Id,
        hint: usize,
        content: &str,
    ) -> Result<Effects> {
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        self.applying_remote = true;
        let pos = doc.apply_insert(id, hint, content);
        self.applying_remote = false;
        Ok(Effects::default().event(HostEvent::Inserted {
            buffer: buffer.to_owned(),
            pos,
            text: content.to_owned(),
        }))
    }

    fn apply_remote_delete(
        &mut self,
        buffer: &str,
        hint: usize,
        spans: &[(usize, Id)],
    ) -> Result<Effects> {
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        self.applying_remote = true;
        let removed = doc.apply_delete(hint, spans);
        self.applying_remote = false;
        let mut effects = Effects::default();
        for (pos, len) in removed {
            effects.events.push(HostEvent::Deleted {
                buffer: buffer.to_owned(),
                pos,
                len,
            });
        }
        Ok(effects)
    }

    fn apply_remote_cursor(
        &mut self,
        buffer: &str,
        site: u16,
        point: Option<Id>,
        point_hint: usize,
        mark: Option<Id>,
        mark_hint: usize,
    ) -> Result<Effects> {
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        doc.set_remote_cursor(site, point, point_hint, mark, mark_hint);
        let resolved = doc.resolve_cursor(site);
        Ok(Effects::default().event(HostEvent::Cursor {
            buffer: buffer.to_owned(),
            site,
            point: resolved.map(|(p, _)| p),
            mark: resolved.and_then(|(_, m)| m),
        }))
    }

    fn apply_remote_focus(&mut self, site: u16, buffer: String) -> Effects {
        self.focus.insert(site, buffer.clone());
        Effects::default().event(HostEvent::Focus { site, buffer })
    }

    /// Applies one of the overlay messages. Returns whether it changed
    /// anything; untouched tables mean an orphaned key that must not be
    /// rebroadcast.
    fn apply_remote_overlay(&mut self, msg: Message, strict: bool) -> Result<(bool, Effects)> {
        let buffer_name = match &msg {
            Message::OverlayAdd { buffer, .. }
            | Message::OverlayMove { buffer, .. }
            | Message::OverlayPut { buffer, .. }
            | Message::OverlayRemove { buffer, .. } => buffer.clone(),
            _ => {
                return ProtocolSnafu {
                    detail: "not an overlay message",
                }
                .fail()
            }
        };
        let Some(doc) = self.buffers.get_mut(&buffer_name) else {
            if strict {
                return UnknownBufferSnafu { name: buffer_name }.fail();
            }
            return Ok((false, Effects::default()));
        };
        self.applying_remote = true;
        let (key, applied, removed) = match msg {
            Message::OverlayAdd {
                site,
                clock,
                species,
                front_advance,
                rear_advance,
                start_hint,
                start,
                end_hint,
                end,
                ..
            } => {
                let key = OverlayKey { site, clock };
                let applied = doc.apply_overlay_add(
                    key,
                    species,
                    front_advance,
                    rear_advance,
                    start,
                    start_hint,
                    end,
                    end_hint,
                );
                (key, applied, false)
            }
            Message::OverlayMove {
                site,
                clock,
                start_hint,
                start,
                end_hint,
                end,
                ..
            } => {
                let key = OverlayKey { site, clock };
                (
                    key,
                    doc.apply_overlay_move(key, start, start_hint, end, end_hint),
                    false,
                )
            }
            Message::OverlayPut {
                site,
                clock,
                prop,
                value,
                ..
            } => {
                let key = OverlayKey { site, clock };
                (key, doc.apply_overlay_put(key, prop, value), false)
            }
            Message::OverlayRemove { site, clock, .. } => {
                let key = OverlayKey { site, clock };
                (key, doc.apply_overlay_remove(key), true)
            }
            _ => unreachable!("filtered above"),
        };
        self.applying_remote = false;
        if !applied {
            debug!(?buffer_name, "overlay message for unknown key dropped");
            return Ok((false, Effects::default()));
        }
        let range = if removed {
            None
        } else {
            self.buffers
                .get(&buffer_name)
                .and_then(|doc| doc.resolve_overlay(key))
        };
        Ok((
            true,
            Effects::default().event(HostEvent::Overlay {
                buffer: buffer_name,
                key,
                range,
            }),
        ))
    }

    // ------------------------------------------------------------------
    // local operations (the host boundary)

    /// True while a remote message is being applied; the host's own change
    /// hooks are rejected so an applied edit cannot echo back out.
    fn local_hooks_inhibited(&self) -> bool {
        if self.applying_remote {
            warn!("local change hook fired during remote application; ignoring");
        }
        self.applying_remote
    }

    /// Server only: start replicating a buffer.
    pub fn share_buffer(
        &mut self,
        name: &str,
        mode: Option<String>,
        content: &str,
    ) -> Result<Effects> {
        if self.is_client() {
            return WrongRoleSnafu { role: "server" }.fail();
        }
        if self.buffers.contains_key(name) {
            return AlreadySharedSnafu { name }.fail();
        }
        let mut doc = Document::new(name, self.site);
        doc.set_mode(mode);
        let _ = doc.local_insert(0, content, &mut self.rng);
        let sync = doc.sync_message();
        self.buffers.insert(name.to_owned(), doc);
        info!(name, "sharing buffer");
        Ok(Effects::default().frame(Target::All, sync))
    }

    /// Server only: stop replicating a buffer.
    pub fn stop_share_buffer(&mut self, name: &str) -> Result<Effects> {
        if self.is_client() {
            return WrongRoleSnafu { role: "server" }.fail();
        }
        self.buffers
            .remove(name)
            .context(UnknownBufferSnafu { name })?;
        info!(name, "stopped sharing buffer");
        Ok(Effects::default()
            .frame(
                Target::All,
                Message::Desync {
                    buffer: name.to_owned(),
                },
            )
            .event(HostEvent::Desynced {
                buffer: name.to_owned(),
            }))
    }

    /// The host inserted `text` at `pos`.
    pub fn local_insert(&mut self, buffer: &str, pos: usize, text: &str) -> Result<Effects> {
        if self.local_hooks_inhibited() {
            return Ok(Effects::default());
        }
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        let len = doc.len();
        if pos > len {
            return OutOfRangeSnafu { pos, len }.fail();
        }
        let msgs = doc.local_insert(pos, text, &mut self.rng);
        let mut effects = Effects::default();
        for msg in msgs {
            effects.frames.push((target, msg));
        }
        Ok(effects)
    }

    /// The host deleted `preimage` starting at `pos`.
    pub fn local_delete(&mut self, buffer: &str, pos: usize, preimage: &str) -> Result<Effects> {
        if self.local_hooks_inhibited() {
            return Ok(Effects::default());
        }
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        let len = doc.len();
        let span = preimage.chars().count();
        if pos + span > len {
            return OutOfRangeSnafu { pos: pos + span, len }.fail();
        }
        let msg = doc.local_delete(pos, preimage);
        Ok(Effects::default().frame(target, msg))
    }

    /// The host's cursor settled; publish it if it moved.
    pub fn local_cursor(
        &mut self,
        buffer: &str,
        point: usize,
        mark: Option<usize>,
    ) -> Result<Effects> {
        if self.local_hooks_inhibited() {
            return Ok(Effects::default());
        }
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        let len = doc.len();
        if point > len || mark.is_some_and(|m| m > len) {
            return OutOfRangeSnafu {
                pos: point.max(mark.unwrap_or(0)),
                len,
            }
            .fail();
        }
        Ok(match doc.local_cursor(point, mark) {
            Some(msg) => Effects::default().frame(target, msg),
            None => Effects::default(),
        })
    }

    /// The host switched to a buffer.
    pub fn local_focus(&mut self, buffer: &str) -> Result<Effects> {
        if !self.buffers.contains_key(buffer) {
            return UnknownBufferSnafu { name: buffer }.fail();
        }
        let site = self.site;
        self.focus.insert(site, buffer.to_owned());
        Ok(Effects::default().frame(
            self.hub_target(),
            Message::Focus {
                site,
                buffer: buffer.to_owned(),
            },
        ))
    }

    /// Creates a locally owned overlay and returns its key.
    pub fn create_overlay(
        &mut self,
        buffer: &str,
        species: &str,
        front_advance: bool,
        rear_advance: bool,
        beg: usize,
        end: usize,
    ) -> Result<(OverlayKey, Effects)> {
        let site = self.site;
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        let len = doc.len();
        if beg > end || end > len {
            return OutOfRangeSnafu { pos: end, len }.fail();
        }
        let key = OverlayKey {
            site,
            clock: self.clock,
        };
        self.clock += 1;
        let msg = doc.create_overlay(key, species, front_advance, rear_advance, beg, end);
        Ok((key, Effects::default().frame(target, msg)))
    }

    /// Re-anchors a locally owned overlay.
    pub fn move_overlay(
        &mut self,
        buffer: &str,
        key: OverlayKey,
        beg: usize,
        end: usize,
    ) -> Result<Effects> {
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        Ok(match doc.move_overlay(key, beg, end) {
            Some(msg) => Effects::default().frame(target, msg),
            None => Effects::default(),
        })
    }

    /// Replicates one overlay property. Values are printable by
    /// construction.
    pub fn put_overlay_prop(
        &mut self,
        buffer: &str,
        key: OverlayKey,
        prop: &str,
        value: Value,
    ) -> Result<Effects> {
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        Ok(match doc.put_overlay_prop(key, prop, value) {
            Some(msg) => Effects::default().frame(target, msg),
            None => Effects::default(),
        })
    }

    /// Deletes a locally owned overlay everywhere.
    pub fn remove_overlay(&mut self, buffer: &str, key: OverlayKey) -> Result<Effects> {
        let target = self.hub_target();
        let Some(doc) = self.buffers.get_mut(buffer) else {
            return UnknownBufferSnafu { name: buffer }.fail();
        };
        Ok(match doc.remove_overlay(key) {
            Some(msg) => Effects::default().frame(target, msg),
            None => Effects::default(),
        })
    }

    #[cfg(test)]
    fn document(&self, name: &str) -> Option<&Document> {
        self.buffers.get(name)
    }

    #[cfg(test)]
    fn exhaust_sites(&mut self) {
        if let Role::Server { next_site } = &mut self.role {
            *next_site = u16::MAX as u32 + 1;
        }
    }
}

// ----------------------------------------------------------------------
// host boundary

/// What a host embeds to render the replicated state. Every callback fires
/// from the engine task after the replica already changed; a host must not
/// call back into local-change entry points from inside them.
#[allow(unused_variables)]
pub trait Host: Send + 'static {
    fn logged_in(&mut self, site: u16, session: &str) {}
    fn buffer_synced(&mut self, buffer: &str, mode: Option<&str>, content: &str) {}
    fn buffer_desynced(&mut self, buffer: &str) {}
    fn remote_insert(&mut self, buffer: &str, pos: usize, text: &str) {}
    fn remote_delete(&mut self, buffer: &str, pos: usize, len: usize) {}
    fn remote_cursor(&mut self, buffer: &str, site: u16, point: Option<usize>, mark: Option<usize>) {
    }
    fn contact_update(&mut self, site: u16, name: Option<&str>) {}
    fn focus_update(&mut self, site: u16, buffer: &str) {}
    fn overlay_update(&mut self, buffer: &str, key: OverlayKey, range: Option<(usize, usize)>) {}
    fn session_ended(&mut self) {}
}

fn deliver(host: &mut dyn Host, event: HostEvent) {
    match event {
        HostEvent::LoggedIn { site, session } => host.logged_in(site, &session),
        HostEvent::Synced {
            buffer,
            mode,
            content,
        } => host.buffer_synced(&buffer, mode.as_deref(), &content),
        HostEvent::Desynced { buffer } => host.buffer_desynced(&buffer),
        HostEvent::Inserted { buffer, pos, text } => host.remote_insert(&buffer, pos, &text),
        HostEvent::Deleted { buffer, pos, len } => host.remote_delete(&buffer, pos, len),
        HostEvent::Cursor {
            buffer,
            site,
            point,
            mark,
        } => host.remote_cursor(&buffer, site, point, mark),
        HostEvent::Contact { site, name } => host.contact_update(site, name.as_deref()),
        HostEvent::Focus { site, buffer } => host.focus_update(site, &buffer),
        HostEvent::Overlay { buffer, key, range } => host.overlay_update(&buffer, key, range),
    }
}

// ----------------------------------------------------------------------
// async shell

#[derive(Debug)]
enum Command {
    Share {
        name: String,
        mode: Option<String>,
        content: String,
    },
    StopShare {
        name: String,
    },
    Insert {
        buffer: String,
        pos: usize,
        text: String,
    },
    Delete {
        buffer: String,
        pos: usize,
        preimage: String,
    },
    Cursor {
        buffer: String,
        point: usize,
        mark: Option<usize>,
    },
    Focus {
        buffer: String,
    },
    CreateOverlay {
        buffer: String,
        species: String,
        front_advance: bool,
        rear_advance: bool,
        beg: usize,
        end: usize,
        reply: flume::Sender<Option<OverlayKey>>,
    },
    MoveOverlay {
        buffer: String,
        key: OverlayKey,
        beg: usize,
        end: usize,
    },
    PutOverlayProp {
        buffer: String,
        key: OverlayKey,
        prop: String,
        value: Value,
    },
    RemoveOverlay {
        buffer: String,
        key: OverlayKey,
    },
    Snapshot {
        buffer: String,
        reply: flume::Sender<Option<String>>,
    },
    Stop,
}

#[derive(Debug)]
enum Event {
    Connected {
        conn: ConnId,
        writer: flume::Sender<String>,
    },
    Frame {
        conn: ConnId,
        msg: Message,
    },
    Bad {
        conn: ConnId,
        error: Error,
    },
    Closed {
        conn: ConnId,
    },
    Command(Command),
}

/// Handle to a running session. Cloneable; dropping it does not stop the
/// session — call [`Session::stop`].
#[derive(Clone)]
pub struct Session {
    tx: flume::Sender<Event>,
    local_addr: Option<SocketAddr>,
}

impl Session {
    /// The bound address when this session is a server.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(Event::Command(cmd))
            .map_err(|_| Error::SessionClosed)
    }

    /// Server only: start replicating a buffer with the given content.
    pub fn share_buffer(
        &self,
        name: impl Into<String>,
        mode: Option<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.command(Command::Share {
            name: name.into(),
            mode,
            content: content.into(),
        })
    }

    /// Server only: withdraw a buffer from the session.
    pub fn stop_share_buffer(&self, name: impl Into<String>) -> Result<()> {
        self.command(Command::StopShare { name: name.into() })
    }

    pub fn insert(&self, buffer: impl Into<String>, pos: usize, text: impl Into<String>) -> Result<()> {
        self.command(Command::Insert {
            buffer: buffer.into(),
            pos,
            text: text.into(),
        })
    }

    pub fn delete(
        &self,
        buffer: impl Into<String>,
        pos: usize,
        preimage: impl Into<String>,
    ) -> Result<()> {
        self.command(Command::Delete {
            buffer: buffer.into(),
            pos,
            preimage: preimage.into(),
        })
    }

    pub fn move_cursor(
        &self,
        buffer: impl Into<String>,
        point: usize,
        mark: Option<usize>,
    ) -> Result<()> {
        self.command(Command::Cursor {
            buffer: buffer.into(),
            point,
            mark,
        })
    }

    pub fn focus(&self, buffer: impl Into<String>) -> Result<()> {
        self.command(Command::Focus {
            buffer: buffer.into(),
        })
    }

    /// Creates an overlay and waits for its key.
    pub async fn create_overlay(
        &self,
        buffer: impl Into<String>,
        species: impl Into<String>,
        front_advance: bool,
        rear_advance: bool,
        beg: usize,
        end: usize,
    ) -> Result<OverlayKey> {
        let (reply, rx) = flume::bounded(1);
        self.command(Command::CreateOverlay {
            buffer: buffer.into(),
            species: species.into(),
            front_advance,
            rear_advance,
            beg,
            end,
            reply,
        })?;
        rx.recv_async()
            .await
            .ok()
            .flatten()
            .ok_or(Error::SessionClosed)
    }

    pub fn move_overlay(
        &self,
        buffer: impl Into<String>,
        key: OverlayKey,
        beg: usize,
        end: usize,
    ) -> Result<()> {
        self.command(Command::MoveOverlay {
            buffer: buffer.into(),
            key,
            beg,
            end,
        })
    }

    pub fn put_overlay_prop(
        &self,
        buffer: impl Into<String>,
        key: OverlayKey,
        prop: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.command(Command::PutOverlayProp {
            buffer: buffer.into(),
            key,
            prop: prop.into(),
            value,
        })
    }

    pub fn remove_overlay(&self, buffer: impl Into<String>, key: OverlayKey) -> Result<()> {
        self.command(Command::RemoveOverlay {
            buffer: buffer.into(),
            key,
        })
    }

    /// Current replica text of a shared buffer, if it exists.
    pub async fn buffer_text(&self, buffer: impl Into<String>) -> Result<Option<String>> {
        let (reply, rx) = flume::bounded(1);
        self.command(Command::Snapshot {
            buffer: buffer.into(),
            reply,
        })?;
        rx.recv_async().await.map_err(|_| Error::SessionClosed)
    }

    /// Tears the session down: every connection closes, the tables drop.
    pub fn stop(&self) {
        let _ = self.command(Command::Stop);
    }
}

/// Binds a listener and runs a server session on it. `addr` may use port 0
/// to let the OS pick; see [`Session::local_addr`].
pub async fn start_server(addr: &str, opts: SessionOptions, host: impl Host) -> Result<Session> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr().ok();
    info!(?local_addr, session = %opts.session_name, "session started");
    let (tx, rx) = flume::unbounded();

    let accept_tx = tx.clone();
    tokio::spawn(async move {
        let mut next_conn: ConnId = 1;
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(conn = next_conn, %peer_addr, "connection accepted");
                    spawn_connection(next_conn, stream, accept_tx.clone());
                    next_conn += 1;
                }
                Err(err) => {
                    warn!(%err, "accept failed; listener closing");
                    break;
                }
            }
        }
    });

    let engine = Engine::server(opts);
    tokio::spawn(run_engine(engine, rx, Box::new(host)));
    Ok(Session {
        tx,
        local_addr,
    })
}

/// Connects to a server session as a client.
pub async fn connect(addr: &str, opts: SessionOptions, host: impl Host) -> Result<Session> {
    let stream = TcpStream::connect(addr).await?;
    info!(addr, "connected to session");
    let (tx, rx) = flume::unbounded();
    spawn_connection(CLIENT_CONN, stream, tx.clone());
    let engine = Engine::client(opts);
    tokio::spawn(run_engine(engine, rx, Box::new(host)));
    Ok(Session {
        tx,
        local_addr: None,
    })
}

fn spawn_connection(conn: ConnId, stream: TcpStream, tx: flume::Sender<Event>) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = flume::unbounded::<String>();
    // the registration must outrun the first frame; same queue keeps order
    let _ = tx.send(Event::Connected {
        conn,
        writer: writer_tx,
    });
    tokio::spawn(read_frames(conn, read_half, tx));
    tokio::spawn(write_frames(write_half, writer_rx));
}

async fn read_frames(conn: ConnId, mut half: OwnedReadHalf, tx: flume::Sender<Event>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8192];
    'receive: loop {
        let n = match half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        buf.extend_from_slice(&chunk[..n]);
        loop {
            let valid_len = match std::str::from_utf8(&buf) {
                Ok(_) => buf.len(),
                // a multibyte character split across reads is not an error
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => {
                    let _ = tx.send(Event::Bad {
                        conn,
                        error: Error::Protocol {
                            detail: "invalid utf-8 on the wire".into(),
                        },
                    });
                    break 'receive;
                }
            };
            let text = match std::str::from_utf8(&buf[..valid_len]) {
                Ok(text) => text,
                Err(_) => break,
            };
            match crate::sexp::read_one(text) {
                Ok(None) => break,
                Ok(Some((value, used))) => {
                    match Message::decode(value) {
                        Ok(msg) => {
                            if tx.send(Event::Frame { conn, msg }).is_err() {
                                break 'receive;
                            }
                        }
                        Err(error) => {
                            let _ = tx.send(Event::Bad { conn, error });
                            break 'receive;
                        }
                    }
                    buf.drain(..used);
                }
                Err(error) => {
                    let _ = tx.send(Event::Bad { conn, error });
                    break 'receive;
                }
            }
        }
    }
    let _ = tx.send(Event::Closed { conn });
}

async fn write_frames(mut half: OwnedWriteHalf, rx: flume::Receiver<String>) {
    while let Ok(frame) = rx.recv_async().await {
        if half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = half.shutdown().await;
}

async fn run_engine(mut engine: Engine, rx: flume::Receiver<Event>, mut host: Box<dyn Host>) {
    let mut writers: HashMap<ConnId, flume::Sender<String>> = HashMap::new();
    let is_client = engine.is_client();
    while let Ok(event) = rx.recv_async().await {
        match event {
            Event::Connected { conn, writer } => {
                writers.insert(conn, writer);
                if is_client {
                    let effects = engine.client_connected();
                    dispatch(&mut writers, &mut *host, effects);
                } else {
                    engine.register(conn);
                }
            }
            Event::Frame { conn, msg } => match engine.handle_frame(conn, msg) {
                Ok(effects) => dispatch(&mut writers, &mut *host, effects),
                Err(err) => {
                    warn!(conn, %err, "error applying frame");
                    if is_client {
                        break;
                    }
                    writers.remove(&conn);
                    let effects = engine.disconnect(conn);
                    dispatch(&mut writers, &mut *host, effects);
                }
            },
            Event::Bad { conn, error } => {
                warn!(conn, %error, "unreadable frame");
                if is_client {
                    break;
                }
                writers.remove(&conn);
                let effects = engine.disconnect(conn);
                dispatch(&mut writers, &mut *host, effects);
            }
            Event::Closed { conn } => {
                writers.remove(&conn);
                if is_client {
                    break;
                }
                let effects = engine.disconnect(conn);
                dispatch(&mut writers, &mut *host, effects);
            }
            Event::Command(cmd) => {
                if run_command(&mut engine, cmd, &mut writers, &mut *host) {
                    break;
                }
            }
        }
    }
    host.session_ended();
}

/// Executes one host command. Returns true when the session should stop.
fn run_command(
    engine: &mut Engine,
    cmd: Command,
    writers: &mut HashMap<ConnId, flume::Sender<String>>,
    host: &mut dyn Host,
) -> bool {
    let outcome = match cmd {
        Command::Stop => return true,
        Command::Share {
            name,
            mode,
            content,
        } => engine.share_buffer(&name, mode, &content),
        Command::StopShare { name } => engine.stop_share_buffer(&name),
        Command::Insert { buffer, pos, text } => engine.local_insert(&buffer, pos, &text),
        Command::Delete {
            buffer,
            pos,
            preimage,
        } => engine.local_delete(&buffer, pos, &preimage),
        Command::Cursor {
            buffer,
            point,
            mark,
        } => engine.local_cursor(&buffer, point, mark),
        Command::Focus { buffer } => engine.local_focus(&buffer),
        Command::CreateOverlay {
            buffer,
            species,
            front_advance,
            rear_advance,
            beg,
            end,
            reply,
        } => match engine.create_overlay(&buffer, &species, front_advance, rear_advance, beg, end) {
            Ok((key, effects)) => {
                let _ = reply.send(Some(key));
                Ok(effects)
            }
            Err(err) => {
                let _ = reply.send(None);
                Err(err)
            }
        },
        Command::MoveOverlay {
            buffer,
            key,
            beg,
            end,
        } => engine.move_overlay(&buffer, key, beg, end),
        Command::PutOverlayProp {
            buffer,
            key,
            prop,
            value,
        } => engine.put_overlay_prop(&buffer, key, &prop, value),
        Command::RemoveOverlay { buffer, key } => engine.remove_overlay(&buffer, key),
        Command::Snapshot { buffer, reply } => {
            let _ = reply.send(engine.buffer_text(&buffer));
            Ok(Effects::default())
        }
    };
    match outcome {
        Ok(effects) => dispatch(writers, host, effects),
        Err(err) => warn!(%err, "host command failed"),
    }
    false
}

fn dispatch(
    writers: &mut HashMap<ConnId, flume::Sender<String>>,
    host: &mut dyn Host,
    effects: Effects,
) {
    for (target, msg) in effects.frames {
        let frame = msg.to_frame();
        match target {
            Target::Conn(id) => {
                if let Some(writer) = writers.get(&id) {
                    let _ = writer.send(frame);
                }
            }
            Target::All => {
                for writer in writers.values() {
                    let _ = writer.send(frame.clone());
                }
            }
            Target::AllExcept(skip) => {
                for (id, writer) in writers.iter() {
                    if *id != skip {
                        let _ = writer.send(frame.clone());
                    }
                }
            }
        }
    }
    for event in effects.events {
        deliver(host, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn opts(session: &str, display: &str, password: Option<&str>) -> SessionOptions {
        SessionOptions {
            session_name: session.into(),
            display_name: display.into(),
            password: password.map(str::to_owned),
        }
    }

    fn frames_for(effects: &Effects, target: Target) -> Vec<&Message> {
        effects
            .frames
            .iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, m)| m)
            .collect()
    }

    // ------------------------------------------------------------------
    // engine

    #[test]
    fn passwordless_hello_is_admitted_with_full_replay() {
        let mut server = Engine::server(opts("room", "owner", None));
        server.share_buffer("notes", None, "HELLO").unwrap();
        server
            .local_cursor("notes", 2, None)
            .unwrap();
        server.register(7);
        let effects = server
            .handle_frame(
                7,
                Message::Hello {
                    name: "alice".into(),
                    response: None,
                },
            )
            .unwrap();
        let direct = frames_for(&effects, Target::Conn(7));
        assert!(matches!(
            direct[0],
            Message::Login { site: 1, session } if session == "room"
        ));
        assert!(matches!(direct[1], Message::Sync { buffer, .. } if buffer == "notes"));
        assert!(matches!(direct[2], Message::Cursor { site: 0, .. }));
        assert!(
            matches!(direct[3], Message::Contact { site: 0, name: Some(n) } if n == "owner")
        );
        // everyone else hears about the newcomer
        let broadcast = frames_for(&effects, Target::AllExcept(7));
        assert!(
            matches!(broadcast[0], Message::Contact { site: 1, name: Some(n) } if n == "alice")
        );
    }

    #[test]
    fn challenge_flow_accepts_good_hmac() {
        let mut server = Engine::server(opts("room", "owner", Some("secret")));
        server.register(1);
        let effects = server
            .handle_frame(
                1,
                Message::Hello {
                    name: "alice".into(),
                    response: None,
                },
            )
            .unwrap();
        let salt = match frames_for(&effects, Target::Conn(1))[0] {
            Message::Challenge { salt } => salt.clone(),
            other => panic!("expected challenge, got {other:?}"),
        };
        assert_eq!(salt.len(), 32);
        let effects = server
            .handle_frame(
                1,
                Message::Hello {
                    name: "alice".into(),
                    response: Some(challenge_response("secret", &salt)),
                },
            )
            .unwrap();
        assert!(matches!(
            frames_for(&effects, Target::Conn(1))[0],
            Message::Login { site: 1, .. }
        ));
    }

    #[test]
    fn challenge_flow_rejects_bad_hmac() {
        let mut server = Engine::server(opts("room", "owner", Some("secret")));
        server.register(1);
        let effects = server
            .handle_frame(
                1,
                Message::Hello {
                    name: "alice".into(),
                    response: None,
                },
            )
            .unwrap();
        let salt = match frames_for(&effects, Target::Conn(1))[0] {
            Message::Challenge { salt } => salt.clone(),
            other => panic!("expected challenge, got {other:?}"),
        };
        let result = server.handle_frame(
            1,
            Message::Hello {
                name: "alice".into(),
                response: Some(challenge_response("wrong", &salt)),
            },
        );
        assert!(matches!(result, Err(Error::Auth)));
    }

    #[test]
    fn operations_before_auth_are_violations() {
        let mut server = Engine::server(opts("room", "owner", None));
        server.register(1);
        let result = server.handle_frame(
            1,
            Message::Focus {
                site: 1,
                buffer: "notes".into(),
            },
        );
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn site_exhaustion_refuses_admission() {
        let mut server = Engine::server(opts("room", "owner", None));
        server.exhaust_sites();
        server.register(1);
        let result = server.handle_frame(
            1,
            Message::Hello {
                name: "alice".into(),
                response: None,
            },
        );
        assert!(matches!(result, Err(Error::SitesExhausted)));
    }

    fn admitted_pair() -> (Engine, Engine, Engine) {
        // a server with one shared buffer and two admitted clients wired up
        // by hand-delivering frames
        let mut server = Engine::server(opts("room", "owner", None));
        server.share_buffer("notes", None, "HELLO").unwrap();
        let mut c1 = Engine::client(opts("", "alice", None));
        let mut c2 = Engine::client(opts("", "bob", None));
        for (conn, client) in [(1u64, &mut c1), (2u64, &mut c2)] {
            server.register(conn);
            let effects = server
                .handle_frame(
                    conn,
                    Message::Hello {
                        name: "peer".into(),
                        response: None,
                    },
                )
                .unwrap();
            for (target, msg) in effects.frames {
                if target == Target::Conn(conn) {
                    client.handle_frame(CLIENT_CONN, msg).unwrap();
                }
            }
        }
        (server, c1, c2)
    }

    #[test]
    fn hub_applies_and_rebroadcasts_with_origin_suppressed() {
        let (mut server, mut c1, mut c2) = admitted_pair();
        assert_eq!(c1.buffer_text("notes").as_deref(), Some("HELLO"));

        // client 1 types "!" at the end
        let effects = c1.local_insert("notes", 5, "!").unwrap();
        assert_eq!(effects.frames.len(), 1);
        let (target, msg) = &effects.frames[0];
        assert_eq!(*target, Target::Conn(CLIENT_CONN));

        // the server applies it and forwards to everyone but the origin
        let server_effects = server.handle_frame(1, msg.clone()).unwrap();
        assert_eq!(server.buffer_text("notes").as_deref(), Some("HELLO!"));
        let forwarded = frames_for(&server_effects, Target::AllExcept(1));
        assert_eq!(forwarded.len(), 1);

        // client 2 applies the forwarded copy and converges
        c2.handle_frame(CLIENT_CONN, forwarded[0].clone()).unwrap();
        assert_eq!(c2.buffer_text("notes").as_deref(), Some("HELLO!"));
    }

    #[test]
    fn unknown_buffer_from_client_drops_connection() {
        let (mut server, mut c1, _) = admitted_pair();
        let effects = c1.local_insert("notes", 0, "x").unwrap();
        let msg = match &effects.frames[0].1 {
            Message::Insert { id, hint, content, .. } => Message::Insert {
                buffer: "no-such-buffer".into(),
                id: id.clone(),
                hint: *hint,
                content: content.clone(),
            },
            _ => unreachable!(),
        };
        assert!(matches!(
            server.handle_frame(1, msg),
            Err(Error::UnknownBuffer { .. })
        ));
    }

    #[test]
    fn disconnect_clears_cursor_and_contact() {
        let (mut server, mut c1, mut c2) = admitted_pair();
        let effects = c1.local_cursor("notes", 3, None).unwrap();
        let cursor = effects.frames[0].1.clone();
        server.handle_frame(1, cursor).unwrap();
        assert!(server
            .document("notes")
            .unwrap()
            .resolve_cursor(1)
            .is_some());

        let effects = server.disconnect(1);
        assert!(server
            .document("notes")
            .unwrap()
            .resolve_cursor(1)
            .is_none());
        let cleared: Vec<_> = effects
            .frames
            .iter()
            .map(|(_, m)| m)
            .collect();
        assert!(cleared
            .iter()
            .any(|m| matches!(m, Message::Cursor { site: 1, point: None, .. })));
        assert!(cleared
            .iter()
            .any(|m| matches!(m, Message::Contact { site: 1, name: None })));
        // the other client processes the clears without complaint
        for msg in cleared {
            c2.handle_frame(CLIENT_CONN, msg.clone()).unwrap();
        }
    }

    #[test]
    fn desync_withdraws_buffer_from_clients() {
        let (mut server, mut c1, _) = admitted_pair();
        let effects = server.stop_share_buffer("notes").unwrap();
        let msg = effects.frames[0].1.clone();
        let client_effects = c1.handle_frame(CLIENT_CONN, msg).unwrap();
        assert!(matches!(
            client_effects.events[0],
            HostEvent::Desynced { .. }
        ));
        assert!(c1.buffer_text("notes").is_none());
        // a late edit for the gone buffer is ignored, not fatal
        let late = Message::Insert {
            buffer: "notes".into(),
            id: Id::from_bytes(vec![0, 9, 0, 1, 0, 0]).unwrap(),
            hint: 0,
            content: "x".into(),
        };
        assert!(c1.handle_frame(CLIENT_CONN, late).unwrap().events.is_empty());
    }

    #[test]
    fn overlays_replicate_through_the_hub() {
        let (mut server, mut c1, mut c2) = admitted_pair();
        let (key, effects) = c1
            .create_overlay("notes", "highlight", true, false, 0, 5)
            .unwrap();
        let add = effects.frames[0].1.clone();
        let server_effects = server.handle_frame(1, add).unwrap();
        let forwarded = frames_for(&server_effects, Target::AllExcept(1));
        c2.handle_frame(CLIENT_CONN, forwarded[0].clone()).unwrap();
        assert_eq!(
            c2.document("notes").unwrap().resolve_overlay(key),
            Some((0, 5))
        );

        // an orphaned move is swallowed by the hub
        let orphan = Message::OverlayMove {
            buffer: "notes".into(),
            site: 9,
            clock: 42,
            start_hint: 0,
            start: Id::empty(),
            end_hint: 0,
            end: Id::empty(),
        };
        let server_effects = server.handle_frame(1, orphan).unwrap();
        assert!(server_effects.frames.is_empty());
    }

    #[test]
    fn newcomer_replay_includes_cursors_focus_and_overlays() {
        let (mut server, mut c1, _) = admitted_pair();
        for effects in [
            c1.local_cursor("notes", 1, Some(3)).unwrap(),
            c1.local_focus("notes").unwrap(),
            c1.create_overlay("notes", "note", false, true, 1, 4)
                .unwrap()
                .1,
        ] {
            for (_, msg) in effects.frames {
                server.handle_frame(1, msg).unwrap();
            }
        }
        server.register(9);
        let effects = server
            .handle_frame(
                9,
                Message::Hello {
                    name: "carol".into(),
                    response: None,
                },
            )
            .unwrap();
        let replay = frames_for(&effects, Target::Conn(9));
        assert!(replay.iter().any(|m| matches!(m, Message::Cursor { site: 1, .. })));
        assert!(replay.iter().any(|m| matches!(m, Message::Focus { site: 1, .. })));
        assert!(replay
            .iter()
            .any(|m| matches!(m, Message::OverlayAdd { site: 1, .. })));
    }

    // ------------------------------------------------------------------
    // shell

    #[derive(Clone, Default)]
    struct RecordingHost {
        state: Arc<Mutex<HostState>>,
    }

    #[derive(Default)]
    struct HostState {
        site: Option<u16>,
        buffers: HashMap<String, String>,
        contacts: BTreeMap<u16, Option<String>>,
        ended: bool,
    }

    impl RecordingHost {
        fn buffer(&self, name: &str) -> Option<String> {
            self.state.lock().unwrap().buffers.get(name).cloned()
        }

        fn ended(&self) -> bool {
            self.state.lock().unwrap().ended
        }

        fn site(&self) -> Option<u16> {
            self.state.lock().unwrap().site
        }

        fn contact(&self, site: u16) -> Option<Option<String>> {
            self.state.lock().unwrap().contacts.get(&site).cloned()
        }
    }

    fn char_to_byte(s: &str, pos: usize) -> usize {
        s.char_indices().nth(pos).map(|(b, _)| b).unwrap_or(s.len())
    }

    impl Host for RecordingHost {
        fn logged_in(&mut self, site: u16, _session: &str) {
            self.state.lock().unwrap().site = Some(site);
        }

        fn buffer_synced(&mut self, buffer: &str, _mode: Option<&str>, content: &str) {
            self.state
                .lock()
                .unwrap()
                .buffers
                .insert(buffer.to_owned(), content.to_owned());
        }

        fn buffer_desynced(&mut self, buffer: &str) {
            self.state.lock().unwrap().buffers.remove(buffer);
        }

        fn remote_insert(&mut self, buffer: &str, pos: usize, text: &str) {
            let mut state = self.state.lock().unwrap();
            if let Some(mirror) = state.buffers.get_mut(buffer) {
                let at = char_to_byte(mirror, pos);
                mirror.insert_str(at, text);
            }
        }

        fn remote_delete(&mut self, buffer: &str, pos: usize, len: usize) {
            let mut state = self.state.lock().unwrap();
            if let Some(mirror) = state.buffers.get_mut(buffer) {
                let beg = char_to_byte(mirror, pos);
                let end = char_to_byte(mirror, pos + len);
                mirror.replace_range(beg..end, "");
            }
        }

        fn contact_update(&mut self, site: u16, name: Option<&str>) {
            self.state
                .lock()
                .unwrap()
                .contacts
                .insert(site, name.map(str::to_owned));
        }

        fn session_ended(&mut self) {
            self.state.lock().unwrap().ended = true;
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn end_to_end_session_converges() {
        let server_host = RecordingHost::default();
        let server = start_server(
            "127.0.0.1:0",
            opts("room", "owner", Some("secret")),
            server_host.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        server.share_buffer("notes", None, "HELLO").unwrap();

        let alice_host = RecordingHost::default();
        let alice = connect(&addr, opts("", "alice", Some("secret")), alice_host.clone())
            .await
            .unwrap();
        wait_for(|| alice_host.buffer("notes").as_deref() == Some("HELLO")).await;
        assert_eq!(alice_host.site(), Some(1));

        // an edit from the client reaches the server replica
        alice.insert("notes", 5, " WORLD").unwrap();
        let mut converged = false;
        for _ in 0..250 {
            let text = server.buffer_text("notes").await.unwrap();
            if text.as_deref() == Some("HELLO WORLD") {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(converged, "server replica never converged");

        // an edit from the server reaches the client mirror
        server.delete("notes", 0, "HELLO ").unwrap();
        wait_for(|| alice_host.buffer("notes").as_deref() == Some("WORLD")).await;

        // a late joiner snapshots the converged state and learns of alice
        let bob_host = RecordingHost::default();
        let _bob = connect(&addr, opts("", "bob", Some("secret")), bob_host.clone())
            .await
            .unwrap();
        wait_for(|| bob_host.buffer("notes").as_deref() == Some("WORLD")).await;
        wait_for(|| bob_host.contact(1).flatten().as_deref() == Some("alice")).await;

        server.stop();
        wait_for(|| alice_host.ended() && bob_host.ended()).await;
    }

    #[tokio::test]
    async fn wrong_password_is_dropped_without_login() {
        let server = start_server(
            "127.0.0.1:0",
            opts("room", "owner", Some("secret")),
            RecordingHost::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let mallory_host = RecordingHost::default();
        let _mallory = connect(&addr, opts("", "mallory", Some("guess")), mallory_host.clone())
            .await
            .unwrap();
        wait_for(|| mallory_host.ended()).await;
        assert_eq!(mallory_host.site(), None);
        server.stop();
    }
}
