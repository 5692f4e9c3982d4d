use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::code::CodeAllocator;
use super::messages::Envelope;
use super::types::{ConnId, Frame, Member, Room, RoomCode, SignalingError};

const COMMAND_CHANNEL_SIZE: usize = 1024;

/// What `join` does when no room exists for the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MissingRoom {
    Reject,
    Create,
}

/// Commands sent to the room registry actor
pub(crate) enum RoomCommand {
    Create {
        member: Member,
        reply: oneshot::Sender<Result<RoomCode, SignalingError>>,
    },
    Join {
        code: RoomCode,
        member: Member,
        missing: MissingRoom,
        reply: oneshot::Sender<Result<(), SignalingError>>,
    },
    Leave {
        id: ConnId,
    },
    Relay {
        from: ConnId,
        msg: Frame,
    },
    Members {
        code: RoomCode,
        reply: oneshot::Sender<Vec<ConnId>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Room state owned by the registry actor.
///
/// Every command runs to completion before the next is taken off the
/// channel, so a membership change and the broadcast it triggers are
/// never observed half-done.
pub(crate) struct RoomRegistry {
    rooms: HashMap<RoomCode, Room>,
    memberships: HashMap<ConnId, RoomCode>,
    allocator: CodeAllocator,
    capacity: usize,
    /// Push `peer-join`/`peer-leave` to the remaining members.
    announce: bool,
}

impl RoomRegistry {
    pub fn new(capacity: usize, allocator: CodeAllocator, announce: bool) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            allocator,
            capacity: capacity.max(1),
            announce,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        debug!("Room registry stopped ({} rooms dropped)", self.rooms.len());
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Create { member, reply } => {
                let _ = reply.send(self.create(member));
            }
            RoomCommand::Join {
                code,
                member,
                missing,
                reply,
            } => {
                let _ = reply.send(self.join(code, member, missing));
            }
            RoomCommand::Leave { id } => self.leave(id),
            RoomCommand::Relay { from, msg } => self.relay(from, msg),
            RoomCommand::Members { code, reply } => {
                let ids = self
                    .rooms
                    .get(&code)
                    .map(|room| room.members.iter().map(|m| m.id).collect())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            RoomCommand::RoomCount { reply } => {
                let _ = reply.send(self.rooms.len());
            }
        }
    }

    fn create(&mut self, member: Member) -> Result<RoomCode, SignalingError> {
        if self.memberships.contains_key(&member.id) {
            return Err(SignalingError::AlreadyInRoom(member.id));
        }

        let rooms = &self.rooms;
        let code = self
            .allocator
            .allocate(|base| rooms.contains_key(&RoomCode::from_base(*base)));

        info!("Room created: {} by {}", code, member.id);
        self.memberships.insert(member.id, code);
        self.rooms.insert(
            code,
            Room {
                members: vec![member],
            },
        );
        Ok(code)
    }

    fn join(
        &mut self,
        code: RoomCode,
        member: Member,
        missing: MissingRoom,
    ) -> Result<(), SignalingError> {
        if self.memberships.contains_key(&member.id) {
            return Err(SignalingError::AlreadyInRoom(member.id));
        }

        let id = member.id;
        match self.rooms.get_mut(&code) {
            Some(room) => {
                if room.members.len() >= self.capacity {
                    return Err(SignalingError::RoomFull(code));
                }
                if self.announce {
                    announce(room, &Envelope::PeerJoin);
                }
                room.members.push(member);
            }
            None if missing == MissingRoom::Create => {
                info!("Room created on demand: {} by {}", code, id);
                self.rooms.insert(
                    code,
                    Room {
                        members: vec![member],
                    },
                );
            }
            None => return Err(SignalingError::RoomNotFound(code)),
        }

        self.memberships.insert(id, code);
        info!("{} joined room {}", id, code);
        Ok(())
    }

    fn leave(&mut self, id: ConnId) {
        let Some(code) = self.memberships.remove(&id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&code) else {
            return;
        };

        room.members.retain(|m| m.id != id);
        info!("{} left room {}", id, code);

        if room.members.is_empty() {
            self.rooms.remove(&code);
            info!("Room {} removed (empty)", code);
        } else if self.announce {
            announce(room, &Envelope::PeerLeave);
        }
    }

    fn relay(&self, from: ConnId, msg: Frame) {
        let Some(room) = self.memberships.get(&from).and_then(|c| self.rooms.get(c)) else {
            debug!("Dropping frame from {}: not in a room", from);
            return;
        };
        let delivered = room.broadcast(&msg, Some(from));
        debug!("Relayed frame from {} to {} member(s)", from, delivered);
    }
}

fn announce(room: &Room, envelope: &Envelope) {
    // Unit variants always serialize.
    if let Ok(msg) = envelope.to_frame() {
        room.broadcast(&msg, None);
    }
}

/// Handle to communicate with the room registry actor
#[derive(Clone)]
pub struct RoomRegistryHandle {
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

impl RoomRegistryHandle {
    /// Spawns a registry actor whose rooms hold at most `capacity` members.
    pub fn spawn(capacity: usize) -> Self {
        Self::spawn_with(capacity, CodeAllocator::new(), true)
    }

    /// Like [`spawn`](Self::spawn); with `announce` off, members are never
    /// sent membership changes and only ever see each other's frames.
    pub fn spawn_with(capacity: usize, allocator: CodeAllocator, announce: bool) -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand>(COMMAND_CHANNEL_SIZE);
        tokio::spawn(RoomRegistry::new(capacity, allocator, announce).run(rx));
        Self { tx }
    }

    /// Create a new room with `member` as its only member
    pub async fn create(&self, member: Member) -> Result<RoomCode, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Create {
            member,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| closed())?
    }

    /// Join an existing room, announcing `peer-join` to its members
    pub async fn join(&self, code: RoomCode, member: Member) -> Result<(), SignalingError> {
        self.join_with(code, member, MissingRoom::Reject).await
    }

    /// Join the room for `code`, creating it if it does not exist
    pub async fn join_or_create(&self, code: RoomCode, member: Member) -> Result<(), SignalingError> {
        self.join_with(code, member, MissingRoom::Create).await
    }

    async fn join_with(
        &self,
        code: RoomCode,
        member: Member,
        missing: MissingRoom,
    ) -> Result<(), SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            code,
            member,
            missing,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| closed())?
    }

    /// Leave the current room; no-op when not in one
    pub async fn leave(&self, id: ConnId) {
        let _ = self.tx.send(RoomCommand::Leave { id }).await;
    }

    /// Forward `msg` to every other writable member of the sender's room
    pub async fn relay(&self, from: ConnId, msg: Frame) {
        let _ = self.tx.send(RoomCommand::Relay { from, msg }).await;
    }

    pub async fn members(&self, code: RoomCode) -> Vec<ConnId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(RoomCommand::Members {
                code,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(RoomCommand::RoomCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or_default()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), SignalingError> {
        self.tx.send(cmd).await.map_err(|_| closed())
    }
}

fn closed() -> SignalingError {
    SignalingError::Internal("registry channel closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> (Member, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Member::new(ConnId::next(), tx), rx)
    }

    fn text(msg: Frame) -> String {
        match msg {
            Frame::Text(t) => t.to_string(),
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn create_registers_single_member() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, _a_rx) = member();
        let a_id = a.id;

        let code = registry.create(a).await.unwrap();
        assert_eq!(registry.members(code).await, vec![a_id]);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn join_unknown_code_is_room_not_found_and_mutates_nothing() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, _a_rx) = member();
        let a_id = a.id;
        let existing = registry.create(a).await.unwrap();

        let unknown = RoomCode::from_base(*b"ZZZZZZZ");
        assert_ne!(unknown, existing);
        let (b, _b_rx) = member();
        let err = registry.join(unknown, b.clone()).await.unwrap_err();
        assert!(matches!(err, SignalingError::RoomNotFound(c) if c == unknown));

        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.members(existing).await, vec![a_id]);
        assert!(registry.members(unknown).await.is_empty());

        // B stays unassociated and may still join a real room.
        registry.join(existing, b).await.unwrap();
    }

    #[tokio::test]
    async fn join_announces_peer_join_to_existing_members_only() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, mut a_rx) = member();
        let (b, mut b_rx) = member();
        let code = registry.create(a).await.unwrap();

        registry.join(code, b).await.unwrap();

        assert_eq!(text(a_rx.try_recv().unwrap()), r#"{"type":"peer-join"}"#);
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_full_room_is_rejected() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, _a_rx) = member();
        let (b, _b_rx) = member();
        let (c, _c_rx) = member();
        let code = registry.create(a).await.unwrap();
        registry.join(code, b).await.unwrap();

        let err = registry.join(code, c).await.unwrap_err();
        assert!(matches!(err, SignalingError::RoomFull(_)));
        assert_eq!(registry.members(code).await.len(), 2);
    }

    #[tokio::test]
    async fn connection_is_in_at_most_one_room() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, _a_rx) = member();
        let (b, _b_rx) = member();
        let code = registry.create(a.clone()).await.unwrap();
        registry.create(b).await.unwrap();

        assert!(matches!(
            registry.create(a.clone()).await,
            Err(SignalingError::AlreadyInRoom(_))
        ));
        assert!(matches!(
            registry.join(code, a).await,
            Err(SignalingError::AlreadyInRoom(_))
        ));
    }

    #[tokio::test]
    async fn relay_reaches_others_but_not_sender() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, mut a_rx) = member();
        let (b, mut b_rx) = member();
        let a_id = a.id;
        let code = registry.create(a).await.unwrap();
        registry.join(code, b).await.unwrap();
        let _ = a_rx.try_recv(); // peer-join

        registry
            .relay(a_id, Frame::from("x".to_string()))
            .await;
        registry.room_count().await;

        assert_eq!(text(b_rx.try_recv().unwrap()), "x");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_skips_unwritable_members() {
        let registry = RoomRegistryHandle::spawn(3);
        let (a, _a_rx) = member();
        let (b, b_rx) = member();
        let (c, mut c_rx) = member();
        let a_id = a.id;
        let code = registry.create(a).await.unwrap();
        registry.join(code, b).await.unwrap();
        registry.join(code, c).await.unwrap();
        drop(b_rx);

        registry
            .relay(a_id, Frame::from("y".to_string()))
            .await;
        registry.room_count().await;

        assert_eq!(text(c_rx.try_recv().unwrap()), "y");
    }

    #[tokio::test]
    async fn relay_from_unassociated_connection_is_dropped() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, mut a_rx) = member();
        registry.create(a).await.unwrap();

        registry
            .relay(ConnId::next(), Frame::from("z".to_string()))
            .await;
        registry.room_count().await;

        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_announces_peer_leave_and_removes_empty_room() {
        let registry = RoomRegistryHandle::spawn(2);
        let (a, mut a_rx) = member();
        let (b, _b_rx) = member();
        let (a_id, b_id) = (a.id, b.id);
        let code = registry.create(a).await.unwrap();
        registry.join(code, b).await.unwrap();
        let _ = a_rx.try_recv(); // peer-join

        registry.leave(b_id).await;
        assert_eq!(registry.members(code).await, vec![a_id]);
        assert_eq!(text(a_rx.try_recv().unwrap()), r#"{"type":"peer-leave"}"#);

        registry.leave(a_id).await;
        assert_eq!(registry.room_count().await, 0);

        let (d, _d_rx) = member();
        assert!(matches!(
            registry.join(code, d).await,
            Err(SignalingError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn leave_without_room_is_noop() {
        let registry = RoomRegistryHandle::spawn(2);
        registry.leave(ConnId::next()).await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn join_or_create_keys_room_by_given_code() {
        let registry = RoomRegistryHandle::spawn(2);
        let code = RoomCode::from_base(*b"RELAY22");
        let (a, mut a_rx) = member();
        let (b, _b_rx) = member();

        registry.join_or_create(code, a).await.unwrap();
        assert_eq!(registry.room_count().await, 1);
        registry.join_or_create(code, b).await.unwrap();
        assert_eq!(registry.members(code).await.len(), 2);
        assert_eq!(text(a_rx.try_recv().unwrap()), r#"{"type":"peer-join"}"#);
    }

    #[tokio::test]
    async fn silent_registry_only_carries_member_frames() {
        let registry = RoomRegistryHandle::spawn_with(2, CodeAllocator::with_seed(7), false);
        let code = RoomCode::from_base(*b"RELAY22");
        let (a, mut a_rx) = member();
        let (b, _b_rx) = member();
        let (a_id, b_id) = (a.id, b.id);

        registry.join_or_create(code, a).await.unwrap();
        registry.join_or_create(code, b).await.unwrap();
        registry.relay(b_id, Frame::from("payload".to_string())).await;
        registry.leave(b_id).await;
        assert_eq!(registry.members(code).await, vec![a_id]);

        assert_eq!(text(a_rx.try_recv().unwrap()), "payload");
        assert!(a_rx.try_recv().is_err());
    }
}
