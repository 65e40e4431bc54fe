//! Cluster membership configuration.
//!
//! A configuration is a flat array of servers. The array is small (typically
//! at most 9 servers) and lookups vastly outnumber mutations, so every search
//! is a linear scan.
//!
//! During a joint-consensus membership change the configuration carries two
//! overlapping views: the `Old` view projects each server's `role`, the `New`
//! view its `role_new`, and the `group` bitmask says which views a server
//! belongs to. Quorum decisions must then be reached in both views.

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::ServerId;

/// Version tag of the configuration wire encoding.
const CONF_VERSION: u8 = 1;
/// Size in bytes of the meta block separating legacy and extended records.
const CONF_META_SIZE: usize = 256;
/// Version tag of the meta block.
const CONF_META_VERSION: u32 = 1;
/// Version tag of the extended server record.
const CONF_SERVER_VERSION: u32 = 1;
/// Size in bytes of one extended server record.
const CONF_SERVER_SIZE: u32 = 11;

/// The role a server plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Receives entries but does not count toward quorum.
    Standby = 0,
    /// Full participant: replicates entries and counts toward quorum.
    Voter = 1,
    /// Inert until promoted; receives no entries.
    Spare = 2,
    /// Receives entries for durability but does not vote.
    Logger = 3,
}

impl Role {
    fn from_u8(val: u8) -> Option<Role> {
        match val {
            0 => Some(Role::Standby),
            1 => Some(Role::Voter),
            2 => Some(Role::Spare),
            3 => Some(Role::Logger),
            _ => None,
        }
    }
}

/// The joint-consensus group(s) a server belongs to, as a bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group(u8);

impl Group {
    /// The outgoing configuration.
    pub const OLD: Group = Group(1);
    /// The incoming configuration.
    pub const NEW: Group = Group(2);
    /// Either view; used for queries, never stored on a server.
    pub const ANY: Group = Group(3);

    /// Check whether all bits of `other` are set in `self`.
    pub fn contains(self, other: Group) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any bit of `other` is set in `self`.
    pub fn intersects(self, other: Group) -> bool {
        self.0 & other.0 != 0
    }

    fn from_u8(val: u8) -> Option<Group> {
        match val {
            1..=3 => Some(Group(val)),
            _ => None,
        }
    }
}

impl std::ops::BitOr for Group {
    type Output = Group;

    fn bitor(self, rhs: Group) -> Group {
        Group(self.0 | rhs.0)
    }
}

/// The membership-change phase a configuration is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    /// A single uniform configuration.
    Normal = 0,
    /// Two overlapping configurations; quorum requires both.
    Joint = 1,
}

/// One server of the cluster configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server ID; nonzero.
    pub id: ServerId,
    /// The server's role in the `Old` view.
    pub role: Role,
    /// The server's role in the `New` view; equals `role` outside joint phase.
    pub role_new: Role,
    /// Which joint-consensus views the server belongs to.
    pub group: Group,
}

impl Server {
    /// Check whether this server counts as a voter in the given view.
    pub fn is_voter(&self, view: Group) -> bool {
        (view.contains(Group::OLD) && self.group.contains(Group::OLD) && self.role == Role::Voter)
            || (view.contains(Group::NEW) && self.group.contains(Group::NEW) && self.role_new == Role::Voter)
    }
}

/// The set of servers forming the cluster, with their roles and groups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The servers of the cluster, in insertion order.
    pub servers: Vec<Server>,
    /// The membership-change phase.
    pub phase: Phase,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Normal
    }
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            phase: Phase::Normal,
        }
    }

    /// The number of servers in the configuration.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Check whether the configuration holds no servers.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Append a server to the configuration.
    pub fn add(&mut self, id: ServerId, role: Role, role_new: Role, group: Group) -> Result<(), RaftError> {
        if id == 0 {
            return Err(RaftError::BadId);
        }
        if self.contains(id) {
            return Err(RaftError::DuplicateId);
        }
        self.servers.push(Server { id, role, role_new, group });
        Ok(())
    }

    /// Delete the server with the given ID, preserving the relative order of
    /// the survivors.
    pub fn remove(&mut self, id: ServerId) -> Result<(), RaftError> {
        match self.index_of(id) {
            Some(i) => {
                self.servers.remove(i);
                Ok(())
            }
            None => Err(RaftError::BadId),
        }
    }

    /// The position of the server with the given ID, if present.
    pub fn index_of(&self, id: ServerId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// The position of the server with the given ID among the voters of the
    /// given view, if it is one of them.
    pub fn index_of_voter(&self, id: ServerId, view: Group) -> Option<usize> {
        self.servers.iter().filter(|s| s.is_voter(view)).position(|s| s.id == id)
    }

    /// Borrow the server with the given ID, if present.
    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Check whether a server with the given ID is present.
    pub fn contains(&self, id: ServerId) -> bool {
        self.index_of(id).is_some()
    }

    /// Count the servers that are voters in the given view.
    pub fn voter_count(&self, view: Group) -> usize {
        self.servers.iter().filter(|s| s.is_voter(view)).count()
    }

    /// Check whether the granted set reaches a strict majority of the voters
    /// in the given view.
    pub fn has_quorum(&self, view: Group, granted: &[ServerId]) -> bool {
        let total = self.voter_count(view);
        if total == 0 {
            return false;
        }
        let count = self
            .servers
            .iter()
            .filter(|s| s.is_voter(view) && granted.contains(&s.id))
            .count();
        count > total / 2
    }

    /// Produce a Normal-phase copy containing only the servers whose group
    /// includes `keep`, each with its `role_new` as the final role.
    pub fn joint_to_normal(&self, keep: Group) -> Configuration {
        let servers = self
            .servers
            .iter()
            .filter(|s| s.group.intersects(keep))
            .map(|s| Server {
                id: s.id,
                role: s.role_new,
                role_new: s.role_new,
                group: Group::OLD,
            })
            .collect();
        Configuration {
            servers,
            phase: Phase::Normal,
        }
    }

    /// Enter joint phase: every server joins both views, except the server
    /// being removed, which stays in the `Old` view only.
    pub fn joint_enter(&mut self, remove_id: ServerId) {
        self.phase = Phase::Joint;
        for server in self.servers.iter_mut() {
            server.role_new = server.role;
            server.group = if server.id == remove_id {
                Group::OLD
            } else {
                Group::OLD | Group::NEW
            };
        }
    }

    /// Abandon joint phase, restoring a uniform configuration from the `Old`
    /// view.
    pub fn joint_reset(&mut self) {
        self.phase = Phase::Normal;
        for server in self.servers.iter_mut() {
            server.role_new = server.role;
            server.group = Group::OLD;
        }
    }

    /// Encode the configuration into its wire format.
    ///
    /// The layout is fixed by on-disk compatibility: a legacy section
    /// (version, server count, per-server id and role) followed by a 256-byte
    /// meta block and extended per-server records carrying `role_new` and
    /// `group`, the whole blob zero-padded to a multiple of 8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let n = self.servers.len();
        let len = 1 + 8 + n * 9 + CONF_META_SIZE + n * CONF_SERVER_SIZE as usize;
        let padded = (len + 7) / 8 * 8;
        let mut buf = Vec::with_capacity(padded);

        buf.put_u8(CONF_VERSION);
        buf.put_u64_le(n as u64);
        for server in &self.servers {
            buf.put_u64_le(server.id);
            buf.put_u8(server.role as u8);
        }

        buf.put_u32_le(CONF_META_VERSION);
        buf.put_u32_le(CONF_SERVER_VERSION);
        buf.put_u32_le(CONF_SERVER_SIZE);
        buf.put_u8(self.phase as u8);
        buf.put_bytes(0, CONF_META_SIZE - 13);

        for server in &self.servers {
            buf.put_u64_le(server.id);
            buf.put_u8(server.role as u8);
            buf.put_u8(server.role_new as u8);
            buf.put_u8(server.group.0);
        }

        buf.put_bytes(0, padded - len);
        buf
    }

    /// Decode a configuration from its wire format.
    ///
    /// The legacy form, with no meta block and no extended records, is
    /// accepted by defaulting `role_new = role`, `group = Old` and
    /// `phase = Normal`.
    pub fn decode(data: &[u8]) -> Result<Configuration, RaftError> {
        let mut buf = data;
        if buf.remaining() < 9 {
            return Err(RaftError::Malformed);
        }
        if buf.get_u8() != CONF_VERSION {
            return Err(RaftError::Malformed);
        }
        let n = buf.get_u64_le() as usize;
        if buf.remaining() / 9 < n {
            return Err(RaftError::Malformed);
        }

        let mut servers = Vec::with_capacity(n);
        for _ in 0..n {
            let id = buf.get_u64_le();
            let role = Role::from_u8(buf.get_u8()).ok_or(RaftError::Malformed)?;
            if id == 0 || servers.iter().any(|s: &Server| s.id == id) {
                return Err(RaftError::Malformed);
            }
            servers.push(Server {
                id,
                role,
                role_new: role,
                group: Group::OLD,
            });
        }

        // Legacy form: nothing but trailing padding follows the role bytes.
        if buf.remaining() < CONF_META_SIZE {
            return Ok(Configuration {
                servers,
                phase: Phase::Normal,
            });
        }

        if buf.get_u32_le() != CONF_META_VERSION {
            return Err(RaftError::Malformed);
        }
        if buf.get_u32_le() != CONF_SERVER_VERSION {
            return Err(RaftError::Malformed);
        }
        if buf.get_u32_le() != CONF_SERVER_SIZE {
            return Err(RaftError::Malformed);
        }
        let phase = match buf.get_u8() {
            0 => Phase::Normal,
            1 => Phase::Joint,
            _ => return Err(RaftError::Malformed),
        };
        buf.advance(CONF_META_SIZE - 13);

        if buf.remaining() / (CONF_SERVER_SIZE as usize) < n {
            return Err(RaftError::Malformed);
        }
        for server in servers.iter_mut() {
            let id = buf.get_u64_le();
            if id != server.id {
                return Err(RaftError::Malformed);
            }
            server.role = Role::from_u8(buf.get_u8()).ok_or(RaftError::Malformed)?;
            server.role_new = Role::from_u8(buf.get_u8()).ok_or(RaftError::Malformed)?;
            server.group = Group::from_u8(buf.get_u8()).ok_or(RaftError::Malformed)?;
        }

        Ok(Configuration { servers, phase })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
