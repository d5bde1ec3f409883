//! Access control
//!
//! Per-record permission bits, the access a handle is opened with, and the
//! authorization hook that decides whether the caller owns a key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::namespace;

/// Read/write/execute access requested by (or granted to) a handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(0b001);
    pub const WRITE: Access = Access(0b010);
    pub const EXECUTE: Access = Access(0b100);
    pub const READ_WRITE: Access = Access(0b011);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Access(bits & 0b111)
    }

    pub const fn union(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn execute(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        self.union(rhs)
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Access({self})")
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read(), 'r'),
            flag(self.write(), 'w'),
            flag(self.execute(), 'x')
        )
    }
}

/// Six permission bits stored in a record header: owner and other r/w/x
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions(u8);

impl Permissions {
    const OTHER_SHIFT: u8 = 3;
    const MASK: u8 = 0b11_1111;

    /// Owner read/write, nothing for others
    pub const OWNER_RW: Permissions = Permissions(0b000_011);

    /// Read/write for everyone
    pub const ALL_RW: Permissions = Permissions(0b011_011);

    pub const fn new(owner: Access, other: Access) -> Self {
        Permissions(owner.bits() | (other.bits() << Self::OTHER_SHIFT))
    }

    pub const fn from_bits(bits: u8) -> Self {
        Permissions(bits & Self::MASK)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn owner(self) -> Access {
        Access::from_bits(self.0)
    }

    pub const fn other(self) -> Access {
        Access::from_bits(self.0 >> Self::OTHER_SHIFT)
    }

    pub const fn owner_read(self) -> bool {
        self.owner().read()
    }

    pub const fn owner_write(self) -> bool {
        self.owner().write()
    }

    pub const fn owner_execute(self) -> bool {
        self.owner().execute()
    }

    pub const fn other_read(self) -> bool {
        self.other().read()
    }

    pub const fn other_write(self) -> bool {
        self.other().write()
    }

    pub const fn other_execute(self) -> bool {
        self.other().execute()
    }

    /// Access allowed to a caller that is (or is not) the owner
    pub const fn allowed(self, is_owner: bool) -> Access {
        if is_owner {
            self.owner()
        } else {
            self.other()
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::OWNER_RW
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({self})")
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.owner(), self.other())
    }
}

/// Decides whether the caller owns a key's namespace
pub trait Authorizer: Send + Sync {
    fn is_owner(&self, key: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_owner(&self, key: &str) -> bool {
        self(key)
    }
}

/// Treats the caller as the owner of every key
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerAlways;

impl Authorizer for OwnerAlways {
    fn is_owner(&self, _key: &str) -> bool {
        true
    }
}

/// Owns exactly the keys whose namespace is in a fixed list
#[derive(Debug, Clone, Default)]
pub struct NamespaceOwner {
    namespaces: Vec<String>,
}

impl NamespaceOwner {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for NamespaceOwner {
    fn is_owner(&self, key: &str) -> bool {
        let ns = namespace(key);
        self.namespaces.iter().any(|n| n == ns)
    }
}
