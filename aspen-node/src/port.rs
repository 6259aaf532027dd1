use std::fmt;

use crate::wire::varint::VarInt;
use crate::wire::{self, Decode, Encode};

/// A local peer slot number.
///
/// Port `0` is reserved for the node's own local delivery endpoint and is
/// never assigned to a peer connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Port(u16);

impl Port {
    /// The reserved local-delivery port.
    pub const LOCAL: Port = Port(0);

    pub fn new(n: u16) -> Self {
        Self(n)
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    pub fn is_local(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Port {
    fn from(n: u16) -> Self {
        Self(n)
    }
}

impl From<Port> for u16 {
    fn from(p: Port) -> Self {
        p.0
    }
}

impl Encode for Port {
    fn encode<W: std::io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, std::io::Error> {
        VarInt::from(self.0).encode(writer)
    }
}

impl Decode for Port {
    fn decode<R: std::io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let v = VarInt::decode(reader)?;
        let n: u64 = *v;
        let n: u16 = n
            .try_into()
            .map_err(|_| wire::Error::InvalidSize {
                expected: u16::MAX as usize,
                actual: n as usize,
            })?;

        Ok(Self(n))
    }
}
