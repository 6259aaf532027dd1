//! Signed root announcements and the frames that carry them.
use std::collections::HashSet;
use std::io;

use crate::crypto::{PublicKey, Signature, Signer};
use crate::port::Port;
use crate::wire::{self, Decode, Encode};

/// One hop in a [`SwitchAnnouncement`]'s signature chain: the key that
/// produced it, the local port it was sent out on, and the signature
/// covering everything that precedes it plus this hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub signer: PublicKey,
    pub port: Port,
    pub signature: Signature,
}

impl Encode for Hop {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.signer.encode(writer)?;
        n += self.port.encode(writer)?;
        n += self.signature.encode(writer)?;
        Ok(n)
    }
}

impl Decode for Hop {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let signer = PublicKey::decode(reader)?;
        let port = Port::decode(reader)?;
        let signature = Signature::decode(reader)?;

        Ok(Self {
            signer,
            port,
            signature,
        })
    }
}

/// A signed root announcement: a claim, by `root_key`, re-signed by every
/// node along the path from the root to the sender.
///
/// The first hop's `signer` MUST equal `root_key`. The last hop is the
/// direct sender. The sequence of `port`s, in order, are this chain's
/// (and thus the sender's) tree coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchAnnouncement {
    pub root_key: PublicKey,
    pub sequence: u64,
    pub signatures: Vec<Hop>,
}

/// Errors that make an announcement structurally or cryptographically invalid.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("empty signature chain")]
    Empty,
    #[error("first signer does not match root key")]
    WrongRoot,
    #[error("hop port is zero")]
    ZeroHop,
    #[error("duplicate signer in chain, loop detected")]
    Loop,
    #[error("signature at hop {0} does not verify")]
    InvalidSignature(usize),
}

impl SwitchAnnouncement {
    /// A synthetic announcement a node uses to describe itself while acting
    /// as root: an empty chain, meaning empty coordinates.
    pub fn root(root_key: PublicKey, sequence: u64) -> Self {
        Self {
            root_key,
            sequence,
            signatures: Vec::new(),
        }
    }

    /// This announcement's coordinates: the ordered hop ports of its chain.
    pub fn coordinates(&self) -> Vec<Port> {
        self.signatures.iter().map(|h| h.port).collect()
    }

    /// The key of the node that produced this announcement (the chain's
    /// last signer), or `root_key` if the chain is empty (self is root).
    pub fn sender(&self) -> &PublicKey {
        self.signatures
            .last()
            .map(|h| &h.signer)
            .unwrap_or(&self.root_key)
    }

    /// Whether this chain already contains `key` as a signer -- adopting or
    /// relaying to such a node would create a loop.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.root_key == *key || self.signatures.iter().any(|h| h.signer == *key)
    }

    /// The byte string a given hop's signature is computed over: every byte
    /// that precedes it in the chain, plus its own signer key and port.
    fn hop_preimage(root_key: &PublicKey, sequence: u64, prior: &[Hop], signer: &PublicKey, port: Port) -> Vec<u8> {
        let mut buf = wire::serialize(root_key);
        buf.extend(wire::serialize(&sequence));
        for hop in prior {
            buf.extend(wire::serialize(&hop.signer));
            buf.extend(wire::serialize(&hop.port));
            buf.extend(wire::serialize(&hop.signature));
        }
        buf.extend(wire::serialize(signer));
        buf.extend(wire::serialize(&port));
        buf
    }

    /// Append a new hop to the chain, signed by `signer` for `port`.
    pub fn signed(mut self, signer: &impl Signer, port: Port) -> Self {
        let preimage = Self::hop_preimage(
            &self.root_key,
            self.sequence,
            &self.signatures,
            signer.public_key(),
            port,
        );
        let signature = signer.sign(&preimage);

        self.signatures.push(Hop {
            signer: *signer.public_key(),
            port,
            signature,
        });
        self
    }

    /// Validate the chain structurally and cryptographically.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.signatures.is_empty() {
            return Ok(()); // self-root: an empty chain is always valid.
        }

        if self.signatures[0].signer != self.root_key {
            return Err(VerifyError::WrongRoot);
        }

        let mut seen = HashSet::with_capacity(self.signatures.len() + 1);
        seen.insert(self.root_key);

        for (i, hop) in self.signatures.iter().enumerate() {
            if hop.port.is_local() {
                return Err(VerifyError::ZeroHop);
            }
            if i > 0 && !seen.insert(hop.signer) {
                return Err(VerifyError::Loop);
            }

            let preimage =
                Self::hop_preimage(&self.root_key, self.sequence, &self.signatures[..i], &hop.signer, hop.port);
            hop.signer
                .verify(&preimage, &hop.signature.0)
                .map_err(|_| VerifyError::InvalidSignature(i))?;
        }
        Ok(())
    }
}

impl Encode for SwitchAnnouncement {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.root_key.encode(writer)?;
        n += self.sequence.encode(writer)?;
        n += self.signatures.encode(writer)?;
        Ok(n)
    }
}

impl Decode for SwitchAnnouncement {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let root_key = PublicKey::decode(reader)?;
        let sequence = u64::decode(reader)?;
        let signatures = Vec::<Hop>::decode(reader)?;

        Ok(Self {
            root_key,
            sequence,
            signatures,
        })
    }
}

/// The destination of a forwarded frame.
///
/// Only [`Destination::Coordinates`] is resolved by this core; the other
/// variants exist for interface completeness and are delegated elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Coordinates(Vec<Port>),
    PublicKey(PublicKey),
    None,
}

/// A frame exchanged with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A spanning-tree (STP) root announcement.
    TreeAnnouncement(SwitchAnnouncement),
    /// An opaque data frame to be forwarded toward `destination`.
    Data {
        destination: Destination,
        payload: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test::signer::MockSigner;

    #[test]
    fn test_sign_increases_chain_and_preserves_root_and_sequence() {
        let signer = MockSigner::default();
        let ann = SwitchAnnouncement::root(*signer.public_key(), 3);
        let signed = ann.clone().signed(&signer, Port::new(1));

        assert_eq!(signed.signatures.len(), ann.signatures.len() + 1);
        assert_eq!(signed.root_key, ann.root_key);
        assert_eq!(signed.sequence, ann.sequence);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let a = MockSigner::default();
        let b = MockSigner::default();

        let mut ann = SwitchAnnouncement::root(*a.public_key(), 1)
            .signed(&a, Port::new(1))
            .signed(&b, Port::new(2));

        assert!(ann.verify().is_ok());

        ann.signatures[1].port = Port::new(3);
        assert_eq!(ann.verify(), Err(VerifyError::InvalidSignature(1)));
    }

    #[test]
    fn test_verify_rejects_loop() {
        let a = MockSigner::default();
        let b = MockSigner::default();

        let mut ann = SwitchAnnouncement::root(*a.public_key(), 1)
            .signed(&a, Port::new(1))
            .signed(&b, Port::new(2));

        // Forge a third hop re-using `a`'s key (can't actually re-sign without
        // `a`'s secret key in a real attack, but the structural check must
        // catch this independent of signature validity).
        ann.signatures.push(ann.signatures[0].clone());

        assert_eq!(ann.verify(), Err(VerifyError::Loop));
    }

    #[test]
    fn test_coordinates() {
        let a = MockSigner::default();
        let ann = SwitchAnnouncement::root(*a.public_key(), 1).signed(&a, Port::new(7));

        assert_eq!(ann.coordinates(), vec![Port::new(7)]);
    }

    #[qcheck_macros::quickcheck]
    fn prop_wire_roundtrip(seed: [u8; 32], port: u16) {
        let signer = MockSigner::from_seed(seed);
        let ann = SwitchAnnouncement::root(*signer.public_key(), 1)
            .signed(&signer, Port::new(port.max(1)));

        let bytes = wire::serialize(&ann);
        let decoded: SwitchAnnouncement = wire::deserialize(&bytes).unwrap();

        assert_eq!(decoded, ann);
    }
}
