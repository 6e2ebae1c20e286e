use ed25519_dalek::{ed25519::{self, signature::Signer}, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::consensus::message::Hashable;

pub type Digest = [u8; 64];

/// Signing identity of one node.
pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pubkey {
    pub key: [u8; 32],
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    pub signer: Pubkey,
    pub sig: [u8; 64],
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::from_signer(SigningKey::generate(&mut csprng))
    }

    /// Deterministic keypair, for reproducible clusters.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signer(SigningKey::from_bytes(&seed))
    }

    fn from_signer(dalek_signer: SigningKey) -> Self {
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign<H: Hashable>(&self, item: &H) -> Signature {
        let sig = self.dalek_signer.sign(&item.hash()).to_bytes();

        Signature {
            signer: self.pubkey.clone(),
            sig,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey.clone()
    }
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        Pubkey { key: *bytes }
    }
}

impl Signature {
    /// False for a malformed key as well as for a signature that does not match.
    pub fn verify<H: Hashable>(&self, item: &H) -> bool {
        let dalek_sig = ed25519::Signature::from_bytes(&self.sig);
        match VerifyingKey::from_bytes(&self.signer.key) {
            Ok(dalek_pubkey) => dalek_pubkey.verify_strict(&item.hash(), &dalek_sig).is_ok(),
            Err(_) => false,
        }
    }
}
