use anyhow::Context;
use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, SignOnly};
use sha2::{Digest, Sha256};

use super::contracts::encode_stacks_address;
use crate::config::Network;

/// Process-wide signer. Loaded once at startup from configuration; key
/// material never leaves this struct.
pub struct Signer {
    secp: Secp256k1<SignOnly>,
    secret: SecretKey,
    address: String,
}

fn address_version(network: Network) -> u8 {
    match network {
        Network::Mainnet => 22,
        Network::Testnet | Network::Devnet => 26,
    }
}

impl Signer {
    pub fn from_hex(private_key_hex: &str, network: Network) -> anyhow::Result<Self> {
        let trimmed = private_key_hex.trim();
        // Wallet exports append a compression marker byte.
        let stripped = trimmed.strip_suffix("01").filter(|s| s.len() == 64).unwrap_or(trimmed);
        let bytes = hex::decode(stripped).context("signer key is not valid hex")?;
        let secret = SecretKey::from_slice(&bytes).context("signer key is not a valid secp256k1 scalar")?;

        let secp = Secp256k1::signing_only();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let sha = Sha256::digest(public.serialize());
        let hash160: [u8; 20] = Ripemd160::digest(sha).into();
        let address = encode_stacks_address(address_version(network), &hash160);

        Ok(Self {
            secp,
            secret,
            address,
        })
    }

    /// The backend's principal, derived from the key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign the sighash of a serialized transaction. Returns the 65-byte
    /// recoverable signature (recovery id first).
    pub fn sign(&self, sighash: &[u8; 32]) -> [u8; 65] {
        let message = Message::from_digest(*sighash);
        let signature = self.secp.sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut out = [0u8; 65];
        out[0] = recovery_id.to_i32() as u8;
        out[1..].copy_from_slice(&compact);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "f9d7c7b6a5948382716f5e4d3c2b1a09f8e7d6c5b4a39281706f5e4d3c2b1a01";

    #[test]
    fn derives_a_testnet_address() {
        let signer = Signer::from_hex(KEY, Network::Testnet).unwrap();
        assert!(signer.address().starts_with("ST"));
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = Signer::from_hex(KEY, Network::Devnet).unwrap();
        let sighash = [7u8; 32];
        assert_eq!(signer.sign(&sighash), signer.sign(&sighash));
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(Signer::from_hex("not-hex", Network::Devnet).is_err());
        assert!(Signer::from_hex("00", Network::Devnet).is_err());
    }
}
