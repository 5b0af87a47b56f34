use std::fs;
use std::path::Path;

use crypto::ed25519;
use failure::format_err;
use log::info;
use rand::RngCore;

pub type PublicKey = Vec<u8>;

pub const SEED_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// An ed25519 key pair derived from a 32 byte seed. The seed is what gets
/// written to disk.
#[derive(Clone)]
pub struct Wallet {
    seed: [u8; SEED_LEN],
    pub secret_key: Vec<u8>,
    pub public_key: PublicKey,
}

impl Wallet {
    pub fn new() -> Wallet {
        let mut seed = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        Wallet::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; SEED_LEN]) -> Wallet {
        let (secret_key, public_key) = ed25519::keypair(&seed);
        Wallet {
            seed,
            secret_key: secret_key.to_vec(),
            public_key: public_key.to_vec(),
        }
    }

    pub fn seed(&self) -> &[u8; SEED_LEN] {
        &self.seed
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        ed25519::signature(message, &self.secret_key).to_vec()
    }

    pub fn load(path: &Path) -> Result<Wallet, Box<dyn std::error::Error>> {
        let text = fs::read_to_string(path)?;
        let bytes = hex::decode(text.trim())?;
        if bytes.len() != SEED_LEN {
            return Err(format_err!(
                "bad key file {}: expected {} bytes, found {}",
                path.display(),
                SEED_LEN,
                bytes.len()
            )
            .compat()
            .into());
        }
        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&bytes);
        Ok(Wallet::from_seed(seed))
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        fs::write(path, hex::encode(self.seed))?;
        info!("saved key to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

/// Checks an ed25519 signature. Inputs of the wrong length never verify.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if public_key.len() != PUBLIC_KEY_LEN || signature.len() != SIGNATURE_LEN {
        return false;
    }
    ed25519::verify(message, public_key, signature)
}

pub fn parse_public_key(text: &str) -> Result<PublicKey, Box<dyn std::error::Error>> {
    let key = hex::decode(text.trim())?;
    if key.len() != PUBLIC_KEY_LEN {
        return Err(format_err!("public key must be {} bytes", PUBLIC_KEY_LEN)
            .compat()
            .into());
    }
    Ok(key)
}
