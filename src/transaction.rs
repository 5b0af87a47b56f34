use serde::{Deserialize, Serialize};

use crate::authority::CertificateAuthority;
use crate::errors::{AuthorityError, TxnError};
use crate::wallet::{self, PublicKey, Wallet};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    Register,
    Update,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub kind: TxKind,
    pub email: String,
    pub public_key: PublicKey,
    // signs signed_payload(), never itself
    pub signature: Vec<u8>,
}

// the part of a transaction covered by its signature
#[derive(Serialize)]
struct SignedPayload<'a> {
    kind: TxKind,
    email: &'a str,
    public_key: &'a [u8],
}

pub fn signed_payload(kind: TxKind, email: &str, public_key: &[u8]) -> Result<Vec<u8>, TxnError> {
    serde_json::to_vec(&SignedPayload {
        kind,
        email,
        public_key,
    })
    .map_err(|e| TxnError::Encoding(e.to_string()))
}

impl Transaction {
    pub fn from_parts(
        kind: TxKind,
        email: &str,
        public_key: PublicKey,
        signature: Vec<u8>,
    ) -> Transaction {
        Transaction {
            kind,
            email: email.to_string(),
            public_key,
            signature,
        }
    }

    /// A first registration, signed by the certificate authority.
    pub fn new_register(
        email: &str,
        public_key: PublicKey,
        ca: &dyn CertificateAuthority,
    ) -> Result<Transaction, AuthorityError> {
        let signature = ca.sign_registration(email, &public_key)?;
        Ok(Transaction::from_parts(TxKind::Register, email, public_key, signature))
    }

    /// A key rotation, signed with the key currently registered for `email`.
    pub fn new_update(
        email: &str,
        public_key: PublicKey,
        previous: &Wallet,
    ) -> Result<Transaction, TxnError> {
        let payload = signed_payload(TxKind::Update, email, &public_key)?;
        let signature = previous.sign(&payload);
        Ok(Transaction::from_parts(TxKind::Update, email, public_key, signature))
    }

    pub fn signed_payload(&self) -> Result<Vec<u8>, TxnError> {
        signed_payload(self.kind, &self.email, &self.public_key)
    }

    pub fn verify(&self, signer: &[u8]) -> Result<bool, TxnError> {
        let payload = self.signed_payload()?;
        Ok(wallet::verify_signature(signer, &payload, &self.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;

    #[test]
    fn test_register_is_signed_by_ca() {
        let ca = LocalAuthority::new(Wallet::new());
        let user = Wallet::new();
        let tx = Transaction::new_register("alice@x.com", user.public_key.clone(), &ca).unwrap();
        assert_eq!(tx.kind, TxKind::Register);
        assert!(tx.verify(&ca.public_key()).unwrap());
        assert!(!tx.verify(&user.public_key).unwrap());
    }

    #[test]
    fn test_update_is_signed_by_previous_key() {
        let k1 = Wallet::new();
        let k2 = Wallet::new();
        let tx = Transaction::new_update("alice@x.com", k2.public_key.clone(), &k1).unwrap();
        assert!(tx.verify(&k1.public_key).unwrap());
        assert!(!tx.verify(&k2.public_key).unwrap());
    }

    #[test]
    fn test_signature_covers_email_and_key() {
        let k1 = Wallet::new();
        let mut tx = Transaction::new_update("alice@x.com", Wallet::new().public_key, &k1).unwrap();
        tx.email = "mallory@x.com".to_string();
        assert!(!tx.verify(&k1.public_key).unwrap());
    }
}
