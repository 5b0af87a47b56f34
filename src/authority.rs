use log::{info, warn};
use regex::Regex;

use crate::errors::AuthorityError;
use crate::transaction::{signed_payload, TxKind};
use crate::wallet::{PublicKey, Wallet};

const EMAIL_PATTERN: &str = r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,4}$";

/// The certificate authority that vouches for first registrations. Nodes only
/// ever need its public key; signing happens wherever the authority lives.
pub trait CertificateAuthority: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign_registration(&self, email: &str, public_key: &[u8]) -> Result<Vec<u8>, AuthorityError>;
}

/// An authority whose private key is held in this process.
pub struct LocalAuthority {
    wallet: Wallet,
    email_re: Regex,
}

impl LocalAuthority {
    pub fn new(wallet: Wallet) -> LocalAuthority {
        LocalAuthority {
            wallet,
            // the pattern is a constant
            email_re: Regex::new(EMAIL_PATTERN).unwrap(),
        }
    }

    pub fn validate_email(&self, email: &str) -> bool {
        self.email_re.is_match(email)
    }

    /// Signs an arbitrary registration request, refusing anything that is
    /// not a `Register`.
    pub fn sign_request(
        &self,
        kind: TxKind,
        email: &str,
        public_key: &[u8],
    ) -> Result<Vec<u8>, AuthorityError> {
        if kind != TxKind::Register {
            warn!("refusing to sign a {:?} request for {}", kind, email);
            return Err(AuthorityError::NotARegistration);
        }
        if !self.validate_email(email) {
            return Err(AuthorityError::BadEmail {
                email: email.to_string(),
            });
        }
        let payload = signed_payload(kind, email, public_key)
            .map_err(|e| AuthorityError::Encoding(e.to_string()))?;
        info!("signing registration for {}", email);
        Ok(self.wallet.sign(&payload))
    }
}

impl CertificateAuthority for LocalAuthority {
    fn public_key(&self) -> PublicKey {
        self.wallet.public_key.clone()
    }

    fn sign_registration(&self, email: &str, public_key: &[u8]) -> Result<Vec<u8>, AuthorityError> {
        self.sign_request(TxKind::Register, email, public_key)
    }
}
