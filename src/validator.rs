use std::collections::HashMap;

use log::{debug, warn};

use crate::block::{meets_target, Block};
use crate::blockchain::{Blockchain, KeyDatabase};
use crate::errors::{ChainError, HashError, TxnError, ValidationError};
use crate::transaction::{Transaction, TxKind};
use crate::wallet::{PublicKey, PUBLIC_KEY_LEN};

/// Block and transaction rules. Holds the two system parameters the rules
/// depend on: the difficulty and the certificate authority's key.
#[derive(Debug, Clone)]
pub struct Validator {
    difficulty: u32,
    authority_key: PublicKey,
}

impl Validator {
    pub fn new(difficulty: u32, authority_key: PublicKey) -> Validator {
        Validator {
            difficulty,
            authority_key,
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn authority_key(&self) -> &PublicKey {
        &self.authority_key
    }

    pub fn validate_hash(&self, block: &Block, chain: &Blockchain) -> Result<(), HashError> {
        let parent_seq = block
            .sequence_number
            .checked_sub(1)
            .ok_or(HashError::MissingParent { seq: 0 })?;
        let parent = chain
            .get(parent_seq)
            .ok_or(HashError::MissingParent { seq: parent_seq })?;
        if parent.hash != block.parent_hash {
            return Err(HashError::ParentMismatch { seq: parent_seq });
        }
        let hash = block.recompute_hash()?;
        if hash != block.hash {
            return Err(HashError::DigestMismatch);
        }
        if !meets_target(&hash, self.difficulty) {
            return Err(HashError::InsufficientWork { bits: self.difficulty });
        }
        Ok(())
    }

    /// Checks one transaction against the key currently on record for its
    /// email, if any.
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
        current: Option<&PublicKey>,
    ) -> Result<(), TxnError> {
        if tx.public_key.len() != PUBLIC_KEY_LEN {
            return Err(TxnError::MalformedKey {
                email: tx.email.clone(),
            });
        }
        let signer = match (current, tx.kind) {
            (None, TxKind::Register) => &self.authority_key,
            (None, TxKind::Update) => {
                return Err(TxnError::UnknownIdentity {
                    email: tx.email.clone(),
                })
            }
            (Some(key), TxKind::Update) => key,
            (Some(_), TxKind::Register) => {
                return Err(TxnError::AlreadyRegistered {
                    email: tx.email.clone(),
                })
            }
        };
        if !tx.verify(signer)? {
            return Err(TxnError::SignatureInvalid {
                email: tx.email.clone(),
            });
        }
        Ok(())
    }

    /// Replays the block's transactions in order. Changes are staged and only
    /// written to `database` once every transaction has passed.
    pub fn validate_and_apply_transactions(
        &self,
        block: &Block,
        database: &mut KeyDatabase,
    ) -> Result<(), TxnError> {
        let mut staged: HashMap<&str, &PublicKey> = HashMap::new();
        for tx in &block.transactions {
            let current = match staged.get(tx.email.as_str()) {
                Some(key) => Some(*key),
                None => database.get(&tx.email),
            };
            if let Err(e) = self.validate_transaction(tx, current) {
                warn!("block {}: {}", block.sequence_number, e);
                return Err(e);
            }
            staged.insert(tx.email.as_str(), &tx.public_key);
        }
        for (email, key) in staged {
            database.insert(email.to_string(), key.clone());
        }
        Ok(())
    }

    /// Hash linkage first, then transactions against the chain's own database.
    /// The block itself is not stored.
    pub fn validate_block(
        &self,
        block: &Block,
        chain: &mut Blockchain,
    ) -> Result<(), ValidationError> {
        self.validate_hash(block, chain)?;
        self.validate_and_apply_transactions(block, chain.database_mut())?;
        Ok(())
    }

    /// `validate_block` followed by storing the block.
    pub fn accept_block(
        &self,
        block: Block,
        chain: &mut Blockchain,
    ) -> Result<(), ValidationError> {
        self.validate_block(&block, chain)?;
        chain.insert(block);
        Ok(())
    }

    /// Walks the chain from genesis, validating every block and replaying it
    /// into a fresh database.
    pub fn verify_chain_and_rebuild_database(
        &self,
        chain: &Blockchain,
    ) -> Result<KeyDatabase, ChainError> {
        let mut rebuilt = Blockchain::new();
        for block in chain.iter().skip(1) {
            self.accept_block(block.clone(), &mut rebuilt)
                .map_err(|cause| ChainError {
                    seq: block.sequence_number,
                    cause,
                })?;
        }
        debug!(
            "verified {} blocks, {} keys",
            rebuilt.len(),
            rebuilt.database().len()
        );
        Ok(rebuilt.database().clone())
    }

    /// Re-derives the chain's database in place, for use after blocks were
    /// dropped from the top of the chain.
    pub fn rebuild_database(&self, chain: &mut Blockchain) -> Result<(), ChainError> {
        let database = self.verify_chain_and_rebuild_database(chain)?;
        chain.replace_database(database);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mine_on, Fixture, TEST_DIFFICULTY};
    use crate::wallet::Wallet;

    /// Moves `email` to `next`, signed by `previous`.
    fn update(email: &str, next: &Wallet, previous: &Wallet) -> Transaction {
        Transaction::new_update(email, next.public_key.clone(), previous).unwrap()
    }

    #[test]
    fn test_register_then_update() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        let k1 = Wallet::new();
        let k2 = Wallet::new();

        let b1 = mine_on(bc.tip(), vec![fx.register("alice@x.com", &k1)]);
        fx.validator.accept_block(b1, &mut bc).unwrap();
        assert_eq!(bc.database().get("alice@x.com"), Some(&k1.public_key));

        // a second registration for the same email
        let again = mine_on(bc.tip(), vec![fx.register("alice@x.com", &Wallet::new())]);
        assert_eq!(
            fx.validator.validate_block(&again, &mut bc.clone()),
            Err(ValidationError::Transaction(TxnError::AlreadyRegistered {
                email: "alice@x.com".to_string()
            }))
        );

        let b2 = mine_on(bc.tip(), vec![update("alice@x.com", &k2, &k1)]);
        fx.validator.accept_block(b2, &mut bc).unwrap();
        assert_eq!(bc.database().get("alice@x.com"), Some(&k2.public_key));

        // K1 no longer has authority over the email
        let stale = mine_on(bc.tip(), vec![update("alice@x.com", &Wallet::new(), &k1)]);
        assert_eq!(
            fx.validator.validate_block(&stale, &mut bc.clone()),
            Err(ValidationError::Transaction(TxnError::SignatureInvalid {
                email: "alice@x.com".to_string()
            }))
        );
        let fresh = mine_on(bc.tip(), vec![update("alice@x.com", &Wallet::new(), &k2)]);
        assert!(fx.validator.validate_block(&fresh, &mut bc.clone()).is_ok());
    }

    #[test]
    fn test_update_without_registration() {
        let fx = Fixture::new();
        let k1 = Wallet::new();
        let tx = Transaction::new_update("bob@x.com", Wallet::new().public_key, &k1).unwrap();
        assert_eq!(
            fx.validator.validate_transaction(&tx, None),
            Err(TxnError::UnknownIdentity {
                email: "bob@x.com".to_string()
            })
        );
    }

    #[test]
    fn test_register_not_signed_by_ca() {
        let fx = Fixture::new();
        let user = Wallet::new();
        let payload =
            crate::transaction::signed_payload(TxKind::Register, "bob@x.com", &user.public_key)
                .unwrap();
        let signature = user.sign(&payload);
        let tx = Transaction::from_parts(
            TxKind::Register,
            "bob@x.com",
            user.public_key.clone(),
            signature,
        );
        assert_eq!(
            fx.validator.validate_transaction(&tx, None),
            Err(TxnError::SignatureInvalid {
                email: "bob@x.com".to_string()
            })
        );
    }

    #[test]
    fn test_block_is_all_or_nothing() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        let block = mine_on(
            bc.tip(),
            vec![
                fx.register("alice@x.com", &Wallet::new()),
                fx.register("bob@x.com", &Wallet::new()),
                update("carol@x.com", &Wallet::new(), &Wallet::new()),
            ],
        );
        assert!(fx.validator.validate_block(&block, &mut bc).is_err());
        assert!(bc.database().is_empty());
    }

    #[test]
    fn test_later_transactions_supersede_earlier_ones() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        let k1 = Wallet::new();
        let k2 = Wallet::new();
        let k3 = Wallet::new();
        let block = mine_on(
            bc.tip(),
            vec![
                fx.register("alice@x.com", &k1),
                Transaction::new_update("alice@x.com", k2.public_key.clone(), &k1).unwrap(),
                Transaction::new_update("alice@x.com", k3.public_key.clone(), &k2).unwrap(),
            ],
        );
        fx.validator.accept_block(block, &mut bc).unwrap();
        assert_eq!(bc.database().get("alice@x.com"), Some(&k3.public_key));
    }

    #[test]
    fn test_validate_hash() {
        let fx = Fixture::new();
        let bc = Blockchain::new();
        let good = mine_on(bc.tip(), vec![]);
        assert_eq!(fx.validator.validate_hash(&good, &bc), Ok(()));

        let mut orphan = good.clone();
        orphan.sequence_number = 5;
        assert_eq!(
            fx.validator.validate_hash(&orphan, &bc),
            Err(HashError::MissingParent { seq: 4 })
        );

        let mut relinked = good.clone();
        relinked.parent_hash = [1u8; 32];
        assert_eq!(
            fx.validator.validate_hash(&relinked, &bc),
            Err(HashError::ParentMismatch { seq: 0 })
        );

        let mut tampered = good.clone();
        tampered.proof_of_work += 1;
        assert!(fx.validator.validate_hash(&tampered, &bc).is_err());

        // a validator demanding far more work than the block carries
        let strict = Validator::new(60, fx.validator.authority_key().clone());
        assert_eq!(
            strict.validate_hash(&good, &bc),
            Err(HashError::InsufficientWork { bits: 60 })
        );
        assert_eq!(fx.validator.difficulty(), TEST_DIFFICULTY);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        let alice1 = Wallet::new();
        let alice2 = Wallet::new();
        let bob = Wallet::new();
        let batches = vec![
            vec![fx.register("alice@x.com", &alice1)],
            vec![fx.register("bob@x.com", &bob)],
            vec![update("alice@x.com", &alice2, &alice1)],
        ];
        for txs in batches {
            let b = mine_on(bc.tip(), txs);
            fx.validator.accept_block(b, &mut bc).unwrap();
        }
        let rebuilt = fx.validator.verify_chain_and_rebuild_database(&bc).unwrap();
        assert_eq!(&rebuilt, bc.database());
        assert_eq!(rebuilt.len(), 2);
    }

    #[test]
    fn test_revalidating_applied_block_does_not_change_database() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        let k1 = Wallet::new();
        let k2 = Wallet::new();
        let b1 = mine_on(bc.tip(), vec![fx.register("alice@x.com", &k1)]);
        fx.validator.accept_block(b1.clone(), &mut bc).unwrap();
        let b2 = mine_on(bc.tip(), vec![update("alice@x.com", &k2, &k1)]);
        fx.validator.accept_block(b2.clone(), &mut bc).unwrap();

        let before = bc.database().clone();
        assert!(fx.validator.validate_and_apply_transactions(&b1, bc.database_mut()).is_err());
        assert!(fx.validator.validate_and_apply_transactions(&b2, bc.database_mut()).is_err());
        assert_eq!(&before, bc.database());
    }

    #[test]
    fn test_verify_chain_reports_bad_block() {
        let fx = Fixture::new();
        let mut bc = Blockchain::new();
        for _ in 0..3 {
            let b = mine_on(bc.tip(), vec![]);
            fx.validator.accept_block(b, &mut bc).unwrap();
        }
        let mut broken = bc.clone();
        let mut b2 = broken.get(2).cloned().unwrap();
        b2.transactions.push(fx.register("eve@x.com", &Wallet::new()));
        broken.insert(b2);
        let err = fx.validator.verify_chain_and_rebuild_database(&broken).unwrap_err();
        assert_eq!(err.seq, 2);
    }
}
