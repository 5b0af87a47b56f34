use failure::Fail;

/// Chain linkage or proof-of-work failure for a single block.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum HashError {
    #[fail(display = "no block at height {} to link against", seq)]
    MissingParent { seq: u64 },
    #[fail(display = "parent hash does not match block {}", seq)]
    ParentMismatch { seq: u64 },
    #[fail(display = "stored hash does not match the block content")]
    DigestMismatch,
    #[fail(display = "hash does not begin with {} zero bits", bits)]
    InsufficientWork { bits: u32 },
    #[fail(display = "could not encode block content: {}", _0)]
    Encoding(String),
}

/// Why a transaction could not be applied to the key database.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[fail(display = "signature for {} does not verify", email)]
    SignatureInvalid { email: String },
    #[fail(display = "{} has no registered public key", email)]
    UnknownIdentity { email: String },
    #[fail(display = "{} has already registered a public key", email)]
    AlreadyRegistered { email: String },
    #[fail(display = "malformed key material for {}", email)]
    MalformedKey { email: String },
    #[fail(display = "could not encode transaction: {}", _0)]
    Encoding(String),
}

#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[fail(display = "hash mismatch: {}", _0)]
    HashMismatch(#[fail(cause)] HashError),
    #[fail(display = "transaction rejected: {}", _0)]
    Transaction(#[fail(cause)] TxnError),
}

impl From<HashError> for ValidationError {
    fn from(e: HashError) -> Self {
        ValidationError::HashMismatch(e)
    }
}

impl From<TxnError> for ValidationError {
    fn from(e: TxnError) -> Self {
        ValidationError::Transaction(e)
    }
}

/// Full-chain verification stops at the first bad block.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
#[fail(display = "block {} is invalid: {}", seq, cause)]
pub struct ChainError {
    pub seq: u64,
    #[fail(cause)]
    pub cause: ValidationError,
}

#[derive(Debug, Fail, Clone, Copy, PartialEq, Eq)]
#[fail(display = "block queue is full")]
pub struct QueueFull;

/// A fork resolution or backfill that had to be abandoned. Chain state is
/// left as it was before the attempt.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[fail(display = "no peer majority for block {}", seq)]
    ChainGap { seq: u64 },
    #[fail(display = "peer block {} is invalid: {}", seq, cause)]
    InvalidBlock {
        seq: u64,
        #[fail(cause)]
        cause: ValidationError,
    },
}

#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[fail(display = "peer {} is unreachable", peer)]
    PeerUnreachable { peer: String },
    #[fail(display = "peer {} timed out", peer)]
    PeerTimeout { peer: String },
    #[fail(display = "network task has stopped")]
    Disconnected,
}

#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[fail(display = "bad email address: {}", email)]
    BadEmail { email: String },
    #[fail(display = "must be a register transaction")]
    NotARegistration,
    #[fail(display = "could not encode registration: {}", _0)]
    Encoding(String),
}

/// Rejections of a transaction submitted to a node.
#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[fail(display = "{}", _0)]
    Authority(#[fail(cause)] AuthorityError),
    #[fail(display = "{}", _0)]
    Transaction(#[fail(cause)] TxnError),
}

impl From<AuthorityError> for SubmitError {
    fn from(e: AuthorityError) -> Self {
        SubmitError::Authority(e)
    }
}

impl From<TxnError> for SubmitError {
    fn from(e: TxnError) -> Self {
        SubmitError::Transaction(e)
    }
}
