use serde::{Deserialize, Serialize};
use crate::block::*;
use crate::transaction::*;
use crate::wallet::PublicKey;

/// Requests a node accepts from peers and clients.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
    SendBlock(Blockmsg),
    RequestBlock(GetBlockmsg),
    SubmitTransaction(Txmsg),
    GetPublicKey(GetKeymsg),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accepted,
    Rejected(String),
    Found(Block),
    NotFound,
    PublicKey(Option<PublicKey>),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Blockmsg {
    pub block: Block,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetBlockmsg {
    pub sequence_number: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Txmsg {
    pub transaction: Transaction,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetKeymsg {
    pub email: String,
}

impl Request {
    pub fn send_block(block: Block) -> Request {
        Request::SendBlock(Blockmsg { block })
    }

    pub fn request_block(sequence_number: u64) -> Request {
        Request::RequestBlock(GetBlockmsg { sequence_number })
    }

    pub fn submit(transaction: Transaction) -> Request {
        Request::SubmitTransaction(Txmsg { transaction })
    }

    pub fn get_public_key(email: &str) -> Request {
        Request::GetPublicKey(GetKeymsg {
            email: email.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::SendBlock(_) => "send_block",
            Request::RequestBlock(_) => "request_block",
            Request::SubmitTransaction(_) => "submit_transaction",
            Request::GetPublicKey(_) => "get_public_key",
        }
    }
}
