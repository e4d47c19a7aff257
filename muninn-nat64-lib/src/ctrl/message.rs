//! Control-plane message schema.
//!
//! Requests carry a fixed header (magic, translator type, instance
//! name, flags) and one typed operation. Responses carry a status code,
//! an optional human-readable error, and a payload. Listings are
//! multipart: each response holds one page, and the DONE flag tells the
//! client to stop re-requesting with an offset.

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::bib::{BibEntry, Session};
use crate::config::GlobalConfig;
use crate::error::Nat64Error;
use crate::instance::XlatorKind;
use crate::pool4::Pool4Sample;
use crate::types::{L4Proto, TransportAddr4, TransportAddr6};

pub const MAGIC: [u8; 4] = *b"MN64";

/// Set on the last response of a multipart sequence.
pub const FLAG_DONE: u16 = 0x0001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub magic: [u8; 4],
    pub xlator_type: XlatorKind,
    /// Instance the operation addresses; ≤ 15 bytes.
    pub instance: String,
    pub flags: u16,
}

impl RequestHeader {
    pub fn new(xlator_type: XlatorKind, instance: impl Into<String>) -> Self {
        Self { magic: MAGIC, xlator_type, instance: instance.into(), flags: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub header: RequestHeader,
    pub op: RequestOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RequestOp {
    InstanceAdd { pool6: Ipv6Net },
    InstanceRm,
    InstanceFlush,
    InstanceForeach,
    InstanceHello,

    Pool4Add { sample: Pool4Sample },
    Pool4Rm { sample: Pool4Sample },
    Pool4Flush,
    Pool4Foreach { offset: Option<Pool4Sample> },

    BibAddStatic { proto: L4Proto, v6: TransportAddr6, v4: TransportAddr4 },
    BibRm { proto: L4Proto, v4: TransportAddr4 },
    BibForeach { proto: L4Proto, offset: Option<TransportAddr4> },

    // The Explicit Address Mapping Table belongs to the stateless
    // sibling; a stateful instance only knows how to refuse it.
    EamtAdd { prefix6: Ipv6Net, prefix4: Ipv4Net },
    EamtRm { prefix6: Ipv6Net, prefix4: Ipv4Net },
    EamtFlush,
    EamtForeach,

    SessionForeach {
        proto: L4Proto,
        offset: Option<(TransportAddr4, TransportAddr4)>,
    },

    GlobalGet,
    GlobalSet { mask: u32, values: Box<GlobalConfig> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// 0 on success; errno-flavored otherwise.
    pub status: u16,
    pub error: Option<String>,
    pub flags: u16,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResponsePayload {
    None,
    Instances { list: Vec<(String, XlatorKind)> },
    Hello { exists: bool },
    Pool4 { samples: Vec<Pool4Sample> },
    Bib { entries: Vec<BibEntry> },
    Sessions { sessions: Vec<Session> },
    Global { config: Box<GlobalConfig> },
}

impl Response {
    pub fn ok(payload: ResponsePayload, done: bool) -> Self {
        Self {
            status: 0,
            error: None,
            flags: if done { FLAG_DONE } else { 0 },
            payload,
        }
    }

    pub fn err(e: &Nat64Error) -> Self {
        Self {
            status: e.status(),
            error: Some(e.to_string()),
            flags: FLAG_DONE,
            payload: ResponsePayload::None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    pub fn is_done(&self) -> bool {
        self.flags & FLAG_DONE != 0
    }
}
