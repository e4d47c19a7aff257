#![forbid(unsafe_code)]

//! Stateful NAT64 (RFC 6146) over the RFC 6145 header translations.
//!
//! The library is the whole translator; binaries only wire it to an OS:
//! feed raw frames to [`xlation::process`], drive [`instance::Xlator::tick`]
//! from a timer, and speak [`ctrl`] over whatever transport suits you.

pub mod bib;
pub mod config;
pub mod ctrl;
pub mod error;
pub mod filtering;
pub mod hooks;
pub mod icmp;
pub mod instance;
pub mod joold;
pub mod packet;
pub mod pool4;
pub mod rfc6052;
pub mod stats;
pub mod translate;
pub mod types;
pub mod xlation;

pub use error::{Nat64Error, Result};
pub use instance::{InstanceRegistry, Xlator, XlatorKind};
pub use types::Verdict;
pub use xlation::{process, Outcome};
