//documentation
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![allow(rustdoc::redundant_explicit_links)]
#![doc = include_str!("../README.md")]
#[allow(unused_imports)]
use crate as simple_tunnel;

//module tree
mod client;
mod common;
mod config;
mod control_message;
pub mod framing;
mod manager;
mod service;
mod store;

//API exports
pub use client::*;
pub use common::*;
pub use config::*;
pub use control_message::*;
pub use framing::{FramingError, MAX_FRAME_LEN, MIN_FRAME_LEN};
pub use manager::*;
pub use service::*;
pub use store::*;
