//! Escrow provider adapters for CivicWorks.

#![deny(unsafe_code)]

pub mod http;
pub mod mock;

pub use http::{HttpEscrowClient, HttpEscrowConfig};
pub use mock::{
    AlwaysFailEscrowClient, FlakyEscrowClient, MockEscrowClient, RecordingEscrowClient,
};
