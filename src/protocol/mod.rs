//! Protocol module for the single-characteristic command channel.
//!
//! This module contains the implementations for:
//! - Command encoding and notification frame decoding
//! - The battery voltage step table
//! - The command retry engine

pub mod battery;
pub mod frame;
pub mod retry;

pub use battery::battery_percent;
pub use frame::{decode, encode, Command, Frame};
pub use retry::{CommandOutcome, RetryEngine, RetryPolicy, RetryStep};
