//! Binary data processing utilities
//!
//! Word-order handling and register/byte conversions shared by the register
//! codec and the wire framing.
//!
//! # Design Principles
//!
//! - **Protocol-agnostic**: No frame or function-code logic here
//! - **Type-safe**: `WordOrder` enum prevents string typos
//! - **Pure**: No allocation beyond the returned buffers, no shared state

pub mod conversions;
pub mod word_order;

pub use conversions::*;
pub use word_order::WordOrder;
