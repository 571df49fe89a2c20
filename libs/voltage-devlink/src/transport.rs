//! Wire transport: frame codecs and device links

pub mod frame;
pub mod link;

pub use frame::{ExceptionCode, FunctionCode, Request};
pub use link::DeviceLink;
