//! slcan serial bridge backend

mod adapter;
pub mod codec;

pub use adapter::BridgeLink;
pub use codec::{CodecError, SlcanCodec, SlcanMessage};
