//! Value types shared by the escrow engine and the marketplace server.
mod fee_rate;
mod money;

pub mod helpers;
pub mod op;
mod secret;

pub use fee_rate::FeeRate;
pub use money::{Money, MoneyConversionError};
pub use secret::Secret;
