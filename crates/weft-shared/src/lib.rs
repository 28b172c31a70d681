pub mod events;
pub mod frames;
pub mod transcript;

/// Wire protocol version reported by `/api/health`.
pub const PROTOCOL_VERSION: u32 = 1;
