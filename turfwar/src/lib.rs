//! turfwar: a land claim game server.
//!
//! Players claim the IPv4 address they connect from under a nickname.
//! Claims are queued by the HTTP workers, written to PostgreSQL in
//! batches by a single persistence thread, and summarized into cached
//! leaderboard and recent activity documents.
pub use asset::{Asset, AssetGeneration, AssetStore};
pub use claim::Claim;
pub use result::{TurfError, TurfResult};
pub use server::ServerContext;

pub mod asset;
pub mod claim;
pub mod conf;
pub mod http;
pub mod logging;
pub mod now;
pub mod queue;
pub mod result;
pub mod server;
pub mod store;
pub mod workers;
