//! Production backends for the hopflow engine SPIs: Redis for trace and
//! shared state, Apache Iggy for step hand-offs, HTTP for cross-host
//! transfers.

mod http;
mod iggy_channel;
mod redis_store;

pub use http::HttpResender;
pub use iggy_channel::{IggyChannelConfig, IggyStepChannel};
pub use redis_store::{RedisContextStore, RedisGlobalStore, RedisStoreConfig};
