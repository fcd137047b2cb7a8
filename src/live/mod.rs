//! 实时推送
//!
//! - [`IncrementalFetcher`]：按会话增量拉取
//! - [`DedupBroadcaster`]：已投递集合去重、发布
//! - [`SubscriptionRegistry`]：连接与订阅

pub mod broadcaster;
pub mod fetcher;
pub mod seen_set;
pub mod subscription;

pub use broadcaster::{CheckOutcome, DedupBroadcaster};
pub use fetcher::IncrementalFetcher;
pub use seen_set::SeenSet;
pub use subscription::{NewMessageEvent, RegistryStats, Subscription, SubscriptionRegistry};
