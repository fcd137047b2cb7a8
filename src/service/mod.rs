pub mod bootstrap;
pub mod wire;

pub use bootstrap::{ApplicationBootstrap, ApplicationContext};
pub use wire::LivePipeline;
