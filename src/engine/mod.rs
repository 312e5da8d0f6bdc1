pub mod feed;
pub mod orchestrator;
pub mod orders;
pub mod rule;
pub mod thresholds;

pub use feed::FeedManager;
pub use orchestrator::Engine;
pub use orders::OrderManager;
pub use rule::RuleEngine;
