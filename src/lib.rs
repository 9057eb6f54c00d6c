pub mod config;
pub mod consumer;
pub mod handler;
pub mod koji;
pub mod matcher;
pub mod mbs;
pub mod rules;

pub use config::Config;
pub use handler::{BuildEvent, EventHandler};
pub use koji::{KojiClient, TagDispatcher};
pub use matcher::{MatchOutcome, RuleEngine};
pub use mbs::{MbsClient, ModulemdSource};
pub use rules::{load_rules, RuleDef};
