// Order execution engine: position lifecycle, reconciliation and emergency close
pub mod cleanup;
pub mod controller;
pub mod emergency;
pub mod lifecycle;
pub mod market_feed;
pub mod reconcile;

pub use cleanup::{cleanup_on_shutdown, CleanupReport};
pub use controller::{EntryOutcome, OrderLifecycleController, RebalanceOutcome, SkipReason};
pub use emergency::{EmergencyCloseManager, Escalation};
pub use lifecycle::{EntryGuard, LifecyclePhase, TriggerBook, TriggeredEntry};
pub use market_feed::MarketDataFeed;
pub use reconcile::{OrphanCheck, PeriodicOutcome, ReconciliationService, StartupReport};
