//! Message processing pipeline.
//!
//! Every inbound message flows through:
//! 1. `filter::matches` — keyword/signature match (no side effects)
//! 2. `DedupLedger::try_claim` — at-most-once gate
//! 3. `RewriteAdapter::rewrite` — AI rewrite with fallback and caption cap
//! 4. `FooterComposer::apply` — footer append
//! 5. transport send with bounded retries — ledger updated on the outcome

pub mod filter;
pub mod footer;
pub mod processor;

pub use footer::FooterComposer;
pub use processor::{PipelineOutcome, RelayPipeline};
