pub mod checker;
pub mod config;
pub mod context;
pub mod domain_utils;
pub mod error;
pub mod evaluator;
pub mod identity;
pub mod macro_expand;
pub mod mechanisms;
pub mod policies;
pub mod record_source;

pub use checker::{CheckFlow, Checker, SpfRecord};
pub use config::SpfConfig;
pub use context::{SpfContext, SpfResult};
pub use error::SpfError;
pub use evaluator::{execute_nested, execute_record, SpfEvaluator, SpfOutcome};
pub use macro_expand::{expand, ExpansionMode, MacroExpander};
pub use policies::{PolicyChain, PolicyStage};
pub use record_source::{RecordSource, StaticRecordSource};
