pub mod bootstrap;
pub mod engine;

pub use bootstrap::{bootstrap, bootstrap_with_config, sql_engine, Application, BootstrapError};
pub use engine::{
    ApprovalEngine, Decision, NewResponsibility, ProcessUpdate, ResponsibilityUpdate, StepUpdate,
};
