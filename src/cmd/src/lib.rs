pub mod cmd;
pub mod reconciler;

pub use cmd::run;
