mod run;
mod serve;

pub use run::{RunArgs, run_once};
pub use serve::run_serve;
