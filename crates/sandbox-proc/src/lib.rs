mod access;
mod capture;
mod config;
mod factory;
mod governor;
mod harness;
mod limits;
mod paths;
mod prerequisites;
mod process;
mod sandbox;
mod seccomp;

pub use config::ProcessConfig;
pub use factory::ProcessFactory;
pub use governor::self_resident_bytes;
pub use sandbox::ProcessSandbox;
