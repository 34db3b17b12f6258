pub mod build_info;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod launch;
pub mod lock;
pub mod logging;
pub mod pidset;
pub mod probe;
pub mod supervisor;
pub mod terminate;

pub use error::KeeperError;
pub use pidset::PidSet;
pub use probe::{LivenessState, ProcessProbe};
