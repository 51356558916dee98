pub mod config_cmd;
pub mod run;
pub mod runtime;
pub mod serve;
pub mod sessions;
