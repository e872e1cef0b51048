pub mod cache_cmd;
pub mod completions_cmd;
pub mod config_cmd;
