pub mod capture;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod launch;
pub mod logbuf;
pub mod reclaim;
pub mod rpc;
pub mod supervisor;
pub mod web_console;

