pub mod run;
pub mod server;
