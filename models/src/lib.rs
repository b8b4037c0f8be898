pub mod client;
pub mod cluster;
pub mod constants;
pub mod deferred;
pub mod image;
pub mod machineconfig;
pub mod node;
pub mod secrets;
pub mod telemetry;
