pub mod config;
pub mod dhcpv6;
pub mod dispatch;
pub mod ia;
pub mod interface;
pub mod ndp;
pub mod rd;
pub mod relay;
pub mod sys;
pub mod wire;
