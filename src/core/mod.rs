pub mod app;
pub mod backend;
pub mod chat;
#[cfg(test)]
pub mod chat_integration_tests;
pub mod clock;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod entitlement;
pub mod keyring;
pub mod message;
pub mod persona;
pub mod quota;
pub mod store;
