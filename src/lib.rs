// Process configuration
pub mod config;

// Durable record of issued credentials
pub mod store;

// One-way encryption of issued keys
pub mod crypto;

// Upstream provider key-management client
pub mod upstream;

// Session key lifecycle
pub mod broker;

// Bearer token verification
pub mod trust;

// HTTP API
pub mod api;

// Background expiry sweep
pub mod sweep;
