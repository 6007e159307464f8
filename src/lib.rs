//! Background work-session tracking: session lifecycle with durable totals,
//! periodic screen capture with graceful fallback, activity and idle
//! monitoring, crash recovery, and an on-demand AI analysis gateway.

pub mod activity;
pub mod analysis;
pub mod capabilities;
pub mod capture;
pub mod clock;
pub mod engine;
pub mod exporter;
pub mod kv;
pub mod model;
pub mod paths;
pub mod settings;
pub mod state;
