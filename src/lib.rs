//! Proma collaboration gateway.
//!
//! Real-time project chat over WebSockets together with the membership and
//! role state machine that decides who may do what inside a project.
//!
//! - [`membership`]: join requests, invitations, admin promotion, status.
//! - [`registry`]: which live connections are bound to which project room.
//! - [`gateway`]: per-connection sessions, persist-then-broadcast messaging.
//! - [`api`]: warp routes for the upgrade and the REST endpoints.
//! - [`store`] and [`identity`]: seams to the document store and token
//!   verification.

pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod locks;
pub mod membership;
pub mod messages;
pub mod models;
pub mod registry;
pub mod store;
