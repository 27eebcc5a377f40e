//! StudyMate inbox: realtime notification feed for the student forum.
//!
//! [`feed::NotificationFeed`] keeps one user's notifications current through a
//! live listener (or a one-time pull when live delivery is unavailable), and
//! [`feed::reconciler::ReadStateReconciler`] moves notifications to read and
//! refreshes the feed. Backends plug in through [`store::DocumentStore`].

pub mod config;
pub mod errors;
pub mod feed;
pub mod models;
pub mod store;
