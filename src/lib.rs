//! Qbgate - a credential-injecting reverse proxy for per-user qBittorrent
//! unix sockets
//!
//! This library provides a discovery-driven reverse proxy that:
//! - Scans the process table for per-user `qbittorrent-nox` instances and
//!   extracts each one's Web UI secret and private socket path
//! - Exposes one world-writable proxy socket per discovered user and tears
//!   it down again when the instance disappears
//! - Rewrites login requests to inject the stored secret, so callers never
//!   need to know it
//! - Offers a single-tenant mode that fronts one fixed backend socket on a
//!   TCP port, with an optional operator gate password

pub mod credential;
pub mod error;
pub mod manager;
pub mod probe;
pub mod registry;
pub mod rewrite;
pub mod scanner;
pub mod single;
